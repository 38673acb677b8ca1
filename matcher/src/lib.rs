//! Two-pass (canonical/witness) exchange-request matching engine (§4.11).
//!
//! A [`Matcher`] drives an [`cc_xreq_store::XreqStore`] through one matching
//! pass: seed the recalculation set, walk `(base, quote, foreign)` pairs,
//! and within each pair walk buyers ("majors") against compatible sellers
//! ("minors"), rounding the traded rate through [`cc_unifloat::UniFloat`]
//! so the decision is bit-identical regardless of host floating-point
//! quirks. A match is not committed the first time it is seen — it is
//! recorded as *pending* and only promoted to a materialized [`Xmatch`]
//! once an independent later pass reproduces the same counterpart and
//! terms (§4.11's two-phase pending-match protocol). Writing the resulting
//! `Xmatch` rows to durable storage is the persist-data writer's job,
//! external to this core; this crate only returns the matches it found.

use cc_unifloat::{Round, UniFloat};
use cc_xreq_store::{MatchingState, Xreq, XreqStore};
use std::sync::Arc;
use tracing::debug;

/// Inclusive bias steps tried, in increasing magnitude, when the ideal
/// rounded rate fails a policy check — see DESIGN.md's Open Question
/// decision on the matcher's rounding-bias retry budget.
const MAX_ROUNDING_BIAS: i32 = 5;

/// How many successive minors a single major will try before giving up on
/// this pass. Bounded rather than exhaustive: `select_minor`'s cursor is
/// only guaranteed to surface the single best compatible counterpart first
/// (see its own tests), so a handful of follow-up attempts is a pragmatic
/// safety margin rather than a promise of full coverage.
const MAX_MINOR_ATTEMPTS: usize = 8;

/// `pending_match_epoch == 0` is reserved to mean "never pending" (the
/// zero value every freshly inserted row starts with) so the very first
/// pass run against fresh data never mistakes "nothing recorded yet" for
/// "confirmed by the previous pass".
const NO_EPOCH: i64 = 0;

/// Inputs to one call to [`Matcher::run_pass`]. `epoch` is this pass's own
/// identifier (> 0, strictly increasing across passes); `last_epoch` is the
/// epoch of the most recent previous pass over the same (`for_witness`)
/// view, or `0` if none has run yet.
#[derive(Debug, Clone, Copy)]
pub struct PassParams {
    pub for_witness: bool,
    pub epoch: i64,
    pub last_epoch: i64,
    pub last_matched_num: i64,
    pub block_time: i64,
    pub max_xreqnum: i64,
}

/// One confirmed trade, ready for the persist-data writer to turn into a
/// durable `Xmatch` row.
#[derive(Debug, Clone, PartialEq)]
pub struct Xmatch {
    pub order: i64,
    pub xreq_type: i64,
    pub base_amount: i64,
    pub rate: f64,
    pub buy_seqnum: i64,
    pub sell_seqnum: i64,
    pub buy_xreqnum: i64,
    pub sell_xreqnum: i64,
    pub pledge: i64,
}

pub struct Matcher {
    store: Arc<XreqStore>,
}

impl Matcher {
    pub fn new(store: Arc<XreqStore>) -> Self {
        Matcher { store }
    }

    /// Runs one full matching pass and returns the trades it confirmed.
    /// Pending-but-not-yet-confirmed matches are recorded in the store (via
    /// each request's `pending_match_*` fields) but not returned — they
    /// become visible as `Xmatch`es only on the pass that reproduces them.
    pub async fn run_pass(&self, params: PassParams) -> cc_error::Result<Vec<Xmatch>> {
        if params.last_epoch != NO_EPOCH {
            self.store.clear_old_pending_matches(params.last_epoch, params.max_xreqnum).await?;
        }
        self.store
            .set_recalc_flags(params.for_witness, params.last_matched_num, params.block_time, params.max_xreqnum)
            .await?;
        self.store.seed_matching_state(params.for_witness, params.max_xreqnum).await?;

        let mut confirmed = Vec::new();
        let mut order = 0i64;

        let mut after_base = i64::MIN;
        loop {
            let Some(base_row) = self.store.select_pair_base(after_base, 0, params.max_xreqnum).await? else {
                break;
            };
            let base = base_row.base_asset;
            after_base = base;

            let mut after_quote = i64::MIN;
            let mut after_foreign = String::new();
            loop {
                let Some(pair_row) = self
                    .store
                    .select_pair_quote(base, after_quote, &after_foreign, 0, params.max_xreqnum)
                    .await?
                else {
                    break;
                };
                after_quote = pair_row.quote_asset;
                after_foreign = pair_row.foreign_asset.clone();

                self.match_pair(base, after_quote, &after_foreign, &params, &mut order, &mut confirmed).await?;
            }
        }

        debug!(epoch = params.epoch, for_witness = params.for_witness, confirmed = confirmed.len(), "matcher: pass complete");
        Ok(confirmed)
    }

    async fn match_pair(
        &self,
        base: i64,
        quote: i64,
        foreign: &str,
        params: &PassParams,
        order: &mut i64,
        confirmed: &mut Vec<Xmatch>,
    ) -> cc_error::Result<()> {
        let mut major_cursor = (f64::MIN, i64::MIN, i64::MIN);
        loop {
            let Some(mut major) = self
                .store
                .select_major(
                    base,
                    quote,
                    foreign,
                    major_cursor.0,
                    major_cursor.1,
                    major_cursor.2,
                    params.max_xreqnum,
                    params.for_witness,
                )
                .await?
            else {
                break;
            };
            major_cursor = (major.signed_rate(major.open_rate_required), major.xreqnum, major.seqnum);

            let mut minor_cursor = (f64::MIN, i64::MIN, i64::MIN);
            for _ in 0..MAX_MINOR_ATTEMPTS {
                let major_remaining = matching_state(&major, params.for_witness).matching_amount;
                if major_remaining <= 0 {
                    break;
                }

                let Some(mut minor) = self
                    .store
                    .select_minor(&major, minor_cursor.0, minor_cursor.1, minor_cursor.2, params.for_witness)
                    .await?
                else {
                    break;
                };
                minor_cursor = (minor.signed_rate(minor.open_rate_required), minor.xreqnum, minor.seqnum);

                let Some((amount, rate)) = propose_trade(&major, &minor, params.for_witness) else {
                    continue;
                };

                let promote = is_reconfirmation(&major, &minor, params.last_epoch, amount, rate);

                apply_trade(&mut major, &mut minor, params.for_witness, amount, rate, params.epoch, promote);

                self.store.update(&major).await?;
                self.store.update(&minor).await?;

                if promote {
                    *order += 1;
                    confirmed.push(Xmatch {
                        order: *order,
                        xreq_type: major.xreq_type.max(minor.xreq_type),
                        base_amount: amount,
                        rate,
                        buy_seqnum: major.seqnum,
                        sell_seqnum: minor.seqnum,
                        buy_xreqnum: major.xreqnum,
                        sell_xreqnum: minor.xreqnum,
                        pledge: major.pledge.min(minor.pledge),
                    });
                }

                // Only one compatible minor is attempted per major once a
                // trade (pending or confirmed) has been proposed; further
                // amount, if any, is picked up by a later pass.
                break;
            }
        }
        Ok(())
    }
}

fn matching_state(xreq: &Xreq, for_witness: bool) -> &MatchingState {
    if for_witness {
        &xreq.witness
    } else {
        &xreq.canonical
    }
}

fn matching_state_mut(xreq: &mut Xreq, for_witness: bool) -> &mut MatchingState {
    if for_witness {
        &mut xreq.witness
    } else {
        &mut xreq.canonical
    }
}

/// Computes the trade this (major, minor) pair would make if matched now:
/// the full amount the buyer still wants (the compatibility check already
/// guarantees the seller can cover at least that much), and a rate chosen
/// by rounding the buyer/seller midpoint through UniFloat, retrying with a
/// small bias until a representable rate satisfies both sides' limits.
fn propose_trade(major: &Xreq, minor: &Xreq, for_witness: bool) -> Option<(i64, f64)> {
    let major_state = matching_state(major, for_witness);
    let minor_state = matching_state(minor, for_witness);

    let amount = major_state.matching_amount.min(minor_state.matching_amount);
    if amount <= 0 {
        return None;
    }

    // `matching_rate_required` is signed by seed_matching_state: positive
    // (the buyer's max) for the major, negative (the negated seller's min)
    // for the minor.
    let buyer_max = major_state.matching_rate_required;
    let seller_min = -minor_state.matching_rate_required;
    if seller_min > buyer_max {
        return None;
    }

    let mid = UniFloat::average(UniFloat::decompose(buyer_max), UniFloat::decompose(seller_min), Round::Nearest);
    let base_wire = mid.wire_encode(Round::Nearest)?;

    for bias in bias_sequence() {
        let candidate_wire = (base_wire as i64 + bias as i64).clamp(0, u32::MAX as i64) as u32;
        let candidate = UniFloat::wire_decode(candidate_wire);
        let rate = candidate.recompose();

        let within_buyer_limit = UniFloat::check_le(candidate, UniFloat::decompose(buyer_max));
        let within_seller_limit = UniFloat::check_le(UniFloat::decompose(seller_min), candidate);
        if within_buyer_limit && within_seller_limit {
            return Some((amount, rate));
        }
    }
    None
}

/// `0, 1, -1, 2, -2, ..., MAX_ROUNDING_BIAS, -MAX_ROUNDING_BIAS`.
fn bias_sequence() -> impl Iterator<Item = i32> {
    std::iter::once(0).chain((1..=MAX_ROUNDING_BIAS).flat_map(|m| [m, -m]))
}

/// A pending match becomes a confirmed one only when the exact same pair,
/// amount, and rate were already pending from the immediately preceding
/// pass — reproducing the match on a second independent pass is the
/// protocol's confirmation signal (§4.11).
fn is_reconfirmation(major: &Xreq, minor: &Xreq, last_epoch: i64, amount: i64, rate: f64) -> bool {
    if last_epoch == NO_EPOCH {
        return false;
    }
    let major_matches = major.pending_match_epoch == last_epoch
        && major.pending_match_amount == amount
        && rates_close(major.pending_match_rate, rate);
    let minor_matches = minor.pending_match_epoch == last_epoch
        && minor.pending_match_amount == amount
        && rates_close(minor.pending_match_rate, rate);
    major_matches && minor_matches
}

fn rates_close(a: f64, b: f64) -> bool {
    UniFloat::check_le(UniFloat::decompose(a), UniFloat::decompose(b))
        && UniFloat::check_le(UniFloat::decompose(b), UniFloat::decompose(a))
}

/// Records the trade on both requests: matching-state amounts are always
/// reduced (so a re-walk of the same pass doesn't rediscover spent
/// capacity), and either the pending-match fields are refreshed (not yet
/// promoted) or, on promotion, `open_amount` is actually drawn down and the
/// pending fields are cleared since the match is now final.
fn apply_trade(major: &mut Xreq, minor: &mut Xreq, for_witness: bool, amount: i64, rate: f64, epoch: i64, promote: bool) {
    {
        let major_state = matching_state_mut(major, for_witness);
        major_state.matching_amount -= amount;
        major_state.last_matched = epoch;
        major_state.best_amount = amount;
        major_state.best_rate = rate;
        major_state.best_net_rate = rate;
        major_state.best_other_seqnum = minor.seqnum;
        major_state.best_other_xreqnum = minor.xreqnum;
        major_state.best_other_matching_amount = amount;
        major_state.best_other_net_rate = rate;
    }
    {
        let minor_state = matching_state_mut(minor, for_witness);
        minor_state.matching_amount -= amount;
        minor_state.last_matched = epoch;
        minor_state.best_amount = amount;
        minor_state.best_rate = rate;
        minor_state.best_net_rate = rate;
        minor_state.best_other_seqnum = major.seqnum;
        minor_state.best_other_xreqnum = major.xreqnum;
        minor_state.best_other_matching_amount = amount;
        minor_state.best_other_net_rate = rate;
    }

    if promote {
        major.open_amount = (major.open_amount - amount).max(0);
        minor.open_amount = (minor.open_amount - amount).max(0);
        major.pending_match_epoch = NO_EPOCH;
        minor.pending_match_epoch = NO_EPOCH;
        major.pending_match_amount = 0;
        minor.pending_match_amount = 0;
        major.pending_match_rate = 0.0;
        minor.pending_match_rate = 0.0;
    } else {
        major.pending_match_epoch = epoch;
        major.pending_match_order = epoch;
        major.pending_match_amount = amount;
        major.pending_match_rate = rate;
        minor.pending_match_epoch = epoch;
        minor.pending_match_order = epoch;
        minor.pending_match_amount = amount;
        minor.pending_match_rate = rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_hash::compute_oid;
    use cc_seqalloc::SeqAlloc;

    fn xreq(oid_byte: u8, is_buyer: bool, rate: f64, amount: i64) -> Xreq {
        Xreq {
            seqnum: 0,
            linked_seqnum: 0,
            oid: compute_oid(1, &[oid_byte]),
            xreqnum: 1,
            xreq_type: 0,
            is_buyer,
            base_asset: 1,
            quote_asset: 2,
            foreign_asset: "USD".into(),
            min_amount: 0,
            max_amount: amount,
            open_amount: amount,
            net_rate_required: rate,
            wait_discount: 0.0,
            open_rate_required: rate,
            base_costs: 0.0,
            quote_costs: 0.0,
            consideration_required: 0,
            consideration_offered: 0,
            pledge: 0,
            accept_time_required: 0,
            accept_time_offered: 0,
            payment_time: 0,
            confirmations: 0,
            hold_time: 0,
            hold_time_required: 0,
            min_wait_time: 0,
            destination: vec![0; 16],
            signing_public_key: None,
            foreign_address: vec![],
            pending_match_epoch: 0,
            pending_match_order: 0,
            pending_match_amount: 0,
            pending_match_rate: 0.0,
            pending_match_hold_time: 0,
            canonical: MatchingState { matching_amount: amount, xreqnum: 1, recalc: true, ..Default::default() },
            witness: MatchingState { matching_amount: amount, xreqnum: 1, recalc: true, ..Default::default() },
        }
    }

    async fn fresh_store() -> Arc<XreqStore> {
        let pool = cc_store::open_in_memory().await.unwrap();
        Arc::new(XreqStore::new(pool, Arc::new(SeqAlloc::new())).await.unwrap())
    }

    fn pass(epoch: i64, last_epoch: i64) -> PassParams {
        PassParams {
            for_witness: false,
            epoch,
            last_epoch,
            last_matched_num: 0,
            block_time: 0,
            max_xreqnum: i64::MAX,
        }
    }

    #[tokio::test]
    async fn pending_match_promotes_on_second_pass() {
        let store = fresh_store().await;
        let buyer_oid = xreq(1, true, 1.0, 10).oid;
        store.insert(xreq(1, true, 1.0, 10)).await.unwrap();
        store.insert(xreq(2, false, 0.99, 10)).await.unwrap();
        let best_seller_oid = xreq(3, false, 0.98, 10).oid;
        store.insert(xreq(3, false, 0.98, 10)).await.unwrap();

        let matcher = Matcher::new(store.clone());

        let pass1 = matcher.run_pass(pass(1, 0)).await.unwrap();
        assert!(pass1.is_empty(), "first sighting is pending, not confirmed");

        let buyer = store.select_by_oid(&buyer_oid).await.unwrap().unwrap();
        assert_eq!(buyer.pending_match_epoch, 1);
        assert_eq!(buyer.pending_match_amount, 10);
        assert_eq!(buyer.canonical.best_other_seqnum, store.select_by_oid(&best_seller_oid).await.unwrap().unwrap().seqnum);

        let pass2 = matcher.run_pass(pass(2, 1)).await.unwrap();
        assert_eq!(pass2.len(), 1);
        let m = &pass2[0];
        assert_eq!(m.base_amount, 10);
        assert!((0.98..=1.0).contains(&m.rate));

        let buyer_after = store.select_by_oid(&buyer_oid).await.unwrap().unwrap();
        let seller_after = store.select_by_oid(&best_seller_oid).await.unwrap().unwrap();
        assert_eq!(buyer_after.open_amount, 0);
        assert_eq!(seller_after.open_amount, 0);
        assert_eq!(buyer_after.pending_match_epoch, 0);
    }

    #[tokio::test]
    async fn no_compatible_minor_produces_no_matches() {
        let store = fresh_store().await;
        store.insert(xreq(1, true, 1.0, 10)).await.unwrap();
        let mut too_expensive = xreq(2, false, 1.5, 10);
        too_expensive.open_rate_required = 1.5;
        store.insert(too_expensive).await.unwrap();

        let matcher = Matcher::new(store);
        let result = matcher.run_pass(pass(1, 0)).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn bias_sequence_is_increasing_magnitude() {
        let seq: Vec<i32> = bias_sequence().collect();
        assert_eq!(seq, vec![0, 1, -1, 2, -2, 3, -3, 4, -4, 5, -5]);
    }
}
