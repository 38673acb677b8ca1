//! Persistent exchange-request table with rate- and match-ordered indexes
//! (§4.10).
//!
//! Each request carries two parallel "matching" substates — `canonical`
//! (what has actually been confirmed into blocks) and `witness` (what a
//! block-producing witness additionally sees, including still-pending
//! requests) — mirroring the original's dual canonical/witness column
//! convention without literally duplicating every column twice in Rust.

use cc_hash::Oid;
use cc_seqalloc::{Domain, Kind, SeqAlloc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::debug;

fn oid_blob(oid: &Oid) -> &[u8] {
    oid.as_bytes()
}

fn oid_from_blob(b: &[u8]) -> Option<Oid> {
    let arr: [u8; cc_hash::OID_LEN] = b.try_into().ok()?;
    Some(Oid::from_bytes(arr))
}

/// The mutable per-pass matching bookkeeping for one side of an exchange
/// request — duplicated as `canonical`/`witness` on [`Xreq`].
#[derive(Debug, Clone, Default)]
pub struct MatchingState {
    pub xreqnum: i64,
    pub block_time: i64,
    pub matching_amount: i64,
    pub matching_rate_required: f64,
    pub recalc_time: i64,
    pub recalc: bool,
    pub last_matched: i64,
    pub best_amount: i64,
    pub best_rate: f64,
    pub best_net_rate: f64,
    pub best_other_seqnum: i64,
    pub best_other_xreqnum: i64,
    pub best_other_matching_amount: i64,
    pub best_other_net_rate: f64,
}

/// Compatibility policy fields compared pairwise between a buyer (major)
/// and seller (minor) during matching.
#[derive(Debug, Clone)]
pub struct Xreq {
    pub seqnum: i64,
    pub linked_seqnum: i64,
    pub oid: Oid,
    pub xreqnum: i64,
    pub xreq_type: i64,
    pub is_buyer: bool,
    pub base_asset: i64,
    pub quote_asset: i64,
    pub foreign_asset: String,
    pub min_amount: i64,
    pub max_amount: i64,
    pub open_amount: i64,
    pub net_rate_required: f64,
    pub wait_discount: f64,
    pub open_rate_required: f64,
    pub base_costs: f64,
    pub quote_costs: f64,
    pub consideration_required: i64,
    pub consideration_offered: i64,
    pub pledge: i64,
    pub accept_time_required: i64,
    pub accept_time_offered: i64,
    pub payment_time: i64,
    pub confirmations: i64,
    pub hold_time: i64,
    pub hold_time_required: i64,
    pub min_wait_time: i64,
    pub destination: Vec<u8>,
    pub signing_public_key: Option<Vec<u8>>,
    pub foreign_address: Vec<u8>,
    pub pending_match_epoch: i64,
    pub pending_match_order: i64,
    pub pending_match_amount: i64,
    pub pending_match_rate: f64,
    pub pending_match_hold_time: i64,
    pub canonical: MatchingState,
    pub witness: MatchingState,
}

impl Xreq {
    /// Signed rate: buyers offer to pay at most this rate, sellers demand
    /// at least it; the sign convention lets both sides compare on one
    /// ordered axis (descending-preference for a buyer is ascending for a
    /// seller once negated).
    pub fn signed_rate(&self, rate: f64) -> f64 {
        if self.is_buyer {
            rate
        } else {
            -rate
        }
    }

    fn matching(&self, for_witness: bool) -> &MatchingState {
        if for_witness {
            &self.witness
        } else {
            &self.canonical
        }
    }
}

pub struct XreqStore {
    pool: SqlitePool,
    seqalloc: Arc<SeqAlloc>,
}

macro_rules! bind_xreq {
    ($q:expr, $x:expr) => {
        $q.bind($x.seqnum)
            .bind($x.linked_seqnum)
            .bind(oid_blob(&$x.oid))
            .bind($x.xreqnum)
            .bind($x.xreq_type)
            .bind($x.is_buyer as i64)
            .bind($x.base_asset)
            .bind($x.quote_asset)
            .bind(&$x.foreign_asset)
            .bind($x.min_amount)
            .bind($x.max_amount)
            .bind($x.open_amount)
            .bind($x.net_rate_required)
            .bind($x.wait_discount)
            .bind($x.open_rate_required)
            .bind($x.base_costs)
            .bind($x.quote_costs)
            .bind($x.consideration_required)
            .bind($x.consideration_offered)
            .bind($x.pledge)
            .bind($x.accept_time_required)
            .bind($x.accept_time_offered)
            .bind($x.payment_time)
            .bind($x.confirmations)
            .bind($x.hold_time)
            .bind($x.hold_time_required)
            .bind($x.min_wait_time)
            .bind(&$x.destination)
            .bind($x.signing_public_key.clone())
            .bind(&$x.foreign_address)
            .bind($x.pending_match_epoch)
            .bind($x.pending_match_order)
            .bind($x.pending_match_amount)
            .bind($x.pending_match_rate)
            .bind($x.pending_match_hold_time)
            .bind($x.canonical.xreqnum)
            .bind($x.canonical.block_time)
            .bind($x.canonical.matching_amount)
            .bind($x.canonical.matching_rate_required)
            .bind($x.canonical.recalc_time)
            .bind($x.canonical.recalc as i64)
            .bind($x.canonical.last_matched)
            .bind($x.canonical.best_amount)
            .bind($x.canonical.best_rate)
            .bind($x.canonical.best_net_rate)
            .bind($x.canonical.best_other_seqnum)
            .bind($x.canonical.best_other_xreqnum)
            .bind($x.canonical.best_other_matching_amount)
            .bind($x.canonical.best_other_net_rate)
            .bind($x.witness.xreqnum)
            .bind($x.witness.block_time)
            .bind($x.witness.matching_amount)
            .bind($x.witness.matching_rate_required)
            .bind($x.witness.recalc_time)
            .bind($x.witness.recalc as i64)
            .bind($x.witness.last_matched)
            .bind($x.witness.best_amount)
            .bind($x.witness.best_rate)
            .bind($x.witness.best_net_rate)
            .bind($x.witness.best_other_seqnum)
            .bind($x.witness.best_other_xreqnum)
            .bind($x.witness.best_other_matching_amount)
            .bind($x.witness.best_other_net_rate)
    };
}

const XREQ_COLUMNS: &str = "seqnum, linked_seqnum, oid, xreqnum, xreq_type, is_buyer, base_asset, quote_asset,
     foreign_asset, min_amount, max_amount, open_amount, net_rate_required, wait_discount, open_rate_required,
     base_costs, quote_costs, consideration_required, consideration_offered, pledge, accept_time_required,
     accept_time_offered, payment_time, confirmations, hold_time, hold_time_required, min_wait_time,
     destination, signing_public_key, foreign_address, pending_match_epoch, pending_match_order,
     pending_match_amount, pending_match_rate, pending_match_hold_time,
     c_xreqnum, c_block_time, c_matching_amount, c_matching_rate_required, c_recalc_time, c_recalc,
     c_last_matched, c_best_amount, c_best_rate, c_best_net_rate, c_best_other_seqnum, c_best_other_xreqnum,
     c_best_other_matching_amount, c_best_other_net_rate,
     w_xreqnum, w_block_time, w_matching_amount, w_matching_rate_required, w_recalc_time, w_recalc,
     w_last_matched, w_best_amount, w_best_rate, w_best_net_rate, w_best_other_seqnum, w_best_other_xreqnum,
     w_best_other_matching_amount, w_best_other_net_rate";

fn row_to_xreq(row: &sqlx::sqlite::SqliteRow) -> cc_error::Result<Xreq> {
    let oid_bytes: Vec<u8> = row.try_get("oid")?;
    let oid = oid_from_blob(&oid_bytes).ok_or_else(|| cc_error::Error::InvalidObject("oid".into()))?;
    Ok(Xreq {
        seqnum: row.try_get("seqnum")?,
        linked_seqnum: row.try_get("linked_seqnum")?,
        oid,
        xreqnum: row.try_get("xreqnum")?,
        xreq_type: row.try_get("xreq_type")?,
        is_buyer: row.try_get::<i64, _>("is_buyer")? != 0,
        base_asset: row.try_get("base_asset")?,
        quote_asset: row.try_get("quote_asset")?,
        foreign_asset: row.try_get("foreign_asset")?,
        min_amount: row.try_get("min_amount")?,
        max_amount: row.try_get("max_amount")?,
        open_amount: row.try_get("open_amount")?,
        net_rate_required: row.try_get("net_rate_required")?,
        wait_discount: row.try_get("wait_discount")?,
        open_rate_required: row.try_get("open_rate_required")?,
        base_costs: row.try_get("base_costs")?,
        quote_costs: row.try_get("quote_costs")?,
        consideration_required: row.try_get("consideration_required")?,
        consideration_offered: row.try_get("consideration_offered")?,
        pledge: row.try_get("pledge")?,
        accept_time_required: row.try_get("accept_time_required")?,
        accept_time_offered: row.try_get("accept_time_offered")?,
        payment_time: row.try_get("payment_time")?,
        confirmations: row.try_get("confirmations")?,
        hold_time: row.try_get("hold_time")?,
        hold_time_required: row.try_get("hold_time_required")?,
        min_wait_time: row.try_get("min_wait_time")?,
        destination: row.try_get("destination")?,
        signing_public_key: row.try_get("signing_public_key")?,
        foreign_address: row.try_get("foreign_address")?,
        pending_match_epoch: row.try_get("pending_match_epoch")?,
        pending_match_order: row.try_get("pending_match_order")?,
        pending_match_amount: row.try_get("pending_match_amount")?,
        pending_match_rate: row.try_get("pending_match_rate")?,
        pending_match_hold_time: row.try_get("pending_match_hold_time")?,
        canonical: MatchingState {
            xreqnum: row.try_get("c_xreqnum")?,
            block_time: row.try_get("c_block_time")?,
            matching_amount: row.try_get("c_matching_amount")?,
            matching_rate_required: row.try_get("c_matching_rate_required")?,
            recalc_time: row.try_get("c_recalc_time")?,
            recalc: row.try_get::<i64, _>("c_recalc")? != 0,
            last_matched: row.try_get("c_last_matched")?,
            best_amount: row.try_get("c_best_amount")?,
            best_rate: row.try_get("c_best_rate")?,
            best_net_rate: row.try_get("c_best_net_rate")?,
            best_other_seqnum: row.try_get("c_best_other_seqnum")?,
            best_other_xreqnum: row.try_get("c_best_other_xreqnum")?,
            best_other_matching_amount: row.try_get("c_best_other_matching_amount")?,
            best_other_net_rate: row.try_get("c_best_other_net_rate")?,
        },
        witness: MatchingState {
            xreqnum: row.try_get("w_xreqnum")?,
            block_time: row.try_get("w_block_time")?,
            matching_amount: row.try_get("w_matching_amount")?,
            matching_rate_required: row.try_get("w_matching_rate_required")?,
            recalc_time: row.try_get("w_recalc_time")?,
            recalc: row.try_get::<i64, _>("w_recalc")? != 0,
            last_matched: row.try_get("w_last_matched")?,
            best_amount: row.try_get("w_best_amount")?,
            best_rate: row.try_get("w_best_rate")?,
            best_net_rate: row.try_get("w_best_net_rate")?,
            best_other_seqnum: row.try_get("w_best_other_seqnum")?,
            best_other_xreqnum: row.try_get("w_best_other_xreqnum")?,
            best_other_matching_amount: row.try_get("w_best_other_matching_amount")?,
            best_other_net_rate: row.try_get("w_best_other_net_rate")?,
        },
    })
}

impl XreqStore {
    pub async fn new(pool: SqlitePool, seqalloc: Arc<SeqAlloc>) -> cc_error::Result<Self> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS xreqs (
                seqnum INTEGER PRIMARY KEY,
                linked_seqnum INTEGER NOT NULL DEFAULT 0,
                oid BLOB UNIQUE NOT NULL,
                xreqnum INTEGER NOT NULL DEFAULT 0,
                xreq_type INTEGER NOT NULL,
                is_buyer INTEGER NOT NULL,
                base_asset INTEGER NOT NULL,
                quote_asset INTEGER NOT NULL,
                foreign_asset TEXT NOT NULL,
                min_amount INTEGER NOT NULL,
                max_amount INTEGER NOT NULL,
                open_amount INTEGER NOT NULL,
                net_rate_required REAL NOT NULL,
                wait_discount REAL NOT NULL,
                open_rate_required REAL NOT NULL,
                base_costs REAL NOT NULL,
                quote_costs REAL NOT NULL,
                consideration_required INTEGER NOT NULL,
                consideration_offered INTEGER NOT NULL,
                pledge INTEGER NOT NULL,
                accept_time_required INTEGER NOT NULL,
                accept_time_offered INTEGER NOT NULL,
                payment_time INTEGER NOT NULL,
                confirmations INTEGER NOT NULL,
                hold_time INTEGER NOT NULL DEFAULT 0,
                hold_time_required INTEGER NOT NULL DEFAULT 0,
                min_wait_time INTEGER NOT NULL DEFAULT 0,
                destination BLOB NOT NULL,
                signing_public_key BLOB,
                foreign_address BLOB NOT NULL,
                pending_match_epoch INTEGER NOT NULL DEFAULT 0,
                pending_match_order INTEGER NOT NULL DEFAULT 0,
                pending_match_amount INTEGER NOT NULL DEFAULT 0,
                pending_match_rate REAL NOT NULL DEFAULT 0,
                pending_match_hold_time INTEGER NOT NULL DEFAULT 0,
                c_xreqnum INTEGER NOT NULL DEFAULT 0,
                c_block_time INTEGER NOT NULL DEFAULT 0,
                c_matching_amount INTEGER NOT NULL DEFAULT 0,
                c_matching_rate_required REAL NOT NULL DEFAULT 0,
                c_recalc_time INTEGER NOT NULL DEFAULT 0,
                c_recalc INTEGER NOT NULL DEFAULT 0,
                c_last_matched INTEGER NOT NULL DEFAULT 0,
                c_best_amount INTEGER NOT NULL DEFAULT 0,
                c_best_rate REAL NOT NULL DEFAULT 0,
                c_best_net_rate REAL NOT NULL DEFAULT 0,
                c_best_other_seqnum INTEGER NOT NULL DEFAULT 0,
                c_best_other_xreqnum INTEGER NOT NULL DEFAULT 0,
                c_best_other_matching_amount INTEGER NOT NULL DEFAULT 0,
                c_best_other_net_rate REAL NOT NULL DEFAULT 0,
                w_xreqnum INTEGER NOT NULL DEFAULT 0,
                w_block_time INTEGER NOT NULL DEFAULT 0,
                w_matching_amount INTEGER NOT NULL DEFAULT 0,
                w_matching_rate_required REAL NOT NULL DEFAULT 0,
                w_recalc_time INTEGER NOT NULL DEFAULT 0,
                w_recalc INTEGER NOT NULL DEFAULT 0,
                w_last_matched INTEGER NOT NULL DEFAULT 0,
                w_best_amount INTEGER NOT NULL DEFAULT 0,
                w_best_rate REAL NOT NULL DEFAULT 0,
                w_best_net_rate REAL NOT NULL DEFAULT 0,
                w_best_other_seqnum INTEGER NOT NULL DEFAULT 0,
                w_best_other_xreqnum INTEGER NOT NULL DEFAULT 0,
                w_best_other_matching_amount INTEGER NOT NULL DEFAULT 0,
                w_best_other_net_rate REAL NOT NULL DEFAULT 0
            )"
        ))
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS Xreqs_OpenRateRequired_Index ON xreqs
                (base_asset, quote_asset, foreign_asset, is_buyer, open_rate_required, xreqnum, seqnum)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS Xreqs_PendingMatchRate_Index ON xreqs
                (base_asset, quote_asset, foreign_asset, is_buyer, pending_match_rate, xreqnum, seqnum)",
        )
        .execute(&pool)
        .await?;

        Ok(XreqStore { pool, seqalloc })
    }

    /// Inserts `xreq`. If an existing pending (`xreqnum == 0`) row shares
    /// the same oid, it is deleted and replaced, reusing its seqnum.
    /// Otherwise a fresh seqnum is allocated.
    pub async fn insert(&self, mut xreq: Xreq) -> cc_error::Result<i64> {
        let mut txn = self.pool.begin().await?;

        let existing = sqlx::query(&format!("SELECT {XREQ_COLUMNS} FROM xreqs WHERE oid = ?1"))
            .bind(oid_blob(&xreq.oid))
            .fetch_optional(&mut *txn)
            .await?;

        if let Some(row) = existing {
            let prior = row_to_xreq(&row)?;
            if prior.xreqnum == 0 {
                if xreq.seqnum == 0 {
                    xreq.seqnum = prior.seqnum;
                }
                sqlx::query("DELETE FROM xreqs WHERE seqnum = ?1")
                    .bind(prior.seqnum)
                    .execute(&mut *txn)
                    .await?;
            }
        }

        if xreq.seqnum == 0 {
            xreq.seqnum = self.seqalloc.next(Kind::Xreq, Domain::Valid);
        }

        let q = sqlx::query(&format!(
            "INSERT INTO xreqs ({XREQ_COLUMNS}) VALUES ({})",
            (1..=63).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
        ));
        bind_xreq!(q, xreq).execute(&mut *txn).await?;

        txn.commit().await?;
        debug!(seqnum = xreq.seqnum, oid = %xreq.oid, "xreq_store: inserted");
        Ok(xreq.seqnum)
    }

    pub async fn delete(&self, seqnum: i64) -> cc_error::Result<()> {
        sqlx::query("DELETE FROM xreqs WHERE seqnum = ?1").bind(seqnum).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn update(&self, xreq: &Xreq) -> cc_error::Result<()> {
        let q = sqlx::query(&format!(
            "INSERT OR REPLACE INTO xreqs ({XREQ_COLUMNS}) VALUES ({})",
            (1..=63).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
        ));
        bind_xreq!(q, xreq).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn select_by_oid(&self, oid: &Oid) -> cc_error::Result<Option<Xreq>> {
        let row = sqlx::query(&format!("SELECT {XREQ_COLUMNS} FROM xreqs WHERE oid = ?1"))
            .bind(oid_blob(oid))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_xreq).transpose()
    }

    /// Next distinct `base_asset` strictly greater than `after_base_asset`,
    /// with `xreqnum` in `[min_xreqnum, max_xreqnum]`.
    pub async fn select_pair_base(
        &self,
        after_base_asset: i64,
        min_xreqnum: i64,
        max_xreqnum: i64,
    ) -> cc_error::Result<Option<Xreq>> {
        let row = sqlx::query(&format!(
            "SELECT {XREQ_COLUMNS} FROM xreqs
             WHERE base_asset > ?1 AND xreqnum >= ?2 AND xreqnum <= ?3
             ORDER BY base_asset, xreqnum, seqnum LIMIT 1"
        ))
        .bind(after_base_asset)
        .bind(min_xreqnum)
        .bind(max_xreqnum)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_xreq).transpose()
    }

    /// Next distinct `(quote_asset, foreign_asset)` pair for a fixed
    /// `base_asset`, strictly after the given cursor.
    pub async fn select_pair_quote(
        &self,
        base_asset: i64,
        after_quote_asset: i64,
        after_foreign_asset: &str,
        min_xreqnum: i64,
        max_xreqnum: i64,
    ) -> cc_error::Result<Option<Xreq>> {
        let row = sqlx::query(&format!(
            "SELECT {XREQ_COLUMNS} FROM xreqs
             WHERE base_asset = ?1 AND quote_asset >= ?2
               AND (quote_asset > ?2 OR foreign_asset > ?3)
               AND xreqnum >= ?4 AND xreqnum <= ?5
             ORDER BY quote_asset, foreign_asset, xreqnum, seqnum LIMIT 1"
        ))
        .bind(base_asset)
        .bind(after_quote_asset)
        .bind(after_foreign_asset)
        .bind(min_xreqnum)
        .bind(max_xreqnum)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_xreq).transpose()
    }

    /// Next buyer for `(base, quote, foreign)` in strict
    /// `(signed_rate, xreqnum, seqnum)` order after the given cursor.
    /// `for_witness = false` requires `xreqnum != 0` (only persistent
    /// requests are visible off-witness).
    #[allow(clippy::too_many_arguments)]
    pub async fn select_major(
        &self,
        base_asset: i64,
        quote_asset: i64,
        foreign_asset: &str,
        after_rate: f64,
        after_xreqnum: i64,
        after_seqnum: i64,
        max_xreqnum: i64,
        for_witness: bool,
    ) -> cc_error::Result<Option<Xreq>> {
        let rows = sqlx::query(&format!(
            "SELECT {XREQ_COLUMNS} FROM xreqs
             WHERE base_asset = ?1 AND quote_asset = ?2 AND foreign_asset = ?3 AND is_buyer = 1
               AND xreqnum <= ?4
             ORDER BY open_rate_required, xreqnum, seqnum"
        ))
        .bind(base_asset)
        .bind(quote_asset)
        .bind(foreign_asset)
        .bind(max_xreqnum)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let xreq = row_to_xreq(&row)?;
            let rate = xreq.signed_rate(xreq.open_rate_required);
            let key = (rate, xreq.xreqnum, xreq.seqnum);
            if key <= (after_rate, after_xreqnum, after_seqnum) {
                continue;
            }
            if !for_witness && xreq.xreqnum == 0 {
                continue;
            }
            if xreq.matching(for_witness).matching_amount == 0 {
                continue;
            }
            return Ok(Some(xreq));
        }
        Ok(None)
    }

    /// Next seller compatible with `major` after the given cursor, walking
    /// in strict rate order and filtering on the full pairwise policy
    /// conjunction (consideration, pledge, accept/payment time,
    /// confirmations, amount bounds).
    #[allow(clippy::too_many_arguments)]
    pub async fn select_minor(
        &self,
        major: &Xreq,
        after_rate: f64,
        after_xreqnum: i64,
        after_seqnum: i64,
        for_witness: bool,
    ) -> cc_error::Result<Option<Xreq>> {
        let rows = sqlx::query(&format!(
            "SELECT {XREQ_COLUMNS} FROM xreqs
             WHERE base_asset = ?1 AND quote_asset = ?2 AND foreign_asset = ?3 AND is_buyer = 0
               AND xreqnum <= ?4
             ORDER BY open_rate_required, xreqnum, seqnum"
        ))
        .bind(major.base_asset)
        .bind(major.quote_asset)
        .bind(&major.foreign_asset)
        .bind(major.canonical.xreqnum.max(major.witness.xreqnum))
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let minor = row_to_xreq(&row)?;
            let rate = minor.signed_rate(minor.open_rate_required);
            let key = (rate, minor.xreqnum, minor.seqnum);
            if key <= (after_rate, after_xreqnum, after_seqnum) {
                continue;
            }
            if !minor_is_compatible(major, &minor, for_witness) {
                continue;
            }
            return Ok(Some(minor));
        }
        Ok(None)
    }

    /// Zeros `pending_match_rate` on every row whose `pending_match_epoch`
    /// differs from the current `epoch` and whose `xreqnum` is within
    /// `[0, max_xreqnum]`.
    pub async fn clear_old_pending_matches(&self, epoch: i64, max_xreqnum: i64) -> cc_error::Result<u64> {
        let changes = sqlx::query(
            "UPDATE xreqs SET pending_match_rate = 0, pending_match_order = 0
             WHERE pending_match_epoch != ?1 AND xreqnum <= ?2",
        )
        .bind(epoch)
        .bind(max_xreqnum)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changes)
    }

    /// Matching pass setup, step 1: marks `recalc` on every row that
    /// either matched last round, had its best-other counterpart matched
    /// last round, or has a scheduled recalc time due by `block_time`.
    pub async fn set_recalc_flags(
        &self,
        for_witness: bool,
        last_matched_num: i64,
        block_time: i64,
        max_xreqnum: i64,
    ) -> cc_error::Result<u64> {
        let col = if for_witness { "w" } else { "c" };
        let sql = format!(
            "UPDATE xreqs SET {col}_recalc = 1
             WHERE xreqnum <= ?1 AND (
                {col}_last_matched = ?2
                OR seqnum IN (SELECT {col}_best_other_seqnum FROM xreqs WHERE {col}_last_matched = ?2)
                OR ({col}_recalc_time > 0 AND {col}_recalc_time <= ?3)
             )"
        );
        let changes = sqlx::query(&sql)
            .bind(max_xreqnum)
            .bind(last_matched_num)
            .bind(block_time)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(changes)
    }

    /// Matching pass setup, step 2: for every row with `recalc` set, reset
    /// `best_*` tracking and seed `matching_amount`/`matching_rate_required`
    /// from the row's open amount/rate, and `best_rate` to signed infinity.
    pub async fn seed_matching_state(&self, for_witness: bool, max_xreqnum: i64) -> cc_error::Result<u64> {
        let col = if for_witness { "w" } else { "c" };
        let sql = format!(
            "UPDATE xreqs SET
                {col}_matching_amount = open_amount,
                {col}_matching_rate_required = CASE WHEN is_buyer THEN open_rate_required ELSE -open_rate_required END,
                {col}_best_rate = CASE WHEN is_buyer THEN -1e308 ELSE 1e308 END,
                {col}_best_net_rate = 0,
                {col}_best_amount = 0,
                {col}_best_other_seqnum = 0,
                {col}_best_other_xreqnum = 0,
                {col}_best_other_matching_amount = 0,
                {col}_best_other_net_rate = 0
             WHERE {col}_recalc = 1 AND xreqnum <= ?1"
        );
        let changes = sqlx::query(&sql).bind(max_xreqnum).execute(&self.pool).await?.rows_affected();
        Ok(changes)
    }
}

/// The pairwise compatibility test between a buyer (`major`) and a
/// candidate seller (`minor`): every policy dimension must be satisfied
/// simultaneously, matching the original's single giant `WHERE` predicate.
fn minor_is_compatible(major: &Xreq, minor: &Xreq, for_witness: bool) -> bool {
    if minor.xreq_type < major.xreq_type {
        return false;
    }
    if minor.consideration_required > major.consideration_required {
        return false;
    }
    if minor.consideration_offered < major.consideration_offered {
        return false;
    }
    if minor.pledge > major.pledge {
        return false;
    }
    if minor.accept_time_required > major.accept_time_required {
        return false;
    }
    if minor.accept_time_offered < major.accept_time_offered {
        return false;
    }
    if minor.payment_time > major.payment_time {
        return false;
    }
    if minor.confirmations > major.confirmations {
        return false;
    }
    if minor.min_amount > major.min_amount {
        return false;
    }
    let major_state = major.matching(for_witness);
    let minor_state = minor.matching(for_witness);
    if minor_state.matching_amount < major_state.matching_amount {
        return false;
    }
    if minor_state.matching_rate_required > major_state.matching_rate_required {
        return false;
    }
    if for_witness {
        minor.witness.recalc || !major.witness.recalc
    } else {
        minor.canonical.recalc || !major.canonical.recalc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_xreq(oid_byte: u8, is_buyer: bool, rate: f64) -> Xreq {
        Xreq {
            seqnum: 0,
            linked_seqnum: 0,
            oid: cc_hash::compute_oid(1, &[oid_byte]),
            xreqnum: 1,
            xreq_type: 0,
            is_buyer,
            base_asset: 1,
            quote_asset: 2,
            foreign_asset: "USD".into(),
            min_amount: 0,
            max_amount: 1000,
            open_amount: 1000,
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
            canonical: MatchingState { matching_amount: 1000, xreqnum: 1, recalc: true, ..Default::default() },
            witness: MatchingState { matching_amount: 1000, xreqnum: 1, recalc: true, ..Default::default() },
        }
    }

    async fn fresh() -> XreqStore {
        let pool = cc_store::open_in_memory().await.unwrap();
        XreqStore::new(pool, Arc::new(SeqAlloc::new())).await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_select_by_oid_round_trips() {
        let store = fresh().await;
        let xreq = base_xreq(1, true, 1.5);
        let oid = xreq.oid;
        let seqnum = store.insert(xreq).await.unwrap();
        assert!(seqnum != 0);

        let got = store.select_by_oid(&oid).await.unwrap().unwrap();
        assert_eq!(got.seqnum, seqnum);
        assert_eq!(got.open_rate_required, 1.5);
    }

    #[tokio::test]
    async fn reinsert_of_pending_duplicate_oid_reuses_seqnum() {
        let store = fresh().await;
        let mut xreq = base_xreq(2, true, 1.0);
        xreq.xreqnum = 0;
        let oid = xreq.oid;
        let seq1 = store.insert(xreq.clone()).await.unwrap();

        let mut xreq2 = xreq;
        xreq2.seqnum = 0;
        xreq2.open_rate_required = 2.0;
        let seq2 = store.insert(xreq2).await.unwrap();

        assert_eq!(seq1, seq2);
        let got = store.select_by_oid(&oid).await.unwrap().unwrap();
        assert_eq!(got.open_rate_required, 2.0);
    }

    #[tokio::test]
    async fn select_major_respects_rate_order_and_witness_visibility() {
        let store = fresh().await;
        let mut pending = base_xreq(3, true, 3.0);
        pending.xreqnum = 0;
        store.insert(pending).await.unwrap();

        let persistent = base_xreq(4, true, 1.0);
        store.insert(persistent).await.unwrap();

        let off_witness = store
            .select_major(1, 2, "USD", f64::MIN, i64::MIN, i64::MIN, i64::MAX, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(off_witness.open_rate_required, 1.0);

        let witness = store
            .select_major(1, 2, "USD", f64::MIN, i64::MIN, i64::MIN, i64::MAX, true)
            .await
            .unwrap()
            .unwrap();
        assert!(witness.open_rate_required == 1.0 || witness.open_rate_required == 3.0);
    }

    #[tokio::test]
    async fn select_minor_filters_by_policy_compatibility() {
        let store = fresh().await;
        let major = base_xreq(5, true, 1.0);
        store.insert(major.clone()).await.unwrap();

        let mut compatible_minor = base_xreq(6, false, 1.0);
        compatible_minor.canonical.matching_amount = 1000;
        store.insert(compatible_minor).await.unwrap();

        let mut incompatible_minor = base_xreq(7, false, 1.0);
        incompatible_minor.min_amount = major.min_amount + 1;
        store.insert(incompatible_minor).await.unwrap();

        let found = store
            .select_minor(&major, f64::MIN, i64::MIN, i64::MIN, false)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn clear_old_pending_matches_zeros_stale_epochs() {
        let store = fresh().await;
        let mut xreq = base_xreq(8, true, 1.0);
        xreq.pending_match_epoch = 1;
        xreq.pending_match_rate = 5.0;
        let oid = xreq.oid;
        store.insert(xreq).await.unwrap();

        store.clear_old_pending_matches(2, i64::MAX).await.unwrap();

        let got = store.select_by_oid(&oid).await.unwrap().unwrap();
        assert_eq!(got.pending_match_rate, 0.0);
    }

    #[tokio::test]
    async fn seed_matching_state_only_touches_recalc_rows() {
        let store = fresh().await;
        let mut untouched = base_xreq(9, true, 2.0);
        untouched.open_amount = 500;
        untouched.canonical.recalc = false;
        let untouched_oid = untouched.oid;
        store.insert(untouched).await.unwrap();

        let mut recalced = base_xreq(10, true, 3.0);
        recalced.open_amount = 777;
        recalced.canonical.recalc = false;
        recalced.canonical.last_matched = 42;
        let recalced_oid = recalced.oid;
        store.insert(recalced).await.unwrap();

        // Neither row's recalc_time nor last_matched matches these params,
        // except `recalced`'s last_matched == last_matched_num.
        store.set_recalc_flags(false, 42, 0, i64::MAX).await.unwrap();
        store.seed_matching_state(false, i64::MAX).await.unwrap();

        let still_untouched = store.select_by_oid(&untouched_oid).await.unwrap().unwrap();
        assert_eq!(still_untouched.canonical.matching_amount, 1000);

        let was_seeded = store.select_by_oid(&recalced_oid).await.unwrap().unwrap();
        assert_eq!(was_seeded.canonical.matching_amount, 777);
        assert_eq!(was_seeded.canonical.matching_rate_required, 3.0);
    }
}
