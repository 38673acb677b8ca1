//! Per-peer advertise/download scheduler (§4.9), built on top of
//! [`cc_relay_store::RelayStore`] and [`cc_valid_store::ValidStore`].
//!
//! `RelayFsm` does not own a socket; it is handed the bytes a `Connection`
//! read and returns the bytes a `Connection` should write, so it can be
//! exercised in tests without any networking at all. The five numbered
//! steps in §4.9 map onto the five public methods below in the same order.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use cc_hash::Oid;
use cc_protocol::{
    encode_header, encode_object, CC_CMD_SEND_BLOCK, CC_CMD_SEND_TX, CC_MSG_HAVE_BLOCK,
    CC_MSG_HAVE_TX,
};
use cc_relay_store::{AnnounceParams, ObjStatus, RelayStore, RELAY_QUERY_MAX_BLOCK_NAMES, RELAY_QUERY_MAX_NAMES};
use cc_valid_store::ValidStore;
use tracing::debug;

/// One `CC_MSG_HAVE_*` entry as carried on the wire: oid, optional prior
/// oid (blocks only), level/size, and the witness flag, concatenated after
/// an 8-byte `size|tag` header built by [`encode_header`].
fn encode_have_entry(out: &mut Vec<u8>, entry: &cc_valid_store::HaveEntry) {
    out.extend_from_slice(entry.oid.as_bytes());
    let has_prior = entry.prior_oid.is_some();
    out.push(has_prior as u8);
    if let Some(prior) = entry.prior_oid {
        out.extend_from_slice(prior.as_bytes());
    }
    out.extend_from_slice(&entry.level.to_le_bytes());
    out.extend_from_slice(&entry.size.to_le_bytes());
    out.push(entry.is_witness_block as u8);
}

fn have_entry_wire_size(entry: &cc_valid_store::HaveEntry) -> usize {
    let mut buf = Vec::new();
    encode_have_entry(&mut buf, entry);
    buf.len()
}

/// Per-peer scheduling state: the relay seqnum cursor this peer has already
/// been advertised up through, and this peer's identity as used by the
/// stores (an opaque `i64`, e.g. the owning `Connection`'s slot index).
pub struct RelayFsm {
    peer: i64,
    next_advertise_seq: AtomicI64,
    relay_store: Arc<RelayStore>,
    valid_store: Arc<ValidStore>,
}

impl RelayFsm {
    pub fn new(peer: i64, relay_store: Arc<RelayStore>, valid_store: Arc<ValidStore>) -> Self {
        RelayFsm {
            peer,
            next_advertise_seq: AtomicI64::new(i64::MIN + 1),
            relay_store,
            valid_store,
        }
    }

    pub fn peer(&self) -> i64 {
        self.peer
    }

    /// Step 1: scans `ValidStore` forward from this peer's cursor and
    /// returns zero or more complete `CC_MSG_HAVE_*` wire buffers, each
    /// holding as many whole entries as fit the given byte budget.
    pub async fn advertise(&self, max_entries: usize, out_budget: usize) -> cc_error::Result<Vec<Vec<u8>>> {
        let mut cursor = self.next_advertise_seq.load(Ordering::SeqCst);
        let entries = self
            .valid_store
            .find_new(&mut cursor, max_entries, true, out_budget, have_entry_wire_size)
            .await?;
        self.next_advertise_seq.store(cursor, Ordering::SeqCst);

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut blocks = Vec::new();
        let mut txs = Vec::new();
        for e in entries {
            if e.seqnum < 0 {
                blocks.push(e);
            } else {
                txs.push(e);
            }
        }

        let mut out = Vec::new();
        for (group, tag) in [(blocks, CC_MSG_HAVE_BLOCK), (txs, CC_MSG_HAVE_TX)] {
            if group.is_empty() {
                continue;
            }
            let mut body = Vec::new();
            for e in &group {
                encode_have_entry(&mut body, e);
            }
            let size = (4 + body.len()) as u32;
            let mut msg = encode_header(size, tag).to_vec();
            msg.extend_from_slice(&body);
            out.push(msg);
        }
        Ok(out)
    }

    /// Step 2: records one inbound `CC_MSG_HAVE_*` advertisement.
    pub async fn on_have(&self, is_block: bool, params: AnnounceParams) -> cc_error::Result<()> {
        self.relay_store.insert(self.peer, is_block, params).await
    }

    /// Step 3: when idle, asks `RelayStore` for this peer's next download
    /// batch and renders it as a `CC_CMD_SEND_*` wire buffer, or `None` if
    /// there is nothing to request right now.
    pub async fn request_downloads(&self, tx_level_max: i64, bytes_pending: i64) -> cc_error::Result<Option<Vec<u8>>> {
        let entries = self
            .relay_store
            .find_downloads(self.peer, tx_level_max, RELAY_QUERY_MAX_NAMES, bytes_pending)
            .await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let is_block = entries[0].seqnum < 0;
        let cap = if is_block { RELAY_QUERY_MAX_BLOCK_NAMES } else { RELAY_QUERY_MAX_NAMES };
        let tag = if is_block { CC_CMD_SEND_BLOCK } else { CC_CMD_SEND_TX };

        let mut body = Vec::new();
        for e in entries.iter().take(cap) {
            body.extend_from_slice(e.oid.as_bytes());
        }
        let size = (4 + body.len()) as u32;
        let mut msg = encode_header(size, tag).to_vec();
        msg.extend_from_slice(&body);
        Ok(Some(msg))
    }

    /// Step 4: given the oids named by an inbound `CC_CMD_SEND_*`, looks
    /// them up in `ValidStore` and returns the complete wire objects to
    /// push back (oids this node no longer has are silently skipped — the
    /// requester will time out and retry against another peer).
    pub async fn serve_downloads(&self, oids: &[Oid]) -> cc_error::Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(oids.len());
        for oid in oids {
            if let Some(handle) = self.valid_store.get(oid, false).await? {
                if let Some(data) = handle.data() {
                    out.push(data.to_vec());
                }
            } else {
                debug!(peer = self.peer, oid = %oid, "relay_fsm: requested oid no longer available");
            }
        }
        Ok(out)
    }

    /// Step 5: records a fully received object as downloaded. Callers are
    /// expected to have already run it through [`cc_valid_store::ValidStore::insert`]
    /// and the process queue's validation pipeline; this just flips the
    /// relay status and (via the caller's `cc-notify` controller) lets
    /// other peers' advertisers pick it up without an extra poll.
    pub async fn mark_downloaded(&self, oid: &Oid) -> cc_error::Result<()> {
        self.relay_store.set_status(oid, ObjStatus::Downloaded, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_seqalloc::SeqAlloc;
    use std::sync::Arc;

    async fn fresh_fsm(peer: i64) -> RelayFsm {
        let relay_pool = cc_store::open_in_memory().await.unwrap();
        let valid_pool = cc_store::open_in_memory().await.unwrap();
        let seqalloc = Arc::new(SeqAlloc::new());
        let relay_store = Arc::new(RelayStore::new(relay_pool, seqalloc.clone()).await.unwrap());
        let valid_store = Arc::new(ValidStore::new(valid_pool, seqalloc).await.unwrap());
        RelayFsm::new(peer, relay_store, valid_store)
    }

    fn oid(b: u8) -> Oid {
        cc_hash::compute_oid(2, &[b])
    }

    #[tokio::test]
    async fn advertise_yields_nothing_on_empty_store() {
        let fsm = fresh_fsm(1).await;
        let msgs = fsm.advertise(20, 4096).await.unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn advertise_then_have_round_trips_through_two_peers() {
        let fsm_a = fresh_fsm(1).await;
        let o = oid(9);
        let handle = cc_refbuf::RefBuf::alloc(4);
        fsm_a.valid_store.insert(handle, o, false, None, 0, 4, false).await.unwrap();

        let msgs = fsm_a.advertise(20, 4096).await.unwrap();
        assert_eq!(msgs.len(), 1);

        let fsm_b = fresh_fsm(2).await;
        fsm_b
            .on_have(
                false,
                AnnounceParams { oid: o, size: 4, level: 0, prior_oid: None, is_witness_block: false },
            )
            .await
            .unwrap();

        let cmd = fsm_b.request_downloads(1000, 0).await.unwrap();
        assert!(cmd.is_some());
    }

    #[tokio::test]
    async fn serve_downloads_skips_missing_oids() {
        let fsm = fresh_fsm(1).await;
        let missing = oid(1);
        let out = fsm.serve_downloads(&[missing]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn mark_downloaded_is_a_noop_for_unknown_oid() {
        let fsm = fresh_fsm(1).await;
        fsm.mark_downloaded(&oid(3)).await.unwrap();
    }
}
