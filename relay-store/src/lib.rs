//! RelayStore: "peer P told us about object O" and the cross-peer retry
//! schedule that governs it (§4.3).
//!
//! Seqnums are assigned from the shared process-global [`cc_seqalloc::SeqAlloc`]
//! (relay domain), and block vs. tx rows are told apart the same way the
//! rest of the pipeline does: negative seqnum = block, positive = tx.

use cc_hash::Oid;
use cc_seqalloc::{Domain, Kind, SeqAlloc};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Per-query cap on relay names (§4.9 budget constants).
pub const RELAY_QUERY_MAX_NAMES: usize = 20;
pub const RELAY_QUERY_MAX_BLOCK_NAMES: usize = 10;

const RETRY_BASE_SECS: i64 = 5;
const RETRY_BYTES_PER_SEC: i64 = 2000;
const RETRY_TIME_MAX_SECS: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ObjStatus {
    Announced = 0,
    Downloaded = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum PeerStatus {
    Ready = 0,
    Started = 1,
}

/// Parameters describing an object as announced by a peer.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub oid: Oid,
    pub size: i64,
    pub level: i64,
    pub prior_oid: Option<Oid>,
    pub is_witness_block: bool,
}

/// One object selected for download by [`RelayStore::find_downloads`].
#[derive(Debug, Clone)]
pub struct DownloadEntry {
    pub seqnum: i64,
    pub oid: Oid,
    pub size: i64,
    pub level: i64,
    pub prior_oid: Option<Oid>,
    pub is_witness_block: bool,
    pub announce_ticks: i64,
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

fn oid_blob(oid: &Oid) -> &[u8] {
    oid.as_bytes()
}

fn oid_from_blob(b: &[u8]) -> Option<Oid> {
    let arr: [u8; cc_hash::OID_LEN] = b.try_into().ok()?;
    Some(Oid::from_bytes(arr))
}

fn kind_of(oid: &Oid, is_block: bool) -> Kind {
    if is_block {
        Kind::Block
    } else {
        let _ = oid;
        Kind::Tx
    }
}

pub struct RelayStore {
    pool: SqlitePool,
    seqalloc: Arc<SeqAlloc>,
    /// Tracks whether `find_downloads` last selected blocks, so a future
    /// batch doesn't mix kinds within itself (checked per-call, stored here
    /// only for diagnostics).
    last_kind_mix_warnings: AtomicU32,
}

impl RelayStore {
    pub async fn new(pool: SqlitePool, seqalloc: Arc<SeqAlloc>) -> cc_error::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS relay_objs (
                seqnum INTEGER PRIMARY KEY,
                announce_ticks INTEGER NOT NULL,
                oid BLOB UNIQUE NOT NULL,
                status INTEGER NOT NULL,
                retry_deadline INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS relay_peers (
                seqnum INTEGER NOT NULL,
                peer INTEGER NOT NULL,
                size INTEGER NOT NULL,
                level INTEGER NOT NULL DEFAULT 0,
                peer_status INTEGER NOT NULL,
                prior_oid BLOB,
                is_witness_block INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (seqnum, peer)
            )",
        )
        .execute(&pool)
        .await?;
        Ok(RelayStore {
            pool,
            seqalloc,
            last_kind_mix_warnings: AtomicU32::new(0),
        })
    }

    /// Records that `peer` announced `params.oid`. New oids get a fresh
    /// relay seqnum; an oid already `Downloaded` is a no-op; a peer
    /// announcing the same oid twice is a silent no-op (not an error).
    pub async fn insert(
        &self,
        peer: i64,
        is_block: bool,
        params: AnnounceParams,
    ) -> cc_error::Result<()> {
        let mut txn = self.pool.begin().await?;

        let existing: Option<(i64, i64)> =
            sqlx::query_as("SELECT seqnum, status FROM relay_objs WHERE oid = ?1")
                .bind(oid_blob(&params.oid))
                .fetch_optional(&mut *txn)
                .await?;

        let seqnum = if let Some((seqnum, status)) = existing {
            if status == ObjStatus::Downloaded as i64 {
                debug!(oid = %params.oid, "relay_store: insert no-op, already downloaded");
                txn.commit().await?;
                return Ok(());
            }
            seqnum
        } else {
            let kind = kind_of(&params.oid, is_block);
            let mut seqnum = self.seqalloc.next(kind, Domain::Relay);
            if cc_seqalloc::is_genesis_rewrite(kind, params.oid.is_zero()) {
                seqnum = 0;
            }
            sqlx::query(
                "INSERT INTO relay_objs (seqnum, announce_ticks, oid, status, retry_deadline)
                 VALUES (?1, ?2, ?3, ?4, 0)",
            )
            .bind(seqnum)
            .bind(now_unix())
            .bind(oid_blob(&params.oid))
            .bind(ObjStatus::Announced as i64)
            .execute(&mut *txn)
            .await?;
            seqnum
        };

        let result = sqlx::query(
            "INSERT OR IGNORE INTO relay_peers
                (seqnum, peer, size, level, peer_status, prior_oid, is_witness_block)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(seqnum)
        .bind(peer)
        .bind(params.size)
        .bind(params.level)
        .bind(PeerStatus::Ready as i64)
        .bind(params.prior_oid.as_ref().map(oid_blob))
        .bind(params.is_witness_block as i64)
        .execute(&mut *txn)
        .await?;

        if result.rows_affected() == 0 {
            debug!(peer, oid = %params.oid, "relay_store: peer re-announced same object, ignored");
        }

        txn.commit().await?;
        Ok(())
    }

    /// Selects download candidates for `peer`, honoring the per-batch
    /// 15-second retry-time budget and refusing to mix block and tx rows in
    /// one batch. Each selected row's retry deadline is bumped so other
    /// callers (and this peer) don't re-select it before the deadline.
    pub async fn find_downloads(
        &self,
        peer: i64,
        tx_level_max: i64,
        max_objs: usize,
        bytes_pending: i64,
    ) -> cc_error::Result<Vec<DownloadEntry>> {
        if max_objs == 0 {
            return Ok(Vec::new());
        }

        let mut total_size = bytes_pending;
        if RETRY_BASE_SECS + total_size / RETRY_BYTES_PER_SEC >= RETRY_TIME_MAX_SECS {
            return Ok(Vec::new());
        }

        let mut txn = self.pool.begin().await?;
        let now = now_unix();

        let rows: Vec<(i64, i64, Vec<u8>, i64, i64, Option<Vec<u8>>, i64)> = sqlx::query_as(
            "SELECT relay_objs.seqnum, relay_objs.announce_ticks, relay_objs.oid,
                    relay_peers.size, relay_peers.level, relay_peers.prior_oid, relay_peers.is_witness_block
             FROM relay_peers JOIN relay_objs ON relay_peers.seqnum = relay_objs.seqnum
             WHERE relay_peers.peer = ?1
               AND relay_peers.peer_status = ?2
               AND relay_objs.status = ?3
               AND (relay_objs.seqnum < 0 OR relay_peers.level <= ?4)
               AND relay_objs.retry_deadline <= ?5
             ORDER BY relay_objs.seqnum
             LIMIT ?6",
        )
        .bind(peer)
        .bind(PeerStatus::Ready as i64)
        .bind(ObjStatus::Announced as i64)
        .bind(tx_level_max)
        .bind(now)
        .bind(max_objs as i64)
        .fetch_all(&mut *txn)
        .await?;

        let mut entries = Vec::new();
        let mut have_blocks = false;

        for (seqnum, announce_ticks, oid_bytes, size, level, prior_oid_bytes, is_witness) in rows {
            let is_block = seqnum < 0;
            if entries.is_empty() {
                have_blocks = is_block;
            } else if is_block != have_blocks {
                self.last_kind_mix_warnings.fetch_add(1, AtomicOrdering::SeqCst);
                break;
            }

            let Some(oid) = oid_from_blob(&oid_bytes) else { continue };
            let prior_oid = prior_oid_bytes.as_deref().and_then(oid_from_blob);

            total_size += size;
            let timeout = RETRY_BASE_SECS + total_size / RETRY_BYTES_PER_SEC;

            sqlx::query("UPDATE relay_peers SET peer_status = ?3 WHERE seqnum = ?1 AND peer = ?2")
                .bind(seqnum)
                .bind(peer)
                .bind(PeerStatus::Started as i64)
                .execute(&mut *txn)
                .await?;

            sqlx::query("UPDATE relay_objs SET retry_deadline = ?2 WHERE seqnum = ?1")
                .bind(seqnum)
                .bind(now + timeout)
                .execute(&mut *txn)
                .await?;

            entries.push(DownloadEntry {
                seqnum,
                oid,
                size,
                level,
                prior_oid,
                is_witness_block: is_witness != 0,
                announce_ticks,
            });

            if timeout >= RETRY_TIME_MAX_SECS {
                break;
            }
        }

        txn.commit().await?;
        Ok(entries)
    }

    /// Promotes (or resets) an object's status. Transitioning a tx to
    /// `Downloaded` deletes its per-peer rows outright (there is nothing
    /// left to police); a block's peer rows are kept so a misbehaving peer
    /// can't re-flood us at that level.
    pub async fn set_status(&self, oid: &Oid, status: ObjStatus, timeout: i64) -> cc_error::Result<()> {
        let mut txn = self.pool.begin().await?;

        let seqnum: Option<(i64,)> = sqlx::query_as("SELECT seqnum FROM relay_objs WHERE oid = ?1")
            .bind(oid_blob(oid))
            .fetch_optional(&mut *txn)
            .await?;
        let Some((seqnum,)) = seqnum else {
            txn.commit().await?;
            return Ok(());
        };

        sqlx::query("UPDATE relay_objs SET status = ?2, retry_deadline = ?3 WHERE oid = ?1")
            .bind(oid_blob(oid))
            .bind(status as i64)
            .bind(now_unix() + timeout)
            .execute(&mut *txn)
            .await?;

        if status == ObjStatus::Downloaded && seqnum > 0 {
            sqlx::query("DELETE FROM relay_peers WHERE seqnum = ?1")
                .bind(seqnum)
                .execute(&mut *txn)
                .await?;
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn delete_peer(&self, peer: i64) -> cc_error::Result<u64> {
        let result = sqlx::query("DELETE FROM relay_peers WHERE peer = ?1")
            .bind(peer)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_seqnum(&self, seqnum: i64) -> cc_error::Result<()> {
        let mut txn = self.pool.begin().await?;
        sqlx::query("DELETE FROM relay_objs WHERE seqnum = ?1")
            .bind(seqnum)
            .execute(&mut *txn)
            .await?;
        sqlx::query("DELETE FROM relay_peers WHERE seqnum = ?1")
            .bind(seqnum)
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Oldest entry in `[min_seq, max_seq]`, skipping `last_returned_seq` so
    /// a caller driving a forward scan makes progress even when the
    /// previous entry hasn't been deleted yet.
    pub async fn get_expires(
        &self,
        min_seq: i64,
        max_seq: i64,
        last_returned_seq: Option<i64>,
    ) -> cc_error::Result<Option<(i64, i64)>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT seqnum, announce_ticks FROM relay_objs
             WHERE seqnum >= ?1 AND seqnum <= ?2 AND seqnum != ?3
             ORDER BY seqnum LIMIT 1",
        )
        .bind(min_seq)
        .bind(max_seq)
        .bind(last_returned_seq.unwrap_or(i64::MIN))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Counts how many times `find_downloads` has stopped a batch early
    /// because the next row's kind (block vs. tx) didn't match the batch
    /// already in progress. Diagnostics only; a healthy peer queue never
    /// interleaves the two kinds within a single caller-supplied `max_objs`
    /// window, so a rising count points at an ordering bug upstream.
    pub fn kind_mix_warning_count(&self) -> u32 {
        self.last_kind_mix_warnings.load(AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> RelayStore {
        let pool = cc_store::open_in_memory().await.unwrap();
        RelayStore::new(pool, Arc::new(SeqAlloc::new())).await.unwrap()
    }

    fn oid(b: u8) -> Oid {
        cc_hash::compute_oid(1, &[b])
    }

    fn params(oid: Oid) -> AnnounceParams {
        AnnounceParams { oid, size: 100, level: 0, prior_oid: None, is_witness_block: false }
    }

    #[tokio::test]
    async fn insert_then_find_downloads_marks_started() {
        let store = fresh().await;
        let o = oid(1);
        store.insert(7, false, params(o)).await.unwrap();

        let entries = store.find_downloads(7, 1_000_000, 20, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].oid, o);

        // Not re-selected for the same peer until the retry deadline passes.
        let again = store.find_downloads(7, 1_000_000, 20, 0).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn insert_on_downloaded_is_noop() {
        let store = fresh().await;
        let o = oid(1);
        store.insert(1, false, params(o)).await.unwrap();
        store.set_status(&o, ObjStatus::Downloaded, 0).await.unwrap();
        store.insert(2, false, params(o)).await.unwrap();

        let entries = store.find_downloads(2, 1_000_000, 20, 0).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn double_peer_announce_is_silent_noop() {
        let store = fresh().await;
        let o = oid(1);
        store.insert(1, false, params(o)).await.unwrap();
        store.insert(1, false, params(o)).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM relay_peers")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn set_status_downloaded_on_tx_drops_peer_rows() {
        let store = fresh().await;
        let o = oid(1);
        store.insert(1, false, params(o)).await.unwrap();
        store.set_status(&o, ObjStatus::Downloaded, 0).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM relay_peers")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn delete_peer_removes_only_that_peers_rows() {
        let store = fresh().await;
        store.insert(1, false, params(oid(1))).await.unwrap();
        store.insert(2, false, params(oid(1))).await.unwrap();

        let n = store.delete_peer(1).await.unwrap();
        assert_eq!(n, 1);
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM relay_peers")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn get_expires_skips_last_returned() {
        let store = fresh().await;
        store.insert(1, false, params(oid(1))).await.unwrap();
        store.insert(1, false, params(oid(2))).await.unwrap();

        let first = store.get_expires(1, i64::MAX, None).await.unwrap().unwrap();
        let second = store.get_expires(1, i64::MAX, Some(first.0)).await.unwrap().unwrap();
        assert_ne!(first.0, second.0);
    }

    #[tokio::test]
    async fn find_downloads_stops_at_a_kind_boundary_and_counts_it() {
        let store = fresh().await;
        // A block seqnum is negative (see cc_seqalloc), so inserting a tx
        // announce then a block announce from the same peer gives
        // find_downloads two rows of differing kind to walk past.
        store.insert(1, false, params(oid(1))).await.unwrap();
        store.insert(1, true, params(oid(2))).await.unwrap();

        let entries = store.find_downloads(1, 1_000_000, 20, 0).await.unwrap();
        assert_eq!(entries.len(), 1, "batch should stop at the kind boundary");
        assert_eq!(store.kind_mix_warning_count(), 1);
    }
}
