//! ValidStore: content-addressed cache of validated objects, indexed by
//! oid and by monotonic seqnum (§4.5).
//!
//! Like [`cc_process_queue`], the live buffer lives in an in-memory side
//! table (`bufs: DashMap<Oid, RefBuf>`) rather than as a raw pointer blob in
//! SQL — the metadata table alone carries the columns callers actually
//! reason about (seqnum, announce_ticks, oid, ...).

use cc_hash::Oid;
use cc_refbuf::RefBuf;
use cc_seqalloc::{Domain, Kind, SeqAlloc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

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

/// One entry as produced by [`ValidStore::find_new`]'s message-emission
/// mode: enough to build a `CC_MSG_HAVE_*` wire record.
#[derive(Debug, Clone)]
pub struct HaveEntry {
    pub seqnum: i64,
    pub oid: Oid,
    pub prior_oid: Option<Oid>,
    pub level: i64,
    pub size: i64,
    pub is_witness_block: bool,
}

pub struct ValidStore {
    pool: SqlitePool,
    seqalloc: Arc<SeqAlloc>,
    bufs: DashMap<Oid, RefBuf>,
}

impl ValidStore {
    pub async fn new(pool: SqlitePool, seqalloc: Arc<SeqAlloc>) -> cc_error::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS valid_objs (
                seqnum INTEGER PRIMARY KEY,
                announce_ticks INTEGER NOT NULL,
                oid BLOB UNIQUE NOT NULL,
                prior_oid BLOB,
                level INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL,
                is_witness_block INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        Ok(ValidStore { pool, seqalloc, bufs: DashMap::new() })
    }

    /// Inserts a validated object, assigning a seqnum from the appropriate
    /// range (`is_block` selects the SeqAlloc kind). Genesis (the all-zero
    /// block oid) is special-cased to seqnum 0. A duplicate oid is a
    /// silent no-op and returns `None`.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        handle: RefBuf,
        oid: Oid,
        is_block: bool,
        prior_oid: Option<Oid>,
        level: i64,
        size: i64,
        is_witness_block: bool,
    ) -> cc_error::Result<Option<i64>> {
        let mut txn = self.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as("SELECT seqnum FROM valid_objs WHERE oid = ?1")
            .bind(oid_blob(&oid))
            .fetch_optional(&mut *txn)
            .await?;
        if existing.is_some() {
            debug!(oid = %oid, "valid_store: insert no-op, already known");
            txn.commit().await?;
            return Ok(None);
        }

        let kind = if is_block { Kind::Block } else { Kind::Tx };
        let mut seqnum = self.seqalloc.next(kind, Domain::Valid);
        if cc_seqalloc::is_genesis_rewrite(kind, oid.is_zero()) {
            seqnum = 0;
        }

        sqlx::query(
            "INSERT INTO valid_objs (seqnum, announce_ticks, oid, prior_oid, level, size, is_witness_block)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(seqnum)
        .bind(now_unix())
        .bind(oid_blob(&oid))
        .bind(prior_oid.as_ref().map(oid_blob))
        .bind(level)
        .bind(size)
        .bind(is_witness_block as i64)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        self.bufs.insert(oid, handle);
        Ok(Some(seqnum))
    }

    /// Looks up the object whose oid equals, or (with `or_greater`) is the
    /// smallest oid greater than, `oid`.
    pub async fn get(&self, oid: &Oid, or_greater: bool) -> cc_error::Result<Option<RefBuf>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT oid FROM valid_objs WHERE oid >= ?1 ORDER BY oid LIMIT 1")
                .bind(oid_blob(oid))
                .fetch_optional(&self.pool)
                .await?;

        let Some((found_bytes,)) = row else { return Ok(None) };
        let Some(found) = oid_from_blob(&found_bytes) else { return Ok(None) };
        if &found != oid && !or_greater {
            return Ok(None);
        }
        Ok(self.bufs.get(&found).map(|h| h.clone()))
    }

    /// Sweeps forward from `*next_seqnum`, collecting up to `max` entries
    /// whose seqnum exceeds the cursor. In "messages" mode, each entry is
    /// rendered as a [`HaveEntry`]; a whole-entry budget (`out_budget`
    /// bytes, as the wire encoding of that many `CC_MSG_HAVE_*` records
    /// would take) governs how many are returned — an entry that would not
    /// fit rewinds the cursor to that entry's seqnum so the next call
    /// re-emits it whole (see DESIGN.md's Open Question decision: no
    /// message is ever split across two calls).
    pub async fn find_new(
        &self,
        next_seqnum: &mut i64,
        max: usize,
        want_msgs: bool,
        out_budget: usize,
        entry_wire_size: impl Fn(&HaveEntry) -> usize,
    ) -> cc_error::Result<Vec<HaveEntry>> {
        let rows: Vec<(i64, Vec<u8>, Option<Vec<u8>>, i64, i64, i64)> = sqlx::query_as(
            "SELECT seqnum, oid, prior_oid, level, size, is_witness_block FROM valid_objs
             WHERE seqnum > ?1 ORDER BY seqnum LIMIT ?2",
        )
        .bind(*next_seqnum)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        let mut used = 0usize;

        for (seqnum, oid_bytes, prior_oid_bytes, level, size, is_witness) in rows {
            let Some(oid) = oid_from_blob(&oid_bytes) else { continue };
            let prior_oid = prior_oid_bytes.as_deref().and_then(oid_from_blob);
            let entry = HaveEntry { seqnum, oid, prior_oid, level, size, is_witness_block: is_witness != 0 };

            if want_msgs {
                let wire = entry_wire_size(&entry);
                if used + wire > out_budget {
                    // Rewind: this entry (and everything after it) is
                    // deferred whole to the caller's next pass.
                    return Ok(out);
                }
                used += wire;
            }

            *next_seqnum = seqnum;
            out.push(entry);
        }

        Ok(out)
    }

    pub async fn delete_obj(&self, oid: &Oid) -> cc_error::Result<()> {
        sqlx::query("DELETE FROM valid_objs WHERE oid = ?1")
            .bind(oid_blob(oid))
            .execute(&self.pool)
            .await?;
        self.bufs.remove(oid);
        Ok(())
    }

    pub async fn delete_by_seqnum(&self, seqnum: i64) -> cc_error::Result<()> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT oid FROM valid_objs WHERE seqnum = ?1")
            .bind(seqnum)
            .fetch_optional(&self.pool)
            .await?;
        sqlx::query("DELETE FROM valid_objs WHERE seqnum = ?1")
            .bind(seqnum)
            .execute(&self.pool)
            .await?;
        if let Some((oid_bytes,)) = row {
            if let Some(oid) = oid_from_blob(&oid_bytes) {
                self.bufs.remove(&oid);
            }
        }
        Ok(())
    }

    pub async fn get_expires(
        &self,
        min_seq: i64,
        max_seq: i64,
    ) -> cc_error::Result<Option<(i64, RefBuf, i64)>> {
        let row: Option<(i64, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT seqnum, oid, announce_ticks FROM valid_objs
             WHERE seqnum >= ?1 AND seqnum <= ?2 ORDER BY seqnum LIMIT 1",
        )
        .bind(min_seq)
        .bind(max_seq)
        .fetch_optional(&self.pool)
        .await?;

        let Some((seqnum, oid_bytes, t0)) = row else { return Ok(None) };
        let Some(oid) = oid_from_blob(&oid_bytes) else { return Ok(None) };
        let Some(handle) = self.bufs.get(&oid).map(|h| h.clone()) else { return Ok(None) };
        Ok(Some((seqnum, handle, t0)))
    }

    /// Live buffer count, for diagnostics/tests (not in the original API,
    /// but a cheap way to assert the strong-reference invariant holds).
    pub fn live_buf_count(&self) -> usize {
        self.bufs.len()
    }
}
