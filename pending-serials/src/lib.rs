//! Tentative double-spend ledger scoped to in-flight blocks (§4.6).
//!
//! A serial number's membership here is provisional: each row ties a serial
//! to the block that first claimed it. Multiple blocks may claim the same
//! serial while they race on different forks; [`PendingSerials::select`]
//! walks all of them so a validator can check for conflicts across the
//! candidate set. Once a block becomes indelible its rows graduate from
//! level 0 to its real level via [`PendingSerials::update`]; rows that never
//! graduate are swept away by [`PendingSerials::prune_level`] once the
//! chain has moved past them.

use cc_hash::Oid;
use sqlx::SqlitePool;
use tracing::{debug, info};

fn block_blob(oid: &Oid) -> &[u8] {
    oid.as_bytes()
}

fn block_from_blob(b: &[u8]) -> Option<Oid> {
    let arr: [u8; cc_hash::OID_LEN] = b.try_into().ok()?;
    Some(Oid::from_bytes(arr))
}

pub struct PendingSerials {
    pool: SqlitePool,
}

impl PendingSerials {
    pub async fn new(pool: SqlitePool) -> cc_error::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS temp_serials (
                serial BLOB NOT NULL,
                block_ref BLOB NOT NULL,
                level INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (serial, block_ref)
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS temp_serials_by_serial ON temp_serials (serial, block_ref)")
            .execute(&pool)
            .await?;
        Ok(PendingSerials { pool })
    }

    /// Claims `serial` on behalf of `block_ref`. Returns `Err(Duplicate)`
    /// if this exact (serial, block_ref) pair is already claimed.
    pub async fn insert(&self, serial: &[u8], block_ref: &Oid) -> cc_error::Result<()> {
        let result = sqlx::query(
            "INSERT INTO temp_serials (serial, block_ref, level) VALUES (?1, ?2, 0)",
        )
        .bind(serial)
        .bind(block_blob(block_ref))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                debug!(block_ref = %block_ref, "pending_serials: duplicate claim");
                Err(cc_error::Error::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All block refs that have claimed `serial`, ordered, strictly after
    /// `last_block_ref` (used to walk forward through a candidate fork
    /// set without re-visiting rows already inspected).
    pub async fn select(
        &self,
        serial: &[u8],
        last_block_ref: Option<&Oid>,
    ) -> cc_error::Result<Vec<Oid>> {
        let cursor: Vec<u8> = last_block_ref.map(|o| o.as_bytes().to_vec()).unwrap_or_default();
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT block_ref FROM temp_serials WHERE serial = ?1 AND block_ref > ?2 ORDER BY block_ref",
        )
        .bind(serial)
        .bind(&cursor)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(|(b,)| block_from_blob(&b)).collect())
    }

    /// Rewrites level-0 rows claimed under the temporary `old_ref` to the
    /// block's now-known indelible reference `new_ref`, assigning `level`.
    pub async fn update(&self, old_ref: &Oid, new_ref: &Oid, level: i64) -> cc_error::Result<()> {
        let changes = sqlx::query(
            "UPDATE temp_serials SET block_ref = ?1, level = ?2 WHERE block_ref = ?3 AND level = 0",
        )
        .bind(block_blob(new_ref))
        .bind(level)
        .bind(block_blob(old_ref))
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!(old_ref = %old_ref, new_ref = %new_ref, level, changes, "pending_serials: promoted to indelible block");
        Ok(())
    }

    /// Drops all level-0 rows still claimed under `block_ref` (the block
    /// was abandoned before becoming indelible).
    pub async fn clear(&self, block_ref: &Oid) -> cc_error::Result<()> {
        sqlx::query("DELETE FROM temp_serials WHERE block_ref = ?1 AND level = 0")
            .bind(block_blob(block_ref))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes rows whose level has fallen below `below` (blocks that can
    /// no longer be reorganized back onto the active chain).
    pub async fn prune_level(&self, below: i64) -> cc_error::Result<()> {
        let changes = sqlx::query("DELETE FROM temp_serials WHERE level > 0 AND level < ?1")
            .bind(below)
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(below, changes, "pending_serials: pruned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh() -> PendingSerials {
        let pool = cc_store::open_in_memory().await.unwrap();
        PendingSerials::new(pool).await.unwrap()
    }

    fn block(b: u8) -> Oid {
        cc_hash::compute_oid(1, &[b])
    }

    #[tokio::test]
    async fn duplicate_claim_is_rejected() {
        let store = fresh().await;
        let serial = b"serial-a";
        let blk = block(1);
        store.insert(serial, &blk).await.unwrap();
        let err = store.insert(serial, &blk).await.unwrap_err();
        assert!(matches!(err, cc_error::Error::Duplicate));
    }

    #[tokio::test]
    async fn select_walks_forward_past_cursor() {
        let store = fresh().await;
        let serial = b"serial-b";
        let b1 = block(1);
        let b2 = block(2);
        let b3 = block(3);
        store.insert(serial, &b1).await.unwrap();
        store.insert(serial, &b2).await.unwrap();
        store.insert(serial, &b3).await.unwrap();

        let all = store.select(serial, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let rest = store.select(serial, Some(&all[0])).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(!rest.contains(&all[0]));
    }

    #[tokio::test]
    async fn update_promotes_level_zero_rows_only() {
        let store = fresh().await;
        let serial = b"serial-c";
        let old = block(1);
        let new = block(2);
        store.insert(serial, &old).await.unwrap();

        store.update(&old, &new, 42).await.unwrap();

        let under_new = store.select(serial, None).await.unwrap();
        assert_eq!(under_new, vec![new]);
    }

    #[tokio::test]
    async fn clear_removes_only_level_zero_rows_for_block() {
        let store = fresh().await;
        let serial = b"serial-d";
        let blk = block(1);
        store.insert(serial, &blk).await.unwrap();
        store.clear(&blk).await.unwrap();

        assert!(store.select(serial, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_level_only_touches_nonzero_rows_below_watermark() {
        let store = fresh().await;
        let serial = b"serial-e";
        let old = block(1);
        let new = block(2);
        store.insert(serial, &old).await.unwrap();
        store.update(&old, &new, 5).await.unwrap();

        store.prune_level(6).await.unwrap();
        assert!(store.select(serial, None).await.unwrap().is_empty());
    }
}
