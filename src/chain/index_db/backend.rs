// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::blocks::{Height, TipsetHash, TipsetKey};
use crate::chain::{BranchId, BranchInfo, Error, RenameBranch, TipsetInfo, GENESIS_BRANCH};
use crate::utils::sqlite;
use cid::multihash::Multihash;
use cid::Cid;
use sqlx::{Row, SqlitePool};
use tracing::error;

/// Multihash code of BLAKE2b-256, the only hash function the index stores.
const BLAKE2B_256: u64 = 0xb220;
/// Fixed width of the stored digests.
const BYTES_IN_HASH: usize = 32;

const SCHEMA_VERSION: u64 = 1;

/// A raw `tipsets` row, hashes still undecoded.
#[derive(Clone, Debug, Default)]
pub struct TipsetIdx {
    pub hash: TipsetHash,
    pub branch: BranchId,
    pub height: Height,
    pub parent_hash: Option<TipsetHash>,
    pub cids: Vec<u8>,
}

/// Sqlite persistence of the tipset index: one row per tipset, keyed by
/// tipset hash, with a unique `(branch, height)` position.
pub struct IndexDbBackend {
    pool: SqlitePool,
}

/// Encodes the block CIDs of a tipset key as concatenated fixed-width
/// BLAKE2b-256 digests. Any other digest width means the key was built with a
/// different hash scheme and cannot be persisted in this layout.
fn encode_cids(cids: &[Cid]) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::with_capacity(cids.len() * BYTES_IN_HASH);
    for cid in cids {
        let digest = cid.hash().digest();
        if digest.len() != BYTES_IN_HASH {
            return Err(Error::DataIntegrity(format!(
                "unexpected digest width {} in {cid}",
                digest.len()
            )));
        }
        buffer.extend_from_slice(digest);
    }
    Ok(buffer)
}

/// Decodes the `cids` column back into CIDs under the fixed
/// CIDv1/DAG-CBOR/BLAKE2b-256 scheme.
fn decode_cids(bytes: &[u8]) -> Result<Vec<Cid>, Error> {
    if bytes.len() % BYTES_IN_HASH != 0 {
        return Err(Error::DataIntegrity(format!(
            "cids blob of invalid length {}",
            bytes.len()
        )));
    }
    let mut cids = Vec::with_capacity(bytes.len() / BYTES_IN_HASH);
    for digest in bytes.chunks_exact(BYTES_IN_HASH) {
        let mh = Multihash::wrap(BLAKE2B_256, digest)
            .map_err(|e| Error::DataIntegrity(format!("cannot rebuild multihash: {e}")))?;
        cids.push(Cid::new_v1(fvm_ipld_encoding::DAG_CBOR, mh));
    }
    Ok(cids)
}

fn decode_hash(bytes: &[u8]) -> Result<TipsetHash, Error> {
    TipsetHash::try_from(bytes).map_err(|e| Error::DataIntegrity(e.to_string()))
}

/// `parent_hash` is stored as an empty blob for the genesis row.
fn decode_parent_hash(bytes: &[u8]) -> Result<Option<TipsetHash>, Error> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        decode_hash(bytes).map(Some)
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<TipsetIdx, Error> {
    Ok(TipsetIdx {
        hash: decode_hash(row.get::<&[u8], _>(0))?,
        branch: row.get::<i64, _>(1) as BranchId,
        height: row.get::<i64, _>(2) as Height,
        parent_hash: decode_parent_hash(row.get::<&[u8], _>(3))?,
        cids: row.get::<Vec<u8>, _>(4),
    })
}

const SELECT_COLUMNS: &str = "SELECT hash,branch,height,parent_hash,cids FROM tipsets";

impl IndexDbBackend {
    /// Opens the backend over an existing pool, creating the schema when it
    /// is not there yet.
    pub async fn open(pool: SqlitePool) -> Result<Self, Error> {
        sqlite::init_db(
            &pool,
            "indexdb",
            SCHEMA_VERSION,
            [
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS tipsets (
                        hash BLOB PRIMARY KEY,
                        branch INTEGER NOT NULL,
                        height INTEGER NOT NULL,
                        parent_hash BLOB NOT NULL,
                        cids BLOB NOT NULL)",
                ),
                sqlx::query(
                    "CREATE UNIQUE INDEX IF NOT EXISTS tipsets_b_h ON tipsets (branch, height)",
                ),
            ],
        )
        .await
        .map_err(|e| {
            error!("cannot create index db: {e}");
            Error::Backend(e.to_string())
        })?;
        Ok(Self { pool })
    }

    /// Reconstructs the branch stubs of the persisted graph: rows grouped by
    /// branch give each branch its bottom (`MIN(height)`) and top
    /// (`MAX(height)`), and parent links are resolved by matching parent
    /// hashes against other branches' top hashes.
    pub async fn init_db(&self) -> Result<BTreeMap<BranchId, BranchInfo>, Error> {
        let mut branches: BTreeMap<BranchId, BranchInfo> = BTreeMap::new();

        let bottoms =
            sqlx::query("SELECT branch,MIN(height),hash,parent_hash FROM tipsets GROUP BY branch")
                .fetch_all(&self.pool)
                .await?;
        for row in &bottoms {
            let id = row.get::<i64, _>(0) as BranchId;
            let height = row.get::<i64, _>(1) as Height;
            let hash = decode_hash(row.get::<&[u8], _>(2))?;
            let parent_hash = decode_parent_hash(row.get::<&[u8], _>(3))?;
            branches.insert(
                id,
                BranchInfo {
                    id,
                    top: hash,
                    top_height: height,
                    bottom: hash,
                    bottom_height: height,
                    parent: None,
                    parent_hash,
                    synced_to_genesis: false,
                    forks: Default::default(),
                },
            );
        }

        if branches.is_empty() {
            // new db here
            return Ok(branches);
        }

        let tops = sqlx::query("SELECT branch,MAX(height),hash FROM tipsets GROUP BY branch")
            .fetch_all(&self.pool)
            .await?;
        for row in &tops {
            let id = row.get::<i64, _>(0) as BranchId;
            let height = row.get::<i64, _>(1) as Height;
            let hash = decode_hash(row.get::<&[u8], _>(2))?;
            let info = branches.get_mut(&id).ok_or_else(|| {
                error!("cannot load graph: data integrity error");
                Error::DataIntegrity(format!("branch {id} has a top but no bottom"))
            })?;
            info.top = hash;
            info.top_height = height;
        }

        let top_hashes: BTreeMap<TipsetHash, BranchId> =
            branches.values().map(|b| (b.top, b.id)).collect();
        for info in branches.values_mut() {
            if let Some(parent_hash) = info.parent_hash {
                info.parent = top_hashes.get(&parent_hash).copied();
            }
        }

        Ok(branches)
    }

    /// Inserts a tipset row and applies the branch rename, if any, in one
    /// transaction. Doing these non-atomically would let the persisted view
    /// and the in-memory graph diverge permanently.
    pub async fn store(
        &self,
        info: &TipsetInfo,
        rename: Option<&RenameBranch>,
    ) -> Result<(), Error> {
        let cids = encode_cids(info.key.cids())?;
        let parent_hash = info
            .parent_hash
            .as_ref()
            .map(|h| h.as_bytes().to_vec())
            .unwrap_or_default();
        if info.parent_hash.is_none() && (info.branch != GENESIS_BRANCH || info.height != 0) {
            return Err(Error::Invariant(format!(
                "only the genesis row may lack a parent hash, got {}:{}",
                info.branch, info.height
            )));
        }

        // uncommitted transactions roll back on drop
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query("INSERT INTO tipsets VALUES (?,?,?,?,?)")
            .bind(info.key.hash().as_bytes())
            .bind(info.branch as i64)
            .bind(info.height as i64)
            .bind(parent_hash)
            .bind(cids)
            .execute(tx.as_mut())
            .await?;
        if inserted.rows_affected() != 1 {
            return Err(Error::Backend("tipset row was not inserted".to_string()));
        }
        if let Some(rename) = rename {
            sqlx::query("UPDATE tipsets SET branch=? WHERE branch=? AND height>?")
                .bind(rename.new_id as i64)
                .bind(rename.old_id as i64)
                .bind(rename.above_height as i64)
                .execute(tx.as_mut())
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Point lookup by tipset hash.
    pub async fn get(&self, hash: &TipsetHash) -> Result<TipsetIdx, Error> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE hash=?"))
            .bind(hash.as_bytes())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::TipsetNotFound(*hash))?;
        decode_row(&row)
    }

    /// First row of `branch` at or above `height`. Heights inside a branch
    /// may be sparse, so "at or above" is the position lookup that works for
    /// both exact hits and the next tipset after a gap.
    pub async fn get_at(&self, branch: BranchId, height: Height) -> Result<TipsetIdx, Error> {
        self.walk(branch, height, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::TipsetNotFoundAt { branch, height })
    }

    /// Up to `limit` rows of `branch` starting at or above `height`, height
    /// ascending.
    pub async fn walk(
        &self,
        branch: BranchId,
        height: Height,
        limit: u64,
    ) -> Result<Vec<TipsetIdx>, Error> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE branch=? AND height>=? ORDER BY height LIMIT ?"
        ))
        .bind(branch as i64)
        .bind(height as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_row).collect()
    }

    /// Decodes a raw row into a [`TipsetInfo`].
    pub fn decode(raw: TipsetIdx) -> Result<Arc<TipsetInfo>, Error> {
        let cids = decode_cids(&raw.cids)?;
        Ok(Arc::new(TipsetInfo {
            key: TipsetKey::new(cids),
            branch: raw.branch,
            height: raw.height,
            parent_hash: raw.parent_hash,
        }))
    }
}
