//! StateStore — redb-backed member persistence.
//!
//! All mutations run in a single write transaction that also bumps the
//! data version, so a batch update is observed atomically by readers.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;
use uuid::Uuid;

use strata_core::Rank;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::Member;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe membership store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "membership store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory membership store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace one member.
    pub fn put_member(&self, member: &Member) -> StateResult<u64> {
        self.put_members(std::slice::from_ref(member))
    }

    /// Insert or replace a batch of members in one transaction.
    ///
    /// Returns the new data version.
    pub fn put_members(&self, members: &[Member]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            for member in members {
                let value = serde_json::to_vec(member).map_err(map_err!(Serialize))?;
                table
                    .insert(member.rank.get(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        let version = bump_version(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = members.len(), version, "members stored");
        Ok(version)
    }

    pub fn get_member(&self, rank: Rank) -> StateResult<Option<Member>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        match table.get(rank.get()).map_err(map_err!(Read))? {
            Some(guard) => {
                let member: Member =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    pub fn find_member_by_uuid(&self, uuid: &Uuid) -> StateResult<Option<Member>> {
        Ok(self
            .list_members()?
            .into_iter()
            .find(|m| &m.uuid == uuid))
    }

    /// All members, ordered by rank.
    pub fn list_members(&self) -> StateResult<Vec<Member>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let member: Member =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(member);
        }
        Ok(results)
    }

    /// Delete a member by rank. Returns true if it existed.
    pub fn delete_member(&self, rank: Rank) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            existed = table.remove(rank.get()).map_err(map_err!(Write))?.is_some();
        }
        if existed {
            bump_version(&txn)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%rank, existed, "member deleted");
        Ok(existed)
    }

    /// Monotonic version of the membership data; 0 for an empty store.
    pub fn data_version(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        let version = table
            .get(DATA_VERSION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(version)
    }
}

fn bump_version(txn: &WriteTransaction) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(DATA_VERSION_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(DATA_VERSION_KEY, next).map_err(map_err!(Write))?;
    Ok(next)
}
