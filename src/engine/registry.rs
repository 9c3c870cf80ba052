use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedPoolState = Arc<RwLock<PoolState>>;

/// One pool per weekday, addressable by id or by day.
pub struct PoolRegistry {
    pools: DashMap<Ulid, SharedPoolState>,
    by_day: DashMap<Weekday, Ulid>,
    /// Serializes pool creation so the day check and the insert are one step.
    creation: Arc<Mutex<()>>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            by_day: DashMap::new(),
            creation: Arc::new(Mutex::new(())),
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedPoolState> {
        self.pools.get(id).map(|e| e.value().clone())
    }

    pub fn id_for_day(&self, day: Weekday) -> Option<Ulid> {
        self.by_day.get(&day).map(|e| *e.value())
    }

    pub(super) async fn lock_creation(&self) -> OwnedMutexGuard<()> {
        self.creation.clone().lock_owned().await
    }

    /// Register a pool. Returns false if its day is already taken.
    pub(super) fn insert(&self, pool: PoolState) -> bool {
        if self.by_day.contains_key(&pool.day) {
            return false;
        }
        self.by_day.insert(pool.day, pool.id);
        self.pools.insert(pool.id, Arc::new(RwLock::new(pool)));
        true
    }

    /// Drop a pool with no occupied slots. Returns false if it is unknown or busy.
    pub(super) fn withdraw(&self, id: &Ulid) -> bool {
        let Some(shared) = self.get(id) else {
            return false;
        };
        let day = match shared.try_read() {
            Ok(pool) if pool.reserved_count == 0 => pool.day,
            _ => return false,
        };
        self.pools.remove(id);
        self.by_day.remove_if(&day, |_, pool_id| pool_id == id);
        true
    }

    /// Pools in weekday order.
    pub fn all(&self) -> Vec<SharedPoolState> {
        Weekday::ALL
            .into_iter()
            .filter_map(|day| self.id_for_day(day))
            .filter_map(|id| self.get(&id))
            .collect()
    }
}
