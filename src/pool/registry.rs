//! Process-wide namespace of running pools.
//!
//! A [`LocalCluster`](crate::pool::LocalCluster) publishes itself here under
//! its [`PoolAddress`] so that other executors can attach to it with
//! `connect`. Entries are weak: the namespace never keeps a pool alive.
//!
//! Upgraded pools are only dropped after the map guard is released, since
//! the last strong reference dropping runs the pool's own `unpublish`.

use std::sync::{Arc, LazyLock, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{ExecError, Result};
use crate::pool::{PoolAddress, WorkerPool};

static POOLS: LazyLock<DashMap<PoolAddress, Weak<dyn WorkerPool>>> = LazyLock::new(DashMap::new);

pub fn publish(pool: &Arc<dyn WorkerPool>) -> Result<()> {
    let address = pool.address().clone();
    let mut previous: Option<Arc<dyn WorkerPool>> = None;

    let result = match POOLS.entry(address) {
        Entry::Occupied(mut entry) => match entry.get().upgrade() {
            Some(existing) if !existing.is_closed() => {
                let err = ExecError::InvalidConfig(format!(
                    "a pool is already running at {}",
                    entry.key()
                ));
                previous = Some(existing);
                Err(err)
            }
            existing => {
                previous = existing;
                entry.insert(Arc::downgrade(pool));
                Ok(())
            }
        },
        Entry::Vacant(entry) => {
            entry.insert(Arc::downgrade(pool));
            Ok(())
        }
    };

    drop(previous);
    result
}

/// Resolve an address to a live pool.
pub fn lookup(address: &PoolAddress) -> Option<Arc<dyn WorkerPool>> {
    let pool = POOLS.get(address).and_then(|entry| entry.upgrade());
    match pool {
        Some(pool) if !pool.is_closed() => Some(pool),
        _ => {
            POOLS.remove_if(address, |_, weak| weak.strong_count() == 0);
            None
        }
    }
}

/// Remove `owner`'s entry. A different pool that has since taken over the
/// address keeps its entry.
pub fn unpublish<T: ?Sized>(address: &PoolAddress, owner: *const T) {
    POOLS.remove_if(address, |_, weak| std::ptr::addr_eq(weak.as_ptr(), owner));
}
