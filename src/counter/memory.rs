//! In-process counter backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{CounterBackend, CounterError, CounterOutcome, CounterResult};
use crate::domain::{Clock, QuotaKey};

#[derive(Debug, Clone, Copy)]
struct Slot {
    used: u32,
    expire_at: DateTime<Utc>,
}

/// DashMap-sharded counters. Every primitive runs under the key's entry
/// lock, so it is atomic per key without a global lock.
#[derive(Debug)]
pub struct MemoryCounter {
    slots: DashMap<QuotaKey, Slot>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryCounter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a backend outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop a key as a volatile backend may after eviction or restart.
    pub fn forget(&self, key: &QuotaKey) {
        self.slots.remove(key);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn check_available(&self) -> CounterResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CounterError::Unavailable {
                message: "memory counter offline".to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl CounterBackend for MemoryCounter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check_and_increment(
        &self,
        key: &QuotaKey,
        limit: u32,
        expire_at: DateTime<Utc>,
    ) -> CounterResult<CounterOutcome> {
        self.check_available()?;
        let now = self.clock.now();
        let mut slot = self.slots.entry(key.clone()).or_insert(Slot {
            used: 0,
            expire_at,
        });
        if slot.expire_at <= now {
            slot.used = 0;
        }
        slot.expire_at = expire_at;

        if slot.used < limit {
            slot.used += 1;
            Ok(CounterOutcome {
                allowed: true,
                used: slot.used,
            })
        } else {
            Ok(CounterOutcome {
                allowed: false,
                used: slot.used,
            })
        }
    }

    async fn release(&self, key: &QuotaKey) -> CounterResult<u32> {
        self.check_available()?;
        Ok(match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.used = slot.used.saturating_sub(1);
                slot.used
            }
            None => 0,
        })
    }

    async fn current(&self, key: &QuotaKey) -> CounterResult<u32> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.expire_at > now)
            .map(|slot| slot.used)
            .unwrap_or(0))
    }

    async fn raise_to(
        &self,
        key: &QuotaKey,
        floor: u32,
        expire_at: DateTime<Utc>,
    ) -> CounterResult<u32> {
        self.check_available()?;
        let now = self.clock.now();
        let mut slot = self.slots.entry(key.clone()).or_insert(Slot {
            used: 0,
            expire_at,
        });
        if slot.expire_at <= now {
            slot.used = 0;
        }
        slot.expire_at = expire_at;
        slot.used = slot.used.max(floor);
        Ok(slot.used)
    }

    async fn purge_expired(&self) -> CounterResult<usize> {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expire_at > now);
        Ok(before - self.slots.len())
    }
}
