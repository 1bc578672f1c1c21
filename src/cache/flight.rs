//! Per-student generation lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::StudentId;
use crate::{Error, Result};

type Slot = Arc<Mutex<()>>;

/// One async mutex per student, created on demand and removed when the
/// last holder lets go. Students never contend with each other.
#[derive(Clone, Debug)]
pub struct GenerationLocks {
    slots: Arc<DashMap<StudentId, Slot>>,
    wait: Duration,
}

impl GenerationLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            wait,
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Wait at most the configured bound for the student's lock.
    pub async fn acquire(&self, student_id: &StudentId) -> Result<GenerationGuard> {
        let slot = self
            .slots
            .entry(student_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.wait, slot.lock_owned()).await {
            Ok(guard) => Ok(GenerationGuard {
                student_id: student_id.clone(),
                slots: Arc::clone(&self.slots),
                guard: Some(guard),
            }),
            Err(_) => {
                tracing::info!(
                    student_id = %student_id,
                    waited_ms = self.wait.as_millis() as u64,
                    "Timed out waiting for generation lock"
                );
                Err(Error::GenerationInProgress {
                    student_id: student_id.clone(),
                    retry_after: self.wait,
                })
            }
        }
    }

    /// Acquire only if nobody holds the lock right now.
    pub fn try_acquire(&self, student_id: &StudentId) -> Option<GenerationGuard> {
        let slot = self
            .slots
            .entry(student_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        slot.try_lock_owned().ok().map(|guard| GenerationGuard {
            student_id: student_id.clone(),
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        })
    }

    pub fn is_locked(&self, student_id: &StudentId) -> bool {
        self.slots
            .get(student_id)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Students with a live lock slot.
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }
}

/// Holds a student's generation lock. Owned, so it can move into a spawned
/// task and outlive the request that acquired it.
pub struct GenerationGuard {
    student_id: StudentId,
    slots: Arc<DashMap<StudentId, Slot>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl GenerationGuard {
    pub fn student_id(&self) -> &StudentId {
        &self.student_id
    }
}

impl std::fmt::Debug for GenerationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationGuard")
            .field("student_id", &self.student_id)
            .finish()
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let mutex = OwnedMutexGuard::mutex(&guard).clone();
            drop(guard);
            // Map plus our clone: nobody else is waiting on this slot.
            self.slots
                .remove_if(&self.student_id, |_, slot| {
                    Arc::ptr_eq(slot, &mutex) && Arc::strong_count(slot) == 2
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_serializes_per_student() {
        let locks = GenerationLocks::new(Duration::from_millis(50));
        let student = StudentId::new("s1");

        let guard = locks.acquire(&student).await.unwrap();
        assert!(locks.is_locked(&student));

        let err = locks.acquire(&student).await.unwrap_err();
        assert!(matches!(err, Error::GenerationInProgress { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(50)));

        drop(guard);
        assert!(locks.acquire(&student).await.is_ok());
    }

    #[tokio::test]
    async fn test_students_do_not_contend() {
        let locks = GenerationLocks::new(Duration::from_millis(50));
        let _a = locks.acquire(&StudentId::new("a")).await.unwrap();
        let b = locks.acquire(&StudentId::new("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_slot_removed_after_release() {
        let locks = GenerationLocks::new(Duration::from_millis(50));
        let guard = locks.acquire(&StudentId::new("s1")).await.unwrap();
        assert_eq!(locks.active_slots(), 1);
        drop(guard);
        assert_eq!(locks.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_holder_releases() {
        let locks = GenerationLocks::new(Duration::from_secs(5));
        let student = StudentId::new("s1");
        let guard = locks.acquire(&student).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let student = student.clone();
            tokio::spawn(async move { locks.acquire(&student).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(locks.active_slots(), 0);
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let locks = GenerationLocks::new(Duration::from_millis(10));
        let student = StudentId::new("s1");
        let guard = locks.try_acquire(&student);
        assert!(guard.is_some());
        assert!(locks.try_acquire(&student).is_none());
    }
}
