use crate::{Deadline, LeaseStore, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local [`LeaseStore`] backed by a hash map.
///
/// Useful for tests and single-process deployments that only need the
/// segment mechanics, not cross-process uniqueness. It honors the full
/// contract — [`reserve`] reports [`StoreError::DomainNotFound`] for
/// unknown domains instead of creating them — so the create-on-miss path
/// behaves exactly as it does against a real store.
///
/// [`reserve`]: LeaseStore::reserve
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    marks: RwLock<HashMap<String, u64>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn prepare(&self, _deadline: Deadline) -> Result<(), StoreError> {
        Ok(())
    }

    fn destroy(&self, _deadline: Deadline) -> Result<(), StoreError> {
        Ok(())
    }

    fn reserve(&self, domain: &str, quantum: u64, _deadline: Deadline) -> Result<u64, StoreError> {
        let mut marks = self.marks.write();
        let Some(mark) = marks.get_mut(domain) else {
            return Err(StoreError::DomainNotFound);
        };
        let prev = *mark;
        *mark = prev
            .checked_add(quantum)
            .ok_or_else(|| StoreError::contract("high-water mark overflows u64"))?;
        Ok(prev)
    }

    fn create_domain(
        &self,
        domain: &str,
        offset: u64,
        _deadline: Deadline,
    ) -> Result<(), StoreError> {
        self.marks.write().entry(domain.to_owned()).or_insert(offset);
        Ok(())
    }
}
