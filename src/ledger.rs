//! In-process violation index backed by the durable store.
//!
//! The index holds violations raised since process start and is the fast path
//! for response routing. The store is the source of truth: lookups and
//! resolutions for ids that are not indexed (raised before a restart) fall
//! through to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::error::SentinelError;
use crate::storage::ViolationStore;
use crate::violation::{StatusUpdate, Violation, ViolationStatus};

pub struct ViolationLedger {
    index: Mutex<HashMap<String, Violation>>,
    store: Arc<dyn ViolationStore>,
}

impl ViolationLedger {
    pub fn new(store: Arc<dyn ViolationStore>) -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn ViolationStore> {
        &self.store
    }

    /// Index and persist a new violation. A persistence failure is logged and
    /// the violation stays indexed.
    pub fn record(&self, violation: &Violation) {
        match self.lock() {
            Ok(mut index) => {
                index.insert(violation.id.clone(), violation.clone());
            }
            Err(e) => log::error!("{}", e),
        }
        if let Err(e) = self.store.insert_or_replace(violation) {
            log::error!(
                "{}",
                SentinelError::Persistence(format!("violation {}: {:#}", violation.id, e))
            );
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Violation>> {
        if let Some(v) = self.lock()?.get(id).cloned() {
            return Ok(Some(v));
        }
        self.store.get_by_id(id)
    }

    /// Indexed violations still awaiting an operator, oldest first.
    pub fn pending(&self) -> Vec<Violation> {
        let mut pending: Vec<Violation> = match self.lock() {
            Ok(index) => index
                .values()
                .filter(|v| v.status == ViolationStatus::Pending)
                .cloned()
                .collect(),
            Err(e) => {
                log::error!("{}", e);
                Vec::new()
            }
        };
        pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        pending
    }

    /// Resolve a pending violation. Returns false when the id is unknown or
    /// the violation was already resolved; the first response wins.
    pub fn resolve(
        &self,
        violation_id: &str,
        status: ViolationStatus,
        operator_id: Option<&str>,
    ) -> Result<bool> {
        let at = crate::now_local();
        // Held through the store fallback so concurrent responses for an
        // unindexed id cannot both win.
        let mut index = self.lock()?;
        let resolved = match index.get_mut(violation_id) {
            Some(v) => {
                if !v.resolve(status, operator_id, at) {
                    return Ok(false);
                }
                v.clone()
            }
            None => {
                let Some(mut stored) = self.store.get_by_id(violation_id)? else {
                    return Ok(false);
                };
                if !stored.resolve(status, operator_id, at) {
                    return Ok(false);
                }
                stored
            }
        };

        let update = StatusUpdate::from_violation(&resolved)
            .ok_or_else(|| anyhow!("resolved violation {} has no response time", resolved.id))?;
        match self.store.update_status(&update) {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "{}",
                SentinelError::Persistence(format!(
                    "violation {} missing from store during status update",
                    violation_id
                ))
            ),
            Err(e) => log::error!(
                "{}",
                SentinelError::Persistence(format!("violation {}: {:#}", violation_id, e))
            ),
        }
        drop(index);
        log::info!("violation {} marked {}", violation_id, resolved.status);
        Ok(true)
    }

    /// Administrative removal from both the index and the store.
    pub fn delete(&self, violation_id: &str) -> Result<bool> {
        let indexed = self.lock()?.remove(violation_id).is_some();
        let stored = self.store.delete(violation_id)?;
        Ok(indexed || stored)
    }

    pub fn indexed_len(&self) -> usize {
        self.lock().map(|i| i.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Violation>>> {
        self.index
            .lock()
            .map_err(|_| anyhow!("violation index lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Detection};
    use crate::storage::InMemoryViolationStore;
    use std::path::PathBuf;

    fn violation() -> Violation {
        Violation::new(
            "zone-a",
            "Dock",
            Detection::person(BBox::new(0, 0, 10, 10), 0.9),
            PathBuf::from("snap.jpg"),
            crate::now_local(),
        )
    }

    #[test]
    fn second_response_is_a_no_op() {
        let store = Arc::new(InMemoryViolationStore::new());
        let ledger = ViolationLedger::new(store.clone());
        let v = violation();
        ledger.record(&v);

        assert!(ledger
            .resolve(&v.id, ViolationStatus::Confirmed, Some("op1"))
            .unwrap());
        assert!(!ledger
            .resolve(&v.id, ViolationStatus::FalsePositive, Some("op2"))
            .unwrap());

        let stored = store.get_by_id(&v.id).unwrap().unwrap();
        assert_eq!(stored.status, ViolationStatus::Confirmed);
        assert_eq!(stored.operator_id.as_deref(), Some("op1"));
        assert_eq!(store.responses(&v.id).unwrap().len(), 1);
    }

    #[test]
    fn resolves_violations_only_known_to_the_store() {
        let store = Arc::new(InMemoryViolationStore::new());
        let v = violation();
        store.insert_or_replace(&v).unwrap();

        let ledger = ViolationLedger::new(store.clone());
        assert_eq!(ledger.indexed_len(), 0);
        assert!(ledger
            .resolve(&v.id, ViolationStatus::FalsePositive, Some("op"))
            .unwrap());
        assert_eq!(
            store.get_by_id(&v.id).unwrap().unwrap().status,
            ViolationStatus::FalsePositive
        );
        assert!(!ledger
            .resolve(&v.id, ViolationStatus::Confirmed, Some("op"))
            .unwrap());
    }

    #[test]
    fn unknown_id_is_not_resolved() {
        let ledger = ViolationLedger::new(Arc::new(InMemoryViolationStore::new()));
        assert!(!ledger
            .resolve("nope", ViolationStatus::Confirmed, None)
            .unwrap());
    }

    #[test]
    fn pending_excludes_resolved() {
        let ledger = ViolationLedger::new(Arc::new(InMemoryViolationStore::new()));
        let a = violation();
        let b = violation();
        ledger.record(&a);
        ledger.record(&b);
        ledger
            .resolve(&a.id, ViolationStatus::Confirmed, None)
            .unwrap();
        let pending: Vec<String> = ledger.pending().into_iter().map(|v| v.id).collect();
        assert_eq!(pending, vec![b.id.clone()]);

        assert!(ledger.delete(&b.id).unwrap());
        assert!(ledger.get(&b.id).unwrap().is_none());
    }
}
