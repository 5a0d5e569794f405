//! Observer registry, violation fan-out and operator response routing.
//!
//! Observers are identified by a caller-chosen id and reached through an
//! unbounded channel of serialized JSON messages; the gateway's socket task
//! drains the receiving end. Delivery is best effort: an observer whose
//! channel is closed is dropped from the registry on the next send.

pub mod message;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use base64::{engine::general_purpose, Engine as _};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::SentinelError;
use crate::ledger::ViolationLedger;
use crate::violation::{Violation, ViolationStatus};

pub use message::{ObserverMessage, SystemNotice, ViolationNotice, PONG};

/// Operator id recorded for responses arriving over plain HTTP.
pub const HTTP_OBSERVER_ID: &str = "http_client";

pub type ObserverSender = UnboundedSender<String>;

pub struct NotificationHub {
    observers: Mutex<HashMap<String, ObserverSender>>,
    scheduler: OnceLock<Handle>,
    ledger: Arc<ViolationLedger>,
}

impl NotificationHub {
    pub fn new(ledger: Arc<ViolationLedger>) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            scheduler: OnceLock::new(),
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<ViolationLedger> {
        &self.ledger
    }

    /// Pin the runtime broadcasts are spawned on. Later calls are ignored.
    pub fn bind_runtime(&self, handle: Handle) {
        let _ = self.scheduler.set(handle);
    }

    /// Add or replace an observer. The first registration made from inside a
    /// tokio runtime pins that runtime for `dispatch`.
    pub fn register(&self, observer_id: &str, sender: ObserverSender) {
        if self.scheduler.get().is_none() {
            if let Ok(handle) = Handle::try_current() {
                self.bind_runtime(handle);
            }
        }
        let replaced = match self.observers.lock() {
            Ok(mut observers) => observers.insert(observer_id.to_string(), sender).is_some(),
            Err(_) => {
                log::error!("observer registry lock poisoned");
                return;
            }
        };
        if replaced {
            log::info!("observer {} reconnected", observer_id);
        } else {
            log::info!("observer {} connected", observer_id);
        }
    }

    pub fn unregister(&self, observer_id: &str) {
        if let Ok(mut observers) = self.observers.lock() {
            if observers.remove(observer_id).is_some() {
                log::info!("observer {} disconnected", observer_id);
            }
        }
    }

    /// Remove `observer_id` only while it is still bound to `sender`, so a
    /// stale connection closing does not evict its replacement.
    pub fn unregister_channel(&self, observer_id: &str, sender: &ObserverSender) {
        if let Ok(mut observers) = self.observers.lock() {
            if observers
                .get(observer_id)
                .is_some_and(|current| current.same_channel(sender))
            {
                observers.remove(observer_id);
                log::info!("observer {} disconnected", observer_id);
            }
        }
    }

    /// Registered observer ids, sorted.
    pub fn connected_observers(&self) -> Vec<String> {
        let mut ids: Vec<String> = match self.observers.lock() {
            Ok(observers) => observers.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        ids.sort();
        ids
    }

    /// Send a violation notice to every observer. Returns the ids it reached.
    pub async fn broadcast(&self, violation: &Violation) -> Vec<String> {
        let image = match tokio::fs::read(&violation.image_path).await {
            Ok(bytes) => Some(general_purpose::STANDARD.encode(bytes)),
            Err(e) => {
                log::warn!(
                    "snapshot {} unreadable, sending notice without image: {}",
                    violation.image_path.display(),
                    e
                );
                None
            }
        };
        let text = match serde_json::to_string(&ViolationNotice::new(violation, image)) {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to encode violation {}: {}", violation.id, e);
                return Vec::new();
            }
        };
        let delivered = self.deliver(&text);
        log::info!(
            "violation {} delivered to {} observer(s)",
            violation.id,
            delivered.len()
        );
        delivered
    }

    /// Informational message to every observer, e.g. monitoring start/stop.
    pub fn broadcast_system_message(&self, message: &str, message_type: &str) -> Vec<String> {
        match serde_json::to_string(&SystemNotice::new(message, message_type)) {
            Ok(text) => self.deliver(&text),
            Err(e) => {
                log::error!("failed to encode system message: {}", e);
                Vec::new()
            }
        }
    }

    /// Fire-and-forget broadcast from a non-async thread.
    pub fn dispatch(self: &Arc<Self>, violation: Violation) {
        let hub = Arc::clone(self);
        if let Some(handle) = self.scheduler.get() {
            handle.spawn(async move {
                hub.broadcast(&violation).await;
            });
            return;
        }

        let spawned = std::thread::Builder::new()
            .name("notify-fallback".into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => {
                        rt.block_on(hub.broadcast(&violation));
                    }
                    Err(e) => log::error!(
                        "no runtime for violation {} broadcast: {}",
                        violation.id,
                        e
                    ),
                }
            });
        if let Err(e) = spawned {
            log::error!("failed to spawn notification thread: {}", e);
        }
    }

    /// Apply an operator's verdict. Returns false for empty ids, unknown
    /// violations and violations already resolved.
    pub fn route_response(&self, observer_id: &str, violation_id: &str, outcome: bool) -> bool {
        if observer_id.is_empty() || violation_id.is_empty() {
            log::warn!("rejected response with empty observer or violation id");
            return false;
        }
        let status = ViolationStatus::from_outcome(outcome);
        let updated = match self.ledger.resolve(violation_id, status, Some(observer_id)) {
            Ok(updated) => updated,
            Err(e) => {
                log::error!("response for violation {} failed: {:#}", violation_id, e);
                return false;
            }
        };
        if !updated {
            log::info!(
                "{}",
                SentinelError::ResponseRouting {
                    violation_id: violation_id.to_string()
                }
            );
            return false;
        }

        let metadata = json!({ "violation_id": violation_id, "response": outcome });
        let message = format!(
            "operator {} answered violation {}",
            observer_id, violation_id
        );
        if let Err(e) =
            self.ledger
                .store()
                .log_system_event("operator_response", &message, Some(&metadata))
        {
            log::error!("failed to record operator response event: {:#}", e);
        }
        true
    }

    /// Handle one text frame from an observer. Returns the reply to send
    /// back, if any. Malformed messages are logged and ignored.
    pub fn handle_message(&self, observer_id: &str, text: &str) -> Option<String> {
        match serde_json::from_str::<ObserverMessage>(text) {
            Ok(ObserverMessage::Ping) => Some(PONG.to_string()),
            Ok(ObserverMessage::Response {
                violation_id,
                response,
            }) => {
                self.route_response(observer_id, &violation_id, response);
                None
            }
            Err(e) => {
                log::debug!("ignoring message from {}: {}", observer_id, e);
                None
            }
        }
    }

    fn deliver(&self, text: &str) -> Vec<String> {
        let observers: Vec<(String, ObserverSender)> = match self.observers.lock() {
            Ok(observers) => observers
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect(),
            Err(_) => return Vec::new(),
        };

        let mut delivered = Vec::with_capacity(observers.len());
        for (id, tx) in observers {
            if tx.send(text.to_string()).is_ok() {
                delivered.push(id);
                continue;
            }
            log::warn!(
                "{}",
                SentinelError::Delivery {
                    observer_id: id.clone(),
                    reason: "channel closed".into(),
                }
            );
            self.unregister_channel(&id, &tx);
        }
        delivered.sort();
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Detection};
    use crate::storage::{InMemoryViolationStore, ViolationStore};
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    fn hub() -> (Arc<NotificationHub>, Arc<InMemoryViolationStore>) {
        let store = Arc::new(InMemoryViolationStore::new());
        let ledger = Arc::new(ViolationLedger::new(store.clone()));
        (Arc::new(NotificationHub::new(ledger)), store)
    }

    fn violation(image: PathBuf) -> Violation {
        Violation::new(
            "zone-1",
            "Dock",
            Detection::person(BBox::new(0, 0, 10, 10), 0.9),
            image,
            crate::now_local(),
        )
    }

    #[tokio::test]
    async fn broadcast_embeds_snapshot_and_drops_closed_observers() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("snap.jpg");
        std::fs::write(&image, b"jpeg-bytes").unwrap();

        let (hub, _) = hub();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        hub.register("a", tx_a);
        hub.register("b", tx_b);
        drop(rx_b);

        let sent = hub.broadcast(&violation(image)).await;
        assert_eq!(sent, vec!["a".to_string()]);
        assert_eq!(hub.connected_observers(), vec!["a".to_string()]);

        let msg: serde_json::Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(msg["image"], general_purpose::STANDARD.encode(b"jpeg-bytes"));
    }

    #[tokio::test]
    async fn reregistering_replaces_the_channel() {
        let (hub, _) = hub();
        let (old_tx, old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        hub.register("op", old_tx);
        hub.register("op", new_tx);
        drop(old_rx);

        assert_eq!(hub.broadcast_system_message("hello", "info"), vec!["op".to_string()]);
        let msg: serde_json::Value = serde_json::from_str(&new_rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "system");
        assert_eq!(msg["message_type"], "info");
        hub.unregister("op");
        hub.unregister("op");
        assert!(hub.connected_observers().is_empty());
    }

    #[test]
    fn response_routing_records_an_audit_event() {
        let (hub, store) = hub();
        let v = violation(PathBuf::from("none.jpg"));
        hub.ledger().record(&v);

        assert!(!hub.route_response("", &v.id, true));
        assert!(hub.route_response("op", &v.id, false));
        assert!(!hub.route_response("op", &v.id, true));

        assert_eq!(
            store.get_by_id(&v.id).unwrap().unwrap().status,
            ViolationStatus::FalsePositive
        );
        let events = store.system_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "operator_response");
        assert_eq!(
            events[0].metadata,
            Some(json!({ "violation_id": v.id, "response": false }))
        );
    }

    #[test]
    fn ping_gets_pong() {
        let (hub, _) = hub();
        assert_eq!(hub.handle_message("op", r#"{"type":"ping"}"#).as_deref(), Some(PONG));
        assert_eq!(hub.handle_message("op", "not json"), None);
    }

    #[test]
    fn dispatch_without_runtime_uses_helper_thread() {
        let (hub, _) = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register("op", tx);
        hub.dispatch(violation(PathBuf::from("missing.jpg")));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let text = loop {
            if let Ok(text) = rx.try_recv() {
                break text;
            }
            assert!(std::time::Instant::now() < deadline, "no broadcast arrived");
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert!(text.contains("\"type\":\"violation\""));
    }
}
