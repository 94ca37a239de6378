//! Correlation table for remote requests awaiting their response.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use super::message::ResponseMessage;
use super::TunnelError;

/// In-flight remote requests keyed by request id.
///
/// Every access happens under one lock. An id has at most one entry, and the
/// entry is removed before its response is handed over, so a replayed
/// response for the same id is reported as an orphan instead of delivered
/// twice.
#[derive(Clone, Default)]
pub struct PendingResponses {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseMessage>>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a response slot for `id`. Fails if `id` is already pending.
    pub async fn register(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<ResponseMessage>, TunnelError> {
        let mut pending = self.inner.lock().await;
        if pending.contains_key(id) {
            return Err(TunnelError::DuplicateRequestId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Deliver `response` to whoever registered its id.
    ///
    /// An unknown id is an orphan and is returned as an error. A caller that
    /// stopped waiting is not an error: the response is dropped.
    pub async fn resolve(&self, response: ResponseMessage) -> Result<(), TunnelError> {
        let sender = self.inner.lock().await.remove(&response.id);
        let Some(sender) = sender else {
            return Err(TunnelError::OrphanResponse(response.id));
        };
        let id = response.id.clone();
        if sender.send(response).is_err() {
            tracing::debug!(%id, "remote caller went away before its response arrived");
        }
        Ok(())
    }

    /// Tie the slot for `id` to the returned guard: dropping the guard
    /// before [`SlotGuard::disarm`] removes the slot.
    pub fn guard(&self, id: &str) -> SlotGuard {
        SlotGuard {
            registry: self.clone(),
            id: Some(id.to_string()),
        }
    }

    /// Drop the slot for `id`, if any. Callable from synchronous code: when
    /// the lock is busy the removal finishes on a spawned task.
    pub fn forget(&self, id: &str) {
        if let Ok(mut pending) = self.inner.try_lock() {
            pending.remove(id);
            return;
        }
        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.lock().await.remove(&id);
            });
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Removes a pending slot when the waiting caller goes away.
pub struct SlotGuard {
    registry: PendingResponses,
    id: Option<String>,
}

impl SlotGuard {
    /// The slot was resolved; nothing left to clean up.
    pub fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.forget(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::message::{MultiMap, Operation};

    fn response(id: &str, status: u16) -> ResponseMessage {
        ResponseMessage {
            id: id.to_string(),
            operation: Operation::ExecuteRemote,
            status,
            headers: MultiMap::new(),
            payload: id.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn resolve_delivers_once_and_removes_entry() {
        let registry = PendingResponses::new();
        let rx = registry.register("a").await.unwrap();
        registry.resolve(response("a", 201)).await.unwrap();
        assert_eq!(rx.await.unwrap().status, 201);
        assert!(registry.is_empty().await);

        let replay = registry.resolve(response("a", 201)).await.unwrap_err();
        assert!(matches!(replay, TunnelError::OrphanResponse(id) if id == "a"));
    }

    #[tokio::test]
    async fn orphan_is_rejected() {
        let registry = PendingResponses::new();
        let err = registry.resolve(response("never-sent", 200)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing remote response channel for id \"never-sent\""
        );
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let registry = PendingResponses::new();
        let _rx = registry.register("dup").await.unwrap();
        assert!(matches!(
            registry.register("dup").await,
            Err(TunnelError::DuplicateRequestId(_))
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn reverse_order_delivery_keeps_callers_apart() {
        let registry = PendingResponses::new();
        let first = registry.register("first").await.unwrap();
        let second = registry.register("second").await.unwrap();

        registry.resolve(response("second", 202)).await.unwrap();
        registry.resolve(response("first", 201)).await.unwrap();

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!((first.id.as_str(), first.status), ("first", 201));
        assert_eq!((second.id.as_str(), second.status), ("second", 202));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn late_response_for_abandoned_caller_is_dropped() {
        let registry = PendingResponses::new();
        drop(registry.register("gone").await.unwrap());
        registry.resolve(response("gone", 200)).await.unwrap();
        assert!(registry.is_empty().await);

        let _rx = registry.register("forgotten").await.unwrap();
        registry.forget("forgotten");
        let late = registry.resolve(response("forgotten", 200)).await;
        assert!(matches!(late, Err(TunnelError::OrphanResponse(_))));
    }

    #[tokio::test]
    async fn dropped_guard_clears_slot_and_disarmed_guard_does_not() {
        let registry = PendingResponses::new();
        let _rx = registry.register("left").await.unwrap();
        drop(registry.guard("left"));
        assert!(registry.is_empty().await);

        let _rx = registry.register("kept").await.unwrap();
        registry.guard("kept").disarm();
        assert_eq!(registry.len().await, 1);
    }
}
