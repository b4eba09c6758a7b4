// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{ControlChannel, Request, RequireError, lock};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// Identifier the device assigns to a signal path on first subscribe.
/// Subscribing to the same path always yields the same id.
#[derive(Clone, Debug)]
pub struct SignalId {
    raw: Value,
    key: String,
}

impl SignalId {
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let key = match value {
            Value::String(s) => s.clone(),
            v => v.to_string(),
        };
        Self {
            raw: value.clone(),
            key,
        }
    }

    /// The id exactly as the device sent it, used as the unsubscribe body.
    #[must_use]
    pub fn to_value(&self) -> Value {
        self.raw.clone()
    }

    fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for SignalId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SignalId {}

/// Receives a copy of every body published on the subscribed signal.
pub type SignalQueue = mpsc::UnboundedReceiver<Value>;

/// Handle for one local subscriber. Pass to [`ControlChannel::unsubscribe`]
/// to release it.
#[derive(Debug)]
pub struct Subscription {
    path: String,
    signal_id: SignalId,
    id: u64,
}

impl Subscription {
    #[must_use]
    pub fn signal_id(&self) -> &SignalId {
        &self.signal_id
    }
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("subscribe request: {0}")]
    Require(#[from] RequireError),

    /// The device returned `false` to the subscribe POST.
    #[error("the device rejected the subscription to '{0}'")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum UnsubscribeError {
    #[error("unsubscribe request: {0}")]
    Require(#[from] RequireError),

    /// The device returned something other than `true` to the
    /// unsubscribe POST.
    #[error("the device rejected the unsubscription from '{0}'")]
    Rejected(String),
}

#[derive(Default)]
struct Registry {
    next_subscription: u64,
    signal_id_by_path: HashMap<String, SignalId>,

    // Keyed by signal id, then by local subscription id.
    queues_by_signal: HashMap<String, HashMap<u64, mpsc::UnboundedSender<Value>>>,
}

/// Tracks which signal paths have a server-side subscription and fans
/// incoming bodies out to the local subscribers.
pub(crate) struct SubscriptionManager {
    // Held across the subscribe/unsubscribe round-trip so at most one
    // such POST is in flight per connection. A subscriber arriving while
    // a subscribe is pending joins the established signal id without an
    // extra round-trip.
    ops: AsyncMutex<()>,

    // Only locked for map access, never across an await. The receiver
    // task delivers signals through this lock.
    registry: std::sync::Mutex<Registry>,
}

impl SubscriptionManager {
    pub(crate) fn new() -> Self {
        Self {
            ops: AsyncMutex::new(()),
            registry: std::sync::Mutex::new(Registry::default()),
        }
    }

    pub(crate) async fn subscribe(
        &self,
        channel: &ControlChannel,
        path: &str,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        let ops = self.ops.lock().await;

        let existing = lock(&self.registry).signal_id_by_path.get(path).cloned();
        let signal_id = match existing {
            Some(id) => id,
            None => {
                let body = channel
                    .require(Request::post(path.to_owned(), Value::Null))
                    .await?;
                if body == Value::Bool(false) {
                    return Err(SubscribeError::Rejected(path.to_owned()));
                }
                SignalId::from_value(&body)
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut registry = lock(&self.registry);
            registry.next_subscription += 1;
            let id = registry.next_subscription;
            registry
                .signal_id_by_path
                .insert(path.to_owned(), signal_id.clone());
            registry
                .queues_by_signal
                .entry(signal_id.key().to_owned())
                .or_default()
                .insert(id, tx);
            id
        };
        drop(ops);

        Ok((
            rx,
            Subscription {
                path: path.to_owned(),
                signal_id,
                id,
            },
        ))
    }

    pub(crate) async fn unsubscribe(
        &self,
        channel: &ControlChannel,
        subscription: Subscription,
    ) -> Result<(), UnsubscribeError> {
        let _ops = self.ops.lock().await;

        let last = {
            let mut registry = lock(&self.registry);
            let Some(queues) = registry
                .queues_by_signal
                .get_mut(subscription.signal_id.key())
            else {
                return Ok(());
            };
            queues.remove(&subscription.id);
            if queues.is_empty() {
                registry
                    .queues_by_signal
                    .remove(subscription.signal_id.key());
                true
            } else {
                false
            }
        };

        if last {
            let body = channel
                .require(Request::post(
                    subscription.path.clone(),
                    subscription.signal_id.to_value(),
                ))
                .await?;
            if body != Value::Bool(true) {
                return Err(UnsubscribeError::Rejected(subscription.path));
            }
            lock(&self.registry)
                .signal_id_by_path
                .remove(&subscription.path);
        }
        Ok(())
    }

    /// Pushes a copy of `body` to every subscriber registered under
    /// `signal_id`. Called from the receiver task.
    pub(crate) fn receive(&self, signal_id: &SignalId, body: &Value) {
        let registry = lock(&self.registry);
        if let Some(queues) = registry.queues_by_signal.get(signal_id.key()) {
            for tx in queues.values() {
                // A send only fails if the subscriber dropped its queue
                // without unsubscribing.
                _ = tx.send(body.clone());
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect;
    use crate::test_util::{accept, listen, recv_json, send_json};
    use common::DummyLogger;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscription_refcount() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            // First subscribe establishes the server-side subscription.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("/recorder:started"), req["path"]);
            assert_eq!(json!("POST"), req["method"]);
            assert_eq!(json!(null), req["body"]);
            send_json(&mut server, json!({"id": req["id"], "body": 42})).await;

            // Sync point: both subscribers are registered once this
            // arrives, and no second subscribe POST preceded it.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("GET"), req["method"]);
            send_json(&mut server, json!({"id": req["id"], "body": null})).await;

            // Signal reaches both subscribers.
            send_json(&mut server, json!({"signal": 42, "body": ["u1"]})).await;

            // The next message must be the second sync point, not an
            // unsubscribe POST for the first subscriber.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("GET"), req["method"]);
            send_json(&mut server, json!({"id": req["id"], "body": null})).await;

            // The single unsubscribe POST after the last local
            // subscriber is gone, with the stored signal id as body.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("/recorder:started"), req["path"]);
            assert_eq!(json!(42), req["body"]);
            send_json(&mut server, json!({"id": req["id"], "body": true})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();

        let (mut queue1, sub1) = channel.subscribe_to_signal("/recorder:started").await.unwrap();
        // Second subscriber joins without a second subscribe POST.
        let (mut queue2, sub2) = channel.subscribe_to_signal("/recorder:started").await.unwrap();
        channel.require_get("/sync".to_owned(), None).await.unwrap();

        assert_eq!(json!(["u1"]), queue1.recv().await.unwrap());
        assert_eq!(json!(["u1"]), queue2.recv().await.unwrap());

        // First unsubscribe must not reach the server.
        channel.unsubscribe(sub1).await.unwrap();
        channel.require_get("/sync".to_owned(), None).await.unwrap();
        channel.unsubscribe(sub2).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_no_prior_signals() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            let req = recv_json(&mut server).await;
            send_json(&mut server, json!({"id": req["id"], "body": "sig-1"})).await;

            // Sync point: the early subscriber is registered.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("GET"), req["method"]);
            send_json(&mut server, json!({"id": req["id"], "body": null})).await;

            send_json(&mut server, json!({"signal": "sig-1", "body": [1]})).await;

            // Sync point so the signal above lands before the late
            // subscriber registers.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("GET"), req["method"]);
            send_json(&mut server, json!({"id": req["id"], "body": null})).await;

            // Second sync point, after which the late subscriber is
            // registered.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("GET"), req["method"]);
            send_json(&mut server, json!({"id": req["id"], "body": null})).await;

            send_json(&mut server, json!({"signal": "sig-1", "body": [2]})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();
        let (mut early, _sub1) = channel.subscribe_to_signal("/recorder:stopped").await.unwrap();
        channel.require_get("/sync".to_owned(), None).await.unwrap();
        assert_eq!(json!([1]), early.recv().await.unwrap());

        channel.require_get("/sync".to_owned(), None).await.unwrap();
        let (mut late, _sub2) = channel.subscribe_to_signal("/recorder:stopped").await.unwrap();
        channel.require_get("/sync".to_owned(), None).await.unwrap();

        assert_eq!(json!([2]), early.recv().await.unwrap());
        // The late subscriber only sees the second signal.
        assert_eq!(json!([2]), late.recv().await.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_rejected() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            let req = recv_json(&mut server).await;
            send_json(&mut server, json!({"id": req["id"], "body": false})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();
        let err = channel
            .subscribe_to_signal("/recorder:started")
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::Rejected(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_rejected() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            let req = recv_json(&mut server).await;
            send_json(&mut server, json!({"id": req["id"], "body": "sig-9"})).await;

            let req = recv_json(&mut server).await;
            send_json(&mut server, json!({"id": req["id"], "body": false})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();
        let (_queue, sub) = channel.subscribe_to_signal("/neighbor:changed").await.unwrap();
        let err = channel.unsubscribe(sub).await.unwrap_err();
        assert!(matches!(err, UnsubscribeError::Rejected(_)));
        server.await.unwrap();
    }
}
