// SPDX-License-Identifier: GPL-2.0-or-later

mod subscription;

pub use subscription::{SignalId, SignalQueue, SubscribeError, Subscription, UnsubscribeError};

use common::{ArcLogger, GlassesError, LogEntry, LogLevel};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use subscription::SubscriptionManager;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, protocol::Message},
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// WebSocket sub-protocol spoken by the device.
const SUBPROTOCOL: &str = "g3api";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    #[must_use]
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// A control channel request. The message id is assigned on send.
#[derive(Clone, Debug)]
pub struct Request {
    pub path: String,
    pub method: Method,
    pub params: Option<Value>,

    /// Serialized verbatim when present. An explicit `null` body and an
    /// omitted body are distinct to the device.
    pub body: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn get(path: String, params: Option<Value>) -> Self {
        Self {
            path,
            method: Method::Get,
            params,
            body: None,
        }
    }

    #[must_use]
    pub fn post(path: String, body: Value) -> Self {
        Self {
            path,
            method: Method::Post,
            params: None,
            body: Some(body),
        }
    }

    fn to_json(&self, id: u64) -> String {
        let mut map = serde_json::Map::new();
        map.insert("path".to_owned(), Value::String(self.path.clone()));
        map.insert(
            "method".to_owned(),
            Value::String(self.method.as_str().to_owned()),
        );
        map.insert("id".to_owned(), Value::from(id));
        if let Some(params) = &self.params {
            map.insert("params".to_owned(), params.clone());
        }
        if let Some(body) = &self.body {
            map.insert("body".to_owned(), body.clone());
        }
        Value::Object(map).to_string()
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("bad websocket url: {0}")]
    BadUrl(tungstenite::Error),

    #[error("websocket handshake: {0}")]
    Handshake(tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum RequireError {
    /// The connection was closed before the response arrived.
    #[error("control channel closed")]
    ChannelClosed,

    /// The device answered with an error response.
    #[error(transparent)]
    Device(#[from] GlassesError),
}

type PendingResult = Result<Value, GlassesError>;

struct Pending {
    closed: bool,
    map: HashMap<u64, oneshot::Sender<PendingResult>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ChannelState {
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    subscriptions: SubscriptionManager,
    logger: ArcLogger,
}

impl ChannelState {
    fn log(&self, level: LogLevel, msg: String) {
        self.logger.log(LogEntry::new(level, "control", None, msg));
    }
}

/// Full-duplex JSON control channel to a device.
///
/// A single receiver task owns all reads from the socket and correlates
/// responses with in-flight requests by id. Signal notifications are fanned
/// out to subscribers, see [`ControlChannel::subscribe_to_signal`].
pub struct ControlChannel {
    state: Arc<ChannelState>,
    write_tx: mpsc::Sender<Message>,
    token: CancellationToken,
    receiver_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Connects to the device's control endpoint and spawns the receiver task.
pub async fn connect(ws_url: &Url, logger: ArcLogger) -> Result<ControlChannel, ConnectError> {
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(ConnectError::BadUrl)?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );

    let (stream, _) = connect_async(request).await.map_err(ConnectError::Handshake)?;
    let (mut sink, mut source) = stream.split();

    let state = Arc::new(ChannelState {
        pending: Mutex::new(Pending {
            closed: false,
            map: HashMap::new(),
        }),
        next_id: AtomicU64::new(0),
        subscriptions: SubscriptionManager::new(),
        logger,
    });

    let token = CancellationToken::new();

    // All writes are funneled through this task so that any number of
    // callers can send without contending for the sink.
    let (write_tx, mut write_rx) = mpsc::channel::<Message>(32);
    let writer_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_token.cancelled() => break,
                msg = write_rx.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    let is_close = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                    if is_close {
                        break;
                    }
                }
            }
        }
    });

    let state2 = state.clone();
    let receiver_token = token.clone();
    let receiver_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = receiver_token.cancelled() => break,
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => handle_message(&state2, text.as_str()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            state2.log(LogLevel::Error, format!("read: {e}"));
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        receiver_token.cancel();
        fail_pending(&state2);
    });

    Ok(ControlChannel {
        state,
        write_tx,
        token,
        receiver_handle: Mutex::new(Some(receiver_handle)),
    })
}

/// Tags an incoming message by shape and dispatches it.
///
/// Exactly three shapes are valid: `{id, body}`, `{id, error, message}`
/// and `{signal, body}`. Anything else is logged and ignored without
/// touching the pending map, so a malformed message never terminates
/// the channel or leaks a request.
fn handle_message(state: &ChannelState, text: &str) {
    let Ok(Value::Object(msg)) = serde_json::from_str::<Value>(text) else {
        state.log(LogLevel::Debug, format!("invalid response: {text}"));
        return;
    };

    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
        let result = if let (Some(error), Some(message)) = (
            msg.get("error").and_then(Value::as_i64),
            msg.get("message").and_then(Value::as_str),
        ) {
            Err(GlassesError {
                code: error,
                message: message.to_owned(),
            })
        } else if let Some(body) = msg.get("body") {
            Ok(body.clone())
        } else {
            state.log(LogLevel::Debug, format!("invalid response: {text}"));
            return;
        };

        let tx = lock(&state.pending).map.remove(&id);
        match tx {
            // The caller was cancelled, discard the response.
            None => state.log(LogLevel::Debug, format!("response for unknown id {id}")),
            Some(tx) => {
                _ = tx.send(result);
            }
        }
        return;
    }

    if let (Some(signal), Some(body)) = (msg.get("signal"), msg.get("body")) {
        state
            .subscriptions
            .receive(&SignalId::from_value(signal), body);
        return;
    }

    state.log(LogLevel::Debug, format!("invalid response: {text}"));
}

fn fail_pending(state: &ChannelState) {
    let mut pending = lock(&state.pending);
    pending.closed = true;
    // Dropping the senders fails every in-flight request with a
    // transport error.
    pending.map.clear();
}

/// Removes the request from the pending map when a `require` future is
/// dropped before its response arrives.
struct PendingGuard<'a> {
    state: &'a ChannelState,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.state.pending).map.remove(&self.id);
    }
}

impl ControlChannel {
    /// Sends a request with a fresh id and returns the body of the
    /// response with the same id.
    pub async fn require(&self, request: Request) -> Result<Value, RequireError> {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.state.pending);
            if pending.closed {
                return Err(RequireError::ChannelClosed);
            }
            pending.map.insert(id, tx);
        }
        let guard = PendingGuard {
            state: &self.state,
            id,
        };

        let text = request.to_json(id);
        self.write_tx
            .send(Message::text(text))
            .await
            .map_err(|_| RequireError::ChannelClosed)?;

        let result = rx.await.map_err(|_| RequireError::ChannelClosed)?;
        drop(guard);
        Ok(result?)
    }

    /// Sends a GET request and returns the body of the response.
    pub async fn require_get(
        &self,
        path: String,
        params: Option<Value>,
    ) -> Result<Value, RequireError> {
        self.require(Request::get(path, params)).await
    }

    /// Sends a POST request and returns the body of the response.
    ///
    /// The default body is the empty list, which the device treats
    /// differently from `null`.
    pub async fn require_post(
        &self,
        path: String,
        body: Option<Value>,
    ) -> Result<Value, RequireError> {
        let body = body.unwrap_or_else(|| Value::Array(Vec::new()));
        self.require(Request::post(path, body)).await
    }

    /// Sets up a subscription to the signal at `path`.
    ///
    /// Multiple local subscribers to the same path share a single
    /// server-side subscription. The returned queue receives a copy of
    /// every signal body; pass the [`Subscription`] to
    /// [`ControlChannel::unsubscribe`] to release it.
    pub async fn subscribe_to_signal(
        &self,
        path: &str,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.state.subscriptions.subscribe(self, path).await
    }

    /// Releases a subscription. The server-side subscription is removed
    /// once the last local subscriber for the path is gone.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), UnsubscribeError> {
        self.state.subscriptions.unsubscribe(self, subscription).await
    }

    /// Cancels the receiver task and performs the closing handshake.
    /// Pending requests fail with a transport error.
    pub async fn close(&self) {
        _ = self.write_tx.send(Message::Close(None)).await;
        self.token.cancel();

        let handle = lock(&self.receiver_handle).take();
        if let Some(handle) = handle {
            _ = handle.await;
        }
        fail_pending(&self.state);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}


#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{accept, listen, recv_json, send_json};
    use common::DummyLogger;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_correlation() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            let first = recv_json(&mut server).await;
            let second = recv_json(&mut server).await;
            assert_eq!(json!("/recorder.name"), first["path"]);
            assert_eq!(json!("/recorder.duration"), second["path"]);

            // Reply out of order.
            send_json(&mut server, json!({"id": second["id"], "body": 12.5})).await;
            send_json(&mut server, json!({"id": first["id"], "body": "rec"})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();
        let name = channel.require_get("/recorder.name".to_owned(), None);
        let duration = channel.require_get("/recorder.duration".to_owned(), None);
        let (name, duration) = tokio::join!(name, duration);

        assert_eq!(json!("rec"), name.unwrap());
        assert_eq!(json!(12.5), duration.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_propagation() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            let req = recv_json(&mut server).await;
            send_json(
                &mut server,
                json!({"id": req["id"], "error": 404, "message": "no such path"}),
            )
            .await;

            // The next request on the same channel succeeds.
            let req = recv_json(&mut server).await;
            send_json(&mut server, json!({"id": req["id"], "body": true})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();
        let err = channel
            .require_post("/bogus!act".to_owned(), None)
            .await
            .unwrap_err();
        match err {
            RequireError::Device(e) => {
                assert_eq!(404, e.code);
                assert_eq!("no such path", e.message);
            }
            RequireError::ChannelClosed => panic!("expected device error"),
        }

        let ok = channel
            .require_post("/recorder!start".to_owned(), None)
            .await
            .unwrap();
        assert_eq!(json!(true), ok);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_shapes_are_ignored() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            let req = recv_json(&mut server).await;
            // None of these may resolve or fail the request.
            send_json(&mut server, json!({"unexpected": 1})).await;
            send_json(&mut server, json!({"id": req["id"]})).await;
            server.send(Message::text("not json")).await.unwrap();
            send_json(&mut server, json!({"id": req["id"], "body": 7})).await;
        });

        let channel = connect(&url, DummyLogger::new()).await.unwrap();
        let body = channel.require_get("/system.name".to_owned(), None).await;
        assert_eq!(json!(7), body.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;
            // Never respond.
            recv_json(&mut server).await;
            loop {
                if server.next().await.is_none() {
                    break;
                }
            }
        });

        let channel = Arc::new(connect(&url, DummyLogger::new()).await.unwrap());
        let channel2 = channel.clone();
        let pending =
            tokio::spawn(async move { channel2.require_get("/system.name".to_owned(), None).await });

        // Give the request time to be sent before closing.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        channel.close().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(RequireError::ChannelClosed)
        ));
        assert!(matches!(
            channel.require_get("/system.name".to_owned(), None).await,
            Err(RequireError::ChannelClosed)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_serialization() {
        let get = Request::get("/recorder.name".to_owned(), None);
        assert_eq!(
            json!({"path": "/recorder.name", "method": "GET", "id": 1}),
            serde_json::from_str::<Value>(&get.to_json(1)).unwrap(),
        );

        // Explicit null body must survive serialization, it is the
        // subscribe marker.
        let subscribe = Request::post("/recorder:started".to_owned(), Value::Null);
        assert_eq!(
            json!({"path": "/recorder:started", "method": "POST", "id": 2, "body": null}),
            serde_json::from_str::<Value>(&subscribe.to_json(2)).unwrap(),
        );
    }
}
