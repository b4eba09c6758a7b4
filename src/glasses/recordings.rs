// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{ApiError, Recording};
use common::{
    ArcLogger,
    EndpointKind::{Action, Signal},
    LogEntry, LogLevel, endpoint_path, json,
};
use control::{
    ControlChannel, SignalQueue, SubscribeError, Subscription, UnsubscribeError,
};
use serde_json::{Value, json};
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingsEventKind {
    /// A recording was added.
    Added,

    /// A recording was removed.
    Removed,
}

pub type RecordingsEvent = (RecordingsEventKind, Value);

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The recordings stored on the device, as an ordered newest-first
/// mirror.
///
/// The mirror is only kept consistent while a [`RecordingsGuard`] from
/// [`Recordings::keep_updated`] is live; it subscribes to the device's
/// child-added and child-removed signals.
pub struct Recordings {
    channel: Arc<ControlChannel>,
    path: &'static str,
    http_url: Option<url::Url>,
    logger: ArcLogger,

    // Newest first. Exclusively owned by the mirror, observed
    // read-only through the accessors.
    children: Arc<Mutex<Vec<Recording>>>,

    running: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<RecordingsEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<RecordingsEvent>>,
}

#[derive(Debug, Error)]
pub enum StartMirrorError {
    #[error("fetch children: {0}")]
    FetchChildren(#[from] ApiError),

    #[error("subscribe: {0}")]
    Subscribe(#[from] SubscribeError),
}

impl Recordings {
    #[must_use]
    pub(crate) fn new(
        channel: Arc<ControlChannel>,
        path: &'static str,
        http_url: Option<url::Url>,
        logger: ArcLogger,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            path,
            http_url,
            logger,
            children: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: AsyncMutex::new(events_rx),
        }
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        let response = self
            .channel
            .require_get(
                endpoint_path(self.path, common::EndpointKind::Property, "name"),
                None,
            )
            .await?;
        Ok(json::into_string(response)?)
    }

    /// Deletes the recording with the given uuid from the device.
    pub async fn delete(&self, uuid: &str) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Action, "delete"),
                Some(json!([uuid])),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn subscribe_to_child_added(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("child-added").await
    }

    pub async fn subscribe_to_child_removed(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("child-removed").await
    }

    pub async fn subscribe_to_deleted(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("deleted").await
    }

    pub async fn subscribe_to_scan_start(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("scan-start").await
    }

    pub async fn subscribe_to_scan_done(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("scan-done").await
    }

    async fn subscribe(&self, name: &str) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, name))
            .await
    }

    /// Snapshot of the mirrored recordings, newest first.
    #[must_use]
    pub fn children(&self) -> Vec<Recording> {
        lock(&self.children).clone()
    }

    /// Uuids of the mirrored recordings, newest first.
    #[must_use]
    pub fn uuids(&self) -> Vec<String> {
        lock(&self.children)
            .iter()
            .map(|r| r.uuid().to_owned())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.children).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.children).is_empty()
    }

    /// The mirrored recording with the given uuid.
    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<Recording> {
        lock(&self.children).iter().find(|r| r.uuid() == uuid).cloned()
    }

    /// The next mirror event. Only produces values while the mirror is
    /// running.
    pub async fn next_event(&self) -> Option<RecordingsEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Starts keeping the mirror updated.
    ///
    /// Fetches the current children, subscribes to the child-added and
    /// child-removed signals and spawns the handler tasks. Stop by
    /// calling [`RecordingsGuard::stop`]. Starting twice is a warning,
    /// not an error; the second guard is inert.
    pub async fn keep_updated(&self) -> Result<RecordingsGuard, StartMirrorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.logger.log(LogEntry::new(
                LogLevel::Warning,
                "recordings",
                None,
                "attempted to start the mirror twice".to_owned(),
            ));
            return Ok(RecordingsGuard::inert());
        }

        match self.start().await {
            Ok(guard) => Ok(guard),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<RecordingsGuard, StartMirrorError> {
        let children = self.fetch_children().await?;
        *lock(&self.children) = children;

        let (added_queue, added_sub) = self.subscribe_to_child_added().await?;

        let (removed_queue, removed_sub) = match self.subscribe_to_child_removed().await {
            Ok(v) => v,
            Err(e) => {
                // Release the subscription already taken.
                _ = self.channel.unsubscribe(added_sub).await;
                return Err(e.into());
            }
        };

        let added_task = tokio::spawn(handle_child_added(
            added_queue,
            self.children.clone(),
            self.channel.clone(),
            self.path,
            self.http_url.clone(),
            self.events_tx.clone(),
        ));
        let removed_task = tokio::spawn(handle_child_removed(
            removed_queue,
            self.children.clone(),
            self.events_tx.clone(),
        ));

        Ok(RecordingsGuard {
            active: Some(GuardState {
                channel: self.channel.clone(),
                running: self.running.clone(),
                added_sub,
                removed_sub,
                added_task,
                removed_task,
            }),
        })
    }

    /// Initial children list, reversed so the newest recording is
    /// first.
    async fn fetch_children(&self) -> Result<Vec<Recording>, ApiError> {
        let response = self.channel.require_get(self.path.to_owned(), None).await?;
        let uuids = match response.get("children") {
            Some(children) => json::into_string_array(children.clone())?,
            None => Vec::new(),
        };
        Ok(uuids
            .into_iter()
            .rev()
            .map(|uuid| {
                Recording::new(self.channel.clone(), self.path, uuid, self.http_url.clone())
            })
            .collect())
    }
}

async fn handle_child_added(
    mut queue: SignalQueue,
    children: Arc<Mutex<Vec<Recording>>>,
    channel: Arc<ControlChannel>,
    path: &'static str,
    http_url: Option<url::Url>,
    events_tx: mpsc::UnboundedSender<RecordingsEvent>,
) {
    while let Some(body) = queue.recv().await {
        let Some(uuid) = body.get(0).and_then(Value::as_str) else {
            continue;
        };
        let recording = Recording::new(channel.clone(), path, uuid.to_owned(), http_url.clone());

        // The device emits added children in creation order, so
        // insertion at the front keeps the mirror newest-first.
        lock(&children).insert(0, recording);
        _ = events_tx.send((RecordingsEventKind::Added, body));
    }
}

async fn handle_child_removed(
    mut queue: SignalQueue,
    children: Arc<Mutex<Vec<Recording>>>,
    events_tx: mpsc::UnboundedSender<RecordingsEvent>,
) {
    while let Some(body) = queue.recv().await {
        let Some(uuid) = body.get(0).and_then(Value::as_str) else {
            continue;
        };
        lock(&children).retain(|r| r.uuid() != uuid);
        _ = events_tx.send((RecordingsEventKind::Removed, body));
    }
}

struct GuardState {
    channel: Arc<ControlChannel>,
    running: Arc<AtomicBool>,
    added_sub: Subscription,
    removed_sub: Subscription,
    added_task: tokio::task::JoinHandle<()>,
    removed_task: tokio::task::JoinHandle<()>,
}

/// Keeps the recordings mirror running until stopped. Dropping the
/// guard without calling `stop` cancels the handler tasks but leaves
/// the server-side subscriptions to the channel's closing.
pub struct RecordingsGuard {
    active: Option<GuardState>,
}

impl RecordingsGuard {
    fn inert() -> Self {
        Self { active: None }
    }

    /// Unsubscribes from both signals and awaits the handler tasks'
    /// cancellation.
    pub async fn stop(mut self) -> Result<(), UnsubscribeError> {
        let Some(state) = self.active.take() else {
            return Ok(());
        };

        let result = state.channel.unsubscribe(state.added_sub).await;
        let result2 = state.channel.unsubscribe(state.removed_sub).await;

        state.added_task.abort();
        state.removed_task.abort();
        _ = state.added_task.await;
        _ = state.removed_task.await;

        state.running.store(false, Ordering::SeqCst);
        result?;
        result2
    }
}

impl Drop for RecordingsGuard {
    fn drop(&mut self) {
        if let Some(state) = self.active.take() {
            state.added_task.abort();
            state.removed_task.abort();
            state.running.store(false, Ordering::SeqCst);
        }
    }
}
