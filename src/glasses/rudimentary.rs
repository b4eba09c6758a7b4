// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ApiError;
use common::{
    ArcLogger,
    EndpointKind::{Action, Property, Signal},
    LogEntry, LogLevel, endpoint_path, json,
};
use control::{ControlChannel, SignalQueue, SubscribeError, Subscription};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;

// The device stops producing rudimentary samples unless a keepalive
// arrives at least every 6 seconds.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Rudimentary data access: one-shot samples over the control channel
/// without an RTSP session.
///
/// The sample streams only run while keepalives arrive, see
/// [`Rudimentary::keep_alive`].
pub struct Rudimentary {
    channel: Arc<ControlChannel>,
    path: &'static str,
    logger: ArcLogger,
}

impl Rudimentary {
    #[must_use]
    pub(crate) fn new(
        channel: Arc<ControlChannel>,
        path: &'static str,
        logger: ArcLogger,
    ) -> Self {
        Self {
            channel,
            path,
            logger,
        }
    }

    async fn get(&self, name: &str) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_get(endpoint_path(self.path, Property, name), None)
            .await?)
    }

    async fn action(&self, name: &str, body: Option<Value>) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_post(endpoint_path(self.path, Action, name), body)
            .await?)
    }

    pub async fn get_event_sample(&self) -> Result<Value, ApiError> {
        self.get("event-sample").await
    }

    pub async fn get_gaze_sample(&self) -> Result<Value, ApiError> {
        self.get("gaze-sample").await
    }

    pub async fn get_imu_sample(&self) -> Result<Value, ApiError> {
        self.get("imu-sample").await
    }

    pub async fn get_sync_port_sample(&self) -> Result<Value, ApiError> {
        self.get("sync-port-sample").await
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("name").await?)?)
    }

    pub async fn get_scene_quality(&self) -> Result<i64, ApiError> {
        Ok(json::as_i64(&self.get("scene-quality").await?)?)
    }

    pub async fn set_scene_quality(&self, value: i64) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Property, "scene-quality"),
                Some(json!(value)),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn get_scene_scale(&self) -> Result<i64, ApiError> {
        Ok(json::as_i64(&self.get("scene-scale").await?)?)
    }

    pub async fn set_scene_scale(&self, value: i64) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Property, "scene-scale"),
                Some(json!(value)),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn calibrate(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.action("calibrate", None).await?)?)
    }

    /// One keepalive. Prefer [`Rudimentary::keep_alive`] for streams
    /// that must outlive a single call.
    pub async fn keepalive(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.action("keepalive", None).await?)?)
    }

    pub async fn send_event(&self, tag: &str, object: Value) -> Result<bool, ApiError> {
        let body = json!([tag, object]);
        Ok(json::as_bool(&self.action("send-event", Some(body)).await?)?)
    }

    pub async fn subscribe_to_gaze(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("gaze").await
    }

    pub async fn subscribe_to_imu(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("imu").await
    }

    pub async fn subscribe_to_event(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("event").await
    }

    pub async fn subscribe_to_scene(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("scene").await
    }

    pub async fn subscribe_to_sync_port(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.subscribe("sync-port").await
    }

    async fn subscribe(&self, name: &str) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, name))
            .await
    }

    /// Keeps the rudimentary streams alive until the guard is stopped
    /// or dropped. The first keepalive is sent before returning, so
    /// samples are flowing once this resolves.
    pub async fn keep_alive(&self) -> Result<KeepAliveGuard, ApiError> {
        self.keep_alive_with_interval(KEEPALIVE_INTERVAL).await
    }

    async fn keep_alive_with_interval(
        &self,
        interval: Duration,
    ) -> Result<KeepAliveGuard, ApiError> {
        self.keepalive().await?;

        let channel = self.channel.clone();
        let path = self.path;
        let logger = self.logger.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let result = channel
                    .require_post(endpoint_path(path, Action, "keepalive"), None)
                    .await;
                match result.as_ref().map(json::as_bool) {
                    Ok(Ok(true)) => {}
                    _ => {
                        logger.log(LogEntry::new(
                            LogLevel::Warning,
                            "app",
                            None,
                            "rudimentary streams did not stay alive".to_owned(),
                        ));
                        return;
                    }
                }
            }
        });
        Ok(KeepAliveGuard { task })
    }
}

/// Stops the keepalive loop when dropped.
pub struct KeepAliveGuard {
    task: JoinHandle<()>,
}

impl KeepAliveGuard {
    /// Stops the keepalive loop and awaits the task's cancellation.
    pub async fn stop(mut self) {
        self.task.abort();
        _ = (&mut self.task).await;
    }
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{accept, listen, recv_json, send_json};
    use common::DummyLogger;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_keep_alive_loop() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            // Keepalives arrive until the guard is stopped; the sync
            // GET is the first message allowed to follow the stop.
            let mut keepalives = 0;
            loop {
                let req = recv_json(&mut server).await;
                if req["method"] == json!("GET") {
                    send_json(&mut server, json!({"id": req["id"], "body": null})).await;
                    break;
                }
                assert_eq!(json!("/rudimentary!keepalive"), req["path"]);
                assert_eq!(json!("POST"), req["method"]);
                assert_eq!(json!([]), req["body"]);
                keepalives += 1;
                send_json(&mut server, json!({"id": req["id"], "body": true})).await;
            }
            assert!(keepalives >= 3, "expected periodic keepalives, got {keepalives}");
        });

        let channel = Arc::new(control::connect(&url, DummyLogger::new()).await.unwrap());
        let rudimentary =
            Rudimentary::new(channel.clone(), "/rudimentary", DummyLogger::new());

        let guard = rudimentary
            .keep_alive_with_interval(Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        guard.stop().await;

        channel.require_get("/sync".to_owned(), None).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_ends_on_rejection() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let mut server = accept(&listener).await;

            // The awaited first keepalive succeeds.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("/rudimentary!keepalive"), req["path"]);
            send_json(&mut server, json!({"id": req["id"], "body": true})).await;

            // The next one is rejected, which must end the loop.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("/rudimentary!keepalive"), req["path"]);
            send_json(&mut server, json!({"id": req["id"], "body": false})).await;

            // No keepalive may follow the rejection.
            let req = recv_json(&mut server).await;
            assert_eq!(json!("GET"), req["method"]);
            send_json(&mut server, json!({"id": req["id"], "body": null})).await;
        });

        let logger = Arc::new(log::Logger::new(LogLevel::Error));
        let mut feed = logger.subscribe();

        let channel = Arc::new(control::connect(&url, logger.clone()).await.unwrap());
        let rudimentary = Rudimentary::new(channel.clone(), "/rudimentary", logger);

        let _guard = rudimentary
            .keep_alive_with_interval(Duration::from_millis(10))
            .await
            .unwrap();

        // The task reports the rejection and ends.
        loop {
            let entry = feed.recv().await.unwrap();
            if entry.level == LogLevel::Warning {
                assert_eq!("rudimentary streams did not stay alive", entry.message);
                break;
            }
        }

        // Several intervals pass without another keepalive reaching
        // the server before the sync GET.
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.require_get("/sync".to_owned(), None).await.unwrap();
        server.await.unwrap();
    }
}
