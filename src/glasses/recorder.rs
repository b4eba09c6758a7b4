// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ApiError;
use chrono::{DateTime, Utc};
use common::{
    EndpointKind::{Action, Property, Signal},
    endpoint_path, json,
};
use control::{ControlChannel, SignalQueue, SubscribeError, Subscription};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};

/// The recorder unit. Properties reflect the ongoing recording, if
/// any; a `duration` of `None` means no recording is in progress.
pub struct Recorder {
    channel: Arc<ControlChannel>,
    path: &'static str,
}

impl Recorder {
    #[must_use]
    pub(crate) fn new(channel: Arc<ControlChannel>, path: &'static str) -> Self {
        Self { channel, path }
    }

    async fn get(&self, name: &str) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_get(endpoint_path(self.path, Property, name), None)
            .await?)
    }

    async fn set(&self, name: &str, body: Value) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(endpoint_path(self.path, Property, name), Some(body))
            .await?;
        Ok(json::as_bool(&response)?)
    }

    async fn action(&self, name: &str, body: Option<Value>) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_post(endpoint_path(self.path, Action, name), body)
            .await?)
    }

    pub async fn get_created(&self) -> Result<Option<DateTime<Utc>>, ApiError> {
        let response = self.get("created").await?;
        match json::into_opt_string(response)? {
            None => Ok(None),
            Some(created) => Ok(Some(crate::recording::parse_timestamp(&created)?)),
        }
    }

    pub async fn get_current_gaze_frequency(&self) -> Result<i64, ApiError> {
        Ok(json::as_i64(&self.get("current-gaze-frequency").await?)?)
    }

    /// `None` when no recording is ongoing.
    pub async fn get_duration(&self) -> Result<Option<Duration>, ApiError> {
        let duration = json::as_opt_f64(&self.get("duration").await?)?;
        Ok(duration.map(Duration::from_secs_f64))
    }

    pub async fn get_folder(&self) -> Result<Option<String>, ApiError> {
        Ok(json::into_opt_string(self.get("folder").await?)?)
    }

    pub async fn set_folder(&self, value: &str) -> Result<bool, ApiError> {
        self.set("folder", json!(value)).await
    }

    pub async fn get_gaze_overlay(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.get("gaze-overlay").await?)?)
    }

    pub async fn get_gaze_samples(&self) -> Result<Option<i64>, ApiError> {
        Ok(json::as_opt_i64(&self.get("gaze-samples").await?)?)
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("name").await?)?)
    }

    pub async fn get_remaining_time(&self) -> Result<Duration, ApiError> {
        let secs = json::as_i64(&self.get("remaining-time").await?)?;
        Ok(Duration::from_secs(secs.max(0).unsigned_abs()))
    }

    pub async fn get_timezone(&self) -> Result<Option<String>, ApiError> {
        Ok(json::into_opt_string(self.get("timezone").await?)?)
    }

    /// UUID of the ongoing recording.
    pub async fn get_uuid(&self) -> Result<Option<String>, ApiError> {
        Ok(json::into_opt_string(self.get("uuid").await?)?)
    }

    pub async fn get_valid_gaze_samples(&self) -> Result<Option<i64>, ApiError> {
        Ok(json::as_opt_i64(&self.get("valid-gaze-samples").await?)?)
    }

    pub async fn get_visible_name(&self) -> Result<Option<String>, ApiError> {
        Ok(json::into_opt_string(self.get("visible-name").await?)?)
    }

    pub async fn set_visible_name(&self, value: &str) -> Result<bool, ApiError> {
        self.set("visible-name", json!(value)).await
    }

    /// Starts a new recording.
    pub async fn start(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.action("start", None).await?)?)
    }

    /// Stops and stores the ongoing recording.
    pub async fn stop(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.action("stop", None).await?)?)
    }

    /// Cancels and discards the ongoing recording.
    pub async fn cancel(&self) -> Result<(), ApiError> {
        self.action("cancel", None).await?;
        Ok(())
    }

    /// Takes a snapshot image during an ongoing recording.
    pub async fn snapshot(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.action("snapshot", None).await?)?)
    }

    pub async fn send_event(&self, tag: &str, object: Value) -> Result<bool, ApiError> {
        let body = json!([tag, object]);
        Ok(json::as_bool(&self.action("send-event", Some(body)).await?)?)
    }

    pub async fn meta_insert(&self, key: &str, meta: Option<&str>) -> Result<bool, ApiError> {
        let body = json!([key, meta]);
        Ok(json::as_bool(&self.action("meta-insert", Some(body)).await?)?)
    }

    pub async fn meta_keys(&self) -> Result<Vec<String>, ApiError> {
        Ok(json::into_string_array(self.action("meta-keys", None).await?)?)
    }

    pub async fn meta_lookup(&self, key: &str) -> Result<Option<String>, ApiError> {
        let body = json!([key]);
        Ok(json::into_opt_string(
            self.action("meta-lookup", Some(body)).await?,
        )?)
    }

    pub async fn subscribe_to_started(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, "started"))
            .await
    }

    pub async fn subscribe_to_stopped(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, "stopped"))
            .await
    }
}
