// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ApiError;
use common::{
    EndpointKind::{Property, Signal},
    endpoint_path, json,
};
use control::{ControlChannel, SignalQueue, SubscribeError, Subscription};
use serde_json::json;
use std::sync::Arc;

/// Device settings.
pub struct Settings {
    channel: Arc<ControlChannel>,
    path: &'static str,
}

impl Settings {
    #[must_use]
    pub(crate) fn new(channel: Arc<ControlChannel>, path: &'static str) -> Self {
        Self { channel, path }
    }

    pub async fn get_gaze_frequency(&self) -> Result<i64, ApiError> {
        let response = self
            .channel
            .require_get(endpoint_path(self.path, Property, "gaze-frequency"), None)
            .await?;
        Ok(json::as_i64(&response)?)
    }

    pub async fn set_gaze_frequency(&self, value: i64) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Property, "gaze-frequency"),
                Some(json!(value)),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn get_gaze_overlay(&self) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_get(endpoint_path(self.path, Property, "gaze-overlay"), None)
            .await?;
        Ok(json::as_bool(&response)?)
    }

    /// Whether recorded scene video gets the gaze point burned in.
    pub async fn set_gaze_overlay(&self, value: bool) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Property, "gaze-overlay"),
                Some(json!(value)),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        let response = self
            .channel
            .require_get(endpoint_path(self.path, Property, "name"), None)
            .await?;
        Ok(json::into_string(response)?)
    }

    pub async fn subscribe_to_changed(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, "changed"))
            .await
    }
}
