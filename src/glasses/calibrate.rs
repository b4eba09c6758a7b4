// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ApiError;
use common::{
    EndpointKind::{Action, Property, Signal},
    endpoint_path, json,
};
use control::{ControlChannel, SignalQueue, SubscribeError, Subscription};
use std::sync::Arc;

/// Gaze calibration against the printed marker.
pub struct Calibrate {
    channel: Arc<ControlChannel>,
    path: &'static str,
}

impl Calibrate {
    #[must_use]
    pub(crate) fn new(channel: Arc<ControlChannel>, path: &'static str) -> Self {
        Self { channel, path }
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        let response = self
            .channel
            .require_get(endpoint_path(self.path, Property, "name"), None)
            .await?;
        Ok(json::into_string(response)?)
    }

    /// Runs a calibration. Returns whether it succeeded.
    pub async fn run(&self) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(endpoint_path(self.path, Action, "run"), None)
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn emit_markers(&self) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(endpoint_path(self.path, Action, "emit-markers"), None)
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn subscribe_to_marker(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, "marker"))
            .await
    }
}
