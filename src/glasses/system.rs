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

/// System information and time settings of the recording unit.
pub struct System {
    channel: Arc<ControlChannel>,
    path: &'static str,
    battery: Battery,
}

impl System {
    #[must_use]
    pub(crate) fn new(channel: Arc<ControlChannel>, path: &'static str) -> Self {
        Self {
            battery: Battery::new(channel.clone(), "/system/battery"),
            channel,
            path,
        }
    }

    #[must_use]
    pub fn battery(&self) -> &Battery {
        &self.battery
    }

    async fn get(&self, name: &str) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_get(endpoint_path(self.path, Property, name), None)
            .await?)
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("name").await?)?)
    }

    pub async fn get_head_unit_serial(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("head-unit-serial").await?)?)
    }

    pub async fn get_recording_unit_serial(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("recording-unit-serial").await?)?)
    }

    pub async fn get_version(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("version").await?)?)
    }

    pub async fn get_timezone(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("timezone").await?)?)
    }

    pub async fn set_timezone(&self, value: &str) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Property, "timezone"),
                Some(json!(value)),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }

    pub async fn get_time(&self) -> Result<DateTime<Utc>, ApiError> {
        let time = json::into_string(self.get("time").await?)?;
        crate::recording::parse_timestamp(&time)
    }

    pub async fn get_ntp_is_enabled(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.get("ntp-is-enabled").await?)?)
    }

    pub async fn get_ntp_is_synchronized(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.get("ntp-is-synchronized").await?)?)
    }

    pub async fn use_ntp(&self, value: bool) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(self.path, Action, "use-ntp"),
                Some(json!([value])),
            )
            .await?;
        Ok(json::as_bool(&response)?)
    }
}

/// Charge state reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatteryState {
    Full,
    Good,
    Low,
    VeryLow,
    Unknown,
}

impl BatteryState {
    fn parse(value: &str) -> Self {
        match value {
            "full" => BatteryState::Full,
            "good" => BatteryState::Good,
            "low" => BatteryState::Low,
            "verylow" => BatteryState::VeryLow,
            _ => BatteryState::Unknown,
        }
    }
}

pub struct Battery {
    channel: Arc<ControlChannel>,
    path: &'static str,
}

impl Battery {
    #[must_use]
    fn new(channel: Arc<ControlChannel>, path: &'static str) -> Self {
        Self { channel, path }
    }

    async fn get(&self, name: &str) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_get(endpoint_path(self.path, Property, name), None)
            .await?)
    }

    pub async fn get_charging(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.get("charging").await?)?)
    }

    /// Charge level between 0 and 1.
    pub async fn get_level(&self) -> Result<f64, ApiError> {
        Ok(json::as_f64(&self.get("level").await?)?)
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("name").await?)?)
    }

    pub async fn get_remaining_time(&self) -> Result<Duration, ApiError> {
        let secs = json::as_i64(&self.get("remaining-time").await?)?;
        Ok(Duration::from_secs(secs.max(0).unsigned_abs()))
    }

    pub async fn get_state(&self) -> Result<BatteryState, ApiError> {
        let state = json::into_string(self.get("state").await?)?;
        Ok(BatteryState::parse(&state))
    }

    pub async fn subscribe_to_state_changed(
        &self,
    ) -> Result<(SignalQueue, Subscription), SubscribeError> {
        self.channel
            .subscribe_to_signal(&endpoint_path(self.path, Signal, "state-changed"))
            .await
    }
}
