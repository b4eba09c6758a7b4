// SPDX-License-Identifier: GPL-2.0-or-later

use crate::ApiError;
use chrono::{DateTime, Utc};
use common::{
    EndpointKind::{Action, Property},
    FeatureNotAvailable, endpoint_path, json,
};
use control::ControlChannel;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use url::Url;

/// One recording stored on the device.
///
/// Holds only what is needed to issue requests: the path prefix, the
/// uuid and a handle to the control channel. Details are fetched on
/// access.
#[derive(Clone)]
pub struct Recording {
    channel: Arc<ControlChannel>,
    path: String,
    uuid: String,
    http_url: Option<Url>,
}

impl Recording {
    #[must_use]
    pub(crate) fn new(
        channel: Arc<ControlChannel>,
        base_path: &str,
        uuid: String,
        http_url: Option<Url>,
    ) -> Self {
        Self {
            channel,
            path: format!("{base_path}/{uuid}"),
            uuid,
            http_url,
        }
    }

    /// The uuid of the recording.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn get(&self, name: &str) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_get(endpoint_path(&self.path, Property, name), None)
            .await?)
    }

    async fn action(&self, name: &str, body: Option<Value>) -> Result<Value, ApiError> {
        Ok(self
            .channel
            .require_post(endpoint_path(&self.path, Action, name), body)
            .await?)
    }

    pub async fn get_created(&self) -> Result<DateTime<Utc>, ApiError> {
        let created = json::into_string(self.get("created").await?)?;
        parse_timestamp(&created)
    }

    pub async fn get_duration(&self) -> Result<Option<Duration>, ApiError> {
        let duration = json::as_opt_f64(&self.get("duration").await?)?;
        Ok(duration.map(Duration::from_secs_f64))
    }

    pub async fn get_folder(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("folder").await?)?)
    }

    pub async fn get_gaze_overlay(&self) -> Result<bool, ApiError> {
        Ok(json::as_bool(&self.get("gaze-overlay").await?)?)
    }

    pub async fn get_gaze_samples(&self) -> Result<Option<i64>, ApiError> {
        Ok(json::as_opt_i64(&self.get("gaze-samples").await?)?)
    }

    /// Path of the recording's folder on the device's HTTP server.
    pub async fn get_http_path(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("http-path").await?)?)
    }

    pub async fn get_name(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("name").await?)?)
    }

    /// Path of the recording on the device's RTSP server.
    pub async fn get_rtsp_path(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("rtsp-path").await?)?)
    }

    pub async fn get_timezone(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("timezone").await?)?)
    }

    pub async fn get_valid_gaze_samples(&self) -> Result<Option<i64>, ApiError> {
        Ok(json::as_opt_i64(&self.get("valid-gaze-samples").await?)?)
    }

    pub async fn get_visible_name(&self) -> Result<String, ApiError> {
        Ok(json::into_string(self.get("visible-name").await?)?)
    }

    pub async fn set_visible_name(&self, value: &str) -> Result<bool, ApiError> {
        let response = self
            .channel
            .require_post(
                endpoint_path(&self.path, Property, "visible-name"),
                Some(json!(value)),
            )
            .await?;
        Ok(json::as_bool(&response)?)
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

    /// Moves the recording to another folder.
    pub async fn move_to(&self, folder: &str) -> Result<bool, ApiError> {
        let body = json!([folder]);
        Ok(json::as_bool(&self.action("move", Some(body)).await?)?)
    }

    /// Url of the recording's folder on the device's HTTP server,
    /// where the `recording.g3` index lives. Fetching is left to the
    /// caller, see [`crate::files::RecordingIndex`].
    pub async fn data_url(&self) -> Result<Url, DataUrlError> {
        let Some(http_url) = &self.http_url else {
            return Err(FeatureNotAvailable(
                "this device was connected without an http url".to_owned(),
            )
            .into());
        };
        let http_path = self.get_http_path().await?;
        let mut url = http_url.clone();
        url.set_path(&http_path);
        Ok(url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DataUrlError {
    #[error(transparent)]
    FeatureNotAvailable(#[from] FeatureNotAvailable),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// The device reports timestamps like `2023-03-01T12:30:00.123456+0000`
/// or with a trailing `Z`.
pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| ApiError::BadTimestamp(value.to_owned()))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("2023-03-01T12:30:00Z"; "trailing z")]
    #[test_case("2023-03-01T12:30:00+00:00"; "rfc3339")]
    #[test_case("2023-03-01T12:30:00"; "naive")]
    fn test_parse_timestamp(value: &str) {
        let want = Utc.with_ymd_and_hms(2023, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(want, parse_timestamp(value).unwrap());
    }

    #[test]
    fn test_parse_timestamp_fraction() {
        let got = parse_timestamp("2023-03-01T12:30:00.500000").unwrap();
        let want = Utc
            .with_ymd_and_hms(2023, 3, 1, 12, 30, 0)
            .unwrap()
            .checked_add_signed(chrono::Duration::milliseconds(500))
            .unwrap();
        assert_eq!(want, got);
    }

    #[test]
    fn test_parse_timestamp_invalid() {
        assert!(parse_timestamp("yesterday").is_err());
    }
}
