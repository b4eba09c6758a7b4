// SPDX-License-Identifier: GPL-2.0-or-later

//! The `recording.g3` index that describes the files of a stored
//! recording. Fetching is the caller's concern; this module only
//! models the format and resolves file urls.

use base64::Engine;
use serde::Deserialize;
use url::Url;

/// One component of a recording, e.g. the scene camera video.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RecordingComponent {
    pub file: String,
}

/// The JSON index in a recording folder.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingIndex {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub created: Option<String>,
    pub duration: Option<f64>,

    pub scenecamera: Option<RecordingComponent>,
    pub gaze: Option<RecordingComponent>,
    pub events: Option<RecordingComponent>,
    pub imu: Option<RecordingComponent>,

    #[serde(rename = "meta-folder")]
    pub meta_folder: Option<String>,
}

impl RecordingIndex {
    pub fn parse(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Url of the scene video file, given the url of the recording
    /// folder.
    #[must_use]
    pub fn scene_video_url(&self, data_url: &Url) -> Option<Url> {
        let file = &self.scenecamera.as_ref()?.file;
        join_file(data_url, file)
    }

    /// Url of the decompressed gaze data file.
    #[must_use]
    pub fn gaze_data_url(&self, data_url: &Url) -> Option<Url> {
        let file = &self.gaze.as_ref()?.file;
        let mut url = join_file(data_url, file)?;
        url.set_query(Some("use-content-encoding=true"));
        Some(url)
    }

    /// Url of the meta folder.
    #[must_use]
    pub fn meta_folder_url(&self, data_url: &Url) -> Option<Url> {
        join_file(data_url, self.meta_folder.as_ref()?)
    }
}

fn join_file(data_url: &Url, file: &str) -> Option<Url> {
    Url::parse(&format!("{}/{file}", data_url.as_str().trim_end_matches('/'))).ok()
}

/// Metadata entries are string-valued; values that decode cleanly as
/// base64 text are returned decoded, anything else raw.
#[must_use]
pub fn decode_meta_value(raw: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    if let Ok(bytes) = engine.decode(raw) {
        if let Ok(text) = String::from_utf8(bytes) {
            return text;
        }
    }
    raw.to_owned()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INDEX: &str = r#"{
        "name": "office-walk",
        "uuid": "0b4b0b9e-9e2a-44ae-b6f8-7b4c89a136d8",
        "created": "2023-03-01T12:30:00.000000+0000",
        "duration": 12.5,
        "scenecamera": {"file": "scenevideo.mp4"},
        "gaze": {"file": "gazedata.gz"},
        "events": {"file": "eventdata.gz"},
        "imu": {"file": "imudata.gz"},
        "meta-folder": "meta",
        "unknown-field": 1
    }"#;

    #[test]
    fn test_parse_index() {
        let index = RecordingIndex::parse(INDEX.as_bytes()).unwrap();
        assert_eq!(Some("office-walk".to_owned()), index.name);
        assert_eq!(Some(12.5), index.duration);
        assert_eq!(
            Some(RecordingComponent {
                file: "scenevideo.mp4".to_owned()
            }),
            index.scenecamera,
        );
    }

    #[test]
    fn test_file_urls() {
        let index = RecordingIndex::parse(INDEX.as_bytes()).unwrap();
        let data_url = Url::parse("http://device/recordings/0b4b0b9e").unwrap();

        assert_eq!(
            "http://device/recordings/0b4b0b9e/scenevideo.mp4",
            index.scene_video_url(&data_url).unwrap().as_str(),
        );
        assert_eq!(
            "http://device/recordings/0b4b0b9e/gazedata.gz?use-content-encoding=true",
            index.gaze_data_url(&data_url).unwrap().as_str(),
        );
        assert_eq!(
            "http://device/recordings/0b4b0b9e/meta",
            index.meta_folder_url(&data_url).unwrap().as_str(),
        );
    }

    #[test]
    fn test_missing_components() {
        let index = RecordingIndex::parse(b"{}").unwrap();
        let data_url = Url::parse("http://device/recordings/x").unwrap();
        assert_eq!(None, index.scene_video_url(&data_url));
        assert_eq!(None, index.gaze_data_url(&data_url));
    }

    #[test]
    fn test_decode_meta_value() {
        // "RulerData" base64-encoded.
        assert_eq!("RulerData", decode_meta_value("UnVsZXJEYXRh"));
        // Not base64, returned raw.
        assert_eq!("plain text!", decode_meta_value("plain text!"));
    }
}
