// SPDX-License-Identifier: GPL-2.0-or-later

mod receiver;
mod session;
mod transport;

pub use receiver::{ClockAnchor, RtcpPacket, RtcpQueue, StreamReceiver, TimedRtp};
pub use session::{Session, SessionError, TrackInfo};

use std::fmt;

/// The media streams a device offers in its live RTSP session. Every
/// stream is identified by its media type and the index among the
/// media sections of that type in the session description.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum StreamKind {
    SceneCamera,
    Audio,
    EyeCameras,
    Gaze,
    Sync,
    Imu,
    Events,
}

impl StreamKind {
    #[must_use]
    pub fn media(self) -> &'static str {
        match self {
            StreamKind::SceneCamera | StreamKind::EyeCameras => "video",
            StreamKind::Audio => "audio",
            StreamKind::Gaze | StreamKind::Sync | StreamKind::Imu | StreamKind::Events => {
                "application"
            }
        }
    }

    #[must_use]
    pub fn media_index(self) -> usize {
        match self {
            StreamKind::SceneCamera | StreamKind::Audio | StreamKind::Gaze => 0,
            StreamKind::EyeCameras | StreamKind::Sync => 1,
            StreamKind::Imu => 2,
            StreamKind::Events => 3,
        }
    }

    #[must_use]
    pub fn is_video(self) -> bool {
        matches!(self, StreamKind::SceneCamera | StreamKind::EyeCameras)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::SceneCamera => "scene_camera",
            StreamKind::Audio => "audio",
            StreamKind::EyeCameras => "eye_cameras",
            StreamKind::Gaze => "gaze",
            StreamKind::Sync => "sync",
            StreamKind::Imu => "imu",
            StreamKind::Events => "events",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
