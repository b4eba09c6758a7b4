// SPDX-License-Identifier: GPL-2.0-or-later

pub mod data;
pub mod nal;
pub mod video;

pub use data::{DataStream, JsonQueue, PayloadQueue};
pub use rtsp::{RtcpPacket, RtcpQueue, Session, SessionError, StreamKind, StreamReceiver};
pub use video::{FrameQueue, NalUnitQueue, VideoDemuxer, VideoStream};

use common::{ArcLogger, ArcMsgLogger, LogEntry, LogLevel, MsgLogger};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use url::Url;

/// Which streams to set up in the live RTSP session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFlags {
    pub scene_camera: bool,
    pub audio: bool,
    pub eye_cameras: bool,
    pub gaze: bool,
    pub sync: bool,
    pub imu: bool,
    pub events: bool,
}

impl Default for StreamFlags {
    fn default() -> Self {
        Self {
            scene_camera: true,
            audio: false,
            eye_cameras: false,
            gaze: false,
            sync: false,
            imu: false,
            events: false,
        }
    }
}

impl StreamFlags {
    fn enabled(self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::SceneCamera => self.scene_camera,
            StreamKind::Audio => self.audio,
            StreamKind::EyeCameras => self.eye_cameras,
            StreamKind::Gaze => self.gaze,
            StreamKind::Sync => self.sync,
            StreamKind::Imu => self.imu,
            StreamKind::Events => self.events,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    /// Reserved streams that this library does not set up yet.
    #[error("the '{0}' stream is not implemented")]
    NotImplemented(StreamKind),

    #[error(transparent)]
    Session(#[from] SessionError),
}

enum Stream {
    Video(VideoStream),
    Data(DataStream),
}

/// The live media session of a device with its selected streams.
///
/// After `connect`, call `play` to start streaming and take the
/// individual streams to demux or decode them. `close` tears the
/// session down and releases all transports.
pub struct Streams {
    session: Session,
    streams: HashMap<StreamKind, Stream>,
}

impl Streams {
    /// Sets up an RTSP media session with the streams selected by
    /// `flags`.
    pub async fn connect(
        rtsp_url: &Url,
        flags: StreamFlags,
        logger: ArcLogger,
    ) -> Result<Self, ConnectError> {
        for kind in [
            StreamKind::Audio,
            StreamKind::Sync,
            StreamKind::Imu,
            StreamKind::Events,
        ] {
            if flags.enabled(kind) {
                return Err(ConnectError::NotImplemented(kind));
            }
        }

        let session_logger: ArcMsgLogger = Arc::new(RtspLogger {
            logger: logger.clone(),
        });
        let mut session = Session::connect(rtsp_url, session_logger).await?;

        let mut streams = HashMap::new();
        for kind in [StreamKind::SceneCamera, StreamKind::EyeCameras, StreamKind::Gaze] {
            if !flags.enabled(kind) {
                continue;
            }
            let receiver = session.setup(kind).await?;
            let stream_logger: ArcMsgLogger = Arc::new(StreamLogger {
                logger: logger.clone(),
                kind,
            });
            let stream = if kind.is_video() {
                Stream::Video(VideoStream::new(receiver, stream_logger))
            } else {
                Stream::Data(DataStream::new(receiver, stream_logger))
            };
            streams.insert(kind, stream);
        }

        Ok(Self { session, streams })
    }

    /// Starts the streaming in the RTSP media session.
    pub async fn play(&mut self) -> Result<(), SessionError> {
        self.session.play().await
    }

    /// Takes the scene camera stream. `None` when it was not selected
    /// or was already taken.
    pub fn scene_camera(&mut self) -> Option<VideoStream> {
        self.take_video(StreamKind::SceneCamera)
    }

    /// Takes the eye cameras stream.
    pub fn eye_cameras(&mut self) -> Option<VideoStream> {
        self.take_video(StreamKind::EyeCameras)
    }

    /// Takes the gaze data stream.
    pub fn gaze(&mut self) -> Option<DataStream> {
        match self.streams.remove(&StreamKind::Gaze)? {
            Stream::Data(stream) => Some(stream),
            Stream::Video(_) => None,
        }
    }

    fn take_video(&mut self, kind: StreamKind) -> Option<VideoStream> {
        match self.streams.remove(&kind)? {
            Stream::Video(stream) => Some(stream),
            Stream::Data(_) => None,
        }
    }

    /// Sends TEARDOWN and closes all transports.
    pub async fn close(&mut self) {
        self.session.teardown().await;
    }
}

struct RtspLogger {
    logger: ArcLogger,
}

impl MsgLogger for RtspLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger
            .log(LogEntry::new(level, "rtsp", None, msg.to_owned()));
    }
}

struct StreamLogger {
    logger: ArcLogger,
    kind: StreamKind,
}

impl MsgLogger for StreamLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(LogEntry::new(
            level,
            "stream",
            None,
            format!("({}) {msg}", self.kind),
        ));
    }
}
