// SPDX-License-Identifier: GPL-2.0-or-later

pub mod calibrate;
pub mod files;
pub mod recorder;
pub mod recording;
pub mod recordings;
pub mod rudimentary;
pub mod settings;
pub mod system;

pub use calibrate::Calibrate;
pub use files::{RecordingIndex, decode_meta_value};
pub use recorder::Recorder;
pub use recording::Recording;
pub use recordings::{Recordings, RecordingsEvent, RecordingsEventKind, RecordingsGuard};
pub use rudimentary::{KeepAliveGuard, Rudimentary};
pub use settings::Settings;
pub use system::{Battery, BatteryState, System};

use common::{ArcLogger, DummyLogger, FeatureNotAvailable, json::ValueError};
use control::{ControlChannel, RequireError};
use discovery::{DeviceService, Discovery, IpPreference};
use std::{sync::Arc, time::Duration};
use streams::{SessionError, StreamFlags, Streams};
use thiserror::Error;
use url::Url;

pub const DEFAULT_WEBSOCKET_PATH: &str = discovery::DEFAULT_WEBSOCKET_PATH;
pub const DEFAULT_RTSP_LIVE_PATH: &str = "/live/all";
pub const DEFAULT_RTSP_PORT: u16 = 8554;
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// A call against a control channel endpoint failed, either in
/// transit or because the response body had an unexpected shape.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Require(#[from] RequireError),

    #[error("unexpected response: {0}")]
    Value(#[from] ValueError),

    #[error("bad timestamp '{0}'")]
    BadTimestamp(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("control channel: {0}")]
    Control(#[from] control::ConnectError),

    #[error(transparent)]
    Listen(#[from] discovery::ListenError),

    #[error(transparent)]
    Discovery(#[from] discovery::WaitForServiceError),

    #[error(transparent)]
    RequestService(#[from] discovery::RequestServiceError),

    #[error(transparent)]
    IncompleteService(#[from] discovery::IncompleteService),

    #[error("bad url: {0}")]
    BadUrl(#[from] url::ParseError),
}

#[derive(Debug, Error)]
pub enum StreamRtspError {
    /// The device was connected without an RTSP url.
    #[error(transparent)]
    FeatureNotAvailable(#[from] FeatureNotAvailable),

    #[error(transparent)]
    Connect(#[from] streams::ConnectError),

    #[error("play: {0}")]
    Play(SessionError),
}

/// A connected device.
///
/// Owns the control channel and the API components speaking over it.
/// Live streaming goes through [`Glasses::stream_rtsp`].
pub struct Glasses {
    channel: Arc<ControlChannel>,
    logger: ArcLogger,
    rtsp_url: Option<Url>,
    http_url: Option<Url>,

    recorder: Recorder,
    recordings: Recordings,
    rudimentary: Rudimentary,
    system: System,
    calibrate: Calibrate,
    settings: Settings,
}

impl Glasses {
    /// Connects the control channel at `ws_url`. The RTSP and HTTP
    /// urls are optional; features needing them fail with
    /// `FeatureNotAvailable` when absent.
    pub async fn connect(
        ws_url: &Url,
        rtsp_url: Option<Url>,
        http_url: Option<Url>,
        logger: ArcLogger,
    ) -> Result<Self, ConnectError> {
        let channel = Arc::new(control::connect(ws_url, logger.clone()).await?);
        Ok(Self::new(channel, rtsp_url, http_url, logger))
    }

    /// Connects to a device by hostname using the device's default
    /// url layout.
    pub async fn connect_to_hostname(
        hostname: &str,
        logger: ArcLogger,
    ) -> Result<Self, ConnectError> {
        let ws_url = Url::parse(&format!("ws://{hostname}{DEFAULT_WEBSOCKET_PATH}"))?;
        let rtsp_url = Url::parse(&format!(
            "rtsp://{hostname}:{DEFAULT_RTSP_PORT}{DEFAULT_RTSP_LIVE_PATH}"
        ))?;
        let http_url = Url::parse(&format!("http://{hostname}:{DEFAULT_HTTP_PORT}"))?;
        Self::connect(&ws_url, Some(rtsp_url), Some(http_url), logger).await
    }

    /// Connects to a discovered device. The RTSP url is omitted when
    /// the service has no paired RTSP record.
    pub async fn connect_to_service(
        service: &DeviceService,
        use_ip: bool,
        preference: IpPreference,
        logger: ArcLogger,
    ) -> Result<Self, ConnectError> {
        let ws_url = service.ws_url(use_ip, preference)?;
        let rtsp_url = service.rtsp_url(use_ip, preference)?;
        let http_url = service.http_url(use_ip, preference)?;
        Self::connect(&ws_url, rtsp_url, Some(http_url), logger).await
    }

    /// Discovers a device on the network and connects to it. With
    /// multiple devices present the first answer wins.
    pub async fn connect_with_discovery(
        timeout: Duration,
        logger: ArcLogger,
    ) -> Result<Self, ConnectError> {
        let mut discovery = Discovery::listen(logger.clone())?;
        let service = discovery
            .wait_for_single_service(timeout, IpPreference::Either)
            .await?;
        drop(discovery);
        Self::connect_to_service(&service, true, IpPreference::Either, logger).await
    }

    fn new(
        channel: Arc<ControlChannel>,
        rtsp_url: Option<Url>,
        http_url: Option<Url>,
        logger: ArcLogger,
    ) -> Self {
        // Sub-facades are cheap, construct them all eagerly.
        Self {
            recorder: Recorder::new(channel.clone(), "/recorder"),
            recordings: Recordings::new(channel.clone(), "/recordings", http_url.clone(), logger.clone()),
            rudimentary: Rudimentary::new(channel.clone(), "/rudimentary", logger.clone()),
            system: System::new(channel.clone(), "/system"),
            calibrate: Calibrate::new(channel.clone(), "/calibrate"),
            settings: Settings::new(channel.clone(), "/settings"),
            channel,
            logger,
            rtsp_url,
            http_url,
        }
    }

    #[must_use]
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    #[must_use]
    pub fn recordings(&self) -> &Recordings {
        &self.recordings
    }

    #[must_use]
    pub fn rudimentary(&self) -> &Rudimentary {
        &self.rudimentary
    }

    #[must_use]
    pub fn system(&self) -> &System {
        &self.system
    }

    #[must_use]
    pub fn calibrate(&self) -> &Calibrate {
        &self.calibrate
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The underlying control channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<ControlChannel> {
        &self.channel
    }

    /// The RTSP url used for live streaming.
    #[must_use]
    pub fn rtsp_url(&self) -> Option<&Url> {
        self.rtsp_url.as_ref()
    }

    /// The base url for HTTP requests to the device.
    #[must_use]
    pub fn http_url(&self) -> Option<&Url> {
        self.http_url.as_ref()
    }

    /// Opens the live RTSP session with the selected streams and
    /// starts playback. Call [`Streams::close`] when done; it sends
    /// TEARDOWN and closes the transports.
    pub async fn stream_rtsp(&self, flags: StreamFlags) -> Result<Streams, StreamRtspError> {
        let Some(rtsp_url) = &self.rtsp_url else {
            return Err(FeatureNotAvailable(
                "this device was connected without an rtsp url".to_owned(),
            )
            .into());
        };

        let mut streams = Streams::connect(rtsp_url, flags, self.logger.clone()).await?;
        if let Err(e) = streams.play().await {
            streams.close().await;
            return Err(StreamRtspError::Play(e));
        }
        Ok(streams)
    }

    /// Closes the underlying control channel. Pending requests fail
    /// with a transport error.
    pub async fn close(&self) {
        self.channel.close().await;
    }
}

/// Connects with a no-op logger, for quick scripts and tests.
pub async fn connect_to_hostname(hostname: &str) -> Result<Glasses, ConnectError> {
    Glasses::connect_to_hostname(hostname, DummyLogger::new()).await
}
