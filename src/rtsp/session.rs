// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    StreamKind,
    receiver::{StreamReceiver, new_stream},
    transport::{ChannelRouter, bind_udp_pair, spawn_udp_readers},
};
use common::{ArcMsgLogger, LogLevel, time::VIDEO_CLOCK_RATE};
use rtsp_types::{Method, Version, headers};
use sdp::description::session::SessionDescription;
use std::{io::Cursor, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use url::Url;

const DEFAULT_RTSP_PORT: u16 = 554;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rtsp url has no host")]
    NoHost,

    #[error("unsupported scheme '{0}'")]
    BadScheme(String),

    #[error("connect: {0}")]
    Connect(std::io::Error),

    #[error("bind transport: {0}")]
    BindTransport(std::io::Error),

    #[error("send request: {0}")]
    Send(std::io::Error),

    /// The connection was closed before the response arrived.
    #[error("rtsp connection closed")]
    Closed,

    #[error("server returned {0}")]
    Status(String),

    #[error("parse session description: {0}")]
    ParseSdp(String),

    #[error("no '{0}' track in the session description")]
    TrackNotFound(StreamKind),
}

// Whether RTP runs over its own UDP sockets or interleaved on the
// RTSP connection, selected by the url scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Proto {
    Udp,
    Tcp,
}

/// One media track offered by the DESCRIBE response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    pub media: String,
    pub control: Url,
    pub clock_rate: u32,
}

struct Transaction {
    write: OwnedWriteHalf,
    responses: mpsc::Receiver<rtsp_types::Response<Vec<u8>>>,
    cseq: u32,
    session_id: Option<String>,
    timeout: Duration,
}

struct SessionInner {
    txn: AsyncMutex<Transaction>,
}

/// An RTSP session against the device's live endpoint.
///
/// `connect` issues DESCRIBE, `setup` once per wanted stream, then
/// `play`. Keep-alive runs until `teardown`, which also releases all
/// transports.
pub struct Session {
    inner: Arc<SessionInner>,
    token: CancellationToken,
    logger: ArcMsgLogger,
    base_url: Url,
    proto: Proto,
    tracks: Vec<TrackInfo>,
    router: ChannelRouter,
    next_channel: u8,
    keepalive_started: bool,
}

impl Session {
    /// Connects and describes the presentation at `rtsp_url`. The
    /// scheme picks the transport: `rtsp` is UDP, `rtspt` is
    /// interleaved TCP.
    pub async fn connect(rtsp_url: &Url, logger: ArcMsgLogger) -> Result<Self, SessionError> {
        let proto = match rtsp_url.scheme() {
            "rtsp" => Proto::Udp,
            "rtspt" => Proto::Tcp,
            scheme => return Err(SessionError::BadScheme(scheme.to_owned())),
        };
        let host = rtsp_url.host_str().ok_or(SessionError::NoHost)?;
        let port = rtsp_url.port().unwrap_or(DEFAULT_RTSP_PORT);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(SessionError::Connect)?;
        let (read, write) = stream.into_split();

        let router = ChannelRouter::default();
        let token = CancellationToken::new();
        let (response_tx, responses) = mpsc::channel(8);
        tokio::spawn(run_reader(
            read,
            router.clone(),
            response_tx,
            token.clone(),
            logger.clone(),
        ));

        // The device speaks plain rtsp on the wire either way.
        let mut base_url = rtsp_url.clone();
        if proto == Proto::Tcp {
            _ = base_url.set_scheme("rtsp");
        }

        let mut session = Self {
            inner: Arc::new(SessionInner {
                txn: AsyncMutex::new(Transaction {
                    write,
                    responses,
                    cseq: 0,
                    session_id: None,
                    timeout: DEFAULT_SESSION_TIMEOUT,
                }),
            }),
            token,
            logger,
            base_url,
            proto,
            tracks: Vec::new(),
            router,
            next_channel: 0,
            keepalive_started: false,
        };
        session.describe().await?;
        Ok(session)
    }

    async fn describe(&mut self) -> Result<(), SessionError> {
        let base_url = self.base_url.clone();
        let mut txn = self.inner.txn.lock().await;
        let response = roundtrip(
            &mut txn,
            Method::Describe,
            &base_url,
            vec![(headers::ACCEPT, "application/sdp".to_owned())],
        )
        .await?;
        drop(txn);

        // Control attributes resolve against the content base when the
        // server provides one.
        let base = response
            .header(&headers::CONTENT_BASE)
            .and_then(|v| Url::parse(v.as_str()).ok())
            .unwrap_or_else(|| self.base_url.clone());

        let body = String::from_utf8_lossy(response.body()).into_owned();
        let sdp = SessionDescription::unmarshal(&mut Cursor::new(body.as_bytes()))
            .map_err(|e| SessionError::ParseSdp(e.to_string()))?;
        self.tracks = parse_tracks(&sdp, &base);
        Ok(())
    }

    #[must_use]
    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    /// Sets up reception for one stream and returns its receiver.
    pub async fn setup(&mut self, kind: StreamKind) -> Result<StreamReceiver, SessionError> {
        let track = self
            .tracks
            .iter()
            .filter(|t| t.media == kind.media())
            .nth(kind.media_index())
            .ok_or(SessionError::TrackNotFound(kind))?
            .clone();

        let (ingest, receiver) = new_stream(self.logger.clone(), kind, track.clock_rate);

        match self.proto {
            Proto::Udp => {
                let (rtp, rtcp) = bind_udp_pair()
                    .await
                    .map_err(SessionError::BindTransport)?;
                let rtp_port = rtp.local_addr().map_err(SessionError::BindTransport)?.port();

                let transport = format!(
                    "RTP/AVP;unicast;client_port={rtp_port}-{}",
                    rtp_port + 1
                );
                let mut txn = self.inner.txn.lock().await;
                roundtrip(
                    &mut txn,
                    Method::Setup,
                    &track.control,
                    vec![(headers::TRANSPORT, transport)],
                )
                .await?;
                drop(txn);

                spawn_udp_readers(rtp, rtcp, ingest, &self.token);
            }
            Proto::Tcp => {
                let channel = self.next_channel;
                self.next_channel += 2;

                // Register before SETUP so no early frame is lost.
                self.router.register(channel, channel + 1, ingest);

                let transport = format!(
                    "RTP/AVP/TCP;unicast;interleaved={channel}-{}",
                    channel + 1
                );
                let mut txn = self.inner.txn.lock().await;
                roundtrip(
                    &mut txn,
                    Method::Setup,
                    &track.control,
                    vec![(headers::TRANSPORT, transport)],
                )
                .await?;
            }
        }
        Ok(receiver)
    }

    /// Starts playback and the keep-alive task.
    pub async fn play(&mut self) -> Result<(), SessionError> {
        let base_url = self.base_url.clone();
        let mut txn = self.inner.txn.lock().await;
        roundtrip(
            &mut txn,
            Method::Play,
            &base_url,
            vec![(headers::RANGE, "npt=0.000-".to_owned())],
        )
        .await?;
        drop(txn);

        self.start_keepalive();
        Ok(())
    }

    fn start_keepalive(&mut self) {
        if self.keepalive_started {
            return;
        }
        self.keepalive_started = true;

        let inner = self.inner.clone();
        let token = self.token.clone();
        let base_url = self.base_url.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            loop {
                let period = { inner.txn.lock().await.timeout } / 2;
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(period) => {}
                }

                let mut txn = inner.txn.lock().await;
                if let Err(e) = roundtrip(&mut txn, Method::GetParameter, &base_url, Vec::new()).await
                {
                    logger.log(LogLevel::Warning, &format!("keepalive: {e}"));
                    return;
                }
            }
        });
    }

    /// Sends TEARDOWN and releases all transports and tasks. Dropping
    /// the session without calling this only cancels the tasks.
    pub async fn teardown(&mut self) {
        let base_url = self.base_url.clone();
        {
            let mut txn = self.inner.txn.lock().await;
            if let Err(e) = roundtrip(&mut txn, Method::Teardown, &base_url, Vec::new()).await {
                self.logger.log(LogLevel::Debug, &format!("teardown: {e}"));
            }
        }
        self.token.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn roundtrip(
    txn: &mut Transaction,
    method: Method,
    uri: &Url,
    extra_headers: Vec<(headers::HeaderName, String)>,
) -> Result<rtsp_types::Response<Vec<u8>>, SessionError> {
    txn.cseq += 1;
    let mut builder = rtsp_types::Request::builder(method, Version::V1_0)
        .request_uri(uri.clone())
        .header(headers::CSEQ, txn.cseq.to_string());
    if let Some(id) = &txn.session_id {
        builder = builder.header(headers::SESSION, id.clone());
    }
    for (name, value) in extra_headers {
        builder = builder.header(name, value);
    }
    let request = builder.build(Vec::new());

    let mut data = Vec::new();
    request
        .write(&mut data)
        .map_err(|e| SessionError::Send(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    txn.write.write_all(&data).await.map_err(SessionError::Send)?;

    // Transactions are serialized, the next response is ours.
    let response = txn.responses.recv().await.ok_or(SessionError::Closed)?;
    if response.status() != rtsp_types::StatusCode::Ok {
        return Err(SessionError::Status(format!("{:?}", response.status())));
    }

    if txn.session_id.is_none() {
        if let Some(session) = response.header(&headers::SESSION) {
            let (id, timeout) = parse_session_header(session.as_str());
            txn.session_id = Some(id);
            txn.timeout = timeout;
        }
    }
    Ok(response)
}

/// `Session: 2e6s7c43;timeout=30` -> id and timeout, default 60s.
fn parse_session_header(value: &str) -> (String, Duration) {
    let mut parts = value.split(';');
    let id = parts.next().unwrap_or(value).trim().to_owned();

    let mut timeout = DEFAULT_SESSION_TIMEOUT;
    for part in parts {
        if let Some(secs) = part.trim().strip_prefix("timeout=") {
            if let Ok(secs) = secs.parse::<u64>() {
                timeout = Duration::from_secs(secs.max(1));
            }
        }
    }
    (id, timeout)
}

async fn run_reader(
    mut read: OwnedReadHalf,
    router: ChannelRouter,
    responses: mpsc::Sender<rtsp_types::Response<Vec<u8>>>,
    token: CancellationToken,
    logger: ArcMsgLogger,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0; 8192];
    loop {
        loop {
            if buf.is_empty() {
                break;
            }
            match rtsp_types::Message::parse(&buf) {
                Ok((message, consumed)) => {
                    buf.drain(..consumed);
                    match message {
                        rtsp_types::Message::Response(response) => {
                            if responses.send(response).await.is_err() {
                                return;
                            }
                        }
                        rtsp_types::Message::Data(data) => {
                            let channel = data.channel_id();
                            router.route(channel, &data.into_body());
                        }
                        rtsp_types::Message::Request(request) => {
                            logger.log(
                                LogLevel::Debug,
                                &format!("ignoring server request {:?}", request.method()),
                            );
                        }
                    }
                }
                Err(rtsp_types::ParseError::Incomplete(_)) => break,
                Err(e) => {
                    logger.log(LogLevel::Error, &format!("parse rtsp message: {e:?}"));
                    return;
                }
            }
        }

        tokio::select! {
            () = token.cancelled() => return,
            res = read.read(&mut chunk) => {
                match res {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
        }
    }
}

fn parse_tracks(sdp: &SessionDescription, base: &Url) -> Vec<TrackInfo> {
    let mut tracks = Vec::new();
    for media in &sdp.media_descriptions {
        let mut control = None;
        let mut clock_rate = None;
        for attribute in &media.attributes {
            match attribute.key.as_str() {
                "control" => {
                    control = attribute.value.as_deref().map(|v| join_control(base, v));
                }
                "rtpmap" => {
                    // "96 H264/90000" or "98 application/90000".
                    clock_rate = attribute
                        .value
                        .as_deref()
                        .and_then(|v| v.split('/').nth(1))
                        .and_then(|v| v.split('/').next())
                        .and_then(|v| v.trim().parse().ok());
                }
                _ => {}
            }
        }
        let Some(control) = control else {
            continue;
        };
        tracks.push(TrackInfo {
            media: media.media_name.media.clone(),
            control,
            clock_rate: clock_rate.unwrap_or(VIDEO_CLOCK_RATE),
        });
    }
    tracks
}

fn join_control(base: &Url, control: &str) -> Url {
    if control == "*" {
        return base.clone();
    }
    if let Ok(absolute) = Url::parse(control) {
        return absolute;
    }
    base.join(control).unwrap_or_else(|_| base.clone())
}
