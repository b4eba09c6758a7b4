// SPDX-License-Identifier: GPL-2.0-or-later

use bytes::Bytes;
use common::{ArcMsgLogger, LogLevel, time::NtpTime};
use rtsp::StreamReceiver;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

// Data samples buffer this many entries before the producer blocks.
pub const DATA_QUEUE_SIZE: usize = 100;

pub type TimedPayload = (Bytes, Option<NtpTime>);
pub type TimedJson = (serde_json::Value, Option<NtpTime>);

/// An application data track carrying one JSON object per RTP packet,
/// e.g. gaze samples.
pub struct DataStream {
    receiver: StreamReceiver,
    logger: ArcMsgLogger,
}

/// Receives the raw sample payloads of a data stream. Dropping the
/// queue stops the demuxer task.
pub struct PayloadQueue {
    rx: mpsc::Receiver<TimedPayload>,
    _guard: DropGuard,
}

impl PayloadQueue {
    pub async fn recv(&mut self) -> Option<TimedPayload> {
        self.rx.recv().await
    }
}

/// Receives the decoded samples of a data stream. Dropping the queue
/// stops the demuxer and decoder tasks.
pub struct JsonQueue {
    rx: mpsc::Receiver<TimedJson>,
    _guard: DropGuard,
}

impl JsonQueue {
    pub async fn recv(&mut self) -> Option<TimedJson> {
        self.rx.recv().await
    }
}

impl DataStream {
    #[must_use]
    pub(crate) fn new(receiver: StreamReceiver, logger: ArcMsgLogger) -> Self {
        Self { receiver, logger }
    }

    /// Takes the stream's RTCP observer queue. Call before `demux` or
    /// `decode`.
    pub fn take_rtcp_queue(&mut self) -> Option<rtsp::RtcpQueue> {
        self.receiver.take_rtcp_queue()
    }

    /// Spawns the demuxer task forwarding raw payloads with their
    /// timestamps.
    #[must_use]
    pub fn demux(self) -> PayloadQueue {
        let (tx, rx) = mpsc::channel(DATA_QUEUE_SIZE);
        let token = CancellationToken::new();

        let mut receiver = self.receiver;
        let token2 = token.clone();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    () = token2.cancelled() => return,
                    packet = receiver.recv_rtp() => packet,
                };
                let Some((packet, ntp)) = packet else {
                    return;
                };
                if tx.send((packet.payload, ntp)).await.is_err() {
                    return;
                }
            }
        });

        PayloadQueue {
            rx,
            _guard: token.drop_guard(),
        }
    }

    /// Spawns demuxer and decoder tasks. Payloads that fail to parse
    /// are dropped with a log entry; empty payloads occur legitimately
    /// as heartbeats.
    #[must_use]
    pub fn decode(self) -> JsonQueue {
        let logger = self.logger.clone();
        let mut payloads = self.demux();

        let (tx, rx) = mpsc::channel(DATA_QUEUE_SIZE);
        let token = CancellationToken::new();
        let token2 = token.clone();
        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    () = token2.cancelled() => return,
                    payload = payloads.recv() => payload,
                };
                let Some((payload, ntp)) = payload else {
                    return;
                };

                let value = match serde_json::from_slice(&payload) {
                    Ok(v) => v,
                    Err(_) => {
                        if payload.is_empty() {
                            logger.log(LogLevel::Debug, "dropping empty sample (heartbeat)");
                        } else {
                            logger.log(LogLevel::Debug, "dropping undecodable sample");
                        }
                        continue;
                    }
                };
                if tx.send((value, ntp)).await.is_err() {
                    return;
                }
            }
        });

        JsonQueue {
            rx,
            _guard: token.drop_guard(),
        }
    }
}
