// SPDX-License-Identifier: GPL-2.0-or-later

use crate::StreamKind;
use common::{ArcMsgLogger, LogLevel, time::NtpTime};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, mpsc::error::TrySendError};
use util::marshal::Unmarshal;

// Observer queue for RTCP packets, statistics only. Lossy by design.
const RTCP_QUEUE_SIZE: usize = 100;

pub type TimedRtp = (rtp::packet::Packet, Option<NtpTime>);
pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;
pub type RtcpQueue = mpsc::Receiver<RtcpPacket>;

/// Last sender report of a stream, anchoring RTP timestamps to
/// wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockAnchor {
    pub ntp: NtpTime,
    pub rtp_ts: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The consumer side of one media stream: RTP packets paired with
/// derived NTP timestamps, plus an observer queue of RTCP packets.
pub struct StreamReceiver {
    kind: StreamKind,
    rtp_rx: mpsc::UnboundedReceiver<TimedRtp>,
    rtcp_rx: Option<RtcpQueue>,
}

impl StreamReceiver {
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// The next RTP packet in arrival order. The timestamp is `None`
    /// until the stream's first RTCP sender report has been processed.
    /// Returns `None` when the transport is gone.
    pub async fn recv_rtp(&mut self) -> Option<TimedRtp> {
        self.rtp_rx.recv().await
    }

    /// Takes the observer queue of parsed RTCP packets, statistics
    /// only. When it is not consumed, new packets are dropped;
    /// timestamps stay correct regardless.
    pub fn take_rtcp_queue(&mut self) -> Option<RtcpQueue> {
        self.rtcp_rx.take()
    }
}

/// The producer side, owned by the stream's transport reader tasks.
#[derive(Clone)]
pub(crate) struct StreamIngest {
    logger: ArcMsgLogger,
    rtp_tx: mpsc::UnboundedSender<TimedRtp>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    clock: Arc<Mutex<Option<ClockAnchor>>>,
    clock_rate: u32,
}

pub(crate) fn new_stream(
    logger: ArcMsgLogger,
    kind: StreamKind,
    clock_rate: u32,
) -> (StreamIngest, StreamReceiver) {
    let (rtp_tx, rtp_rx) = mpsc::unbounded_channel();
    let (rtcp_tx, rtcp_rx) = mpsc::channel(RTCP_QUEUE_SIZE);
    (
        StreamIngest {
            logger,
            rtp_tx,
            rtcp_tx,
            clock: Arc::new(Mutex::new(None)),
            clock_rate,
        },
        StreamReceiver {
            kind,
            rtp_rx,
            rtcp_rx: Some(rtcp_rx),
        },
    )
}

impl StreamIngest {
    /// Parses an RTP datagram, derives its wall-clock timestamp from
    /// the last sender report and queues it for the demuxer.
    pub(crate) fn handle_rtp(&self, data: &[u8]) {
        let mut buf = data;
        let packet = match rtp::packet::Packet::unmarshal(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                self.logger
                    .log(LogLevel::Debug, &format!("corrupt rtp packet: {e}"));
                return;
            }
        };

        let anchor = *lock(&self.clock);
        let ntp = anchor.map(|anchor| {
            anchor
                .ntp
                .with_rtp_delta(packet.header.timestamp, anchor.rtp_ts, self.clock_rate)
        });
        _ = self.rtp_tx.send((packet, ntp));
    }

    /// Parses an RTCP compound datagram. Sender reports update the
    /// stream clock; every packet is offered to the observer queue.
    pub(crate) fn handle_rtcp(&self, data: &[u8]) {
        let mut buf = data;
        let packets = match rtcp::packet::unmarshal(&mut buf) {
            Ok(v) => v,
            Err(e) => {
                self.logger
                    .log(LogLevel::Debug, &format!("corrupt rtcp packet: {e}"));
                return;
            }
        };

        for packet in packets {
            if let Some(report) = packet
                .as_any()
                .downcast_ref::<rtcp::sender_report::SenderReport>()
            {
                *lock(&self.clock) = Some(ClockAnchor {
                    ntp: NtpTime::from_fixed_point(report.ntp_time),
                    rtp_ts: report.rtp_time,
                });
            }

            match self.rtcp_tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.logger.log(
                        LogLevel::Warning,
                        "rtcp queue full, dropping packet; consume the queue to prevent this",
                    );
                }
                // Nobody is observing.
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use common::MsgLogger;
    use pretty_assertions::assert_eq;
    use util::marshal::Marshal;

    struct NopLogger;

    impl MsgLogger for NopLogger {
        fn log(&self, _: LogLevel, _: &str) {}
    }

    fn logger() -> ArcMsgLogger {
        Arc::new(NopLogger)
    }

    fn rtp_bytes(seq: u16, timestamp: u32) -> Vec<u8> {
        let packet = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp,
                ssrc: 0x1234,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[1, 2, 3]),
        };
        packet.marshal().unwrap().to_vec()
    }

    fn sender_report_bytes(ntp_time: u64, rtp_time: u32) -> Vec<u8> {
        let report = rtcp::sender_report::SenderReport {
            ssrc: 0x1234,
            ntp_time,
            rtp_time,
            ..Default::default()
        };
        report.marshal().unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_timestamps_none_before_sender_report() {
        let (ingest, mut receiver) = new_stream(logger(), StreamKind::SceneCamera, 90000);

        ingest.handle_rtp(&rtp_bytes(1, 90000));
        let (packet, ntp) = receiver.recv_rtp().await.unwrap();
        assert_eq!(1, packet.header.sequence_number);
        assert_eq!(None, ntp);
    }

    #[tokio::test]
    async fn test_ntp_derivation() {
        let (ingest, mut receiver) = new_stream(logger(), StreamKind::SceneCamera, 90000);

        // Sender report anchoring rtp_ts 90000 to the unix epoch plus
        // 10 seconds.
        let ntp = (2_208_988_810u64) << 32;
        ingest.handle_rtcp(&sender_report_bytes(ntp, 90000));

        // One second past the anchor.
        ingest.handle_rtp(&rtp_bytes(2, 180_000));
        let (_, ntp) = receiver.recv_rtp().await.unwrap();
        assert_eq!(Some(NtpTime::new(11.0)), ntp);

        // A later report moves the anchor.
        let ntp2 = (2_208_988_820u64) << 32;
        ingest.handle_rtcp(&sender_report_bytes(ntp2, 990_000));
        ingest.handle_rtp(&rtp_bytes(3, 990_000));
        let (_, ntp) = receiver.recv_rtp().await.unwrap();
        assert_eq!(Some(NtpTime::new(20.0)), ntp);
    }

    #[tokio::test]
    async fn test_rtcp_queue_is_lossy() {
        let (ingest, mut receiver) = new_stream(logger(), StreamKind::Gaze, 90000);

        for _ in 0..RTCP_QUEUE_SIZE + 10 {
            ingest.handle_rtcp(&sender_report_bytes(2_208_988_800u64 << 32, 0));
        }

        // Only the queue capacity was retained and the clock still
        // works.
        let mut rtcp_queue = receiver.take_rtcp_queue().unwrap();
        let mut count = 0;
        while rtcp_queue.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(RTCP_QUEUE_SIZE, count);

        ingest.handle_rtp(&rtp_bytes(1, 0));
        let (_, ntp) = receiver.recv_rtp().await.unwrap();
        assert_eq!(Some(NtpTime::new(0.0)), ntp);
    }

    #[tokio::test]
    async fn test_corrupt_packets_are_dropped() {
        let (ingest, mut receiver) = new_stream(logger(), StreamKind::SceneCamera, 90000);

        ingest.handle_rtp(&[0xFF]);
        ingest.handle_rtcp(&[0xFF]);
        ingest.handle_rtp(&rtp_bytes(5, 0));

        let (packet, _) = receiver.recv_rtp().await.unwrap();
        assert_eq!(5, packet.header.sequence_number);
    }
}
