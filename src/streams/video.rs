// SPDX-License-Identifier: GPL-2.0-or-later

use crate::nal::{
    FuHeader, NAL_TYPE_FU_A, NAL_TYPE_IDR, NAL_TYPE_NON_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS, NalUnit,
    fu_reconstructed_header,
};
use common::{ArcMsgLogger, LogLevel, time::NtpTime};
use rtsp::StreamReceiver;
use sentryshot_ffmpeg_h264::{
    H264Decoder, H264DecoderBuilder, H264BuilderError, Packet, PaddedBytes, Ready,
    ReceiveFrameError, SendPacketError,
};
use sentryshot_util::Frame;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

// Reassembled NAL units and decoded frames buffer this many entries
// before the producer blocks.
pub const FRAME_QUEUE_SIZE: usize = 10;

pub type TimedNalUnit = (NalUnit, Option<NtpTime>);

/// A video track of the live session. `demux` yields reassembled NAL
/// units, `decode` yields decoded frames.
pub struct VideoStream {
    receiver: StreamReceiver,
    logger: ArcMsgLogger,
}

/// Receives the demuxed NAL units of a video stream. Dropping the
/// queue stops the demuxer task.
pub struct NalUnitQueue {
    rx: mpsc::Receiver<TimedNalUnit>,
    _guard: DropGuard,
}

impl NalUnitQueue {
    pub async fn recv(&mut self) -> Option<TimedNalUnit> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("new decoder: {0}")]
    NewDecoder(#[from] H264BuilderError),

    #[error("send packet: {0}")]
    SendPacket(SendPacketError),

    #[error("receive frame: {0}")]
    ReceiveFrame(ReceiveFrameError),

    #[error("parameter set too short")]
    BadParameterSet,
}

pub type TimedFrame = (Frame, Option<NtpTime>);

/// Receives the decoded frames of a video stream. Dropping the queue
/// stops the demuxer and decoder tasks.
pub struct FrameQueue {
    rx: mpsc::Receiver<Result<TimedFrame, DecoderError>>,
    _guard: DropGuard,
}

impl FrameQueue {
    pub async fn recv(&mut self) -> Option<Result<TimedFrame, DecoderError>> {
        self.rx.recv().await
    }
}

impl VideoStream {
    #[must_use]
    pub(crate) fn new(receiver: StreamReceiver, logger: ArcMsgLogger) -> Self {
        Self { receiver, logger }
    }

    /// Takes the stream's RTCP observer queue. Call before `demux` or
    /// `decode`.
    pub fn take_rtcp_queue(&mut self) -> Option<rtsp::RtcpQueue> {
        self.receiver.take_rtcp_queue()
    }

    /// Spawns the demuxer task and returns the NAL unit queue.
    #[must_use]
    pub fn demux(self) -> NalUnitQueue {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_SIZE);
        let token = CancellationToken::new();

        let mut receiver = self.receiver;
        let mut demuxer = VideoDemuxer::new(self.logger);
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
                if let Some(nal) = demuxer.push(&packet.payload, ntp) {
                    // A full queue blocks us here, frames then pile up
                    // in the transport buffers.
                    if tx.send(nal).await.is_err() {
                        return;
                    }
                }
            }
        });

        NalUnitQueue {
            rx,
            _guard: token.drop_guard(),
        }
    }

    /// Spawns demuxer and decoder tasks and returns the frame queue.
    ///
    /// The decoder is configured from the first in-band SPS/PPS pair.
    /// Each NAL unit may produce zero or more frames; all are forwarded
    /// in order with the source NAL unit's timestamp.
    #[must_use]
    pub fn decode(self) -> FrameQueue {
        let logger = self.logger.clone();
        let mut nal_queue = self.demux();

        let (tx, rx) = mpsc::channel(FRAME_QUEUE_SIZE);
        let token = CancellationToken::new();
        let token2 = token.clone();
        tokio::spawn(async move {
            let mut decoder = PendingDecoder::new();
            let mut pts: i64 = 0;
            loop {
                let nal = tokio::select! {
                    () = token2.cancelled() => return,
                    nal = nal_queue.recv() => nal,
                };
                let Some((nal, ntp)) = nal else {
                    return;
                };

                if decoder.decoder.is_none() {
                    if matches!(nal.nal_type(), NAL_TYPE_SPS | NAL_TYPE_PPS) {
                        if let Err(e) = decoder.absorb_parameter_set(&nal) {
                            _ = tx.send(Err(e)).await;
                            return;
                        }
                    } else {
                        // The demuxer opens its gate after a single
                        // parameter set, so a slice can still arrive
                        // before the decoder has both.
                        logger.log(
                            LogLevel::Warning,
                            &format!(
                                "dropping nal unit of type {} before the decoder is ready",
                                nal.nal_type()
                            ),
                        );
                    }
                    continue;
                }

                if matches!(nal.nal_type(), NAL_TYPE_SPS | NAL_TYPE_PPS) {
                    // Already part of the decoder configuration.
                    continue;
                }

                pts += 1;
                let avcc = PaddedBytes::new(length_prefixed(nal.data()));

                // The actual decode runs on the blocking pool, the
                // decoder moves there and back.
                let mut h264_decoder = decoder.decoder.take().expect("decoder");
                let result: Result<(), SendPacketError>;
                (h264_decoder, result) = tokio::task::spawn_blocking(move || {
                    let result = h264_decoder.send_packet(&Packet::new(&avcc).with_pts(pts));
                    (h264_decoder, result)
                })
                .await
                .expect("join");
                decoder.decoder = Some(h264_decoder);

                if let Err(e) = result {
                    if matches!(e, SendPacketError::Invaliddata) {
                        logger.log(LogLevel::Warning, "h264 decoder: send_packet: invalid data");
                        continue;
                    }
                    _ = tx.send(Err(DecoderError::SendPacket(e))).await;
                    return;
                }

                loop {
                    let mut frame = Frame::new();
                    match decoder.decoder.as_mut().expect("decoder").receive_frame(&mut frame) {
                        Ok(()) => {}
                        Err(ReceiveFrameError::Eagain) => break,
                        Err(e) => {
                            _ = tx.send(Err(DecoderError::ReceiveFrame(e))).await;
                            return;
                        }
                    }
                    if tx.send(Ok((frame, ntp))).await.is_err() {
                        return;
                    }
                }
            }
        });

        FrameQueue {
            rx,
            _guard: token.drop_guard(),
        }
    }
}

struct PendingDecoder {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    decoder: Option<H264Decoder<Ready>>,
}

impl PendingDecoder {
    fn new() -> Self {
        Self {
            sps: None,
            pps: None,
            decoder: None,
        }
    }

    /// Collects SPS and PPS until the decoder can be built.
    fn absorb_parameter_set(&mut self, nal: &NalUnit) -> Result<(), DecoderError> {
        match nal.nal_type() {
            NAL_TYPE_SPS => self.sps = Some(nal.data().to_vec()),
            NAL_TYPE_PPS => self.pps = Some(nal.data().to_vec()),
            _ => return Ok(()),
        }
        if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
            let config = avc_decoder_config(sps, pps)?;
            self.decoder = Some(
                H264DecoderBuilder::new()
                    .avcc(PaddedBytes::new(config))
                    .map_err(DecoderError::NewDecoder)?,
            );
        }
        Ok(())
    }
}

/// AVCDecoderConfigurationRecord from one SPS and one PPS,
/// ISO/IEC 14496-15 section 5.2.4.1.
fn avc_decoder_config(sps: &[u8], pps: &[u8]) -> Result<Vec<u8>, DecoderError> {
    if sps.len() < 4 {
        return Err(DecoderError::BadParameterSet);
    }
    let sps_len = u16::try_from(sps.len()).map_err(|_| DecoderError::BadParameterSet)?;
    let pps_len = u16::try_from(pps.len()).map_err(|_| DecoderError::BadParameterSet)?;

    let mut config = Vec::with_capacity(11 + sps.len() + pps.len());
    config.push(1); // configurationVersion
    config.extend_from_slice(&sps[1..4]); // profile, compatibility, level
    config.push(0xFF); // lengthSizeMinusOne = 3
    config.push(0xE1); // one SPS
    config.extend_from_slice(&sps_len.to_be_bytes());
    config.extend_from_slice(sps);
    config.push(1); // one PPS
    config.extend_from_slice(&pps_len.to_be_bytes());
    config.extend_from_slice(pps);
    Ok(config)
}

/// NAL unit in the decoder's ingest form, a four byte length prefix.
fn length_prefixed(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + nal.len());
    out.extend_from_slice(&u32::try_from(nal.len()).unwrap_or(0).to_be_bytes());
    out.extend_from_slice(nal);
    out
}

/// Parses NAL units out of RTP payloads and reassembles FU-A
/// fragments. Packets are consumed strictly in arrival order; no
/// reordering by sequence number is performed.
pub struct VideoDemuxer {
    logger: ArcMsgLogger,
    parameter_sets_seen: bool,
    assembly: Option<(Vec<u8>, Option<NtpTime>)>,
}

impl VideoDemuxer {
    #[must_use]
    pub fn new(logger: ArcMsgLogger) -> Self {
        Self {
            logger,
            parameter_sets_seen: false,
            assembly: None,
        }
    }

    /// Feeds one RTP payload. Returns a NAL unit when one became
    /// complete.
    pub fn push(&mut self, payload: &[u8], ntp: Option<NtpTime>) -> Option<TimedNalUnit> {
        if payload.is_empty() {
            return None;
        }

        let nal_type = payload[0] & 0b0001_1111;
        match nal_type {
            NAL_TYPE_SPS | NAL_TYPE_PPS => {
                self.parameter_sets_seen = true;
                Some((NalUnit::new(payload.to_vec()), ntp))
            }
            // The decoder would not accept the stream before its first
            // parameter set.
            _ if !self.parameter_sets_seen => None,
            NAL_TYPE_NON_IDR | NAL_TYPE_IDR => Some((NalUnit::new(payload.to_vec()), ntp)),
            NAL_TYPE_FU_A => self.push_fragment(payload, ntp),
            _ => {
                self.logger.log(
                    LogLevel::Warning,
                    &format!("unhandled nal unit of type {nal_type}"),
                );
                None
            }
        }
    }

    fn push_fragment(&mut self, payload: &[u8], ntp: Option<NtpTime>) -> Option<TimedNalUnit> {
        if payload.len() < 2 {
            self.logger.log(LogLevel::Warning, "fu-a without header");
            return None;
        }
        let fu = FuHeader::parse(payload[1]);

        if fu.start {
            let mut data = Vec::with_capacity(1 + payload.len() - 2);
            data.push(fu_reconstructed_header(payload[0], fu));
            data.extend_from_slice(&payload[2..]);
            self.assembly = Some((data, ntp));
        } else {
            let Some((data, _)) = &mut self.assembly else {
                // A fragment without a preceding start is corruption.
                self.logger
                    .log(LogLevel::Warning, "fu-a fragment without assembly");
                return None;
            };
            data.extend_from_slice(&payload[2..]);
        }

        if fu.end {
            let (data, start_ntp) = self.assembly.take()?;
            return Some((NalUnit::new(data), start_ntp));
        }
        None
    }
}
