// SPDX-License-Identifier: GPL-2.0-or-later

use crate::receiver::StreamIngest;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 65536;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes interleaved `$` data frames to the stream they belong to by
/// channel id. Shared between the session reader task and `setup`.
#[derive(Clone, Default)]
pub(crate) struct ChannelRouter {
    inner: Arc<Mutex<HashMap<u8, Sink>>>,
}

struct Sink {
    ingest: StreamIngest,
    is_rtcp: bool,
}

impl ChannelRouter {
    pub(crate) fn register(&self, rtp_channel: u8, rtcp_channel: u8, ingest: StreamIngest) {
        let mut inner = lock(&self.inner);
        inner.insert(
            rtp_channel,
            Sink {
                ingest: ingest.clone(),
                is_rtcp: false,
            },
        );
        inner.insert(
            rtcp_channel,
            Sink {
                ingest,
                is_rtcp: true,
            },
        );
    }

    /// Unknown channels are dropped silently.
    pub(crate) fn route(&self, channel: u8, data: &[u8]) {
        let inner = lock(&self.inner);
        let Some(sink) = inner.get(&channel) else {
            return;
        };
        if sink.is_rtcp {
            sink.ingest.handle_rtcp(data);
        } else {
            sink.ingest.handle_rtp(data);
        }
    }
}

/// Binds an RTP/RTCP socket pair on consecutive ports with the RTP
/// port even, as SETUP advertises them.
pub(crate) async fn bind_udp_pair() -> std::io::Result<(UdpSocket, UdpSocket)> {
    for _ in 0..16 {
        let rtp = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        if let Ok(rtcp) = UdpSocket::bind(("0.0.0.0", port + 1)).await {
            return Ok((rtp, rtcp));
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "no free udp port pair",
    ))
}

/// Spawns the reader tasks feeding one stream from its UDP transports.
pub(crate) fn spawn_udp_readers(
    rtp: UdpSocket,
    rtcp: UdpSocket,
    ingest: StreamIngest,
    token: &CancellationToken,
) {
    let rtp_token = token.clone();
    let rtp_ingest = ingest.clone();
    tokio::spawn(async move {
        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            tokio::select! {
                () = rtp_token.cancelled() => return,
                res = rtp.recv_from(&mut buf) => {
                    let Ok((n, _)) = res else {
                        return;
                    };
                    rtp_ingest.handle_rtp(&buf[..n]);
                }
            }
        }
    });

    let rtcp_token = token.clone();
    tokio::spawn(async move {
        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            tokio::select! {
                () = rtcp_token.cancelled() => return,
                res = rtcp.recv_from(&mut buf) => {
                    let Ok((n, _)) = res else {
                        return;
                    };
                    ingest.handle_rtcp(&buf[..n]);
                }
            }
        }
    });
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StreamKind, receiver::new_stream};
    use common::{LogLevel, MsgLogger};
    use pretty_assertions::assert_eq;
    use util::marshal::Marshal;

    struct NopLogger;

    impl MsgLogger for NopLogger {
        fn log(&self, _: LogLevel, _: &str) {}
    }

    #[tokio::test]
    async fn test_udp_pair_ports() {
        let (rtp, rtcp) = bind_udp_pair().await.unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();
        let rtcp_port = rtcp.local_addr().unwrap().port();
        assert_eq!(0, rtp_port % 2);
        assert_eq!(rtp_port + 1, rtcp_port);
    }

    #[tokio::test]
    async fn test_channel_routing() {
        let router = ChannelRouter::default();
        let (ingest, mut receiver) =
            new_stream(Arc::new(NopLogger), StreamKind::SceneCamera, 90000);
        router.register(0, 1, ingest);

        let packet = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                sequence_number: 9,
                ..Default::default()
            },
            payload: bytes::Bytes::from_static(&[0xAA]),
        };
        router.route(0, &packet.marshal().unwrap());

        // Unknown channel, dropped.
        router.route(4, &[1, 2, 3]);

        let (got, _) = receiver.recv_rtp().await.unwrap();
        assert_eq!(9, got.header.sequence_number);
    }
}
