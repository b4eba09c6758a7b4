// SPDX-License-Identifier: GPL-2.0-or-later

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::Url;

pub const CONTROL_SERVICE_TYPE: &str = "_tobii-g3api._tcp.local.";
pub const RTSP_SERVICE_TYPE: &str = "_rtsp._tcp.local.";

pub const DEFAULT_WEBSOCKET_PATH: &str = "/websocket";

/// Which address family a caller requires when turning a service into
/// a connection URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpPreference {
    V4Only,
    V6Only,
    Either,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IncompleteService {
    #[error("service has no IPv4 address")]
    MissingIpv4,

    #[error("service has no IPv6 address")]
    MissingIpv6,

    #[error("service has no address")]
    MissingAddress,
}

/// A device on the network, assembled from its control service record
/// and, when reachable, the paired RTSP service record.
///
/// The RTSP half is optional: a device can be usable for control while
/// unreachable for media.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceService {
    /// The instance name of the control service, by default the serial
    /// number of the recording unit.
    pub hostname: String,

    /// The service type the device was discovered under.
    pub service_type: String,

    /// Target host of the control SRV record.
    pub server: String,

    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,

    /// Port of the control service, also serving HTTP.
    pub port: u16,

    pub rtsp_port: Option<u16>,
    pub rtsp_live_path: Option<String>,
    pub rtsp_recordings_path: Option<String>,
}

impl DeviceService {
    fn host(&self, use_ip: bool, preference: IpPreference) -> Result<String, IncompleteService> {
        if !use_ip {
            return Ok(self.hostname.clone());
        }
        match preference {
            IpPreference::V4Only => self
                .ipv4
                .map(|ip| ip.to_string())
                .ok_or(IncompleteService::MissingIpv4),
            IpPreference::V6Only => self
                .ipv6
                .map(|ip| format!("[{ip}]"))
                .ok_or(IncompleteService::MissingIpv6),
            IpPreference::Either => self
                .ipv4
                .map(|ip| ip.to_string())
                .or_else(|| self.ipv6.map(|ip| format!("[{ip}]")))
                .ok_or(IncompleteService::MissingAddress),
        }
    }

    #[must_use]
    pub fn has_address(&self, preference: IpPreference) -> bool {
        match preference {
            IpPreference::V4Only => self.ipv4.is_some(),
            IpPreference::V6Only => self.ipv6.is_some(),
            IpPreference::Either => self.ipv4.is_some() || self.ipv6.is_some(),
        }
    }

    /// The url of the control channel websocket.
    pub fn ws_url(
        &self,
        use_ip: bool,
        preference: IpPreference,
    ) -> Result<Url, IncompleteService> {
        let host = self.host(use_ip, preference)?;
        Ok(parse_url(format!("ws://{host}{DEFAULT_WEBSOCKET_PATH}")))
    }

    /// The url of the live RTSP stream, `None` when the paired RTSP
    /// service was not found.
    pub fn rtsp_url(
        &self,
        use_ip: bool,
        preference: IpPreference,
    ) -> Result<Option<Url>, IncompleteService> {
        let (Some(port), Some(path)) = (self.rtsp_port, &self.rtsp_live_path) else {
            return Ok(None);
        };
        let host = self.host(use_ip, preference)?;
        Ok(Some(parse_url(format!("rtsp://{host}:{port}{path}"))))
    }

    /// The base url for HTTP requests to the device.
    pub fn http_url(
        &self,
        use_ip: bool,
        preference: IpPreference,
    ) -> Result<Url, IncompleteService> {
        let host = self.host(use_ip, preference)?;
        Ok(parse_url(format!("http://{host}:{}", self.port)))
    }
}

fn parse_url(url: String) -> Url {
    #[allow(clippy::unwrap_used)]
    Url::parse(&url).unwrap()
}
