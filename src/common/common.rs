// SPDX-License-Identifier: GPL-2.0-or-later

pub mod json;
pub mod time;

use serde::Serialize;
use std::{fmt, sync::Arc};
use thiserror::Error;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// The device API distinguishes three endpoint kinds by the delimiter
/// that precedes the endpoint name in a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// `GET` to read, `POST` with a scalar body to write.
    Property,

    /// `POST` with a list body.
    Action,

    /// `POST` with body `null` to subscribe, body `signal_id` to unsubscribe.
    Signal,
}

impl EndpointKind {
    #[must_use]
    pub fn delimiter(self) -> char {
        match self {
            EndpointKind::Property => '.',
            EndpointKind::Action => '!',
            EndpointKind::Signal => ':',
        }
    }
}

/// Computes the full path of an endpoint, e.g. `/recorder` + `started`
/// with kind `Signal` becomes `/recorder:started`.
#[must_use]
pub fn endpoint_path(base: &str, kind: EndpointKind, name: &str) -> String {
    format!("{base}{}{name}", kind.delimiter())
}

/// Error response from the device, mirroring the wire shape
/// `{"id": N, "error": CODE, "message": "..."}`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("device error {code}: {message}")]
pub struct GlassesError {
    pub code: i64,
    pub message: String,
}

/// A capability was not configured, e.g. the device was connected
/// without an RTSP or HTTP url.
#[derive(Debug, Error)]
#[error("feature not available: {0}")]
pub struct FeatureNotAvailable(pub String);

pub type ArcLogger = Arc<dyn ILogger + Send + Sync>;

pub trait ILogger {
    /// Send log.
    fn log(&self, _: LogEntry) {}
}

/// Logger that prefixes messages with a fixed context.
pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

/// Log entry. The timestamp is applied by the logger implementation.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: LogSource,
    pub device_id: Option<DeviceId>,
    pub message: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(
        level: LogLevel,
        source: LogSource,
        device_id: Option<DeviceId>,
        message: String,
    ) -> Self {
        Self {
            level,
            source,
            device_id,
            message,
        }
    }
}

/// Subsystem a log entry originated from.
pub type LogSource = &'static str;

/// Severity of the log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Something requires attention.
    Error,

    /// Something may require attention.
    Warning,

    /// Standard information.
    Info,

    /// Verbose debugging information.
    Debug,
}

impl LogLevel {
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        match self {
            LogLevel::Error => 16,
            LogLevel::Warning => 24,
            LogLevel::Info => 32,
            LogLevel::Debug => 48,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseLogLevelError {
    #[error("invalid value: '{0}'")]
    InvalidValue(u8),

    #[error("unknown log level: '{0}'")]
    UnknownLevel(String),
}

impl TryFrom<u8> for LogLevel {
    type Error = ParseLogLevelError;

    fn try_from(value: u8) -> Result<Self, ParseLogLevelError> {
        match value {
            16 => Ok(Self::Error),
            24 => Ok(Self::Warning),
            32 => Ok(Self::Info),
            48 => Ok(Self::Debug),
            _ => Err(ParseLogLevelError::InvalidValue(value)),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(LogLevel::Error),
            "warning" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(ParseLogLevelError::UnknownLevel(s.to_owned())),
        }
    }
}

/// Identifies a device in log entries. By default the device hostname,
/// which is the serial number of the recording unit.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    #[must_use]
    pub fn new(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logger that does nothing. Default for devices constructed without one.
pub struct DummyLogger;

impl DummyLogger {
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new() -> ArcLogger {
        Arc::new(Self {})
    }
}

impl ILogger for DummyLogger {
    fn log(&self, _: LogEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(EndpointKind::Property, "name", "/recorder.name"; "property")]
    #[test_case(EndpointKind::Action, "start", "/recorder!start"; "action")]
    #[test_case(EndpointKind::Signal, "started", "/recorder:started"; "signal")]
    fn test_endpoint_path(kind: EndpointKind, name: &str, want: &str) {
        assert_eq!(want, endpoint_path("/recorder", kind, name));
    }

    #[test]
    fn test_glasses_error_display() {
        let e = GlassesError {
            code: 404,
            message: "no such path".to_owned(),
        };
        assert_eq!("device error 404: no such path", e.to_string());
    }

    #[test_case("error", LogLevel::Error)]
    #[test_case("warning", LogLevel::Warning)]
    #[test_case("info", LogLevel::Info)]
    #[test_case("debug", LogLevel::Debug)]
    fn test_log_level_from_str(input: &str, want: LogLevel) {
        assert_eq!(want, input.parse().unwrap());
        assert_eq!(want, LogLevel::try_from(want.as_u8()).unwrap());
    }
}
