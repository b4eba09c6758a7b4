// SPDX-License-Identifier: GPL-2.0-or-later

use common::{DeviceId, ILogger, LogEntry, LogLevel, LogSource};
use serde::Serialize;
use std::{
    fmt,
    ops::Deref,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::broadcast;

/// Logger used everywhere across the library.
pub struct Logger {
    /// Internal logging feed.
    feed: broadcast::Sender<LogEntryWithTime>,

    print_level: LogLevel,
}

impl Logger {
    /// Creates a new logger that prints entries up to `print_level` to
    /// stdout and forwards everything to subscribers.
    #[must_use]
    pub fn new(print_level: LogLevel) -> Self {
        let (feed, _) = broadcast::channel(64);
        Self { feed, print_level }
    }

    /// Subscribes to the log feed and returns a channel that receives all log entries.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntryWithTime> {
        self.feed.subscribe()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl ILogger for Logger {
    /// Sends log entry to all subscribers. The timestamp is applied now.
    fn log(&self, log: LogEntry) {
        let log = LogEntryWithTime {
            level: log.level,
            source: log.source,
            device_id: log.device_id,
            message: log.message,
            time: UnixMicro::now(),
        };

        if log.level.as_u8() <= self.print_level.as_u8() {
            println!("{log}");
        }

        // Only returns an error if there are no subscribers.
        self.feed.send(log).ok();
    }
}

/// Microseconds since the `UNIX_EPOCH`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct UnixMicro(u64);

impl UnixMicro {
    /// Current time as `UnixMicro`.
    fn now() -> Self {
        UnixMicro(
            u64::try_from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("broken system clock")
                    .as_micros(),
            )
            .expect("really broken system clock"),
        )
    }
}

impl From<u64> for UnixMicro {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Deref for UnixMicro {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Log entry with time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntryWithTime {
    /// Severity.
    pub level: LogLevel,

    /// Source.
    pub source: LogSource,

    /// Optional device ID if the message can be tied to a device.
    #[serde(rename = "deviceID", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,

    /// Message.
    pub message: String,

    // Timestamp.
    pub time: UnixMicro,
}

impl fmt::Display for LogEntryWithTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            LogLevel::Error => write!(f, "[ERROR] ")?,
            LogLevel::Warning => write!(f, "[WARNING] ")?,
            LogLevel::Info => write!(f, "[INFO] ")?,
            LogLevel::Debug => write!(f, "[DEBUG] ")?,
        };

        if let Some(device_id) = &self.device_id {
            write!(f, "{device_id}: ")?;
        };

        write!(f, "{}: {}", self.source, self.message)?;

        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn logger_messages() {
        let logger = Logger::new(LogLevel::Debug);
        let mut feed = logger.subscribe();

        logger.log(LogEntry {
            level: LogLevel::Info,
            source: "control",
            device_id: Some("d1".into()),
            message: "1".to_owned(),
        });
        logger.log(LogEntry {
            level: LogLevel::Warning,
            source: "rtsp",
            device_id: None,
            message: "2".to_owned(),
        });

        let mut actual = vec![feed.recv().await.unwrap(), feed.recv().await.unwrap()];
        actual.iter_mut().for_each(|v| v.time = UnixMicro(0));

        let expected = vec![
            LogEntryWithTime {
                level: LogLevel::Info,
                source: "control",
                device_id: Some("d1".into()),
                message: "1".to_owned(),
                time: UnixMicro(0),
            },
            LogEntryWithTime {
                level: LogLevel::Warning,
                source: "rtsp",
                device_id: None,
                message: "2".to_owned(),
                time: UnixMicro(0),
            },
        ];
        assert_eq!(expected, actual);
    }

    #[test]
    fn entry_display() {
        let entry = LogEntryWithTime {
            level: LogLevel::Error,
            source: "discovery",
            device_id: Some("g3-123".into()),
            message: "lookup failed".to_owned(),
            time: UnixMicro(0),
        };
        assert_eq!("[ERROR] g3-123: discovery: lookup failed", entry.to_string());
    }
}
