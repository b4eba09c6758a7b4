// SPDX-License-Identifier: GPL-2.0-or-later

use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// RTP timestamp granularity of the device's video tracks.
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: f64 = 2_208_988_800.0;

/// Wall-clock time in seconds since the Unix epoch, recovered by anchoring
/// an RTP timestamp to the last RTCP sender report of its stream.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct NtpTime(f64);

impl NtpTime {
    #[must_use]
    pub fn new(secs: f64) -> Self {
        Self(secs)
    }

    /// Converts from the 64-bit fixed-point format used in RTCP sender
    /// reports: upper 32 bits are seconds since 1900, lower 32 bits are
    /// the fraction of a second.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn from_fixed_point(ntp: u64) -> Self {
        let secs = (ntp >> 32) as f64;
        let frac = (ntp & 0xFFFF_FFFF) as f64 / f64::from(2u32).powi(32);
        Self(secs + frac - NTP_UNIX_OFFSET)
    }

    /// Projects this anchor forward (or backward) by the signed distance
    /// between two RTP timestamps. The subtraction wraps, so a timestamp
    /// just past the 32-bit rollover still yields a small positive delta.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
    pub fn with_rtp_delta(self, rtp_ts: u32, anchor_rtp_ts: u32, clock_rate: u32) -> Self {
        let delta = rtp_ts.wrapping_sub(anchor_rtp_ts) as i32;
        Self(self.0 + f64::from(delta) / f64::from(clock_rate))
    }

    #[must_use]
    pub fn as_secs(self) -> f64 {
        self.0
    }
}

impl Deref for NtpTime {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fixed_point() {
        // 1970-01-01 00:00:00 plus half a second.
        let ntp = (2_208_988_800u64 << 32) | (1u64 << 31);
        assert_eq!(NtpTime::new(0.5), NtpTime::from_fixed_point(ntp));
    }

    #[test]
    fn test_rtp_delta() {
        let anchor = NtpTime::new(100.0);
        assert_eq!(
            NtpTime::new(101.0),
            anchor.with_rtp_delta(180_000, 90000, VIDEO_CLOCK_RATE)
        );
        // Packet slightly older than the anchor.
        assert_eq!(
            NtpTime::new(99.0),
            anchor.with_rtp_delta(0, 90000, VIDEO_CLOCK_RATE)
        );
    }

    #[test]
    fn test_rtp_delta_wraparound() {
        let anchor = NtpTime::new(50.0);
        // Anchor taken just below the rollover, packet just above it.
        let got = anchor.with_rtp_delta(45000, u32::MAX - 44_999, VIDEO_CLOCK_RATE);
        assert_eq!(NtpTime::new(51.0), got);
    }
}
