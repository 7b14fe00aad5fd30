//! Control/result wire types for the client protocol.
//!
//! A `Control` is one trial's instructions, fetched by the client as
//! JSON from `GET /control`. Duration fields travel as human-readable
//! strings (e.g. `"50ms"`), not raw nanosecond integers, so that every
//! client language can parse them the same way. The client posts its
//! outcome back as query parameters on `POST /result`, which the
//! controller combines with OS accounting into a [`TrialResult`].

use crate::timing::Timing;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CONTROL_PATH: &str = "/control";
pub const RESULT_PATH: &str = "/result";

pub const DEFAULT_CONTROLLER_PORT: u16 = 8000;
pub const DEFAULT_COLLECTOR_GRPC_PORT: u16 = 8001;
pub const DEFAULT_COLLECTOR_HTTP_PORT: u16 = 8002;

/// Clients amortize sleep calls so each actual sleep is about this long.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_millis(50);

/// One trial's instructions, consumed exactly once by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    /// How many worker routines/threads the client should run.
    pub concurrent: usize,

    /// Abstract busy-loop units of work per span.
    pub work: i64,

    /// How many repetitions.
    pub repeat: i64,

    /// Amortized sleep debt accumulated per iteration.
    #[serde(with = "duration_string")]
    pub sleep: Duration,

    /// Debt threshold at which the client actually sleeps.
    #[serde(with = "duration_string")]
    pub sleep_interval: Duration,

    /// How many bytes per log statement.
    pub bytes_per_log: i64,
    pub num_logs: i64,

    /// Trace the operation.
    pub trace: bool,
    /// Terminate the test.
    pub exit: bool,
}

impl Control {
    /// Terminal signal telling the client to exit cleanly.
    pub fn exit() -> Self {
        Control {
            exit: true,
            ..Default::default()
        }
    }

    /// Range checks on a control about to be issued.
    pub fn validate(&self) -> Result<(), String> {
        if !self.exit && self.concurrent < 1 {
            return Err(format!("concurrent must be >= 1, got {}", self.concurrent));
        }
        if self.work < 0 || self.repeat < 0 || self.bytes_per_log < 0 || self.num_logs < 0 {
            return Err("work, repeat, and log fields must be non-negative".into());
        }
        Ok(())
    }
}

/// One trial's outcome: the client-reported wall time and sleep total,
/// combined with the user/sys CPU usage the controller measured.
/// Immutable once returned.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrialResult {
    pub measured: Timing,
    /// Post-trial flush cost, wall-clock only.
    pub flush: Timing,
    /// Total seconds the client actually slept.
    pub sleeps: f64,
}

/// Format a duration the way the protocol expects: the largest unit
/// that represents the value without a fractional part.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}us", nanos / 1_000)
    } else {
        format!("{}ns", nanos)
    }
}

/// Parse a duration string such as `"50ms"`, `"1.5s"`, `"10ns"`, or a
/// compound like `"1m30s"`. Returns an error message on malformed
/// input; callers surface it as `BenchError::MalformedInput`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    if s == "0" || s == "0s" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos = 0.0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration: {}", s))?;
        if num_end == 0 {
            return Err(format!("missing number in duration: {}", s));
        }
        let (num_str, after) = rest.split_at(num_end);
        let num: f64 = num_str
            .parse()
            .map_err(|_| format!("invalid number in duration: {}", num_str))?;

        let unit_end = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, next) = after.split_at(unit_end);

        let scale = match unit {
            "ns" => 1.0,
            "us" | "\u{00b5}s" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(format!("invalid duration unit: {}", unit)),
        };
        total_nanos += num * scale;
        rest = next;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Serde adapter serializing `Duration` fields as protocol strings.
pub mod duration_string {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse_duration(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formats() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
        assert_eq!(format_duration(Duration::from_secs(2)), "2s");
        assert_eq!(format_duration(Duration::from_nanos(1)), "1ns");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1500us");
    }

    #[test]
    fn duration_parses() {
        assert_eq!(parse_duration("50ms").unwrap(), Duration::from_millis(50));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10ns").unwrap(), Duration::from_nanos(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("10fortnights").is_err());
    }

    #[test]
    fn whole_millisecond_strings_round_trip_exactly() {
        for ms in [1u64, 5, 50, 999, 1500] {
            let d = Duration::from_millis(ms);
            let s = format_duration(d);
            assert_eq!(parse_duration(&s).unwrap(), d, "via {}", s);
        }
    }

    #[test]
    fn control_json_round_trip() {
        let control = Control {
            concurrent: 2,
            work: 1000,
            repeat: 10,
            sleep: Duration::from_millis(50),
            sleep_interval: Duration::from_millis(100),
            bytes_per_log: 64,
            num_logs: 4,
            trace: true,
            exit: false,
        };
        let body = serde_json::to_string(&control).unwrap();
        let back: Control = serde_json::from_str(&body).unwrap();
        assert_eq!(back, control);
        // Wire field names are camelCase with duration strings.
        assert!(body.contains("\"sleepInterval\":\"100ms\""), "{}", body);
        assert!(body.contains("\"bytesPerLog\":64"), "{}", body);
    }

    #[test]
    fn control_validation() {
        assert!(Control::exit().validate().is_ok());
        let bad = Control {
            concurrent: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let ok = Control {
            concurrent: 1,
            work: 10,
            repeat: 1,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }
}
