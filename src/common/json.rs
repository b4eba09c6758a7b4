// SPDX-License-Identifier: GPL-2.0-or-later

//! Downcast helpers for the dynamic JSON values the control channel
//! produces. Each helper reports the actual shape on mismatch so the
//! callsite error names the offending endpoint response.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected {want}, got {got}")]
pub struct ValueError {
    pub want: &'static str,
    pub got: &'static str,
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(want: &'static str, value: &Value) -> ValueError {
    ValueError {
        want,
        got: shape(value),
    }
}

pub fn as_bool(value: &Value) -> Result<bool, ValueError> {
    value.as_bool().ok_or_else(|| mismatch("bool", value))
}

pub fn as_i64(value: &Value) -> Result<i64, ValueError> {
    value.as_i64().ok_or_else(|| mismatch("integer", value))
}

pub fn as_f64(value: &Value) -> Result<f64, ValueError> {
    value.as_f64().ok_or_else(|| mismatch("float", value))
}

pub fn as_str(value: &Value) -> Result<&str, ValueError> {
    value.as_str().ok_or_else(|| mismatch("string", value))
}

pub fn into_string(value: Value) -> Result<String, ValueError> {
    match value {
        Value::String(s) => Ok(s),
        v => Err(mismatch("string", &v)),
    }
}

/// `null` maps to `None`, anything else must be a string.
pub fn into_opt_string(value: Value) -> Result<Option<String>, ValueError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        v => Err(mismatch("string or null", &v)),
    }
}

pub fn into_array(value: Value) -> Result<Vec<Value>, ValueError> {
    match value {
        Value::Array(v) => Ok(v),
        v => Err(mismatch("array", &v)),
    }
}

pub fn into_string_array(value: Value) -> Result<Vec<String>, ValueError> {
    into_array(value)?.into_iter().map(into_string).collect()
}

/// The device reports missing numeric values as `-1`.
pub fn as_opt_i64(value: &Value) -> Result<Option<i64>, ValueError> {
    let v = as_i64(value)?;
    if v == -1 {
        Ok(None)
    } else {
        Ok(Some(v))
    }
}

/// The device reports missing durations as `-1` seconds.
#[allow(clippy::float_cmp)]
pub fn as_opt_f64(value: &Value) -> Result<Option<f64>, ValueError> {
    let v = as_f64(value)?;
    if v == -1.0 {
        Ok(None)
    } else {
        Ok(Some(v))
    }
}
