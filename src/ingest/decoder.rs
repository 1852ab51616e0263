//! Record decoder: one raw transport line to a typed candidate reading.
//!
//! Pure and total. Every input, including truncated or binary-garbled
//! lines, yields either a `CandidateReading` or a classified `DecodeError`.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::models::{parse_timestamp, CandidateReading};

// ---

pub fn decode(line: &[u8]) -> Result<CandidateReading, DecodeError> {
    // ---
    let value: Value =
        serde_json::from_slice(line).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

    let Value::Object(obj) = value else {
        return Err(DecodeError::MalformedJson("expected a JSON object".into()));
    };

    let probe_id = match obj.get("probe_id") {
        None => return Err(DecodeError::MissingRequiredField("probe_id")),
        Some(v) => v.as_i64().ok_or(DecodeError::WrongType("probe_id"))?,
    };

    // A present-but-null moisture_raw is left for the validator to reject.
    let moisture_raw = match obj.get("moisture_raw") {
        None => return Err(DecodeError::MissingRequiredField("moisture_raw")),
        Some(_) => opt_i64(&obj, "moisture_raw")?,
    };

    let ts = match obj.get("ts") {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => {
            Some(parse_timestamp(text).ok_or(DecodeError::WrongType("ts"))?)
        }
        Some(_) => return Err(DecodeError::WrongType("ts")),
    };

    // Older firmware sends `temp`.
    let temp_c = if obj.contains_key("temp_c") {
        opt_f64(&obj, "temp_c")?
    } else {
        opt_f64(&obj, "temp")?
    };

    Ok(CandidateReading {
        probe_id,
        ts,
        seq: opt_i64(&obj, "seq")?,
        lux: opt_f64(&obj, "lux")?,
        rh: opt_f64(&obj, "rh")?,
        temp_c,
        moisture_raw,
        err: device_faults(&obj)?,
    })
}

fn opt_i64(obj: &Map<String, Value>, field: &'static str) -> Result<Option<i64>, DecodeError> {
    // ---
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or(DecodeError::WrongType(field)),
    }
}

fn opt_f64(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, DecodeError> {
    // ---
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or(DecodeError::WrongType(field)),
    }
}

/// `err` may be a single code, a list of codes, or null/empty.
fn device_faults(obj: &Map<String, Value>) -> Result<Vec<String>, DecodeError> {
    // ---
    match obj.get("err") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(code)) => Ok(split_codes(code)),
        Some(Value::Array(items)) => {
            let mut codes = Vec::new();
            for item in items {
                let code = item.as_str().ok_or(DecodeError::WrongType("err"))?;
                codes.extend(split_codes(code));
            }
            Ok(codes)
        }
        Some(_) => Err(DecodeError::WrongType("err")),
    }
}

fn split_codes(text: &str) -> Vec<String> {
    // ---
    text.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(String::from)
        .collect()
}
