//! Classified failures of the ingestion pipeline.
//!
//! None of these are fatal. A `DecodeError` discards one line, a
//! `RejectReason` sends one line to the dead-letter table. Store and bootstrap
//! failures travel as `anyhow::Error` instead.

use thiserror::Error;

// ---

/// Why a raw line could not be turned into a candidate reading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    // ---
    /// Not JSON, not UTF-8, or not a JSON object.
    #[error("malformed-json: {0}")]
    MalformedJson(String),

    #[error("missing-required-field: {0}")]
    MissingRequiredField(&'static str),

    #[error("wrong-type: {0}")]
    WrongType(&'static str),
}

impl DecodeError {
    /// Stable reason code, as stored and logged.
    pub fn code(&self) -> &'static str {
        // ---
        match self {
            DecodeError::MalformedJson(_) => "malformed-json",
            DecodeError::MissingRequiredField(_) => "missing-required-field",
            DecodeError::WrongType(_) => "wrong-type",
        }
    }
}

/// Hard validation fault: the reading is unusable and is not committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    // ---
    #[error("invalid-moisture-raw: {0}")]
    InvalidMoistureRaw(String),
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        // ---
        match self {
            RejectReason::InvalidMoistureRaw(_) => "invalid-moisture-raw",
        }
    }

    pub fn detail(&self) -> &str {
        // ---
        match self {
            RejectReason::InvalidMoistureRaw(detail) => detail,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_codes_match_display_prefix() {
        // ---
        let errors = [
            DecodeError::MalformedJson("eof".into()),
            DecodeError::MissingRequiredField("probe_id"),
            DecodeError::WrongType("lux"),
        ];
        for err in errors {
            assert!(err.to_string().starts_with(err.code()));
        }

        let reject = RejectReason::InvalidMoistureRaw("1500 outside [0, 1023]".into());
        assert_eq!(reject.code(), "invalid-moisture-raw");
        assert_eq!(reject.detail(), "1500 outside [0, 1023]");
    }
}
