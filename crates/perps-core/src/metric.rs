//! Presence-aware values.
//!
//! A [`Metric`] is either a fetched value or an explicit marker saying why the
//! value is missing. A query that completed with no rows is `Available` with a
//! zero or empty value; a query that never produced an answer is `Unavailable`.
//! The two are never conflated in the cache artifact.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// Upstream exceeded its allowed duration
    Timeout,
    /// The protocol or provider has no configured identifier for this data
    NotSupported,
    /// Upstream answered but the payload did not match the expected shape
    MalformedResponse,
    /// Transport failure or non-success status from upstream
    UpstreamError,
    /// Too few history samples to derive the value
    InsufficientHistory,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::Timeout => "timeout",
            UnavailableReason::NotSupported => "not_supported",
            UnavailableReason::MalformedResponse => "malformed_response",
            UnavailableReason::UpstreamError => "upstream_error",
            UnavailableReason::InsufficientHistory => "insufficient_history",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Metric<T> {
    Available {
        value: T,
    },
    Unavailable {
        reason: UnavailableReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl<T> Metric<T> {
    pub fn available(value: T) -> Self {
        Metric::Available { value }
    }

    pub fn unavailable(reason: UnavailableReason) -> Self {
        Metric::Unavailable {
            reason,
            detail: None,
        }
    }

    pub fn unavailable_with(reason: UnavailableReason, detail: impl Into<String>) -> Self {
        Metric::Unavailable {
            reason,
            detail: Some(detail.into()),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Metric::Available { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Metric::Available { value } => Some(value),
            Metric::Unavailable { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Metric::Available { value } => Some(value),
            Metric::Unavailable { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<UnavailableReason> {
        match self {
            Metric::Available { .. } => None,
            Metric::Unavailable { reason, .. } => Some(*reason),
        }
    }

    pub fn as_ref(&self) -> Metric<&T> {
        match self {
            Metric::Available { value } => Metric::Available { value },
            Metric::Unavailable { reason, detail } => Metric::Unavailable {
                reason: *reason,
                detail: detail.clone(),
            },
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Metric<U> {
        match self {
            Metric::Available { value } => Metric::Available { value: f(value) },
            Metric::Unavailable { reason, detail } => Metric::Unavailable { reason, detail },
        }
    }

    /// Same marker, different payload type. `None` when the metric is available.
    pub fn unavailable_as<U>(&self) -> Option<Metric<U>> {
        match self {
            Metric::Available { .. } => None,
            Metric::Unavailable { reason, detail } => Some(Metric::Unavailable {
                reason: *reason,
                detail: detail.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_zero_is_not_absence() {
        let zero: Metric<u64> = Metric::available(0);
        let missing: Metric<u64> = Metric::unavailable(UnavailableReason::Timeout);

        assert_ne!(zero, missing);
        assert_eq!(zero.value(), Some(&0));
        assert_eq!(missing.value(), None);
        assert_eq!(missing.reason(), Some(UnavailableReason::Timeout));
    }

    #[test]
    fn test_wire_shape() {
        let zero: Metric<u64> = Metric::available(0);
        assert_eq!(
            serde_json::to_string(&zero).unwrap(),
            r#"{"status":"available","value":0}"#
        );

        let missing: Metric<u64> = Metric::unavailable(UnavailableReason::NotSupported);
        assert_eq!(
            serde_json::to_string(&missing).unwrap(),
            r#"{"status":"unavailable","reason":"not_supported"}"#
        );

        let detailed: Metric<u64> =
            Metric::unavailable_with(UnavailableReason::UpstreamError, "HTTP 502");
        let json = serde_json::to_string(&detailed).unwrap();
        assert_eq!(serde_json::from_str::<Metric<u64>>(&json).unwrap(), detailed);
    }

    #[test]
    fn test_decimal_value_survives_serde() {
        let volume = Metric::available(dec!(1234567.8900));
        let json = serde_json::to_string(&volume).unwrap();
        let back: Metric<rust_decimal::Decimal> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, volume);
    }

    #[test]
    fn test_map_keeps_marker() {
        let missing: Metric<u64> = Metric::unavailable_with(UnavailableReason::Timeout, "300s");
        let mapped = missing.map(|v| v * 2);
        assert_eq!(mapped.reason(), Some(UnavailableReason::Timeout));
        assert_eq!(Metric::available(21u64).map(|v| v * 2).value(), Some(&42));
    }
}
