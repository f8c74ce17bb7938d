//! Metric domain model: tagged gauge/counter variant, canonical keys, and
//! the text encoding used by the single-value `/update` and `/value` routes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The two metric kinds the system understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last-write-wins sample.
    Gauge,
    /// Monotonically accumulated delta.
    Counter,
}

impl MetricKind {
    /// Case-insensitive parse of the `gauge`/`counter` type token.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Some(Self::Gauge),
            "counter" => Some(Self::Counter),
            _ => None,
        }
    }

    /// Lowercase wire form, also used in the canonical key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while constructing or parsing a [`Metric`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetricError {
    #[error("invalid metric type {0:?}")]
    InvalidMetricType(String),
    #[error("invalid metric value {0:?}")]
    InvalidMetricValue(String),
    #[error("invalid metric name")]
    InvalidMetricName,
}

/// A single metric sample. The variant tag drives both update dispatch and
/// serialization; invariants from the data model (gauge has a value only,
/// counter has a delta only) are enforced at construction.
#[derive(Clone, Debug, PartialEq)]
pub enum Metric {
    /// `Type=Gauge`, carries a `value`.
    Gauge { name: String, value: f64 },
    /// `Type=Counter`, carries a `delta`.
    Counter { name: String, delta: i64 },
}

impl Metric {
    /// Build a metric from its type token, name, and textual value, failing
    /// with the same taxonomy the HTTP path-param route uses.
    pub fn new(name: &str, kind_token: &str, text_value: &str) -> Result<Self, MetricError> {
        if name.is_empty() {
            return Err(MetricError::InvalidMetricName);
        }
        match MetricKind::parse(kind_token) {
            Some(MetricKind::Gauge) => {
                let value: f64 = text_value
                    .parse()
                    .map_err(|_| MetricError::InvalidMetricValue(text_value.to_string()))?;
                Ok(Metric::Gauge { name: name.to_string(), value })
            }
            Some(MetricKind::Counter) => {
                let delta: i64 = text_value
                    .parse()
                    .map_err(|_| MetricError::InvalidMetricValue(text_value.to_string()))?;
                Ok(Metric::Counter { name: name.to_string(), delta })
            }
            None => Err(MetricError::InvalidMetricType(kind_token.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Metric::Gauge { name, .. } | Metric::Counter { name, .. } => name,
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Gauge { .. } => MetricKind::Gauge,
            Metric::Counter { .. } => MetricKind::Counter,
        }
    }

    /// Identity key: `(name, type)`.
    pub fn key(&self) -> MetricKey {
        MetricKey { name: self.name().to_string(), kind: self.kind() }
    }

    /// Canonical string form `"<type>_<name>"`, used as the map key of the
    /// in-memory backend and as the key in on-disk frames.
    pub fn key_string(&self) -> String {
        self.key().to_string()
    }

    /// Minimum-precision float formatting for gauges, base-10 for counters.
    pub fn string_value(&self) -> String {
        match self {
            Metric::Gauge { value, .. } => format_gauge(*value),
            Metric::Counter { delta, .. } => delta.to_string(),
        }
    }
}

/// Formats a gauge value with the shortest representation that round-trips
/// back to the same float.
fn format_gauge(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        let mut s = format!("{}", value);
        if s.contains('e') || s.contains('E') {
            s = format!("{:.17}", value);
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        s
    }
}

/// Identity key: the ordered pair `(Name, Type)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub name: String,
    pub kind: MetricKind,
}

impl MetricKey {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self { name: name.into(), kind }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.as_str(), self.name)
    }
}

/// Wire/on-disk JSON record: `{ "id": name, "type": "gauge"|"counter",
/// "delta": i64?, "value": f64? }`. `delta`/`value` are mutually exclusive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricDto {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl From<&Metric> for MetricDto {
    fn from(m: &Metric) -> Self {
        match m {
            Metric::Gauge { name, value } => MetricDto {
                id: name.clone(),
                kind: MetricKind::Gauge,
                delta: None,
                value: Some(*value),
            },
            Metric::Counter { name, delta } => MetricDto {
                id: name.clone(),
                kind: MetricKind::Counter,
                delta: Some(*delta),
                value: None,
            },
        }
    }
}

impl From<Metric> for MetricDto {
    fn from(m: Metric) -> Self {
        (&m).into()
    }
}

impl TryFrom<MetricDto> for Metric {
    type Error = MetricError;

    fn try_from(dto: MetricDto) -> Result<Self, Self::Error> {
        if dto.id.is_empty() {
            return Err(MetricError::InvalidMetricName);
        }
        match dto.kind {
            MetricKind::Gauge => {
                let value = dto
                    .value
                    .ok_or_else(|| MetricError::InvalidMetricValue("missing value".into()))?;
                Ok(Metric::Gauge { name: dto.id, value })
            }
            MetricKind::Counter => {
                let delta = dto
                    .delta
                    .ok_or_else(|| MetricError::InvalidMetricValue("missing delta".into()))?;
                Ok(Metric::Counter { name: dto.id, delta })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_type_is_case_insensitive() {
        assert_eq!(MetricKind::parse("GAUGE"), Some(MetricKind::Gauge));
        assert_eq!(MetricKind::parse("Counter"), Some(MetricKind::Counter));
        assert_eq!(MetricKind::parse("bogus"), None);
    }

    #[test]
    fn new_rejects_empty_name() {
        assert_eq!(Metric::new("", "gauge", "1.0"), Err(MetricError::InvalidMetricName));
    }

    #[test]
    fn new_rejects_unparseable_value() {
        assert!(matches!(
            Metric::new("x", "counter", "abc"),
            Err(MetricError::InvalidMetricValue(_))
        ));
    }

    #[test]
    fn key_string_is_type_then_name() {
        let m = Metric::Gauge { name: "heap".into(), value: 1.0 };
        assert_eq!(m.key_string(), "gauge_heap");
    }

    #[test]
    fn string_value_round_trips_gauge() {
        let m = Metric::Gauge { name: "k".into(), value: 3.0000003 };
        let text = m.string_value();
        let parsed = Metric::new("k", "gauge", &text).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn string_value_round_trips_counter() {
        let m = Metric::Counter { name: "k".into(), delta: -42 };
        let text = m.string_value();
        let parsed = Metric::new("k", "counter", &text).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn dto_round_trip() {
        let m = Metric::Counter { name: "c".into(), delta: 3 };
        let dto: MetricDto = (&m).into();
        let back: Metric = dto.try_into().unwrap();
        assert_eq!(back, m);
    }
}
