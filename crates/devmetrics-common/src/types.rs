use crate::error::{MetricError, Result};
use crate::sign::Signer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const GAUGE: &str = "gauge";
pub const COUNTER: &str = "counter";

/// The two metric semantics understood by the pipeline.
///
/// # Examples
///
/// ```
/// use devmetrics_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("notcounter".parse::<MetricKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => GAUGE,
            MetricKind::Counter => COUNTER,
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    /// Type tags are matched exactly; `"Gauge"` is as unknown as `"nogauge"`.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            GAUGE => Ok(MetricKind::Gauge),
            COUNTER => Ok(MetricKind::Counter),
            other => Err(MetricError::UnknownType(other.to_string())),
        }
    }
}

/// Current value of a metric.
///
/// A gauge is replaced on every write; a counter accumulates the deltas it
/// receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    /// Parses `text` according to a textual type tag.
    ///
    /// An unknown tag yields [`MetricError::UnknownType`]; a value that does
    /// not parse for a known tag yields [`MetricError::InvalidValue`].
    pub fn parse(type_tag: &str, text: &str) -> Result<Self> {
        let kind = type_tag.parse::<MetricKind>()?;
        Self::parse_as(kind, text)
    }

    pub fn parse_as(kind: MetricKind, text: &str) -> Result<Self> {
        let invalid = || MetricError::InvalidValue {
            kind: kind.as_str(),
            text: text.to_string(),
        };
        match kind {
            MetricKind::Gauge => {
                let v = text.trim().parse::<f64>().map_err(|_| invalid())?;
                if v.is_finite() {
                    Ok(MetricValue::Gauge(v))
                } else {
                    Err(invalid())
                }
            }
            MetricKind::Counter => text
                .trim()
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|_| invalid()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Combines the stored value with an incoming one.
    ///
    /// Returns `None` when the variants differ: a name stays bound to the
    /// kind it was first ingested with.
    ///
    /// ```
    /// use devmetrics_common::types::MetricValue;
    ///
    /// let c = MetricValue::Counter(6).merge(MetricValue::Counter(6));
    /// assert_eq!(c, Some(MetricValue::Counter(12)));
    /// let g = MetricValue::Gauge(0.01).merge(MetricValue::Gauge(0.02));
    /// assert_eq!(g, Some(MetricValue::Gauge(0.02)));
    /// assert_eq!(MetricValue::Gauge(1.0).merge(MetricValue::Counter(1)), None);
    /// ```
    pub fn merge(self, incoming: MetricValue) -> Option<MetricValue> {
        match (self, incoming) {
            (MetricValue::Gauge(_), MetricValue::Gauge(v)) => Some(MetricValue::Gauge(v)),
            (MetricValue::Counter(a), MetricValue::Counter(b)) => {
                Some(MetricValue::Counter(a.saturating_add(b)))
            }
            _ => None,
        }
    }

    /// Value text used inside the signed message: `%f` for gauges (six
    /// fractional digits), plain decimal for counters.
    pub fn canonical_text(&self) -> String {
        match self {
            MetricValue::Gauge(v) => format!("{v:.6}"),
            MetricValue::Counter(d) => d.to_string(),
        }
    }

    /// The exact string both sides feed to the signer.
    ///
    /// ```
    /// use devmetrics_common::types::MetricValue;
    ///
    /// assert_eq!(MetricValue::Gauge(0.5).canonical_message("Alloc"), "Alloc:gauge:0.500000");
    /// assert_eq!(MetricValue::Counter(3).canonical_message("PollCount"), "PollCount:counter:3");
    /// ```
    pub fn canonical_message(&self, name: &str) -> String {
        format!("{name}:{}:{}", self.type_tag(), self.canonical_text())
    }

    /// Builds the wire record for `name`, signed with `signer`.
    pub fn to_record(&self, name: &str, signer: &Signer) -> MetricRecord {
        let (value, delta) = match *self {
            MetricValue::Gauge(v) => (Some(v), None),
            MetricValue::Counter(d) => (None, Some(d)),
        };
        MetricRecord {
            id: name.to_string(),
            mtype: self.type_tag().to_string(),
            delta,
            value,
            hash: signer.sign(&self.canonical_message(name)),
        }
    }
}

/// Display form: shortest round-trip float for gauges, plain integer for
/// counters (`0.01`, `12`).
impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// Wire form of a metric, shared by JSON bodies, gRPC envelopes and
/// persisted snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub mtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

impl MetricRecord {
    /// A bare `{id, type}` record, as sent to the JSON value query.
    pub fn query(id: &str, kind: MetricKind) -> Self {
        Self {
            id: id.to_string(),
            mtype: kind.as_str().to_string(),
            delta: None,
            value: None,
            hash: String::new(),
        }
    }

    pub fn kind(&self) -> Result<MetricKind> {
        self.mtype.parse()
    }

    /// Extracts the typed value carried by this record.
    pub fn to_value(&self) -> Result<MetricValue> {
        match self.kind()? {
            MetricKind::Gauge => match self.value {
                Some(v) if v.is_finite() => Ok(MetricValue::Gauge(v)),
                Some(v) => Err(MetricError::InvalidValue {
                    kind: GAUGE,
                    text: v.to_string(),
                }),
                None => Err(MetricError::MissingValue {
                    id: self.id.clone(),
                    kind: GAUGE,
                    field: "value",
                }),
            },
            MetricKind::Counter => {
                self.delta
                    .map(MetricValue::Counter)
                    .ok_or_else(|| MetricError::MissingValue {
                        id: self.id.clone(),
                        kind: COUNTER,
                        field: "delta",
                    })
            }
        }
    }
}
