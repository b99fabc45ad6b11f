use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const STATUS_SUCCESS: &str = "success";
pub const RESULT_TYPE_MATRIX: &str = "matrix";
pub const RESULT_TYPE_VECTOR: &str = "vector";

/// Label set identifying one series. Equality of the full map decides
/// whether two series are the same.
pub type TagSet = BTreeMap<String, String>;

/// An inclusive millisecond-epoch time range. Zero bounds mean unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    pub start: i64,
    pub end: i64,
}

impl Extent {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn is_unset(&self) -> bool {
        self.start == 0 || self.end == 0
    }
}

/// One data point. Stored with millisecond resolution; the wire form is
/// the upstream pair `[<unix seconds>, "<value>"]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePair {
    pub timestamp: i64,
    pub value: f64,
}

impl SamplePair {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl Serialize for SamplePair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        if self.timestamp % 1000 == 0 {
            seq.serialize_element(&(self.timestamp / 1000))?;
        } else {
            seq.serialize_element(&(self.timestamp as f64 / 1000.0))?;
        }
        seq.serialize_element(&format!("{}", self.value))?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for SamplePair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairVisitor;

        impl<'de> Visitor<'de> for PairVisitor {
            type Value = SamplePair;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a [timestamp, value] sample pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<SamplePair, A::Error> {
                let secs: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let raw: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| de::Error::custom(format!("invalid sample value {raw:?}")))?;
                Ok(SamplePair {
                    timestamp: (secs * 1000.0).round() as i64,
                    value,
                })
            }
        }

        deserializer.deserialize_seq(PairVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleStream {
    #[serde(default)]
    pub metric: TagSet,
    #[serde(default)]
    pub values: Vec<SamplePair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<SampleStream>,
}

/// The upstream range-query response envelope, also the cached payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixEnvelope {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: MatrixData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorSample {
    #[serde(default)]
    pub metric: TagSet,
    #[serde(default)]
    pub value: Option<SamplePair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<VectorSample>,
}

/// The upstream instant-query ("latest point") response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorEnvelope {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: VectorData,
}

impl MatrixEnvelope {
    /// An empty matrix envelope, the working set for a fresh request.
    pub fn empty() -> Self {
        Self {
            status: String::new(),
            data: MatrixData {
                result_type: RESULT_TYPE_MATRIX.to_string(),
                result: Vec::new(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    /// Oldest and newest data point timestamps across all series.
    /// Series without points contribute nothing; the zero extent means
    /// the envelope holds no data at all.
    pub fn extents(&self) -> Extent {
        let mut oldest = 0i64;
        let mut newest = 0i64;
        for series in &self.data.result {
            if let (Some(first), Some(last)) = (series.values.first(), series.values.last()) {
                if oldest == 0 || first.timestamp < oldest {
                    oldest = first.timestamp;
                }
                if newest == 0 || last.timestamp > newest {
                    newest = last.timestamp;
                }
            }
        }
        Extent::new(oldest, newest)
    }

    pub fn value_count(&self) -> usize {
        self.data.result.iter().map(|s| s.values.len()).sum()
    }

    /// Trims every series to `[start, end]`. A zero bound leaves that
    /// side untouched. Series left empty or entirely outside the range
    /// are removed. Idempotent.
    pub fn crop_to_range(&mut self, start: i64, end: i64) {
        self.data.result.retain_mut(|series| {
            if start > 0 {
                if let Some(idx) = series.values.iter().position(|v| v.timestamp >= start) {
                    series.values.drain(..idx);
                }
                match series.values.last() {
                    Some(last) if last.timestamp >= start => {}
                    _ => return false,
                }
            }
            if end > 0 {
                if let Some(idx) = series.values.iter().rposition(|v| v.timestamp <= end) {
                    series.values.truncate(idx + 1);
                }
                match series.values.first() {
                    Some(first) if first.timestamp <= end => {}
                    _ => return false,
                }
            }
            true
        });
    }
}

/// Merges two range-query result sets where `older` is assumed to
/// entirely precede `newer` in time. On a status mismatch the
/// successful side wins; if both failed, `older` is returned.
///
/// For each series in `newer`, the same-tag-set series in `older` keeps
/// its points up to the last one strictly before `newer`'s first point,
/// then `newer`'s points follow. Series appearing only in `newer` are
/// carried over whole.
pub fn merge_matrix(newer: MatrixEnvelope, older: MatrixEnvelope) -> MatrixEnvelope {
    if newer.status != STATUS_SUCCESS {
        return older;
    }
    if older.status != STATUS_SUCCESS {
        return newer;
    }

    let mut merged = older;
    for series in newer.data.result {
        match merged
            .data
            .result
            .iter_mut()
            .find(|s| s.metric == series.metric)
        {
            Some(base) => {
                let first = match series.values.first() {
                    Some(v) => v.timestamp,
                    None => continue,
                };
                match base.values.iter().rposition(|v| v.timestamp < first) {
                    Some(cut) => {
                        base.values.truncate(cut + 1);
                        base.values.extend(series.values);
                    }
                    // No base point precedes the incoming data; the
                    // incoming points replace the series outright.
                    None => base.values = series.values,
                }
            }
            None => merged.data.result.push(series),
        }
    }
    merged
}

/// Stitches latest-point data onto `base`: a vector sample extends its
/// matching series only when strictly newer than the series' last
/// point, quantized down to whole seconds. Samples without a matching
/// series are dropped.
pub fn merge_vector(mut base: MatrixEnvelope, vector: VectorEnvelope) -> MatrixEnvelope {
    if vector.data.result.is_empty() {
        return base;
    }
    for sample in vector.data.result {
        let Some(pair) = sample.value else { continue };
        if let Some(series) = base
            .data
            .result
            .iter_mut()
            .find(|s| s.metric == sample.metric)
        {
            let Some(last) = series.values.last().map(|v| v.timestamp) else {
                continue;
            };
            if pair.timestamp > last {
                series.values.push(SamplePair::new(
                    (pair.timestamp / 1000) * 1000,
                    pair.value,
                ));
            }
        }
    }
    base
}
