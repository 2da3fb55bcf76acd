//! Message contract between the dispatch service and its worker.
//!
//! Requests travel as `{id, type, data}` and come back as
//! `{id, type, result?, error?}` with exactly one of `result`/`error` set.
//! Payloads are plain JSON values, so nothing but owned data crosses the
//! boundary.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::AudioWorkerError;

/// Operation catalogue understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "processFFT")]
    ProcessFft,
    #[serde(rename = "processTimeDomain")]
    ProcessTimeDomain,
    #[serde(rename = "calculateLevels")]
    CalculateLevels,
    #[serde(rename = "detectBeat")]
    DetectBeat,
    #[serde(rename = "downsampleWaveform")]
    DownsampleWaveform,
    #[serde(rename = "smoothData")]
    SmoothData,
    #[serde(rename = "findPeaks")]
    FindPeaks,
    #[serde(rename = "convertFrequencies")]
    ConvertFrequencies,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        Self::ProcessFft,
        Self::ProcessTimeDomain,
        Self::CalculateLevels,
        Self::DetectBeat,
        Self::DownsampleWaveform,
        Self::SmoothData,
        Self::FindPeaks,
        Self::ConvertFrequencies,
    ];

    /// Wire name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessFft => "processFFT",
            Self::ProcessTimeDomain => "processTimeDomain",
            Self::CalculateLevels => "calculateLevels",
            Self::DetectBeat => "detectBeat",
            Self::DownsampleWaveform => "downsampleWaveform",
            Self::SmoothData => "smoothData",
            Self::FindPeaks => "findPeaks",
            Self::ConvertFrequencies => "convertFrequencies",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = AudioWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AudioWorkerError::UnknownOperation(s.to_string()))
    }
}

/// Correlation token linking a request to its response.
///
/// Rendered as `<seq>-<unix millis>`. Only `seq` matters for uniqueness; the
/// timestamp is there to make logs readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    seq: u64,
    issued_at_ms: u64,
}

impl RequestId {
    /// Builds the id for sequence number `seq`, stamped with the current time.
    pub fn new(seq: u64) -> Self {
        let issued_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self { seq, issued_at_ms }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.seq, self.issued_at_ms)
    }
}

impl FromStr for RequestId {
    type Err = AudioWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, issued_at_ms) = s
            .split_once('-')
            .ok_or_else(|| AudioWorkerError::msg(format!("malformed request id `{s}`")))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| AudioWorkerError::msg(format!("malformed request id `{s}`")))
        };
        Ok(Self {
            seq: parse(seq)?,
            issued_at_ms: parse(issued_at_ms)?,
        })
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Request posted to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub data: Value,
}

/// Answer posted back by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn success(id: RequestId, kind: OperationKind, result: Value) -> Self {
        Self {
            id,
            kind,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, kind: OperationKind, error: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn operation_names_match_the_wire() {
        for kind in OperationKind::ALL {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, Value::String(kind.as_str().to_string()));
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!(matches!(
            "fft".parse::<OperationKind>(),
            Err(AudioWorkerError::UnknownOperation(name)) if name == "fft"
        ));
    }

    #[test]
    fn message_envelope_layout() {
        let id: RequestId = "7-1700000000000".parse().unwrap();
        let message = WorkerMessage {
            id,
            kind: OperationKind::SmoothData,
            data: json!({ "data": [1.0, 2.0] }),
        };

        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({
                "id": "7-1700000000000",
                "type": "smoothData",
                "data": { "data": [1.0, 2.0] }
            })
        );

        let failure = serde_json::to_value(WorkerResponse::failure(id, message.kind, "bad")).unwrap();
        assert_eq!(
            failure,
            json!({ "id": "7-1700000000000", "type": "smoothData", "error": "bad" })
        );
    }

    #[test]
    fn ids_are_ordered_by_sequence() {
        let first = RequestId::new(1);
        let second = RequestId::new(2);
        assert!(first < second);
        assert_eq!(first.seq(), 1);
        assert!(first.to_string().starts_with("1-"));
        assert!("nope".parse::<RequestId>().is_err());
    }
}
