//! Processing functions executed by the worker.
//!
//! Every operation in the catalogue is a pure function from a typed options
//! struct to a typed result. The worker only ever sees them through
//! [`run_operation`], which decodes the JSON payload, runs the function and
//! encodes the result; callers that want to skip the worker can call
//! [`Operation::run`] directly on their own thread.

mod series;
mod spectrum;
mod waveform;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    protocol::{OperationKind, WorkerMessage, WorkerResponse},
    Result,
};

pub use series::{
    FindPeaksOptions, FindPeaksResult, Peak, SmoothDataOptions, SmoothDataResult, SmoothingMethod,
};
pub use spectrum::{
    byte_frequency_data, BeatDetectionOptions, BeatDetectionResult, FftProcessOptions,
    FftProcessResult, FrequencyConversionOptions, FrequencyConversionResult, SpectrumAnalyser,
};
pub use waveform::{
    DownsampleMethod, LevelOptions, LevelResult, TimeDomainOptions, TimeDomainResult,
    WaveformDownsampleOptions, WaveformDownsampleResult,
};

/// Typed options of one catalogue entry.
pub trait Operation: Serialize + DeserializeOwned {
    /// Catalogue name this options type is sent under.
    const KIND: OperationKind;
    /// Result produced by the operation.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Runs the operation on the current thread.
    fn run(&self) -> Result<Self::Output>;
}

/// Decodes `data` as the options of `kind`, runs the operation and encodes
/// its result.
pub fn run_operation(kind: OperationKind, data: Value) -> Result<Value> {
    match kind {
        OperationKind::ProcessFft => run_encoded::<FftProcessOptions>(data),
        OperationKind::ProcessTimeDomain => run_encoded::<TimeDomainOptions>(data),
        OperationKind::CalculateLevels => run_encoded::<LevelOptions>(data),
        OperationKind::DetectBeat => run_encoded::<BeatDetectionOptions>(data),
        OperationKind::DownsampleWaveform => run_encoded::<WaveformDownsampleOptions>(data),
        OperationKind::SmoothData => run_encoded::<SmoothDataOptions>(data),
        OperationKind::FindPeaks => run_encoded::<FindPeaksOptions>(data),
        OperationKind::ConvertFrequencies => run_encoded::<FrequencyConversionOptions>(data),
    }
}

/// Worker-side message handler: every failure becomes an error response
/// carrying the request id, never a worker-level fault.
pub fn handle_message(message: WorkerMessage) -> WorkerResponse {
    let WorkerMessage { id, kind, data } = message;
    match run_operation(kind, data) {
        Ok(result) => WorkerResponse::success(id, kind, result),
        Err(err) => WorkerResponse::failure(id, kind, err.to_string()),
    }
}

fn run_encoded<O: Operation>(data: Value) -> Result<Value> {
    let options: O = serde_json::from_value(data)?;
    let output = options.run()?;
    Ok(serde_json::to_value(output)?)
}

pub(crate) fn compute_rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Serializes `-inf` decibel levels as `null`, since JSON has no infinity.
pub(crate) mod decibels {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::RequestId;

    #[test]
    fn handles_messages_for_every_operation() {
        let payloads = [
            (OperationKind::ProcessFft, json!({ "frequencyData": [0, 10, 200, 10] , "outputBins": 4 })),
            (OperationKind::ProcessTimeDomain, json!({ "timeDomainData": [128, 255, 0, 128] })),
            (OperationKind::CalculateLevels, json!({ "data": [128, 192] })),
            (OperationKind::DetectBeat, json!({ "frequencyData": [100, 100], "energyHistory": [] })),
            (OperationKind::DownsampleWaveform, json!({ "samples": [0.1, 0.5, -0.2, 0.3], "outputLength": 2 })),
            (OperationKind::SmoothData, json!({ "data": [1.0, 2.0, 3.0] })),
            (OperationKind::FindPeaks, json!({ "data": [0.0, 2.0, 0.0] })),
            (OperationKind::ConvertFrequencies, json!({ "bins": [1], "sampleRate": 44100, "fftSize": 2048 })),
        ];

        for (seq, (kind, data)) in payloads.into_iter().enumerate() {
            let id = RequestId::new(seq as u64);
            let response = handle_message(WorkerMessage { id, kind, data });
            assert_eq!(response.id, id);
            assert_eq!(response.kind, kind);
            assert!(response.error.is_none(), "{kind} failed: {:?}", response.error);
            assert!(response.result.is_some());
        }
    }

    #[test]
    fn malformed_payload_becomes_error_response() {
        let response = handle_message(WorkerMessage {
            id: RequestId::new(1),
            kind: OperationKind::FindPeaks,
            data: json!({ "data": "not numbers" }),
        });

        assert!(response.result.is_none());
        assert!(response.error.is_some());
    }

    #[test]
    fn function_errors_are_reported_with_the_request() {
        let response = handle_message(WorkerMessage {
            id: RequestId::new(3),
            kind: OperationKind::CalculateLevels,
            data: json!({ "data": [] }),
        });

        let error = response.error.expect("empty input should fail");
        assert!(error.contains("invalid input"));
    }

    #[test]
    fn silent_levels_round_trip_as_null() {
        let levels = LevelOptions {
            data: vec![128.0; 8],
            is_float_data: false,
        }
        .run()
        .unwrap();

        let encoded = serde_json::to_value(&levels).unwrap();
        assert_eq!(encoded["rmsDb"], Value::Null);

        let decoded: LevelResult = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.rms_db, f64::NEG_INFINITY);
    }
}
