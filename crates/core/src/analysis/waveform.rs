use serde::{Deserialize, Serialize};

use super::{compute_rms, decibels, Operation};
use crate::{protocol::OperationKind, AudioWorkerError, Result};

/// Centre value of unsigned 8-bit time-domain data.
const BYTE_CENTRE: f64 = 128.0;

/// Options of the `processTimeDomain` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeDomainOptions {
    /// Unsigned byte samples centred on 128.
    pub time_domain_data: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_samples: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDomainResult {
    pub processed_data: Vec<f64>,
    pub rms: f64,
    pub peak: f64,
    pub zero_crossings: usize,
}

impl Operation for TimeDomainOptions {
    const KIND: OperationKind = OperationKind::ProcessTimeDomain;
    type Output = TimeDomainResult;

    fn run(&self) -> Result<TimeDomainResult> {
        let input = &self.time_domain_data;
        if input.is_empty() {
            return Err(AudioWorkerError::InvalidInput(
                "processTimeDomain requires samples",
            ));
        }

        let processed_data = match self.output_samples {
            Some(outputs) if outputs > 0 && outputs < input.len() => {
                let step = input.len() as f64 / outputs as f64;
                (0..outputs)
                    .map(|i| {
                        let start = (i as f64 * step).floor() as usize;
                        let end = (((i + 1) as f64 * step).floor() as usize).min(input.len());
                        let (min, max) = input[start..end]
                            .iter()
                            .fold((255.0_f64, 0.0_f64), |(min, max), v| (min.min(*v), max.max(*v)));
                        (min + max) / 2.0
                    })
                    .collect()
            }
            _ => input.clone(),
        };

        let normalised: Vec<f64> = input.iter().map(|v| (v - BYTE_CENTRE) / BYTE_CENTRE).collect();
        let peak = normalised.iter().fold(0.0_f64, |peak, s| peak.max(s.abs()));

        let mut zero_crossings = 0;
        let mut last_positive = None;
        for sample in &normalised {
            let positive = *sample >= 0.0;
            if last_positive.is_some_and(|last| last != positive) {
                zero_crossings += 1;
            }
            last_positive = Some(positive);
        }

        Ok(TimeDomainResult {
            processed_data,
            rms: compute_rms(&normalised),
            peak,
            zero_crossings,
        })
    }
}

/// Options of the `calculateLevels` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LevelOptions {
    pub data: Vec<f64>,
    /// Samples are already normalised floats rather than bytes centred on 128.
    pub is_float_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelResult {
    pub rms: f64,
    pub peak: f64,
    /// `-inf` for silence.
    #[serde(with = "decibels")]
    pub rms_db: f64,
    #[serde(with = "decibels")]
    pub peak_db: f64,
}

impl Operation for LevelOptions {
    const KIND: OperationKind = OperationKind::CalculateLevels;
    type Output = LevelResult;

    fn run(&self) -> Result<LevelResult> {
        if self.data.is_empty() {
            return Err(AudioWorkerError::InvalidInput(
                "level calculation requires samples",
            ));
        }

        let magnitudes: Vec<f64> = if self.is_float_data {
            self.data.iter().map(|v| v.abs()).collect()
        } else {
            self.data
                .iter()
                .map(|v| (v - BYTE_CENTRE).abs() / BYTE_CENTRE)
                .collect()
        };

        let rms = compute_rms(&magnitudes);
        let peak = magnitudes.iter().fold(0.0_f64, |peak, v| peak.max(*v));

        Ok(LevelResult {
            rms,
            peak,
            rms_db: to_decibels(rms),
            peak_db: to_decibels(peak),
        })
    }
}

fn to_decibels(level: f64) -> f64 {
    if level > 0.0 {
        20.0 * level.log10()
    } else {
        f64::NEG_INFINITY
    }
}

/// Reduction applied to each output slot of `downsampleWaveform`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownsampleMethod {
    /// Midpoint of the slot's extremes; also reports the extremes.
    #[default]
    MinMax,
    Average,
    Rms,
}

/// Options of the `downsampleWaveform` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaveformDownsampleOptions {
    pub samples: Vec<f64>,
    pub output_length: usize,
    pub method: DownsampleMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformDownsampleResult {
    pub data: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_values: Option<Vec<f64>>,
}

impl Operation for WaveformDownsampleOptions {
    const KIND: OperationKind = OperationKind::DownsampleWaveform;
    type Output = WaveformDownsampleResult;

    fn run(&self) -> Result<WaveformDownsampleResult> {
        let samples = &self.samples;
        if samples.is_empty() || self.output_length == 0 {
            return Err(AudioWorkerError::InvalidInput(
                "waveform downsampling requires samples and a non-zero output length",
            ));
        }

        let per_slot = samples.len() as f64 / self.output_length as f64;
        // Every slot covers at least one sample, so a longer output repeats
        // samples instead of producing empty slots.
        let slots = (0..self.output_length).map(|i| {
            let start = (i as f64 * per_slot).floor() as usize;
            let end = ((i + 1) as f64 * per_slot).floor() as usize;
            let end = end.max(start + 1).min(samples.len());
            &samples[start..end]
        });

        Ok(match self.method {
            DownsampleMethod::MinMax => {
                let (min_values, max_values): (Vec<f64>, Vec<f64>) = slots
                    .map(|slot| {
                        slot.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
                            (min.min(*v), max.max(*v))
                        })
                    })
                    .unzip();
                let data = min_values
                    .iter()
                    .zip(&max_values)
                    .map(|(min, max)| (min + max) / 2.0)
                    .collect();
                WaveformDownsampleResult {
                    data,
                    min_values: Some(min_values),
                    max_values: Some(max_values),
                }
            }
            DownsampleMethod::Average => WaveformDownsampleResult {
                data: slots
                    .map(|slot| slot.iter().sum::<f64>() / slot.len() as f64)
                    .collect(),
                min_values: None,
                max_values: None,
            },
            DownsampleMethod::Rms => WaveformDownsampleResult {
                data: slots.map(compute_rms).collect(),
                min_values: None,
                max_values: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_domain_statistics() {
        let result = TimeDomainOptions {
            time_domain_data: vec![128.0, 192.0, 64.0, 128.0, 0.0],
            output_samples: None,
        }
        .run()
        .unwrap();

        assert_eq!(result.processed_data.len(), 5);
        assert_eq!(result.peak, 1.0);
        // Signs: +, +, -, +, -
        assert_eq!(result.zero_crossings, 3);
        let expected_rms = ((0.25 + 0.25 + 1.0) / 5.0_f64).sqrt();
        assert!((result.rms - expected_rms).abs() < 1e-12);
    }

    #[test]
    fn time_domain_downsamples_to_segment_midpoints() {
        let result = TimeDomainOptions {
            time_domain_data: vec![100.0, 140.0, 120.0, 130.0],
            output_samples: Some(2),
        }
        .run()
        .unwrap();

        assert_eq!(result.processed_data, vec![120.0, 125.0]);
    }

    #[test]
    fn byte_levels_in_decibels() {
        let result = LevelOptions {
            data: vec![192.0, 64.0],
            is_float_data: false,
        }
        .run()
        .unwrap();

        assert_eq!(result.rms, 0.5);
        assert_eq!(result.peak, 0.5);
        assert!((result.peak_db - (-6.0206)).abs() < 1e-3);
    }

    #[test]
    fn float_levels_use_absolute_values() {
        let result = LevelOptions {
            data: vec![-1.0, 0.0],
            is_float_data: true,
        }
        .run()
        .unwrap();

        assert_eq!(result.peak, 1.0);
        assert_eq!(result.peak_db, 0.0);
    }

    #[test]
    fn minmax_downsampling_reports_extremes() {
        let result = WaveformDownsampleOptions {
            samples: vec![0.1, -0.5, 0.9, 0.3],
            output_length: 2,
            method: DownsampleMethod::MinMax,
        }
        .run()
        .unwrap();

        assert_eq!(result.min_values, Some(vec![-0.5, 0.3]));
        assert_eq!(result.max_values, Some(vec![0.1, 0.9]));
        assert!((result.data[0] - (-0.2)).abs() < 1e-12);
        assert!((result.data[1] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn average_and_rms_downsampling() {
        let samples = vec![1.0, -1.0, 2.0, 2.0];
        let average = WaveformDownsampleOptions {
            samples: samples.clone(),
            output_length: 2,
            method: DownsampleMethod::Average,
        }
        .run()
        .unwrap();
        assert_eq!(average.data, vec![0.0, 2.0]);
        assert!(average.min_values.is_none());

        let rms = WaveformDownsampleOptions {
            samples,
            output_length: 2,
            method: DownsampleMethod::Rms,
        }
        .run()
        .unwrap();
        assert_eq!(rms.data, vec![1.0, 2.0]);
    }

    #[test]
    fn longer_output_repeats_samples() {
        let result = WaveformDownsampleOptions {
            samples: vec![1.0, 3.0],
            output_length: 4,
            method: DownsampleMethod::Average,
        }
        .run()
        .unwrap();

        assert_eq!(result.data, vec![1.0, 1.0, 3.0, 3.0]);
    }

    #[test]
    fn method_names_on_the_wire() {
        let decoded: WaveformDownsampleOptions =
            serde_json::from_str(r#"{ "samples": [1.0], "outputLength": 1, "method": "rms" }"#)
                .unwrap();
        assert_eq!(decoded.method, DownsampleMethod::Rms);
        assert_eq!(
            serde_json::to_value(DownsampleMethod::MinMax).unwrap(),
            serde_json::json!("minmax")
        );
    }
}
