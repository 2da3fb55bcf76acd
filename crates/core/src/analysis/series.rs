use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::Operation;
use crate::{protocol::OperationKind, Result};

const MAX_DOMINANT_PEAKS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SmoothingMethod {
    #[default]
    Exponential,
    MovingAverage,
}

/// Options of the `smoothData` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmoothDataOptions {
    pub data: Vec<f64>,
    pub method: SmoothingMethod,
    /// Weight of the new value for exponential smoothing.
    pub alpha: f64,
    /// Width of the centred window for the moving average.
    pub window_size: usize,
    /// Previous frame; exponential smoothing blends against it per index when
    /// the lengths match, otherwise it runs along the series.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_data: Option<Vec<f64>>,
}

impl Default for SmoothDataOptions {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            method: SmoothingMethod::Exponential,
            alpha: 0.3,
            window_size: 5,
            previous_data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothDataResult {
    pub data: Vec<f64>,
}

impl Operation for SmoothDataOptions {
    const KIND: OperationKind = OperationKind::SmoothData;
    type Output = SmoothDataResult;

    fn run(&self) -> Result<SmoothDataResult> {
        let data = &self.data;
        let alpha = self.alpha;

        let smoothed = match self.method {
            SmoothingMethod::Exponential => match &self.previous_data {
                Some(previous) if previous.len() == data.len() => data
                    .iter()
                    .zip(previous)
                    .map(|(value, prev)| alpha * value + (1.0 - alpha) * prev)
                    .collect(),
                _ => {
                    let mut out = Vec::with_capacity(data.len());
                    for value in data {
                        let next = match out.last() {
                            Some(prev) => alpha * value + (1.0 - alpha) * prev,
                            None => *value,
                        };
                        out.push(next);
                    }
                    out
                }
            },
            SmoothingMethod::MovingAverage => {
                let half = self.window_size / 2;
                (0..data.len())
                    .map(|i| {
                        let start = i.saturating_sub(half);
                        let end = (i + half + 1).min(data.len());
                        let window = &data[start..end];
                        window.iter().sum::<f64>() / window.len() as f64
                    })
                    .collect()
            }
        };

        Ok(SmoothDataResult { data: smoothed })
    }
}

/// Options of the `findPeaks` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FindPeaksOptions {
    pub data: Vec<f64>,
    /// Peaks must be strictly above this value.
    pub threshold: f64,
    /// Minimum index distance between reported peaks.
    pub min_distance: usize,
}

impl Default for FindPeaksOptions {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            threshold: 0.0,
            min_distance: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    pub index: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindPeaksResult {
    /// All peaks in index order.
    pub peaks: Vec<Peak>,
    /// The ten highest peaks, highest first.
    pub dominant_peaks: Vec<Peak>,
}

impl Operation for FindPeaksOptions {
    const KIND: OperationKind = OperationKind::FindPeaks;
    type Output = FindPeaksResult;

    fn run(&self) -> Result<FindPeaksResult> {
        let mut peaks: Vec<Peak> = Vec::new();

        for (offset, w) in self.data.windows(3).enumerate() {
            let value = w[1];
            if !(value > w[0] && value > w[2] && value > self.threshold) {
                continue;
            }
            let peak = Peak {
                index: offset + 1,
                value,
            };
            match peaks.last_mut() {
                Some(last) if peak.index - last.index < self.min_distance => {
                    // Too close: keep whichever of the two is higher.
                    if value > last.value {
                        *last = peak;
                    }
                }
                _ => peaks.push(peak),
            }
        }

        let mut dominant_peaks = peaks.clone();
        dominant_peaks.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(Ordering::Equal));
        dominant_peaks.truncate(MAX_DOMINANT_PEAKS);

        Ok(FindPeaksResult {
            peaks,
            dominant_peaks,
        })
    }
}
