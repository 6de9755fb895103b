//! Random linear projections of per-channel waveform features.

use std::result::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use crate::error::{SortingError, invalid_parameter};


/// Scalar summarizing the waveform of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RandomProjectionFeature {
    /// L2 norm over time
    Energy,
    /// Maximum minus minimum over time
    PeakToPeak,
}

impl RandomProjectionFeature {
    pub fn compute(&self, trace: ArrayView1<f32>) -> f32 {
        match self {
            RandomProjectionFeature::Energy => trace.iter().map(|x| x * x).sum::<f32>().sqrt(),
            RandomProjectionFeature::PeakToPeak => {
                let max = trace.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let min = trace.iter().copied().fold(f32::INFINITY, f32::min);

                if trace.is_empty() { 0. } else { max - min }
            },
        }
    }
}

/// Draws a `(num_channels, num_projections)` matrix with entries from `N(0, 1 / num_channels)`
pub fn projection_matrix(
    num_channels: usize,
    num_projections: usize,
    rng: &mut StdRng,
) -> Result<Array2<f32>, SortingError> {
    if num_channels == 0 || num_projections == 0 {
        return Err(invalid_parameter("nb_projections", "projection matrix must not be empty"));
    }

    let normal = Normal::new(0., 1. / (num_channels as f32).sqrt())
        .map_err(|err| invalid_parameter("nb_projections", &err.to_string()))?;

    Ok(Array2::from_shape_simple_fn((num_channels, num_projections), || normal.sample(rng)))
}

/// Projects the per-channel feature of one sparse waveform, column `k` of `waveform`
/// holds `channels[k]`, giving a `num_projections` long vector
pub fn compute_random_projection_features(
    waveform: ArrayView2<f32>,
    channels: &[usize],
    projections: ArrayView2<f32>,
    feature: RandomProjectionFeature,
) -> Array1<f32> {
    let mut projected = Array1::<f32>::zeros(projections.ncols());

    for (k, &channel) in channels.iter().enumerate().take(waveform.ncols()) {
        let value = feature.compute(waveform.column(k));
        projected.scaled_add(value, &projections.row(channel));
    }

    projected
}
