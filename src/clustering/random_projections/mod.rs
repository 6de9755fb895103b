//! Random projection clustering.
//!
//! Sparse waveforms are smoothed, reduced to one scalar per channel and projected on
//! a seeded gaussian matrix as the recording is streamed. All peaks are then clustered
//! at once, which is quadratic in the number of peaks.

use std::result::Result;
use ndarray::Array1;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use super::{
    ClusteringContext, ClusteringOutput, ClusteringStrategy, FeatureWaveforms,
    TemplateWindow, finalize_clusters,
};
use super::hdbscan::{ClusterSelectionMethod, Hdbscan};
use crate::deduplication::DeduplicationParameters;
use crate::error::{SortingError, invalid_parameter};
use crate::features::random_projections::{
    RandomProjectionFeature, compute_random_projection_features, projection_matrix,
};
use crate::features::savgol::SavGolFilter;
use crate::peaks::{Peak, PeakLabels};
use crate::pruning::PruningParameters;
use crate::recording::Recording;
use crate::sparsity::SparsityMethod;
use crate::templates::{AmplitudeMode, PeakSign};
use crate::waveforms::{ChannelNeighborhood, extract_sparse_features};


/// Savitzky-Golay smoothing applied to waveforms before features are computed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingParameters {
    pub window_length_ms: f64,
    pub polyorder: usize,
}

impl Default for SmoothingParameters {
    fn default() -> Self {
        SmoothingParameters { window_length_ms: 0.25, polyorder: 3 }
    }
}

/// Settings of the random projection clustering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomProjectionsParameters {
    pub hdbscan: Hdbscan,
    pub waveforms: FeatureWaveforms,
    /// Number of projections, capped at the channel count
    pub nb_projections: usize,
    pub feature: RandomProjectionFeature,
    pub smoothing: SmoothingParameters,
    pub templates: TemplateWindow,
    pub pruning: PruningParameters,
    pub deduplication: DeduplicationParameters,
}

impl Default for RandomProjectionsParameters {
    fn default() -> Self {
        RandomProjectionsParameters {
            hdbscan: Hdbscan {
                min_cluster_size: 10,
                min_samples: None,
                allow_single_cluster: true,
                cluster_selection_method: ClusterSelectionMethod::Leaf,
                cluster_selection_epsilon: 1.,
            },
            waveforms: FeatureWaveforms { radius_um: 30., ..FeatureWaveforms::default() },
            nb_projections: 10,
            feature: RandomProjectionFeature::Energy,
            smoothing: SmoothingParameters::default(),
            templates: TemplateWindow::default(),
            pruning: PruningParameters {
                sparsity: SparsityMethod::Snr {
                    threshold: 0.25,
                    amplitude_mode: AmplitudeMode::PeakToPeak,
                    peak_sign: PeakSign::Neg,
                },
                noise_threshold: Some(4.),
            },
            deduplication: DeduplicationParameters::default(),
        }
    }
}

impl ClusteringStrategy for RandomProjectionsParameters {
    fn name(&self) -> &'static str {
        "random_projections"
    }

    fn validate(&self, num_channels: usize, noise_levels: &Array1<f32>) -> Result<(), SortingError> {
        self.hdbscan.validate()?;
        self.waveforms.validate()?;
        self.templates.validate()?;
        if self.nb_projections == 0 {
            return Err(invalid_parameter("nb_projections", "must be at least 1"));
        }
        if !(self.smoothing.window_length_ms.is_finite() && self.smoothing.window_length_ms >= 0.) {
            return Err(invalid_parameter("window_length_ms", "must be a non negative duration"));
        }
        self.pruning.validate(num_channels, Some(noise_levels))?;

        self.deduplication.validate()
    }

    fn main_function<R: Recording + ?Sized>(
        &self,
        recording: &R,
        peaks: &[Peak],
        context: &ClusteringContext,
        rng: &mut StdRng,
    ) -> Result<ClusteringOutput, SortingError> {
        if peaks.is_empty() {
            return Ok(ClusteringOutput::empty(0));
        }

        let sampling_frequency = recording.sampling_frequency();
        let num_channels = recording.num_channels();
        let window = self.waveforms.window(sampling_frequency)?;

        let num_projections = self.nb_projections.min(num_channels);
        let projections = projection_matrix(num_channels, num_projections, rng)?;

        let neighborhood = ChannelNeighborhood::from_radius(recording.get_probe(), self.waveforms.radius_um);

        let filter = SavGolFilter::from_ms(
            self.smoothing.window_length_ms, self.smoothing.polyorder, sampling_frequency, window.num_samples(),
        )?;
        match &filter {
            Some(filter) => log::debug!("{}: smoothing over {} samples", self.name(), filter.window_length()),
            None => log::debug!("{}: waveforms too short to be smoothed", self.name()),
        }

        let features = extract_sparse_features(
            recording, peaks, window, &neighborhood, num_projections, context.job,
            |peak, sparse| {
                let smoothed = match &filter {
                    Some(filter) => filter.apply_to_waveform(sparse.view()),
                    None => sparse,
                };

                compute_random_projection_features(
                    smoothed.view(), neighborhood.channels(peak.channel_index), projections.view(), self.feature,
                )
            },
        )?;

        let (peak_labels, failed_partitions) = match context.pool.install(|| self.hdbscan.fit(features.view())) {
            Ok(labels) => (PeakLabels::from_vec(labels), 0),
            Err(err) if err.is_recoverable() => {
                log::warn!("{}: clustering failed, all {} peaks are marked as noise: {}", self.name(), peaks.len(), err);
                (PeakLabels::noise(peaks.len()), 1)
            },
            Err(err) => return Err(err),
        };

        let mut output = finalize_clusters(
            recording, peaks, peak_labels, self.templates, &self.pruning, &self.deduplication,
            context, self.name(),
        )?;
        output.report.failed_partitions = failed_partitions;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snr_pruning_requires_matching_noise_levels() {
        let params = RandomProjectionsParameters::default();

        assert!(params.validate(8, &Array1::ones(8)).is_ok());
        assert!(params.validate(8, &Array1::ones(2)).is_err());
    }

    #[test]
    fn test_leaf_selection_by_default() {
        let params = RandomProjectionsParameters::default();

        assert_eq!(params.hdbscan.cluster_selection_method, ClusterSelectionMethod::Leaf);
        assert_eq!(params.waveforms.radius_um, 30.);
    }
}
