//! Learned subspace clustering.
//!
//! A temporal basis is fitted on the peak channel waveforms of a bounded random
//! subsample of peaks and persisted to the scratch folder. Every peak's sparse waveform
//! is projected through it channel by channel while the recording is streamed, so only
//! the projected features are kept. Peaks are then grouped by their channel
//! and each group goes through a second, local decomposition and density clustering.
//! Labels of each group are shifted by the number of clusters found before it.

use std::collections::BTreeMap;
use std::result::Result;
use ndarray::{Array1, ArrayView2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use super::{
    ClusteringContext, ClusteringOutput, ClusteringStrategy, FeatureWaveforms,
    TemplateWindow, finalize_clusters,
};
use super::hdbscan::{ClusterSelectionMethod, Hdbscan};
use crate::deduplication::DeduplicationParameters;
use crate::error::{SortingError, invalid_parameter};
use crate::features::{check_projection, project_waveform, select_rows};
use crate::features::svd::{ProjectionModel, ProjectionParameters, TruncatedSvd};
use crate::peaks::{NOISE_LABEL, Peak, PeakLabels, select_peaks};
use crate::pruning::PruningParameters;
use crate::recording::Recording;
use crate::waveforms::{ChannelNeighborhood, extract_sparse_features, extract_waveforms_at_max_channel};


/// Settings of the learned subspace clustering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircusParameters {
    pub hdbscan: Hdbscan,
    pub waveforms: FeatureWaveforms,
    /// Components of the temporal basis and of the per channel decomposition
    pub n_svd: [usize; 2],
    /// Largest number of peaks the temporal basis is fitted on
    pub n_peaks_svd: usize,
    pub templates: TemplateWindow,
    pub pruning: PruningParameters,
    pub deduplication: DeduplicationParameters,
}

impl Default for CircusParameters {
    fn default() -> Self {
        CircusParameters {
            hdbscan: Hdbscan {
                min_cluster_size: 20,
                min_samples: Some(1),
                allow_single_cluster: true,
                cluster_selection_method: ClusterSelectionMethod::ExcessOfMass,
                cluster_selection_epsilon: 0.,
            },
            waveforms: FeatureWaveforms::default(),
            n_svd: [5, 10],
            n_peaks_svd: 10000,
            templates: TemplateWindow::default(),
            pruning: PruningParameters::default(),
            deduplication: DeduplicationParameters::default(),
        }
    }
}

impl CircusParameters {
    /// Labels of one channel group, local decomposition then density clustering
    fn cluster_partition(&self, features: ArrayView2<f32>) -> Result<Vec<i64>, SortingError> {
        let (_, reduced) = TruncatedSvd::fit_transform(features, self.n_svd[1])?;

        self.hdbscan.fit(reduced.view())
    }
}

impl ClusteringStrategy for CircusParameters {
    fn name(&self) -> &'static str {
        "circus"
    }

    fn validate(&self, num_channels: usize, noise_levels: &Array1<f32>) -> Result<(), SortingError> {
        self.hdbscan.validate()?;
        self.waveforms.validate()?;
        self.templates.validate()?;
        if self.n_svd.iter().any(|n| *n == 0) {
            return Err(invalid_parameter("n_svd", "both decompositions need at least one component"));
        }
        if self.n_peaks_svd == 0 {
            return Err(invalid_parameter("n_peaks_svd", "must be at least 1"));
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
        let window = self.waveforms.window(sampling_frequency)?;

        let subset = select_peaks(peaks, self.n_peaks_svd, rng);
        let peak_channel_waveforms = extract_waveforms_at_max_channel(recording, &subset, window, context.job)?;
        let finite_rows: Vec<usize> = peak_channel_waveforms.rows()
            .into_iter()
            .enumerate()
            .filter(|(_, row)| row.iter().all(|x| x.is_finite()))
            .map(|(index, _)| index)
            .collect();
        if finite_rows.len() < subset.len() {
            log::warn!(
                "{}: {} waveforms with non finite samples left out of the temporal basis",
                self.name(), subset.len() - finite_rows.len(),
            );
        }
        let peak_channel_waveforms = select_rows(peak_channel_waveforms.view(), &finite_rows);
        let svd = match TruncatedSvd::fit(peak_channel_waveforms.view(), self.n_svd[0]) {
            Ok(svd) => svd,
            Err(err) if err.is_recoverable() => {
                log::warn!(
                    "{}: temporal basis could not be fitted, all {} peaks are marked as noise: {}",
                    self.name(), peaks.len(), err,
                );
                let mut output = ClusteringOutput::empty(peaks.len());
                output.report.failed_partitions = 1;

                return Ok(output);
            },
            Err(err) => return Err(err),
        };
        let model = ProjectionModel {
            params: ProjectionParameters {
                ms_before: self.waveforms.ms_before,
                ms_after: self.waveforms.ms_after,
                sampling_frequency,
            },
            svd,
        };
        let model_folder = model.save(&context.scratch.join(self.name()))?;
        log::debug!("{}: temporal basis written to {}", self.name(), model_folder.display());

        let model = ProjectionModel::load(&model_folder)?;
        check_projection(&model.svd, window.num_samples())?;

        let neighborhood = ChannelNeighborhood::from_radius(recording.get_probe(), self.waveforms.radius_um);
        let num_features = model.svd.n_components * neighborhood.max_num_channels();
        let features = extract_sparse_features(
            recording, peaks, window, &neighborhood, num_features, context.job,
            |_, sparse| project_waveform(&model.svd, sparse.view()),
        )?;

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (index, peak) in peaks.iter().enumerate() {
            groups.entry(peak.channel_index).or_default().push(index);
        }

        let mut peak_labels = PeakLabels::noise(peaks.len());
        let mut num_clusters: i64 = 0;
        let mut failed_partitions = 0;

        for (channel, rows) in groups.iter() {
            let group_features = select_rows(features.view(), rows);

            let local_labels = match context.pool.install(|| self.cluster_partition(group_features.view())) {
                Ok(local_labels) => local_labels,
                Err(err) if err.is_recoverable() => {
                    log::warn!(
                        "{}: clustering failed on channel {}, its {} peaks are marked as noise: {}",
                        self.name(), channel, rows.len(), err,
                    );
                    failed_partitions += 1;

                    continue;
                },
                Err(err) => return Err(err),
            };

            let found = local_labels.iter().max().map_or(0, |max| max + 1);
            for (row, label) in rows.iter().zip(local_labels) {
                if label > NOISE_LABEL {
                    peak_labels.set(*row, label + num_clusters);
                }
            }
            num_clusters += found;
        }

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
    fn test_rejects_empty_decomposition() {
        let params = CircusParameters { n_svd: [5, 0], ..CircusParameters::default() };

        assert!(params.validate(4, &Array1::ones(4)).is_err());
        assert!(CircusParameters::default().validate(4, &Array1::ones(4)).is_ok());
    }

    #[test]
    fn test_noise_levels_must_match_channels() {
        let result = CircusParameters::default().validate(4, &Array1::ones(3));

        assert!(result.is_err());
    }

    #[test]
    fn test_parameters_from_toml() {
        let params: CircusParameters = toml::from_str(
            "n_svd = [3, 6]\n[hdbscan]\nmin_cluster_size = 15\ncluster_selection_method = \"eom\"\n"
        ).unwrap();

        assert_eq!(params.n_svd, [3, 6]);
        assert_eq!(params.hdbscan.min_cluster_size, 15);
        assert_eq!(params.hdbscan.min_samples, None);
        assert_eq!(params.waveforms, FeatureWaveforms::default());
    }
}
