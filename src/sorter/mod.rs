//! Entry points of the pipeline.
//!
//! [`find_clusters_from_peaks`] is the canonical clustering call: it resolves the
//! capabilities, checks the configuration, estimates noise levels when none are given,
//! seeds the random generator and runs the selected method in a scratch folder.
//! [`run_sorter`] chains peak selection, clustering, template estimation and a matching
//! pursuit over the whole recording into a [`Sorting`].

use std::fs;
use std::path::{Path, PathBuf};
use std::result::Result;
use ndarray::Array1;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use crate::clustering::{ClusteringContext, ClusteringMethod, ClusteringOutput, ClusteringStrategy};
use crate::error::{ConfigurationError, DependencyMissingError, SortingError, invalid_parameter};
use crate::job::JobParameters;
use crate::matching::find_spikes_from_templates;
use crate::matching::omp::{MatchingParameters, MatchingPursuit};
use crate::peaks::{NOISE_LABEL, Peak, PeakLabels, spikes_from_labels, select_peaks};
use crate::recording::Recording;
use crate::recording::noise::{NoiseLevelParameters, get_noise_levels};
use crate::sorting::Sorting;
use crate::sparsity::{SparsityMethod, compute_sparsity};
use crate::templates::{AmplitudeMode, PeakSign, Templates, estimate_templates};
use crate::waveforms::WaveformWindow;


/// Optional parts of the pipeline compiled into this build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub density_clustering: bool,
    pub template_matching: bool,
}

impl Capabilities {
    pub fn detect() -> Self {
        Capabilities {
            density_clustering: cfg!(feature = "hdbscan"),
            template_matching: cfg!(feature = "matching"),
        }
    }

    /// Fails with the first missing capability among the requested ones
    pub fn require(&self, density_clustering: bool, template_matching: bool) -> Result<(), SortingError> {
        if density_clustering && !self.density_clustering {
            return Err(DependencyMissingError::DensityClustering.into());
        }
        if template_matching && !self.template_matching {
            return Err(DependencyMissingError::TemplateMatching.into());
        }

        Ok(())
    }
}

/// Folder where fitted models are written during one call
///
/// A temporary folder is removed when dropped, a persistent one is left to the caller
#[derive(Debug)]
pub enum ScratchFolder {
    Temporary(TempDir),
    Persistent(PathBuf),
}

impl ScratchFolder {
    pub fn new(folder: Option<&Path>) -> Result<Self, SortingError> {
        match folder {
            Some(folder) => {
                fs::create_dir_all(folder)
                    .map_err(|err| ConfigurationError::ScratchFolder(err.to_string()))?;

                Ok(ScratchFolder::Persistent(folder.to_path_buf()))
            },
            None => {
                let folder = tempfile::Builder::new()
                    .prefix("spike_sorting_")
                    .tempdir()
                    .map_err(|err| ConfigurationError::ScratchFolder(err.to_string()))?;

                Ok(ScratchFolder::Temporary(folder))
            },
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ScratchFolder::Temporary(folder) => folder.path(),
            ScratchFolder::Persistent(folder) => folder,
        }
    }
}

/// Settings shared by every clustering method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub job: JobParameters,
    pub random_seed: u64,
    /// Folder kept after the call, a temporary folder is used when unset
    pub tmp_folder: Option<PathBuf>,
    /// One noise level per channel, estimated from the recording when unset
    pub noise_levels: Option<Array1<f32>>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        ClusteringConfig {
            job: JobParameters::default(),
            random_seed: 42,
            tmp_folder: None,
            noise_levels: None,
        }
    }
}

fn check_peaks<R: Recording + ?Sized>(recording: &R, peaks: &[Peak]) -> Result<(), SortingError> {
    let num_channels = recording.num_channels();
    let num_segments = recording.num_segments();

    match peaks.iter().find(|peak| peak.channel_index >= num_channels || peak.segment_index >= num_segments) {
        Some(peak) => Err(invalid_parameter(
            "peaks",
            &format!(
                "peak at channel {} in segment {} is outside of a recording with {} channels and {} segments",
                peak.channel_index, peak.segment_index, num_channels, num_segments,
            ),
        )),
        None => Ok(()),
    }
}

/// Clusters `peaks` with `method`, returns sorted unit ids and one label per peak
///
/// Configuration and capability errors are returned before any chunk is processed,
/// a call that finds no unit returns an empty output
pub fn find_clusters_from_peaks<R: Recording + ?Sized>(
    recording: &R,
    peaks: &[Peak],
    method: &ClusteringMethod,
    config: &ClusteringConfig,
) -> Result<ClusteringOutput, SortingError> {
    Capabilities::detect().require(true, true)?;
    config.job.validate()?;
    check_peaks(recording, peaks)?;

    let num_channels = recording.num_channels();
    if let Some(noise_levels) = &config.noise_levels {
        if noise_levels.len() != num_channels {
            return Err(ConfigurationError::NoiseLevelsLengthMismatch {
                expected: num_channels, found: noise_levels.len(),
            }.into());
        }
    }

    let mut rng = StdRng::seed_from_u64(config.random_seed);

    let noise_levels = match &config.noise_levels {
        Some(noise_levels) => noise_levels.clone(),
        None => get_noise_levels(recording, &NoiseLevelParameters::default(), &mut rng)?,
    };
    method.validate(num_channels, &noise_levels)?;

    if peaks.is_empty() {
        log::info!("{}: no peaks to cluster", method.name());
        return Ok(ClusteringOutput::empty(0));
    }

    let scratch = ScratchFolder::new(config.tmp_folder.as_deref())?;
    let pool = config.job.thread_pool()?;
    let context = ClusteringContext {
        job: &config.job, noise_levels: &noise_levels, scratch: scratch.path(), pool: &pool,
    };

    let output = method.main_function(recording, peaks, &context, &mut rng)?;

    debug_assert_eq!(output.peak_labels.len(), peaks.len());
    debug_assert!(output.peak_labels.is_consistent_with(&output.labels));

    if output.report.failed_partitions > 0 {
        log::warn!(
            "{}: {} partitions failed to cluster and were marked as noise",
            method.name(), output.report.failed_partitions,
        );
    }
    log::info!("{}: {} units from {} peaks", method.name(), output.num_units(), peaks.len());

    Ok(output)
}

/// Window and radius applied to every stage of [`run_sorter`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralParameters {
    pub ms_before: f64,
    pub ms_after: f64,
    pub radius_um: f32,
}

impl Default for GeneralParameters {
    fn default() -> Self {
        GeneralParameters { ms_before: 2., ms_after: 2., radius_um: 75. }
    }
}

/// Size of the peak subset handed to the clustering
///
/// Density clustering takes time quadratic in the number of points it is given. The
/// learned subspace method clusters each channel group apart, so its cost is bounded by
/// the largest group, while random projections cluster the whole subset at once. The
/// defaults (at least 100000 peaks) are sized for the first; lower `min_n_peaks` when
/// running random projections on long recordings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionParameters {
    pub n_peaks_per_channel: usize,
    pub min_n_peaks: usize,
}

impl Default for SelectionParameters {
    fn default() -> Self {
        SelectionParameters { n_peaks_per_channel: 5000, min_n_peaks: 100000 }
    }
}

impl SelectionParameters {
    pub fn num_peaks(&self, num_channels: usize) -> usize {
        self.min_n_peaks.max(self.n_peaks_per_channel * num_channels)
    }
}

/// Settings of [`run_sorter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterParameters {
    pub general: GeneralParameters,
    pub sparsity: SparsityMethod,
    pub selection: SelectionParameters,
    pub clustering: ClusteringMethod,
    /// Matching pursuit over the whole recording, `None` keeps the clustered peaks
    pub matching: Option<MatchingParameters>,
    /// Chunk duration (ms) of the matching pursuit
    pub matching_chunk_duration_ms: f64,
    /// Signal to noise ratio a template needs to be kept by the random projection method
    pub detect_threshold: f32,
    pub job: JobParameters,
    pub seed: u64,
    pub tmp_folder: Option<PathBuf>,
}

impl Default for SorterParameters {
    fn default() -> Self {
        SorterParameters {
            general: GeneralParameters::default(),
            sparsity: SparsityMethod::Snr {
                threshold: 1.,
                amplitude_mode: AmplitudeMode::PeakToPeak,
                peak_sign: PeakSign::Neg,
            },
            selection: SelectionParameters::default(),
            clustering: ClusteringMethod::default(),
            matching: Some(MatchingParameters::default()),
            matching_chunk_duration_ms: 100.,
            detect_threshold: 5.,
            job: JobParameters::default(),
            seed: 42,
            tmp_folder: None,
        }
    }
}

impl SorterParameters {
    /// Clustering method with the general window, radius and sparsity applied
    pub fn clustering_method(&self) -> ClusteringMethod {
        let mut method = self.clustering.clone();

        match &mut method {
            ClusteringMethod::Circus(params) => {
                params.waveforms.ms_before = self.general.ms_before;
                params.waveforms.ms_after = self.general.ms_after;
                params.waveforms.radius_um = self.general.radius_um;
                params.templates.ms_before = self.general.ms_before;
                params.templates.ms_after = self.general.ms_after;
                params.pruning.sparsity = self.sparsity.clone();
            },
            ClusteringMethod::RandomProjections(params) => {
                params.waveforms.ms_before = self.general.ms_before;
                params.waveforms.ms_after = self.general.ms_after;
                params.waveforms.radius_um = self.general.radius_um;
                params.templates.ms_before = self.general.ms_before;
                params.templates.ms_after = self.general.ms_after;
                params.pruning.sparsity = self.sparsity.clone();
                params.pruning.noise_threshold = Some(self.detect_threshold);
            },
        }

        method
    }
}

/// Result of [`run_sorter`]
#[derive(Debug, Clone)]
pub struct SorterOutput {
    pub sorting: Sorting,
    /// Peaks handed to the clustering
    pub selected_peaks: Vec<Peak>,
    /// Clustering of `selected_peaks`
    pub clustering: ClusteringOutput,
    /// Sparse templates the final spikes were matched with
    pub templates: Templates,
    /// Matching chunks dropped during the final pass
    pub dropped_chunks: usize,
}

/// Sorts a recording from its detected peaks
pub fn run_sorter<R: Recording + ?Sized>(
    recording: &R,
    peaks: &[Peak],
    params: &SorterParameters,
) -> Result<SorterOutput, SortingError> {
    Capabilities::detect().require(true, params.matching.is_some())?;
    params.job.validate()?;
    if let Some(matching) = &params.matching {
        matching.validate()?;
    }
    let matching_job = JobParameters { chunk_duration_ms: params.matching_chunk_duration_ms, ..params.job.clone() };
    matching_job.validate()?;

    let sampling_frequency = recording.sampling_frequency();
    let num_channels = recording.num_channels();
    let window = WaveformWindow::from_ms(params.general.ms_before, params.general.ms_after, sampling_frequency)?;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let noise_levels = get_noise_levels(recording, &NoiseLevelParameters::default(), &mut rng)?;
    params.sparsity.validate(num_channels, Some(&noise_levels))?;

    let selected_peaks = select_peaks(peaks, params.selection.num_peaks(num_channels), &mut rng);
    log::info!("sorter: kept {} of {} peaks for clustering", selected_peaks.len(), peaks.len());

    let config = ClusteringConfig {
        job: params.job.clone(),
        random_seed: params.seed,
        tmp_folder: params.tmp_folder.clone(),
        noise_levels: Some(noise_levels.clone()),
    };
    let clustering = find_clusters_from_peaks(recording, &selected_peaks, &params.clustering_method(), &config)?;

    let unit_ids: Vec<i64> = (0..clustering.labels.len() as i64).collect();
    let relabelled: Vec<i64> = clustering.peak_labels.iter()
        .map(|label| clustering.labels.binary_search(label).map_or(NOISE_LABEL, |index| index as i64))
        .collect();
    let spikes = spikes_from_labels(&selected_peaks, &PeakLabels::from_vec(relabelled), &unit_ids);

    let templates = estimate_templates(recording, &spikes, &unit_ids, window, &params.job)?
        .without_empty_units();
    let templates = if templates.is_empty() {
        templates
    } else {
        let sparsity = compute_sparsity(&templates, Some(&noise_levels), &params.sparsity)?;
        templates.to_sparse(&sparsity)?.remove_empty_templates()
    };
    log::info!("sorter: {} templates after sparsification", templates.num_units());

    let (sorting, dropped_chunks) = match &params.matching {
        Some(matching) if !templates.is_empty() => {
            let matcher = MatchingPursuit::new(&templates, matching)?;
            let output = find_spikes_from_templates(recording, &matcher, &matching_job)?;

            (Sorting::from_matched_spikes(sampling_frequency, &output.spikes, &templates.unit_ids)?, output.dropped_chunks)
        },
        Some(_) => (Sorting::new(sampling_frequency, Vec::new(), Vec::new())?, 0),
        None => (Sorting::new(sampling_frequency, unit_ids, spikes)?, 0),
    };
    log::info!("sorter: {} spikes over {} units", sorting.spikes.len(), sorting.num_units());

    Ok(SorterOutput { sorting, selected_peaks, clustering, templates, dropped_chunks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_capability_is_named() {
        let capabilities = Capabilities { density_clustering: true, template_matching: false };

        match capabilities.require(true, true) {
            Err(SortingError::DependencyRelatedError(DependencyMissingError::TemplateMatching)) => {},
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(capabilities.require(true, false).is_ok());
    }

    #[test]
    fn test_persistent_scratch_folder_is_kept() -> Result<(), SortingError> {
        let root = TempDir::new().unwrap();
        let folder = root.path().join("clustering");

        {
            let scratch = ScratchFolder::new(Some(&folder))?;
            assert_eq!(scratch.path(), folder.as_path());
        }
        assert!(folder.exists());

        let temporary = ScratchFolder::new(None)?;
        let path = temporary.path().to_path_buf();
        assert!(path.exists());
        drop(temporary);
        assert!(!path.exists());

        Ok(())
    }

    #[test]
    fn test_general_parameters_reach_clustering() {
        let params = SorterParameters::default();

        match params.clustering_method() {
            ClusteringMethod::Circus(circus) => {
                assert_eq!(circus.waveforms.radius_um, 75.);
                assert_eq!(circus.templates.ms_before, 2.);
                assert_eq!(circus.pruning.sparsity, params.sparsity);
            },
            other => panic!("unexpected method: {:?}", other),
        }
    }

    #[test]
    fn test_selection_size_grows_with_channels() {
        let selection = SelectionParameters { n_peaks_per_channel: 100, min_n_peaks: 1000 };

        assert_eq!(selection.num_peaks(4), 1000);
        assert_eq!(selection.num_peaks(32), 3200);
        assert_eq!(SelectionParameters::default().num_peaks(4), 100000);
    }
}
