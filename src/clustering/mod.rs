//! Clustering of detected peaks into units.
//!
//! Every method turns a peak list into a `(labels, peak_labels)` pair where `labels`
//! holds the sorted unit ids and `peak_labels` one entry per peak, `-1` for noise.
//! Methods share the same ending: templates are estimated from the raw clusters,
//! pruned, then deduplicated by matching them against each other.

use std::collections::HashSet;
use std::path::Path;
use std::result::Result;
use ndarray::Array1;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use crate::deduplication::{DeduplicationParameters, remove_duplicates_via_matching};
use crate::error::{SortingError, invalid_parameter};
use crate::job::JobParameters;
use crate::peaks::{Peak, PeakLabels, spikes_from_labels};
use crate::pruning::{PruningParameters, PruningReport, prune_templates};
use crate::recording::Recording;
use crate::templates::estimate_templates;
use crate::waveforms::WaveformWindow;
pub mod hdbscan;
pub mod circus;
pub mod random_projections;

use circus::CircusParameters;
use random_projections::RandomProjectionsParameters;


/// Resources shared by every clustering method for one call
#[derive(Debug, Clone, Copy)]
pub struct ClusteringContext<'a> {
    pub job: &'a JobParameters,
    /// One noise level per recording channel
    pub noise_levels: &'a Array1<f32>,
    /// Folder where fitted models may be written, owned by the caller
    pub scratch: &'a Path,
    /// Worker pool of `job.n_jobs` threads for the work done outside of chunks
    pub pool: &'a rayon::ThreadPool,
}

/// What happened between the raw clusters and the final units
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusteringReport {
    /// Clusters found before templates were estimated
    pub raw_clusters: usize,
    /// Partitions whose clustering failed and were marked as noise
    pub failed_partitions: usize,
    pub pruning: PruningReport,
    /// `(removed, kept)` unit id pairs merged by deduplication
    pub merges: Vec<(i64, i64)>,
    /// Matching chunks dropped during deduplication
    pub dropped_chunks: usize,
}

/// Final units of a clustering call
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringOutput {
    /// Sorted unit ids
    pub labels: Vec<i64>,
    /// One label per input peak, `-1` or one of `labels`
    pub peak_labels: PeakLabels,
    pub report: ClusteringReport,
}

impl ClusteringOutput {
    /// Output of a call that found no unit
    pub fn empty(num_peaks: usize) -> Self {
        ClusteringOutput {
            labels: Vec::new(),
            peak_labels: PeakLabels::noise(num_peaks),
            report: ClusteringReport::default(),
        }
    }

    pub fn num_units(&self) -> usize {
        self.labels.len()
    }
}

/// Uniform interface of the clustering methods
pub trait ClusteringStrategy {
    /// Name used in logs and configuration files
    fn name(&self) -> &'static str;

    /// Checks the parameters against the recording layout before any work starts
    fn validate(&self, num_channels: usize, noise_levels: &Array1<f32>) -> Result<(), SortingError>;

    /// Clusters `peaks`, randomness is drawn from `rng` only
    fn main_function<R: Recording + ?Sized>(
        &self,
        recording: &R,
        peaks: &[Peak],
        context: &ClusteringContext,
        rng: &mut StdRng,
    ) -> Result<ClusteringOutput, SortingError>;
}

/// Available clustering methods, tagged by `method` in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClusteringMethod {
    /// Learned subspace projection and clustering per channel
    Circus(CircusParameters),
    /// Random projections of smoothed sparse waveforms and one global clustering
    RandomProjections(RandomProjectionsParameters),
}

impl Default for ClusteringMethod {
    fn default() -> Self {
        ClusteringMethod::Circus(CircusParameters::default())
    }
}

impl ClusteringStrategy for ClusteringMethod {
    fn name(&self) -> &'static str {
        match self {
            ClusteringMethod::Circus(params) => params.name(),
            ClusteringMethod::RandomProjections(params) => params.name(),
        }
    }

    fn validate(&self, num_channels: usize, noise_levels: &Array1<f32>) -> Result<(), SortingError> {
        match self {
            ClusteringMethod::Circus(params) => params.validate(num_channels, noise_levels),
            ClusteringMethod::RandomProjections(params) => params.validate(num_channels, noise_levels),
        }
    }

    fn main_function<R: Recording + ?Sized>(
        &self,
        recording: &R,
        peaks: &[Peak],
        context: &ClusteringContext,
        rng: &mut StdRng,
    ) -> Result<ClusteringOutput, SortingError> {
        match self {
            ClusteringMethod::Circus(params) => params.main_function(recording, peaks, context, rng),
            ClusteringMethod::RandomProjections(params) => params.main_function(recording, peaks, context, rng),
        }
    }
}

/// Window (ms) and neighbourhood radius (um) of the waveforms features are computed on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWaveforms {
    pub ms_before: f64,
    pub ms_after: f64,
    pub radius_um: f32,
}

impl Default for FeatureWaveforms {
    fn default() -> Self {
        FeatureWaveforms { ms_before: 0.5, ms_after: 0.5, radius_um: 100. }
    }
}

impl FeatureWaveforms {
    pub fn validate(&self) -> Result<(), SortingError> {
        if !(self.ms_before.is_finite() && self.ms_before >= 0. && self.ms_after.is_finite() && self.ms_after >= 0.) {
            return Err(invalid_parameter("ms_before", "window bounds must be non negative"));
        }
        if !(self.radius_um.is_finite() && self.radius_um >= 0.) {
            return Err(invalid_parameter("radius_um", "must be a non negative distance"));
        }

        Ok(())
    }

    pub fn window(&self, sampling_frequency: f64) -> Result<WaveformWindow, SortingError> {
        WaveformWindow::from_ms(self.ms_before, self.ms_after, sampling_frequency)
    }
}

/// Window (ms) of the templates estimated from the raw clusters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateWindow {
    pub ms_before: f64,
    pub ms_after: f64,
}

impl Default for TemplateWindow {
    fn default() -> Self {
        TemplateWindow { ms_before: 2., ms_after: 2. }
    }
}

impl TemplateWindow {
    pub fn validate(&self) -> Result<(), SortingError> {
        if !(self.ms_before.is_finite() && self.ms_before >= 0. && self.ms_after.is_finite() && self.ms_after >= 0.) {
            return Err(invalid_parameter("templates", "window bounds must be non negative"));
        }

        Ok(())
    }
}

/// Turns raw cluster labels into final units: estimates the templates of the raw
/// clusters, prunes them and merges duplicates
pub(crate) fn finalize_clusters<R: Recording + ?Sized>(
    recording: &R,
    peaks: &[Peak],
    mut peak_labels: PeakLabels,
    template_window: TemplateWindow,
    pruning: &PruningParameters,
    deduplication: &DeduplicationParameters,
    context: &ClusteringContext,
    method_name: &str,
) -> Result<ClusteringOutput, SortingError> {
    let unit_ids = peak_labels.unique_labels();
    let mut report = ClusteringReport { raw_clusters: unit_ids.len(), ..ClusteringReport::default() };
    log::info!("{}: {} raw clusters", method_name, unit_ids.len());

    if unit_ids.is_empty() {
        return Ok(ClusteringOutput { labels: Vec::new(), peak_labels, report });
    }

    let window = WaveformWindow::from_ms(
        template_window.ms_before, template_window.ms_after, recording.sampling_frequency()
    )?;
    let spikes = spikes_from_labels(peaks, &peak_labels, &unit_ids);
    let templates = estimate_templates(recording, &spikes, &unit_ids, window, context.job)?
        .without_empty_units();

    let estimated: HashSet<i64> = templates.unit_ids.iter().copied().collect();
    peak_labels.retain_units(&estimated);

    let (templates, peak_labels, pruning_report) = prune_templates(
        templates, peak_labels, context.noise_levels, pruning
    )?;
    report.pruning = pruning_report;

    let deduplicated = remove_duplicates_via_matching(&templates, peak_labels, deduplication)?;
    report.merges = deduplicated.merges;
    report.dropped_chunks = deduplicated.dropped_chunks;

    log::info!("{}: {} clusters kept", method_name, deduplicated.labels.len());

    Ok(ClusteringOutput { labels: deduplicated.labels, peak_labels: deduplicated.peak_labels, report })
}
