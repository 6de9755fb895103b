//! # Spike Sorting Components
//!
//! `spike_sorting_components` turns detected peaks of an extracellular recording
//! into sorted units. Peaks are projected to compact features, clustered with a
//! density based algorithm, reduced to per-unit templates, pruned with a sparsity
//! rule and deduplicated by matching the templates against each other. Every stage
//! that reads traces works chunk by chunk on a worker pool so that recordings never
//! need to fit in memory at once.
//!
//! The canonical output of the clustering is a pair of sorted unit ids (`labels`)
//! and one label per input peak (`peak_labels`), where `-1` marks noise and every
//! other entry is one of `labels`.
//!
//! ## Modules
//!
//! - [`recording`] : recording provider trait, probe geometry and noise levels
//! - [`peaks`] : peak and spike records, the owned peak label array
//! - [`job`] : chunking plan and worker pool execution
//! - [`waveforms`] : dense and sparse waveform extraction
//! - [`features`] : truncated decomposition, smoothing and random projections
//! - [`clustering`] : density clustering and the clustering methods
//! - [`templates`], [`sparsity`], [`pruning`] : template estimation and validation
//! - [`matching`], [`deduplication`] : matching pursuit and duplicate removal
//! - [`sorting`], [`sorter`] : spike trains and the pipeline entry points
//! - [`generation`] : synthetic ground truth recordings
//!
//! ## Example Code
//!
//! ### Clustering peaks of a synthetic recording
//!
//! ```rust
//! use rand::{SeedableRng, rngs::StdRng};
//! use spike_sorting_components::{
//!     clustering::{ClusteringMethod, circus::CircusParameters},
//!     error::SortingError,
//!     generation::{GroundTruthParameters, generate_ground_truth_recording},
//!     job::JobParameters,
//!     sorter::{ClusteringConfig, find_clusters_from_peaks},
//! };
//!
//! fn main() -> Result<(), SortingError> {
//!     let params = GroundTruthParameters { durations_s: vec![5.], ..GroundTruthParameters::default() };
//!     let truth = generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(0))?;
//!
//!     let config = ClusteringConfig { job: JobParameters::sequential(1000.), ..ClusteringConfig::default() };
//!     let output = find_clusters_from_peaks(
//!         &truth.recording,
//!         &truth.peaks,
//!         &ClusteringMethod::Circus(CircusParameters::default()),
//!         &config,
//!     )?;
//!
//!     // every peak is either noise or belongs to a surviving unit
//!     assert_eq!(output.peak_labels.len(), truth.peaks.len());
//!     assert!(output.peak_labels.is_consistent_with(&output.labels));
//!
//!     Ok(())
//! }
//! ```

pub mod clustering;
pub mod deduplication;
pub mod error;
pub mod features;
pub mod generation;
pub mod job;
pub mod matching;
pub mod peaks;
pub mod pruning;
pub mod recording;
pub mod sorter;
pub mod sorting;
pub mod sparsity;
pub mod templates;
pub mod waveforms;
