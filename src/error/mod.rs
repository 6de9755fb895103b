//! Error set for the clustering, template estimation and matching stages.
//!
//! Errors are split between pipeline-fatal kinds ([`ConfigurationError`],
//! [`DependencyMissingError`], [`RecordingError`]) which propagate to the caller
//! immediately, and recoverable kinds ([`DegenerateClusterError`], [`MatchingError`])
//! which are absorbed by the stage that raised them for one partition or one chunk.

use std::fmt::{Display, Debug, Formatter, Result};


/// Invalid parameter combinations, detected before any chunked work starts
#[derive(Clone, PartialEq)]
pub enum ConfigurationError {
    /// Sparsity method requires noise levels but none were given or estimated
    NoiseLevelsRequired(String),
    /// Noise levels do not have one entry per channel
    NoiseLevelsLengthMismatch { expected: usize, found: usize },
    /// A numerical parameter is out of its valid range
    InvalidParameter { name: String, reason: String },
    /// Template window must contain at least one sample
    EmptyWaveformWindow,
    /// Recording and templates disagree on the channel count
    ChannelCountMismatch { recording: usize, templates: usize },
    /// Worker pool could not be built
    WorkerPool(String),
    /// Scratch folder could not be created or written
    ScratchFolder(String),
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            ConfigurationError::NoiseLevelsRequired(method) => write!(
                f, "Sparsity method '{}' requires noise levels", method
            ),
            ConfigurationError::NoiseLevelsLengthMismatch { expected, found } => write!(
                f, "Expected {} noise levels (one per channel), found {}", expected, found
            ),
            ConfigurationError::InvalidParameter { name, reason } => write!(
                f, "Invalid parameter '{}': {}", name, reason
            ),
            ConfigurationError::EmptyWaveformWindow => write!(
                f, "Waveform window must contain at least one sample"
            ),
            ConfigurationError::ChannelCountMismatch { recording, templates } => write!(
                f, "Recording has {} channels but templates have {}", recording, templates
            ),
            ConfigurationError::WorkerPool(reason) => write!(f, "Cannot build worker pool: {}", reason),
            ConfigurationError::ScratchFolder(reason) => write!(f, "Cannot use scratch folder: {}", reason),
        }
    }
}

impl Debug for ConfigurationError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "file: {}, line: {}, error: {}", file!(), line!(), self)
    }
}

/// A capability the pipeline depends on was not compiled in
#[derive(Clone, PartialEq)]
pub enum DependencyMissingError {
    /// Density based clustering (enable the `hdbscan` feature)
    DensityClustering,
    /// Template matching pursuit (enable the `matching` feature)
    TemplateMatching,
}

impl Display for DependencyMissingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let err_msg = match self {
            DependencyMissingError::DensityClustering =>
                "Density clustering is unavailable, build with the `hdbscan` feature",
            DependencyMissingError::TemplateMatching =>
                "Template matching is unavailable, build with the `matching` feature",
        };

        write!(f, "{}", err_msg)
    }
}

impl Debug for DependencyMissingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "file: {}, line: {}, error: {}", file!(), line!(), self)
    }
}

/// Clustering could not run on one partition of the peaks
#[derive(Clone, PartialEq)]
pub enum DegenerateClusterError {
    /// Feature matrix contains `NaN` or infinite values
    NonFiniteFeatures,
    /// Feature matrix has no columns
    NoFeatures,
    /// Decomposition of the partition failed
    DecompositionFailed(String),
}

impl Display for DegenerateClusterError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            DegenerateClusterError::NonFiniteFeatures => write!(f, "Features contain non finite values"),
            DegenerateClusterError::NoFeatures => write!(f, "Feature matrix has no columns"),
            DegenerateClusterError::DecompositionFailed(reason) => write!(f, "Decomposition failed: {}", reason),
        }
    }
}

impl Debug for DegenerateClusterError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "file: {}, line: {}, error: {}", file!(), line!(), self)
    }
}

/// Errors raised by a recording provider
#[derive(Clone, PartialEq)]
pub enum RecordingError {
    /// Segment index out of range
    SegmentNotFound(usize),
    /// Requested frames are out of the segment
    FramesOutOfBounds { segment_index: usize, start_frame: usize, end_frame: usize },
    /// Traces, channel ids and probe disagree on the channel count
    ShapeMismatch(String),
    /// Sampling frequency must be positive and finite
    InvalidSamplingFrequency(f64),
}

impl Display for RecordingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            RecordingError::SegmentNotFound(segment_index) => write!(f, "Segment {} not found", segment_index),
            RecordingError::FramesOutOfBounds { segment_index, start_frame, end_frame } => write!(
                f, "Frames {}..{} out of bounds for segment {}", start_frame, end_frame, segment_index
            ),
            RecordingError::ShapeMismatch(reason) => write!(f, "Recording shape mismatch: {}", reason),
            RecordingError::InvalidSamplingFrequency(fs) => write!(f, "Invalid sampling frequency: {}", fs),
        }
    }
}

impl Debug for RecordingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "file: {}, line: {}, error: {}", file!(), line!(), self)
    }
}

/// Matching pursuit failed on one chunk
#[derive(Clone, PartialEq)]
pub enum MatchingError {
    /// Traces contain `NaN` or infinite values
    NonFiniteTraces,
    /// Chunk is shorter than one template
    ChunkTooShort { chunk_samples: usize, template_samples: usize },
    /// Traces and dictionary disagree on the channel count
    ChannelMismatch { traces: usize, templates: usize },
    /// Template of the unit at this index has non finite samples on an active channel
    NonFiniteTemplate(usize),
}

impl Display for MatchingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            MatchingError::NonFiniteTraces => write!(f, "Traces contain non finite values"),
            MatchingError::ChunkTooShort { chunk_samples, template_samples } => write!(
                f, "Chunk of {} samples is shorter than templates of {} samples", chunk_samples, template_samples
            ),
            MatchingError::ChannelMismatch { traces, templates } => write!(
                f, "Traces have {} channels but templates have {}", traces, templates
            ),
            MatchingError::NonFiniteTemplate(unit_index) => write!(
                f, "Template of unit index {} contains non finite values", unit_index
            ),
        }
    }
}

impl Debug for MatchingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "file: {}, line: {}, error: {}", file!(), line!(), self)
    }
}

/// A set of errors that may occur when sorting spikes
#[derive(Clone, PartialEq)]
pub enum SortingError {
    /// Errors related to parameters
    ConfigurationRelatedError(ConfigurationError),
    /// Errors related to missing capabilities
    DependencyRelatedError(DependencyMissingError),
    /// Errors related to clustering a partition
    ClusteringRelatedError(DegenerateClusterError),
    /// Errors related to reading traces
    RecordingRelatedError(RecordingError),
    /// Errors related to template matching
    MatchingRelatedError(MatchingError),
}

impl SortingError {
    /// Whether the error may be absorbed by the stage that raised it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SortingError::ClusteringRelatedError(_) | SortingError::MatchingRelatedError(_)
        )
    }
}

impl Display for SortingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self {
            SortingError::ConfigurationRelatedError(err) => write!(f, "{}", err),
            SortingError::DependencyRelatedError(err) => write!(f, "{}", err),
            SortingError::ClusteringRelatedError(err) => write!(f, "{}", err),
            SortingError::RecordingRelatedError(err) => write!(f, "{}", err),
            SortingError::MatchingRelatedError(err) => write!(f, "{}", err),
        }
    }
}

impl Debug for SortingError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "file: {}, line: {}, error: {}", file!(), line!(), self)
    }
}

impl std::error::Error for SortingError {}

impl From<ConfigurationError> for SortingError {
    fn from(err: ConfigurationError) -> SortingError {
        SortingError::ConfigurationRelatedError(err)
    }
}

impl From<DependencyMissingError> for SortingError {
    fn from(err: DependencyMissingError) -> SortingError {
        SortingError::DependencyRelatedError(err)
    }
}

impl From<DegenerateClusterError> for SortingError {
    fn from(err: DegenerateClusterError) -> SortingError {
        SortingError::ClusteringRelatedError(err)
    }
}

impl From<RecordingError> for SortingError {
    fn from(err: RecordingError) -> SortingError {
        SortingError::RecordingRelatedError(err)
    }
}

impl From<MatchingError> for SortingError {
    fn from(err: MatchingError) -> SortingError {
        SortingError::MatchingRelatedError(err)
    }
}

/// Shorthand for an out of range parameter
pub(crate) fn invalid_parameter(name: &str, reason: &str) -> SortingError {
    SortingError::ConfigurationRelatedError(
        ConfigurationError::InvalidParameter { name: name.to_string(), reason: reason.to_string() }
    )
}
