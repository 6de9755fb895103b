//! Read-only access to multi-segment, multi-channel extracellular recordings.
//!
//! The clustering core never reads files itself, it only consumes the [`Recording`]
//! trait. [`InMemoryRecording`] is the provider used by the generator and the tests.

use std::result::Result;
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};
use crate::error::RecordingError;
pub mod noise;


/// Channel geometry, one planar contact position (um) per channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// Contact positions as `[x, y]` in micrometers
    pub contact_positions: Vec<[f32; 2]>,
}

impl Probe {
    /// Generates a single column probe with contacts every `pitch_um` micrometers
    pub fn linear(num_channels: usize, pitch_um: f32) -> Self {
        Probe {
            contact_positions: (0..num_channels)
                .map(|i| [0., i as f32 * pitch_um])
                .collect(),
        }
    }

    pub fn num_contacts(&self) -> usize {
        self.contact_positions.len()
    }

    /// Euclidean distance between every pair of contacts
    pub fn get_channel_distances(&self) -> Array2<f32> {
        let n = self.num_contacts();

        Array2::from_shape_fn((n, n), |(i, j)| {
            let [xi, yi] = self.contact_positions[i];
            let [xj, yj] = self.contact_positions[j];
            ((xi - xj).powi(2) + (yi - yj).powi(2)).sqrt()
        })
    }
}

/// Handles reading traces from a recording, traces are returned as `(frames, channels)`
pub trait Recording: Send + Sync {
    /// Sampling frequency (Hz)
    fn sampling_frequency(&self) -> f64;
    /// Number of channels
    fn num_channels(&self) -> usize;
    /// Channel identifiers, ordered like the channel axis of the traces
    fn channel_ids(&self) -> &[String];
    /// Channel geometry
    fn get_probe(&self) -> &Probe;
    /// Number of segments
    fn num_segments(&self) -> usize;
    /// Number of samples in the given segment
    fn num_samples(&self, segment_index: usize) -> Result<usize, RecordingError>;
    /// Reads frames `start_frame..end_frame` of the given segment
    fn get_traces(
        &self,
        segment_index: usize,
        start_frame: usize,
        end_frame: usize,
    ) -> Result<Array2<f32>, RecordingError>;
}

/// Reads frames `start..end` of a segment where frames outside of the segment
/// are returned as zeros, used to handle windows that run past segment boundaries
pub fn get_traces_padded<R: Recording + ?Sized>(
    recording: &R,
    segment_index: usize,
    start: i64,
    end: i64,
) -> Result<Array2<f32>, RecordingError> {
    let num_channels = recording.num_channels();
    let num_samples = recording.num_samples(segment_index)? as i64;
    let length = (end - start).max(0) as usize;

    let mut traces = Array2::<f32>::zeros((length, num_channels));

    let read_start = start.clamp(0, num_samples);
    let read_end = end.clamp(0, num_samples);

    if read_end > read_start {
        let offset = (read_start - start) as usize;
        let read = recording.get_traces(segment_index, read_start as usize, read_end as usize)?;
        traces.slice_mut(s![offset..offset + read.nrows(), ..]).assign(&read);
    }

    Ok(traces)
}

/// Recording held in memory, one `(frames, channels)` array per segment
#[derive(Debug, Clone)]
pub struct InMemoryRecording {
    sampling_frequency: f64,
    channel_ids: Vec<String>,
    probe: Probe,
    traces: Vec<Array2<f32>>,
}

impl InMemoryRecording {
    /// Builds a recording after checking that every segment, the channel ids and
    /// the probe agree on the channel count
    pub fn new(
        sampling_frequency: f64,
        traces: Vec<Array2<f32>>,
        channel_ids: Vec<String>,
        probe: Probe,
    ) -> Result<Self, RecordingError> {
        if !(sampling_frequency.is_finite() && sampling_frequency > 0.) {
            return Err(RecordingError::InvalidSamplingFrequency(sampling_frequency));
        }
        if channel_ids.len() != probe.num_contacts() {
            return Err(RecordingError::ShapeMismatch(
                format!("{} channel ids for {} probe contacts", channel_ids.len(), probe.num_contacts())
            ));
        }
        if let Some(segment) = traces.iter().find(|segment| segment.ncols() != channel_ids.len()) {
            return Err(RecordingError::ShapeMismatch(
                format!("segment with {} channels for {} channel ids", segment.ncols(), channel_ids.len())
            ));
        }

        Ok(InMemoryRecording { sampling_frequency, channel_ids, probe, traces })
    }

    /// Builds a recording on a linear probe with channel ids `"0"`, `"1"`, ...
    pub fn from_traces(
        sampling_frequency: f64,
        traces: Vec<Array2<f32>>,
        pitch_um: f32,
    ) -> Result<Self, RecordingError> {
        let num_channels = traces.first().map(|segment| segment.ncols()).unwrap_or(0);
        let channel_ids = (0..num_channels).map(|i| i.to_string()).collect();

        InMemoryRecording::new(sampling_frequency, traces, channel_ids, Probe::linear(num_channels, pitch_um))
    }

    pub fn segment(&self, segment_index: usize) -> Option<&Array2<f32>> {
        self.traces.get(segment_index)
    }
}

impl Recording for InMemoryRecording {
    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn num_channels(&self) -> usize {
        self.channel_ids.len()
    }

    fn channel_ids(&self) -> &[String] {
        &self.channel_ids
    }

    fn get_probe(&self) -> &Probe {
        &self.probe
    }

    fn num_segments(&self) -> usize {
        self.traces.len()
    }

    fn num_samples(&self, segment_index: usize) -> Result<usize, RecordingError> {
        self.traces.get(segment_index)
            .map(|segment| segment.nrows())
            .ok_or(RecordingError::SegmentNotFound(segment_index))
    }

    fn get_traces(
        &self,
        segment_index: usize,
        start_frame: usize,
        end_frame: usize,
    ) -> Result<Array2<f32>, RecordingError> {
        let segment = self.traces.get(segment_index)
            .ok_or(RecordingError::SegmentNotFound(segment_index))?;

        if start_frame > end_frame || end_frame > segment.nrows() {
            return Err(RecordingError::FramesOutOfBounds { segment_index, start_frame, end_frame });
        }

        Ok(segment.slice(s![start_frame..end_frame, ..]).to_owned())
    }
}
