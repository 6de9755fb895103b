//! Extraction of per-peak waveform snippets, either on every channel or restricted to
//! the channels around the peak's channel, streamed over recording chunks.

use std::result::Result;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use crate::error::{ConfigurationError, SortingError, invalid_parameter};
use crate::job::{ChunkExecutor, JobParameters};
use crate::peaks::{Peak, argsort_peaks};
use crate::recording::{Probe, Recording};


/// Number of samples kept before and after a peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformWindow {
    pub nbefore: usize,
    pub nafter: usize,
}

impl WaveformWindow {
    /// Converts millisecond bounds into sample counts, `nbefore = round(ms_before * fs / 1000)`
    pub fn from_ms(ms_before: f64, ms_after: f64, sampling_frequency: f64) -> Result<Self, SortingError> {
        if !(ms_before >= 0. && ms_after >= 0.) {
            return Err(ConfigurationError::EmptyWaveformWindow.into());
        }

        let window = WaveformWindow {
            nbefore: (ms_before * sampling_frequency / 1000.).round() as usize,
            nafter: (ms_after * sampling_frequency / 1000.).round() as usize,
        };

        if window.num_samples() == 0 {
            return Err(ConfigurationError::EmptyWaveformWindow.into());
        }

        Ok(window)
    }

    pub fn num_samples(&self) -> usize {
        self.nbefore + self.nafter
    }

    /// Margin a chunk needs so that every window of its peaks fits
    pub fn margin(&self) -> usize {
        self.nbefore.max(self.nafter)
    }
}

/// For every channel, the ordered list of channels considered around it
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelNeighborhood {
    neighbours: Vec<Vec<usize>>,
    max_num_channels: usize,
}

impl ChannelNeighborhood {
    /// Channels within `radius_um` of each channel, in channel order
    pub fn from_radius(probe: &Probe, radius_um: f32) -> Self {
        let distances = probe.get_channel_distances();

        let neighbours: Vec<Vec<usize>> = distances.axis_iter(Axis(0))
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, distance)| **distance <= radius_um)
                    .map(|(channel, _)| channel)
                    .collect()
            })
            .collect();

        let max_num_channels = neighbours.iter().map(|n| n.len()).max().unwrap_or(0);

        ChannelNeighborhood { neighbours, max_num_channels }
    }

    pub fn num_channels(&self) -> usize {
        self.neighbours.len()
    }

    /// Width of sparse waveforms, the largest neighbourhood
    pub fn max_num_channels(&self) -> usize {
        self.max_num_channels
    }

    /// Neighbours of the given channel
    pub fn channels(&self, channel_index: usize) -> &[usize] {
        self.neighbours.get(channel_index).map(|n| n.as_slice()).unwrap_or(&[])
    }
}

/// Sparse waveforms, `data[i, .., k]` holds channel `neighborhood.channels(peaks[i].channel_index)[k]`
/// and trailing columns past the neighbourhood size are zero
#[derive(Debug, Clone)]
pub struct SparseWaveforms {
    pub data: Array3<f32>,
    pub neighborhood: ChannelNeighborhood,
}

/// Streams the recording chunk by chunk and reduces the snippet of each peak to a row of
/// `row_len` values, only the reduced rows outlive a chunk
fn extract_with<R, F>(
    recording: &R,
    peaks: &[Peak],
    window: WaveformWindow,
    row_len: usize,
    job: &JobParameters,
    job_name: &str,
    reduce: F,
) -> Result<Array2<f32>, SortingError>
where
    R: Recording + ?Sized,
    F: Fn(&Peak, ArrayView2<f32>) -> Array1<f32> + Sync,
{
    let num_samples = window.num_samples();
    let mut rows = Array2::<f32>::zeros((peaks.len(), row_len));

    if peaks.is_empty() {
        return Ok(rows);
    }

    let order = argsort_peaks(peaks);
    let keys: Vec<(usize, i64)> = order.iter()
        .map(|&i| (peaks[i].segment_index, peaks[i].sample_index))
        .collect();

    let executor = ChunkExecutor::new(recording, job, job_name)?.with_margin(window.margin());
    let margin = executor.margin() as i64;

    let output = executor.run(|chunk, traces| {
        let first = keys.partition_point(|key| *key < (chunk.segment_index, chunk.start_frame as i64));
        let last = keys.partition_point(|key| *key < (chunk.segment_index, chunk.end_frame as i64));

        let mut reduced = Array2::<f32>::zeros((last - first, row_len));
        for (mut row, &peak_index) in reduced.axis_iter_mut(Axis(0)).zip(&order[first..last]) {
            let peak = &peaks[peak_index];
            let center = peak.sample_index - chunk.start_frame as i64 + margin;
            let start = (center - window.nbefore as i64) as usize;
            let snippet = traces.slice(s![start..start + num_samples, ..]);

            let values = reduce(peak, snippet);
            if values.len() != row_len {
                return Err(invalid_parameter(
                    "waveforms", &format!("expected {} values per peak, found {}", row_len, values.len()),
                ));
            }
            row.assign(&values);
        }

        Ok((first, reduced))
    })?;

    let mut extracted = 0;
    for (_, (first, reduced)) in output.results {
        for (offset, row) in reduced.axis_iter(Axis(0)).enumerate() {
            rows.row_mut(order[first + offset]).assign(&row);
        }
        extracted += reduced.nrows();
    }

    if extracted < peaks.len() {
        log::warn!(
            "{}: {} peaks fall outside of the recording and were left as zeros",
            job_name, peaks.len() - extracted,
        );
    }

    Ok(rows)
}

fn flatten(waveform: ArrayView2<f32>) -> Array1<f32> {
    waveform.iter().copied().collect()
}

fn into_waveforms(rows: Array2<f32>, num_samples: usize, num_channels: usize) -> Result<Array3<f32>, SortingError> {
    let num_peaks = rows.nrows();

    rows.into_shape((num_peaks, num_samples, num_channels))
        .map_err(|err| invalid_parameter("waveforms", &err.to_string()))
}

/// Copies the neighbourhood of the peak's channel into a `(samples, width)` waveform
fn sparse_waveform(neighborhood: &ChannelNeighborhood, peak: &Peak, snippet: ArrayView2<f32>) -> Array2<f32> {
    let mut sparse = Array2::<f32>::zeros((snippet.nrows(), neighborhood.max_num_channels()));
    for (k, &channel) in neighborhood.channels(peak.channel_index).iter().enumerate() {
        sparse.column_mut(k).assign(&snippet.column(channel));
    }

    sparse
}

/// Extracts `(peaks, samples, channels)` waveforms on every channel
pub fn extract_dense_waveforms<R: Recording + ?Sized>(
    recording: &R,
    peaks: &[Peak],
    window: WaveformWindow,
    job: &JobParameters,
) -> Result<Array3<f32>, SortingError> {
    let num_channels = recording.num_channels();

    let rows = extract_with(
        recording, peaks, window, window.num_samples() * num_channels, job, "extract dense waveforms",
        |_, snippet| flatten(snippet),
    )?;

    into_waveforms(rows, window.num_samples(), num_channels)
}

/// Extracts waveforms on the neighbourhood of each peak's channel
pub fn extract_sparse_waveforms<R: Recording + ?Sized>(
    recording: &R,
    peaks: &[Peak],
    window: WaveformWindow,
    neighborhood: &ChannelNeighborhood,
    job: &JobParameters,
) -> Result<SparseWaveforms, SortingError> {
    let width = neighborhood.max_num_channels();

    let rows = extract_with(
        recording, peaks, window, window.num_samples() * width, job, "extract sparse waveforms",
        |peak, snippet| flatten(sparse_waveform(neighborhood, peak, snippet).view()),
    )?;

    Ok(SparseWaveforms { data: into_waveforms(rows, window.num_samples(), width)?, neighborhood: neighborhood.clone() })
}

/// Reduces the sparse waveform of every peak to `num_features` values while the recording
/// is streamed, `reduce` receives the `(samples, max_num_channels)` waveform laid out as
/// in [`SparseWaveforms`]
pub fn extract_sparse_features<R, F>(
    recording: &R,
    peaks: &[Peak],
    window: WaveformWindow,
    neighborhood: &ChannelNeighborhood,
    num_features: usize,
    job: &JobParameters,
    reduce: F,
) -> Result<Array2<f32>, SortingError>
where
    R: Recording + ?Sized,
    F: Fn(&Peak, Array2<f32>) -> Array1<f32> + Sync,
{
    extract_with(
        recording, peaks, window, num_features, job, "extract sparse features",
        |peak, snippet| reduce(peak, sparse_waveform(neighborhood, peak, snippet)),
    )
}

/// Extracts `(peaks, samples)` waveforms on the channel of each peak
pub fn extract_waveforms_at_max_channel<R: Recording + ?Sized>(
    recording: &R,
    peaks: &[Peak],
    window: WaveformWindow,
    job: &JobParameters,
) -> Result<Array2<f32>, SortingError> {
    let num_channels = recording.num_channels();

    extract_with(
        recording, peaks, window, window.num_samples(), job, "extract waveforms at max channel",
        |peak, snippet| snippet.column(peak.channel_index.min(num_channels.saturating_sub(1))).to_owned(),
    )
}
