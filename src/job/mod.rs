//! Chunked, data-parallel execution over the segments of a recording.
//!
//! A recording is cut into a fixed plan of chunks, every chunk is processed independently
//! on a worker pool and results are handed back in plan order once every chunk has
//! finished, which is the only synchronization point between chunks.

use std::result::Result;
use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::error::{ConfigurationError, SortingError, invalid_parameter};
use crate::recording::{Recording, get_traces_padded};


/// Worker pool and chunking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParameters {
    /// Number of worker threads
    pub n_jobs: usize,
    /// Duration of one chunk (ms), ignored when `chunk_memory` is set
    pub chunk_duration_ms: f64,
    /// Upper bound of traces held by one chunk (bytes)
    pub chunk_memory: Option<usize>,
}

impl Default for JobParameters {
    fn default() -> Self {
        JobParameters {
            n_jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            chunk_duration_ms: 1000.,
            chunk_memory: None,
        }
    }
}

impl JobParameters {
    /// Single worker with the given chunk duration
    pub fn sequential(chunk_duration_ms: f64) -> Self {
        JobParameters { n_jobs: 1, chunk_duration_ms, chunk_memory: None }
    }

    pub fn validate(&self) -> Result<(), SortingError> {
        if self.n_jobs == 0 {
            return Err(invalid_parameter("n_jobs", "must be at least 1"));
        }
        if self.chunk_memory.is_none() && !(self.chunk_duration_ms.is_finite() && self.chunk_duration_ms > 0.) {
            return Err(invalid_parameter("chunk_duration_ms", "must be positive"));
        }
        if self.chunk_memory == Some(0) {
            return Err(invalid_parameter("chunk_memory", "must be positive"));
        }

        Ok(())
    }

    /// Builds a worker pool of `n_jobs` threads
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool, SortingError> {
        self.validate()?;

        rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_jobs)
            .build()
            .map_err(|err| ConfigurationError::WorkerPool(err.to_string()).into())
    }

    /// Number of samples per chunk for the given recording layout
    pub fn chunk_size(&self, sampling_frequency: f64, num_channels: usize) -> usize {
        let size = match self.chunk_memory {
            Some(bytes) => bytes / (num_channels.max(1) * std::mem::size_of::<f32>()),
            None => (self.chunk_duration_ms * sampling_frequency / 1000.) as usize,
        };

        size.max(1)
    }
}

/// A contiguous span of samples within one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub segment_index: usize,
    pub start_frame: usize,
    pub end_frame: usize,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.end_frame - self.start_frame
    }

    pub fn is_empty(&self) -> bool {
        self.end_frame == self.start_frame
    }

    /// Whether a sample of this segment falls in the chunk
    pub fn contains(&self, segment_index: usize, sample_index: i64) -> bool {
        segment_index == self.segment_index &&
        sample_index >= self.start_frame as i64 &&
        sample_index < self.end_frame as i64
    }
}

/// Cuts every segment into consecutive chunks of at most `chunk_size` samples
pub fn divide_recording_into_chunks<R: Recording + ?Sized>(
    recording: &R,
    chunk_size: usize,
) -> Result<Vec<Chunk>, SortingError> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();

    for segment_index in 0..recording.num_segments() {
        let num_samples = recording.num_samples(segment_index)?;

        let mut start_frame = 0;
        while start_frame < num_samples {
            let end_frame = (start_frame + chunk_size).min(num_samples);
            chunks.push(Chunk { segment_index, start_frame, end_frame });
            start_frame = end_frame;
        }
    }

    Ok(chunks)
}

/// What to do when the work on one chunk fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The first failing chunk aborts the whole stage
    Abort,
    /// Recoverable failures drop the chunk's result, fatal ones still abort
    DropChunk,
}

/// Results of a chunked stage together with the number of chunks that were dropped
#[derive(Debug, Clone)]
pub struct ChunkResults<T> {
    pub results: Vec<(Chunk, T)>,
    pub dropped_chunks: usize,
}

/// Runs one function per chunk on a worker pool, every call receives the chunk and its
/// traces extended by `margin` samples on both sides (zero padded at segment edges)
///
/// The pool is built once and reused by every batch run through the executor.
pub struct ChunkExecutor<'a, R: Recording + ?Sized> {
    recording: &'a R,
    job: &'a JobParameters,
    pool: rayon::ThreadPool,
    margin: usize,
    policy: FailurePolicy,
    job_name: &'a str,
}

impl<'a, R: Recording + ?Sized> ChunkExecutor<'a, R> {
    pub fn new(recording: &'a R, job: &'a JobParameters, job_name: &'a str) -> Result<Self, SortingError> {
        let pool = job.thread_pool()?;

        Ok(ChunkExecutor { recording, job, pool, margin: 0, policy: FailurePolicy::Abort, job_name })
    }

    pub fn with_margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn margin(&self) -> usize {
        self.margin
    }

    /// Processes the chunk plan derived from the job parameters
    pub fn run<T, F>(&self, func: F) -> Result<ChunkResults<T>, SortingError>
    where
        T: Send,
        F: Fn(&Chunk, ArrayView2<f32>) -> Result<T, SortingError> + Sync,
    {
        let chunk_size = self.job.chunk_size(
            self.recording.sampling_frequency(), self.recording.num_channels()
        );
        let chunks = divide_recording_into_chunks(self.recording, chunk_size)?;

        self.run_on_chunks(&chunks, func)
    }

    /// Processes an explicit chunk plan
    pub fn run_on_chunks<T, F>(&self, chunks: &[Chunk], func: F) -> Result<ChunkResults<T>, SortingError>
    where
        T: Send,
        F: Fn(&Chunk, ArrayView2<f32>) -> Result<T, SortingError> + Sync,
    {
        let margin = self.margin as i64;
        let outputs: Vec<Result<T, SortingError>> = self.pool.install(|| {
            chunks.par_iter()
                .map(|chunk| {
                    let traces = get_traces_padded(
                        self.recording,
                        chunk.segment_index,
                        chunk.start_frame as i64 - margin,
                        chunk.end_frame as i64 + margin,
                    )?;

                    func(chunk, traces.view())
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outputs.len());
        let mut dropped_chunks = 0;

        for (chunk, output) in chunks.iter().zip(outputs) {
            match output {
                Ok(value) => results.push((*chunk, value)),
                Err(err) if self.policy == FailurePolicy::DropChunk && err.is_recoverable() => {
                    log::warn!(
                        "{}: dropping chunk {}..{} of segment {}: {}",
                        self.job_name, chunk.start_frame, chunk.end_frame, chunk.segment_index, err,
                    );
                    dropped_chunks += 1;
                },
                Err(err) => return Err(err),
            }
        }

        log::debug!("{}: processed {} chunks", self.job_name, results.len());

        Ok(ChunkResults { results, dropped_chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use crate::error::MatchingError;
    use crate::recording::InMemoryRecording;

    fn recording() -> InMemoryRecording {
        InMemoryRecording::from_traces(
            1000., vec![Array2::ones((25, 2)), Array2::ones((10, 2))], 20.
        ).unwrap()
    }

    #[test]
    fn test_chunk_plan_covers_segments() {
        let chunks = divide_recording_into_chunks(&recording(), 10).unwrap();

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[2], Chunk { segment_index: 0, start_frame: 20, end_frame: 25 });
        assert_eq!(chunks[3], Chunk { segment_index: 1, start_frame: 0, end_frame: 10 });
    }

    #[test]
    fn test_margin_is_zero_padded() {
        let recording = recording();
        let job = JobParameters::sequential(10.);
        let executor = ChunkExecutor::new(&recording, &job, "sum").unwrap().with_margin(3);

        let output = executor.run(|_, traces| Ok(traces.sum())).unwrap();

        // first chunk of each segment misses its leading margin, last misses its trailing one
        let sums: Vec<f32> = output.results.iter().map(|(_, sum)| *sum).collect();
        assert_eq!(sums, vec![26., 32., 16., 20.]);
    }

    #[test]
    fn test_drop_chunk_policy() {
        let recording = recording();
        let job = JobParameters::sequential(10.);

        let failing = |chunk: &Chunk, _: ArrayView2<f32>| {
            if chunk.segment_index == 1 {
                Err(SortingError::from(MatchingError::NonFiniteTraces))
            } else {
                Ok(chunk.len())
            }
        };

        let dropped = ChunkExecutor::new(&recording, &job, "drop")
            .unwrap()
            .with_policy(FailurePolicy::DropChunk)
            .run(failing)
            .unwrap();
        assert_eq!(dropped.dropped_chunks, 1);
        assert_eq!(dropped.results.len(), 3);

        let aborted = ChunkExecutor::new(&recording, &job, "abort").unwrap().run(failing);
        assert!(aborted.is_err());
    }

    #[test]
    fn test_one_executor_runs_several_batches() -> Result<(), SortingError> {
        let recording = recording();
        let job = JobParameters { n_jobs: 2, ..JobParameters::sequential(10.) };
        let executor = ChunkExecutor::new(&recording, &job, "batches")?;
        let chunks = divide_recording_into_chunks(&recording, 5)?;

        let mut lengths = Vec::new();
        for batch in chunks.chunks(3) {
            let output = executor.run_on_chunks(batch, |chunk, traces| {
                assert_eq!(traces.nrows(), chunk.len());
                Ok(chunk.len())
            })?;
            lengths.extend(output.results.into_iter().map(|(_, len)| len));
        }

        assert_eq!(lengths, vec![5, 5, 5, 5, 5, 5, 5]);
        assert_eq!(executor.pool.current_num_threads(), 2);

        Ok(())
    }

    #[test]
    fn test_zero_workers_are_rejected_up_front() {
        let recording = recording();
        let job = JobParameters { n_jobs: 0, ..JobParameters::sequential(10.) };

        assert!(matches!(
            ChunkExecutor::new(&recording, &job, "empty pool"),
            Err(SortingError::ConfigurationRelatedError(ConfigurationError::InvalidParameter { .. }))
        ));
    }
}
