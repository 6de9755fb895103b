//! Template matching over a recording.
//!
//! A [`TemplateMatcher`] explains one block of traces as a sum of scaled templates.
//! [`find_spikes_from_templates`] runs it over every chunk of a recording, chunks that
//! fail with a recoverable error are dropped and counted.

use std::result::Result;
use ndarray::ArrayView2;
use crate::error::{ConfigurationError, MatchingError, SortingError};
use crate::job::{Chunk, ChunkExecutor, FailurePolicy, JobParameters};
use crate::peaks::MatchedSpike;
use crate::recording::Recording;
pub mod omp;


/// Spike found in a block of traces, `sample_index` is relative to the block start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSpike {
    pub sample_index: usize,
    pub unit_index: usize,
    pub amplitude: f32,
}

/// Explains traces with a fixed dictionary of templates
pub trait TemplateMatcher: Sync {
    /// Number of channels of the dictionary
    fn num_channels(&self) -> usize;
    /// Number of units of the dictionary
    fn num_units(&self) -> usize;
    /// Samples needed around a chunk so that spikes inside it are fully visible
    fn margin(&self) -> usize;
    /// Finds the spikes of a `(frames, channels)` block, units in `ignored_units`
    /// are never matched
    fn find_spikes(&self, traces: ArrayView2<f32>, ignored_units: &[usize]) -> Result<Vec<LocalSpike>, MatchingError>;
}

/// Matched spikes of a recording together with the chunks that had to be dropped
#[derive(Debug, Clone, Default)]
pub struct MatchingOutput {
    pub spikes: Vec<MatchedSpike>,
    pub dropped_chunks: usize,
}

/// Runs `matcher` chunk by chunk, `ignored_units` gives for each chunk the units
/// that must not be matched in it
pub(crate) fn match_chunks<R, M, F>(
    recording: &R,
    matcher: &M,
    job: &JobParameters,
    ignored_units: F,
) -> Result<MatchingOutput, SortingError>
where
    R: Recording + ?Sized,
    M: TemplateMatcher + ?Sized,
    F: Fn(&Chunk) -> Vec<usize> + Sync,
{
    let executor = ChunkExecutor::new(recording, job, "find spikes")?
        .with_margin(matcher.margin())
        .with_policy(FailurePolicy::DropChunk);
    let margin = executor.margin() as i64;

    let output = executor.run(|chunk, traces| {
        let local = matcher.find_spikes(traces, &ignored_units(chunk))?;

        Ok(local.into_iter()
            .map(|spike| MatchedSpike {
                sample_index: chunk.start_frame as i64 - margin + spike.sample_index as i64,
                unit_index: spike.unit_index,
                segment_index: chunk.segment_index,
                amplitude: spike.amplitude,
            })
            .filter(|spike| chunk.contains(spike.segment_index, spike.sample_index))
            .collect::<Vec<MatchedSpike>>())
    })?;

    let mut spikes: Vec<MatchedSpike> = output.results
        .into_iter()
        .flat_map(|(_, spikes)| spikes)
        .collect();
    spikes.sort_by_key(|spike| (spike.segment_index, spike.sample_index, spike.unit_index));

    Ok(MatchingOutput { spikes, dropped_chunks: output.dropped_chunks })
}

/// Reconstructs the spikes of a recording with a template dictionary
pub fn find_spikes_from_templates<R, M>(
    recording: &R,
    matcher: &M,
    job: &JobParameters,
) -> Result<MatchingOutput, SortingError>
where
    R: Recording + ?Sized,
    M: TemplateMatcher + ?Sized,
{
    if recording.num_channels() != matcher.num_channels() {
        return Err(ConfigurationError::ChannelCountMismatch {
            recording: recording.num_channels(),
            templates: matcher.num_channels(),
        }.into());
    }

    let output = match_chunks(recording, matcher, job, |_| Vec::new())?;

    if output.dropped_chunks > 0 {
        log::warn!("find spikes: {} chunks dropped", output.dropped_chunks);
    }
    log::info!("find spikes: {} spikes matched", output.spikes.len());

    Ok(output)
}
