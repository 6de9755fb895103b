//! Unit templates, their estimation from labelled spikes and amplitude helpers.

use std::result::Result;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use crate::error::{ConfigurationError, SortingError, invalid_parameter};
use crate::job::{ChunkExecutor, JobParameters, divide_recording_into_chunks};
use crate::peaks::Spike;
use crate::recording::{Probe, Recording};
use crate::sparsity::ChannelSparsity;
use crate::waveforms::WaveformWindow;


/// Mean waveform of every unit, `templates_array` is `(units, samples, channels)`,
/// channels outside a unit's sparsity mask are zero
#[derive(Debug, Clone, PartialEq)]
pub struct Templates {
    pub templates_array: Array3<f32>,
    /// `(units, channels)` active channels, `None` means every channel is active
    pub sparsity_mask: Option<Array2<bool>>,
    pub unit_ids: Vec<i64>,
    pub channel_ids: Vec<String>,
    pub nbefore: usize,
    pub sampling_frequency: f64,
    pub probe: Probe,
}

impl Templates {
    pub fn num_units(&self) -> usize {
        self.templates_array.len_of(Axis(0))
    }

    pub fn num_samples(&self) -> usize {
        self.templates_array.len_of(Axis(1))
    }

    pub fn num_channels(&self) -> usize {
        self.templates_array.len_of(Axis(2))
    }

    pub fn nafter(&self) -> usize {
        self.num_samples() - self.nbefore
    }

    pub fn window(&self) -> WaveformWindow {
        WaveformWindow { nbefore: self.nbefore, nafter: self.nafter() }
    }

    pub fn is_empty(&self) -> bool {
        self.num_units() == 0
    }

    /// `(samples, channels)` template of the unit at `unit_index`
    pub fn unit(&self, unit_index: usize) -> ArrayView2<f32> {
        self.templates_array.index_axis(Axis(0), unit_index)
    }

    /// Active channels of the unit at `unit_index`
    pub fn get_sparsity_mask(&self, unit_index: usize) -> Array1<bool> {
        match &self.sparsity_mask {
            Some(mask) => mask.row(unit_index).to_owned(),
            None => Array1::from_elem(self.num_channels(), true),
        }
    }

    /// Zeroes the channels outside of `sparsity` and keeps the mask
    pub fn to_sparse(&self, sparsity: &ChannelSparsity) -> Result<Templates, SortingError> {
        if sparsity.mask.dim() != (self.num_units(), self.num_channels()) {
            return Err(invalid_parameter("sparsity", "mask shape does not match the templates"));
        }

        let mut templates_array = self.templates_array.clone();
        for (mut template, mask) in templates_array.axis_iter_mut(Axis(0)).zip(sparsity.mask.axis_iter(Axis(0))) {
            for (mut channel, active) in template.axis_iter_mut(Axis(1)).zip(mask.iter()) {
                if !active {
                    channel.fill(0.);
                }
            }
        }

        Ok(Templates {
            templates_array,
            sparsity_mask: Some(sparsity.mask.clone()),
            ..self.clone()
        })
    }

    /// Keeps the units at the given positions, in the given order
    pub fn select_units(&self, unit_indices: &[usize]) -> Templates {
        Templates {
            templates_array: self.templates_array.select(Axis(0), unit_indices),
            sparsity_mask: self.sparsity_mask.as_ref().map(|mask| mask.select(Axis(0), unit_indices)),
            unit_ids: unit_indices.iter().map(|i| self.unit_ids[*i]).collect(),
            ..self.clone()
        }
    }

    /// Whether every sample of the unit's active channels is finite
    pub fn has_finite_template(&self, unit_index: usize) -> bool {
        let mask = self.get_sparsity_mask(unit_index);

        self.unit(unit_index).axis_iter(Axis(1))
            .zip(mask.iter())
            .all(|(channel, active)| !*active || channel.iter().all(|x| x.is_finite()))
    }

    /// Drops units without any active channel, whose masked template is zero or whose
    /// masked template has non finite samples
    pub fn remove_empty_templates(&self) -> Templates {
        let kept: Vec<usize> = (0..self.num_units())
            .filter(|&i| {
                let mask = self.get_sparsity_mask(i);
                let has_signal = self.unit(i).axis_iter(Axis(1))
                    .zip(mask.iter())
                    .any(|(channel, active)| *active && channel.iter().any(|x| *x != 0.));

                mask.iter().any(|active| *active) && has_signal && self.has_finite_template(i)
            })
            .collect();

        self.select_units(&kept)
    }
}

/// Which lobe of a template defines its amplitude
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSign {
    Neg,
    Pos,
    Both,
}

/// How an amplitude is read from a template channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmplitudeMode {
    /// Extremum over the whole window
    Extremum,
    /// Value at the peak sample (`nbefore`)
    AtIndex,
    /// Maximum minus minimum
    PeakToPeak,
}

fn channel_amplitude(trace: ndarray::ArrayView1<f32>, nbefore: usize, peak_sign: PeakSign, mode: AmplitudeMode) -> f32 {
    let max = trace.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let min = trace.iter().copied().fold(f32::INFINITY, f32::min);
    if trace.is_empty() {
        return 0.;
    }

    match mode {
        AmplitudeMode::Extremum => match peak_sign {
            PeakSign::Neg => min,
            PeakSign::Pos => max,
            PeakSign::Both => max.abs().max(min.abs()),
        },
        AmplitudeMode::AtIndex => {
            let value = trace[nbefore.min(trace.len() - 1)];
            match peak_sign {
                PeakSign::Both => value.abs(),
                _ => value,
            }
        },
        AmplitudeMode::PeakToPeak => max - min,
    }
}

/// `(units, channels)` amplitudes
pub fn get_template_amplitudes(templates: &Templates, peak_sign: PeakSign, mode: AmplitudeMode) -> Array2<f32> {
    Array2::from_shape_fn((templates.num_units(), templates.num_channels()), |(unit, channel)| {
        channel_amplitude(
            templates.templates_array.slice(s![unit, .., channel]), templates.nbefore, peak_sign, mode
        )
    })
}

/// Channel index with the largest absolute amplitude, per unit
pub fn get_template_extremum_channel(templates: &Templates, peak_sign: PeakSign, mode: AmplitudeMode) -> Vec<usize> {
    get_template_amplitudes(templates, peak_sign, mode)
        .axis_iter(Axis(0))
        .map(|amplitudes| {
            amplitudes.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_value), (channel, value)| {
                    if value.abs() > best_value { (channel, value.abs()) } else { (best, best_value) }
                })
                .0
        })
        .collect()
}

/// Offset of the extremum sample relative to `nbefore` on the extremum channel, per unit
pub fn get_template_extremum_channel_peak_shift(templates: &Templates, peak_sign: PeakSign) -> Vec<i64> {
    let channels = get_template_extremum_channel(templates, peak_sign, AmplitudeMode::Extremum);

    channels.iter()
        .enumerate()
        .map(|(unit, &channel)| {
            let trace = templates.templates_array.slice(s![unit, .., channel]);
            let key = |x: f32| match peak_sign {
                PeakSign::Neg => -x,
                PeakSign::Pos => x,
                PeakSign::Both => x.abs(),
            };

            let position = trace.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, x)| {
                    if key(*x) > best_value { (i, key(*x)) } else { (best, best_value) }
                })
                .0;

            position as i64 - templates.nbefore as i64
        })
        .collect()
}

/// Absolute amplitude on the extremum channel, per unit
pub fn get_template_extremum_amplitude(templates: &Templates, peak_sign: PeakSign, mode: AmplitudeMode) -> Vec<f32> {
    let amplitudes = get_template_amplitudes(templates, peak_sign, mode);

    get_template_extremum_channel(templates, peak_sign, mode)
        .into_iter()
        .enumerate()
        .map(|(unit, channel)| amplitudes[[unit, channel]].abs())
        .collect()
}

/// Templates together with the number of spikes averaged for each unit
#[derive(Debug, Clone)]
pub struct EstimatedTemplates {
    pub templates: Templates,
    pub counts: Vec<usize>,
}

impl EstimatedTemplates {
    /// Drops the units that received no spike
    pub fn without_empty_units(&self) -> Templates {
        let kept: Vec<usize> = self.counts.iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, _)| i)
            .collect();

        self.templates.select_units(&kept)
    }
}

/// Averages the dense waveform of every spike per unit, `spikes[i].unit_index` indexes
/// `unit_ids`, traces are streamed chunk by chunk and the chunk sums are added in plan order
pub fn estimate_templates<R: Recording + ?Sized>(
    recording: &R,
    spikes: &[Spike],
    unit_ids: &[i64],
    window: WaveformWindow,
    job: &JobParameters,
) -> Result<EstimatedTemplates, SortingError> {
    job.validate()?;
    if window.num_samples() == 0 {
        return Err(ConfigurationError::EmptyWaveformWindow.into());
    }
    if let Some(spike) = spikes.iter().find(|spike| spike.unit_index >= unit_ids.len()) {
        return Err(invalid_parameter("spikes", &format!("unit index {} has no unit id", spike.unit_index)));
    }

    let num_units = unit_ids.len();
    let num_samples = window.num_samples();
    let num_channels = recording.num_channels();

    let mut order: Vec<usize> = (0..spikes.len()).collect();
    order.sort_by_key(|&i| (spikes[i].segment_index, spikes[i].sample_index));
    let keys: Vec<(usize, i64)> = order.iter()
        .map(|&i| (spikes[i].segment_index, spikes[i].sample_index))
        .collect();

    let chunk_size = job.chunk_size(recording.sampling_frequency(), num_channels);
    let chunks = divide_recording_into_chunks(recording, chunk_size)?;
    let executor = ChunkExecutor::new(recording, job, "estimate templates")?.with_margin(window.margin());
    let margin = executor.margin() as i64;

    let mut sums = Array3::<f64>::zeros((num_units, num_samples, num_channels));
    let mut counts = vec![0; num_units];

    // bounded number of partial sums alive at once
    let batch_size = job.n_jobs.max(1) * 4;
    for batch in chunks.chunks(batch_size) {
        let output = executor.run_on_chunks(batch, |chunk, traces| {
            let first = keys.partition_point(|key| *key < (chunk.segment_index, chunk.start_frame as i64));
            let last = keys.partition_point(|key| *key < (chunk.segment_index, chunk.end_frame as i64));

            let mut partial: Vec<(usize, Array2<f32>, usize)> = Vec::new();
            for &spike_index in &order[first..last] {
                let spike = &spikes[spike_index];
                let start = (spike.sample_index - chunk.start_frame as i64 + margin) as usize - window.nbefore;
                let snippet = traces.slice(s![start..start + num_samples, ..]);

                match partial.iter_mut().find(|(unit, _, _)| *unit == spike.unit_index) {
                    Some((_, sum, count)) => {
                        *sum += &snippet;
                        *count += 1;
                    },
                    None => partial.push((spike.unit_index, snippet.to_owned(), 1)),
                }
            }

            Ok(partial)
        })?;

        for (_, partial) in output.results {
            for (unit, sum, count) in partial {
                sums.index_axis_mut(Axis(0), unit).zip_mut_with(&sum, |total, x| *total += *x as f64);
                counts[unit] += count;
            }
        }
    }

    let skipped = spikes.len() - counts.iter().sum::<usize>();
    if skipped > 0 {
        log::warn!("estimate templates: {} spikes fall outside of the recording", skipped);
    }

    let mut templates_array = Array3::<f32>::zeros((num_units, num_samples, num_channels));
    for (unit, count) in counts.iter().enumerate() {
        if *count > 0 {
            let mean = sums.index_axis(Axis(0), unit).mapv(|x| (x / *count as f64) as f32);
            templates_array.index_axis_mut(Axis(0), unit).assign(&mean);
        }
    }

    Ok(EstimatedTemplates {
        templates: Templates {
            templates_array,
            sparsity_mask: None,
            unit_ids: unit_ids.to_vec(),
            channel_ids: recording.channel_ids().to_vec(),
            nbefore: window.nbefore,
            sampling_frequency: recording.sampling_frequency(),
            probe: recording.get_probe().clone(),
        },
        counts,
    })
}
