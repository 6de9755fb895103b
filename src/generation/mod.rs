//! Synthetic recordings with known units, used to exercise the pipeline end to end.

use std::result::Result;
use ndarray::{Array2, Array3, Axis, s};
use rand::{Rng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use crate::error::{SortingError, invalid_parameter};
use crate::peaks::{Peak, Spike};
use crate::recording::{InMemoryRecording, Probe};


/// One injected unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitParameters {
    /// Channel closest to the unit, where its trough is largest
    pub channel_index: usize,
    /// Depth of the trough on the closest channel
    pub amplitude: f32,
    pub firing_rate_hz: f64,
}

/// Settings of [`generate_ground_truth_recording`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundTruthParameters {
    pub sampling_frequency: f64,
    pub num_channels: usize,
    /// Distance between contacts of the linear probe
    pub pitch_um: f32,
    /// Duration of each segment (s)
    pub durations_s: Vec<f64>,
    pub units: Vec<UnitParameters>,
    /// Smallest interval between two spikes of one unit
    pub refractory_ms: f64,
    /// Standard deviation of the gaussian background
    pub noise_std: f32,
    /// Distance over which a template decays by a factor e
    pub spatial_decay_um: f32,
    pub ms_before: f64,
    pub ms_after: f64,
}

impl Default for GroundTruthParameters {
    fn default() -> Self {
        GroundTruthParameters {
            sampling_frequency: 30000.,
            num_channels: 4,
            pitch_um: 20.,
            durations_s: vec![10.],
            units: vec![
                UnitParameters { channel_index: 0, amplitude: 60., firing_rate_hz: 10. },
                UnitParameters { channel_index: 2, amplitude: 120., firing_rate_hz: 10. },
                UnitParameters { channel_index: 3, amplitude: 200., firing_rate_hz: 5. },
            ],
            refractory_ms: 4.,
            noise_std: 1.,
            spatial_decay_um: 25.,
            ms_before: 1.,
            ms_after: 2.,
        }
    }
}

impl GroundTruthParameters {
    pub fn validate(&self) -> Result<(), SortingError> {
        if !(self.sampling_frequency.is_finite() && self.sampling_frequency > 0.) {
            return Err(invalid_parameter("sampling_frequency", "must be positive"));
        }
        if self.num_channels == 0 {
            return Err(invalid_parameter("num_channels", "must be at least 1"));
        }
        if self.durations_s.iter().any(|duration| !(duration.is_finite() && *duration > 0.)) {
            return Err(invalid_parameter("durations_s", "segment durations must be positive"));
        }
        if let Some(unit) = self.units.iter().find(|unit| unit.channel_index >= self.num_channels) {
            return Err(invalid_parameter(
                "units", &format!("unit on channel {} of a {} channel probe", unit.channel_index, self.num_channels)
            ));
        }
        if self.units.iter().any(|unit| !(unit.firing_rate_hz.is_finite() && unit.firing_rate_hz >= 0.)) {
            return Err(invalid_parameter("firing_rate_hz", "must be non negative"));
        }
        if !(self.noise_std.is_finite() && self.noise_std >= 0.) {
            return Err(invalid_parameter("noise_std", "must be non negative"));
        }
        if !(self.spatial_decay_um.is_finite() && self.spatial_decay_um > 0.) {
            return Err(invalid_parameter("spatial_decay_um", "must be positive"));
        }

        Ok(())
    }

    fn to_samples(&self, ms: f64) -> usize {
        (ms * self.sampling_frequency / 1000.).round() as usize
    }
}

/// Generated recording with everything that was injected in it
#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub recording: InMemoryRecording,
    /// One peak per injected spike at the trough on the closest channel, ordered by
    /// `(segment_index, sample_index)`
    pub peaks: Vec<Peak>,
    /// Injected unit of each peak
    pub peak_units: Vec<usize>,
    /// Injected spikes, parallel to `peaks`
    pub spikes: Vec<Spike>,
    /// `(units, samples, channels)` templates, the trough sits at `nbefore`
    pub templates: Array3<f32>,
    pub nbefore: usize,
}

/// Biphasic shape with its trough equal to -1 at `nbefore`
fn waveform(num_samples: usize, nbefore: usize, sampling_frequency: f64) -> Vec<f32> {
    let ms_per_sample = 1000. / sampling_frequency;

    (0..num_samples)
        .map(|i| {
            let t = (i as f64 - nbefore as f64) * ms_per_sample;
            let trough = (-(t * t) / (2. * 0.15 * 0.15)).exp();
            let rebound = 0.3 * (-((t - 0.6) * (t - 0.6)) / (2. * 0.35 * 0.35)).exp();

            (rebound - trough) as f32
        })
        .collect()
}

fn generate_templates(params: &GroundTruthParameters, probe: &Probe, nbefore: usize, num_samples: usize) -> Array3<f32> {
    let shape = waveform(num_samples, nbefore, params.sampling_frequency);
    let trough = -shape[nbefore];
    let distances = probe.get_channel_distances();

    let mut templates = Array3::<f32>::zeros((params.units.len(), num_samples, params.num_channels));
    for (unit, unit_params) in params.units.iter().enumerate() {
        for channel in 0..params.num_channels {
            let decay = (-distances[[unit_params.channel_index, channel]] / params.spatial_decay_um).exp();
            let scale = unit_params.amplitude * decay / trough;

            for (sample, value) in shape.iter().enumerate() {
                templates[[unit, sample, channel]] = scale * value;
            }
        }
    }

    templates
}

/// Draws `count` spike samples in `low..high` at least `refractory` samples apart
fn spike_train(count: usize, low: usize, high: usize, refractory: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut train: Vec<usize> = Vec::with_capacity(count);
    if high <= low {
        return train;
    }

    let max_attempts = 100 * count.max(1);
    let mut attempts = 0;

    while train.len() < count && attempts < max_attempts {
        attempts += 1;
        let candidate = rng.gen_range(low..high);
        let position = train.partition_point(|sample| *sample < candidate);

        let clear_before = position == 0 || candidate - train[position - 1] >= refractory;
        let clear_after = position == train.len() || train[position] - candidate >= refractory;

        if clear_before && clear_after {
            train.insert(position, candidate);
        }
    }

    if train.len() < count {
        log::warn!("generation: only {} of {} spikes fit in the segment", train.len(), count);
    }

    train
}

/// Generates a recording on a linear probe where each unit fires a refractory train
/// of one fixed template over gaussian noise
pub fn generate_ground_truth_recording(
    params: &GroundTruthParameters,
    rng: &mut StdRng,
) -> Result<GroundTruth, SortingError> {
    params.validate()?;

    let probe = Probe::linear(params.num_channels, params.pitch_um);
    let nbefore = params.to_samples(params.ms_before);
    let num_samples = nbefore + params.to_samples(params.ms_after);
    let refractory = params.to_samples(params.refractory_ms).max(1);
    let templates = generate_templates(params, &probe, nbefore, num_samples);

    let noise = Normal::new(0., params.noise_std)
        .map_err(|err| invalid_parameter("noise_std", &err.to_string()))?;

    let mut traces = Vec::with_capacity(params.durations_s.len());
    let mut spikes = Vec::new();

    for (segment_index, duration) in params.durations_s.iter().enumerate() {
        let num_frames = (duration * params.sampling_frequency).round() as usize;
        let mut segment = Array2::from_shape_simple_fn((num_frames, params.num_channels), || noise.sample(rng));

        for (unit_index, unit) in params.units.iter().enumerate() {
            let count = (unit.firing_rate_hz * duration).round() as usize;
            let train = spike_train(count, nbefore, num_frames.saturating_sub(num_samples - nbefore), refractory, rng);

            for sample in train {
                let start = sample - nbefore;
                let mut window = segment.slice_mut(s![start..start + num_samples, ..]);
                window += &templates.index_axis(Axis(0), unit_index);

                spikes.push(Spike { sample_index: sample as i64, unit_index, segment_index });
            }
        }

        traces.push(segment);
    }

    spikes.sort_by_key(|spike| (spike.segment_index, spike.sample_index, spike.unit_index));

    let peaks = spikes.iter()
        .map(|spike| {
            let channel_index = params.units[spike.unit_index].channel_index;
            Peak {
                sample_index: spike.sample_index,
                channel_index,
                segment_index: spike.segment_index,
                amplitude: traces[spike.segment_index][[spike.sample_index as usize, channel_index]],
            }
        })
        .collect();
    let peak_units = spikes.iter().map(|spike| spike.unit_index).collect();

    let channel_ids = (0..params.num_channels).map(|i| i.to_string()).collect();
    let recording = InMemoryRecording::new(params.sampling_frequency, traces, channel_ids, probe)?;

    log::debug!("generation: {} spikes from {} units", spikes.len(), params.units.len());

    Ok(GroundTruth { recording, peaks, peak_units, spikes, templates, nbefore })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::recording::Recording;

    #[test]
    fn test_spike_trains_respect_refractory_period() -> Result<(), SortingError> {
        let params = GroundTruthParameters { durations_s: vec![2., 1.], ..GroundTruthParameters::default() };
        let truth = generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(1))?;

        assert_eq!(truth.recording.num_segments(), 2);
        assert_eq!(truth.peaks.len(), truth.spikes.len());

        let refractory = params.to_samples(params.refractory_ms) as i64;
        for unit in 0..params.units.len() {
            for segment in 0..2 {
                let train: Vec<i64> = truth.spikes.iter()
                    .filter(|spike| spike.unit_index == unit && spike.segment_index == segment)
                    .map(|spike| spike.sample_index)
                    .collect();
                assert!(train.windows(2).all(|pair| pair[1] - pair[0] >= refractory));
            }
        }

        Ok(())
    }

    #[test]
    fn test_template_trough_on_closest_channel() -> Result<(), SortingError> {
        let params = GroundTruthParameters::default();
        let truth = generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(3))?;

        for (unit, unit_params) in params.units.iter().enumerate() {
            let trough = truth.templates[[unit, truth.nbefore, unit_params.channel_index]];
            assert!((trough + unit_params.amplitude).abs() < 1e-3);
        }

        Ok(())
    }

    #[test]
    fn test_generation_is_seeded() -> Result<(), SortingError> {
        let params = GroundTruthParameters { durations_s: vec![1.], ..GroundTruthParameters::default() };

        let first = generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(5))?;
        let second = generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(5))?;

        assert_eq!(first.peaks, second.peaks);
        assert_eq!(first.recording.segment(0), second.recording.segment(0));

        Ok(())
    }
}
