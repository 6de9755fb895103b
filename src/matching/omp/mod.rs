//! Greedy matching pursuit with bounded template amplitudes.
//!
//! Scalar products between every template and every position of the traces are computed
//! once with FFT cross-correlation, then the best explained event is subtracted and the
//! scalar products around it are updated from precomputed template overlaps until no
//! position can be explained within the amplitude bounds.

use std::result::Result;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use super::{LocalSpike, TemplateMatcher};
use crate::error::{DependencyMissingError, MatchingError, SortingError, invalid_parameter};
use crate::templates::Templates;


/// Settings of [`MatchingPursuit`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingParameters {
    /// Smallest accepted scaling of a template
    pub amplitude_min: f32,
    /// Largest accepted scaling of a template
    pub amplitude_max: f32,
}

impl Default for MatchingParameters {
    fn default() -> Self {
        MatchingParameters { amplitude_min: 0.6, amplitude_max: 2. }
    }
}

impl MatchingParameters {
    pub fn validate(&self) -> Result<(), SortingError> {
        if !(self.amplitude_min.is_finite() && self.amplitude_max.is_finite()) ||
            self.amplitude_min <= 0. || self.amplitude_min > self.amplitude_max {
            return Err(invalid_parameter("amplitudes", "bounds must satisfy 0 < min <= max"));
        }

        Ok(())
    }
}

/// Template dictionary prepared for matching
#[derive(Debug, Clone)]
pub struct MatchingPursuit {
    templates: Array3<f32>,
    active_channels: Vec<Vec<usize>>,
    /// Squared norm of each template
    norms: Vec<f32>,
    /// `overlaps[[k, j, d + num_samples - 1]]` is the scalar product of template `k` with
    /// template `j` shifted by `d` samples
    overlaps: Array3<f32>,
    nbefore: usize,
    params: MatchingParameters,
}

impl MatchingPursuit {
    /// Prepares the (masked) templates, the memory of the overlaps grows with the
    /// square of the number of units
    pub fn new(templates: &Templates, params: &MatchingParameters) -> Result<Self, SortingError> {
        if !cfg!(feature = "matching") {
            return Err(DependencyMissingError::TemplateMatching.into());
        }
        params.validate()?;

        let num_units = templates.num_units();
        let num_samples = templates.num_samples();

        let mut masked = templates.templates_array.clone();
        let mut active_channels = Vec::with_capacity(num_units);
        for (unit, mut template) in masked.axis_iter_mut(Axis(0)).enumerate() {
            let mask = templates.get_sparsity_mask(unit);
            let mut active = Vec::new();
            for (channel, mut trace) in template.axis_iter_mut(Axis(1)).enumerate() {
                if mask[channel] && trace.iter().any(|x| *x != 0.) {
                    active.push(channel);
                } else {
                    trace.fill(0.);
                }
            }
            active_channels.push(active);
        }

        if let Some(unit) = (0..num_units).find(|&unit| !templates.has_finite_template(unit)) {
            return Err(MatchingError::NonFiniteTemplate(unit).into());
        }

        let norms: Vec<f32> = masked.axis_iter(Axis(0))
            .map(|template| template.iter().map(|x| x * x).sum())
            .collect();

        let num_shifts = (2 * num_samples).saturating_sub(1);
        let rows: Vec<Array2<f32>> = (0..num_units).into_par_iter()
            .map(|k| {
                let mut row = Array2::<f32>::zeros((num_units, num_shifts));
                for j in 0..num_units {
                    let common: Vec<usize> = active_channels[k].iter()
                        .copied()
                        .filter(|channel| active_channels[j].contains(channel))
                        .collect();
                    if common.is_empty() {
                        continue;
                    }

                    for shift in 0..num_shifts {
                        let delta = shift as i64 - (num_samples as i64 - 1);
                        let mut total = 0.;
                        for s in 0..num_samples as i64 {
                            let t = s + delta;
                            if t < 0 || t >= num_samples as i64 {
                                continue;
                            }
                            for &channel in &common {
                                total += masked[[k, s as usize, channel]] * masked[[j, t as usize, channel]];
                            }
                        }
                        row[[j, shift]] = total;
                    }
                }

                row
            })
            .collect();

        let mut overlaps = Array3::<f32>::zeros((num_units, num_units, num_shifts));
        for (k, row) in rows.into_iter().enumerate() {
            overlaps.index_axis_mut(Axis(0), k).assign(&row);
        }

        Ok(MatchingPursuit {
            templates: masked,
            active_channels,
            norms,
            overlaps,
            nbefore: templates.nbefore,
            params: params.clone(),
        })
    }

    pub fn num_samples(&self) -> usize {
        self.templates.len_of(Axis(1))
    }

    /// Scalar product of every template with every window of the traces, `(units, positions)`
    fn scalar_products(&self, traces: ArrayView2<f32>) -> Array2<f32> {
        let num_frames = traces.nrows();
        let num_samples = self.num_samples();
        let num_positions = num_frames + 1 - num_samples;
        let num_units = self.templates.len_of(Axis(0));

        let fft_size = (num_frames + num_samples - 1).next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        let mut used = vec![false; traces.ncols()];
        for channels in &self.active_channels {
            for &channel in channels {
                used[channel] = true;
            }
        }

        let spectra: Vec<Option<Vec<Complex<f32>>>> = (0..traces.ncols()).into_par_iter()
            .map(|channel| {
                if !used[channel] {
                    return None;
                }

                let mut buffer = vec![Complex::new(0., 0.); fft_size];
                for (value, x) in buffer.iter_mut().zip(traces.column(channel).iter()) {
                    *value = Complex::new(*x, 0.);
                }
                forward.process(&mut buffer);

                Some(buffer)
            })
            .collect();

        let rows: Vec<Vec<f32>> = (0..num_units).into_par_iter()
            .map(|unit| {
                let mut products = vec![0.; num_positions];
                let scale = 1. / fft_size as f32;

                for &channel in &self.active_channels[unit] {
                    let spectrum = match &spectra[channel] {
                        Some(spectrum) => spectrum,
                        None => continue,
                    };

                    // correlation is convolution with the reversed template
                    let mut buffer = vec![Complex::new(0., 0.); fft_size];
                    for s in 0..num_samples {
                        buffer[s] = Complex::new(self.templates[[unit, num_samples - 1 - s, channel]], 0.);
                    }
                    forward.process(&mut buffer);
                    for (value, x) in buffer.iter_mut().zip(spectrum.iter()) {
                        *value *= x;
                    }
                    inverse.process(&mut buffer);

                    for (position, product) in products.iter_mut().enumerate() {
                        *product += buffer[position + num_samples - 1].re * scale;
                    }
                }

                products
            })
            .collect();

        let mut scalar_products = Array2::<f32>::zeros((num_units, num_positions));
        for (unit, row) in rows.into_iter().enumerate() {
            for (position, value) in row.into_iter().enumerate() {
                scalar_products[[unit, position]] = value;
            }
        }

        scalar_products
    }

    /// Best explained `(unit, position, amplitude)` within the amplitude bounds
    fn best_candidate(&self, scalar_products: &Array2<f32>, ignored: &[bool]) -> Option<(usize, usize, f32)> {
        let mut best: Option<(usize, usize, f32, f32)> = None;

        for (unit, row) in scalar_products.axis_iter(Axis(0)).enumerate() {
            if ignored[unit] || self.norms[unit] <= 0. {
                continue;
            }

            for (position, product) in row.iter().enumerate() {
                let amplitude = product / self.norms[unit];
                if !(amplitude >= self.params.amplitude_min && amplitude <= self.params.amplitude_max) {
                    continue;
                }

                // decrease of the residual energy
                let gain = product * amplitude;
                if best.map_or(true, |(_, _, _, best_gain)| gain > best_gain) {
                    best = Some((unit, position, amplitude, gain));
                }
            }
        }

        best.map(|(unit, position, amplitude, _)| (unit, position, amplitude))
    }
}

impl TemplateMatcher for MatchingPursuit {
    fn num_channels(&self) -> usize {
        self.templates.len_of(Axis(2))
    }

    fn num_units(&self) -> usize {
        self.templates.len_of(Axis(0))
    }

    fn margin(&self) -> usize {
        self.num_samples()
    }

    fn find_spikes(&self, traces: ArrayView2<f32>, ignored_units: &[usize]) -> Result<Vec<LocalSpike>, MatchingError> {
        let num_samples = self.num_samples();
        let num_units = self.num_units();

        if traces.ncols() != self.num_channels() {
            return Err(MatchingError::ChannelMismatch { traces: traces.ncols(), templates: self.num_channels() });
        }
        if traces.nrows() < num_samples {
            return Err(MatchingError::ChunkTooShort { chunk_samples: traces.nrows(), template_samples: num_samples });
        }
        if traces.iter().any(|x| !x.is_finite()) {
            return Err(MatchingError::NonFiniteTraces);
        }
        if num_units == 0 || num_samples == 0 {
            return Ok(Vec::new());
        }

        let mut ignored = vec![false; num_units];
        for &unit in ignored_units.iter().filter(|unit| **unit < num_units) {
            ignored[unit] = true;
        }

        let mut scalar_products = self.scalar_products(traces);
        let num_positions = scalar_products.ncols();
        let max_iterations = num_positions * num_units;
        let mut spikes = Vec::new();

        while spikes.len() < max_iterations {
            let (unit, position, amplitude) = match self.best_candidate(&scalar_products, &ignored) {
                Some(candidate) => candidate,
                None => break,
            };

            spikes.push(LocalSpike { sample_index: position + self.nbefore, unit_index: unit, amplitude });

            let first = position.saturating_sub(num_samples - 1);
            let last = (position + num_samples).min(num_positions);
            for other in 0..num_units {
                let overlaps = self.overlaps.slice(ndarray::s![other, unit, ..]);
                for p in first..last {
                    let shift = p + num_samples - 1 - position;
                    scalar_products[[other, p]] -= amplitude * overlaps[shift];
                }
            }
        }

        spikes.sort_by_key(|spike| (spike.sample_index, spike.unit_index));

        Ok(spikes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, s};
    use crate::recording::Probe;

    fn dictionary() -> Templates {
        let mut array = Array3::<f32>::zeros((2, 6, 2));
        for (s, value) in [0., -2., -10., -4., 2., 0.].iter().enumerate() {
            array[[0, s, 0]] = *value;
            array[[1, s, 1]] = *value * 0.5;
        }

        Templates {
            templates_array: array,
            sparsity_mask: None,
            unit_ids: vec![0, 1],
            channel_ids: vec!["0".into(), "1".into()],
            nbefore: 2,
            sampling_frequency: 1000.,
            probe: Probe::linear(2, 20.),
        }
    }

    #[test]
    fn test_recovers_overlapping_spikes() {
        let templates = dictionary();
        let matcher = MatchingPursuit::new(&templates, &MatchingParameters::default()).unwrap();

        let mut traces = Array2::<f32>::zeros((40, 2));
        {
            let mut window = traces.slice_mut(s![8..14, ..]);
            window += &(&templates.unit(0) * 1.2);
        }
        {
            let mut window = traces.slice_mut(s![10..16, ..]);
            window += &templates.unit(1);
        }
        {
            let mut window = traces.slice_mut(s![25..31, ..]);
            window += &templates.unit(0);
        }

        let spikes = matcher.find_spikes(traces.view(), &[]).unwrap();

        assert_eq!(spikes.len(), 3);
        assert_eq!((spikes[0].sample_index, spikes[0].unit_index), (10, 0));
        assert!((spikes[0].amplitude - 1.2).abs() < 1e-3);
        assert_eq!((spikes[1].sample_index, spikes[1].unit_index), (12, 1));
        assert_eq!((spikes[2].sample_index, spikes[2].unit_index), (27, 0));
    }

    #[test]
    fn test_amplitude_bounds_and_ignored_units() {
        let templates = dictionary();
        let matcher = MatchingPursuit::new(&templates, &MatchingParameters::default()).unwrap();

        let mut traces = Array2::<f32>::zeros((30, 2));
        {
            let mut window = traces.slice_mut(s![5..11, ..]);
            window += &(&templates.unit(0) * 0.3);
        }
        {
            let mut window = traces.slice_mut(s![15..21, ..]);
            window += &templates.unit(1);
        }

        let spikes = matcher.find_spikes(traces.view(), &[]).unwrap();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].unit_index, 1);

        let spikes = matcher.find_spikes(traces.view(), &[1]).unwrap();
        assert!(spikes.is_empty());
    }

    #[test]
    fn test_invalid_chunks() {
        let matcher = MatchingPursuit::new(&dictionary(), &MatchingParameters::default()).unwrap();

        let short = Array2::<f32>::zeros((3, 2));
        assert!(matches!(matcher.find_spikes(short.view(), &[]), Err(MatchingError::ChunkTooShort { .. })));

        let mut nan = Array2::<f32>::zeros((30, 2));
        nan[[4, 0]] = f32::NAN;
        assert_eq!(matcher.find_spikes(nan.view(), &[]), Err(MatchingError::NonFiniteTraces));

        let wide = Array2::<f32>::zeros((30, 3));
        assert!(matches!(matcher.find_spikes(wide.view(), &[]), Err(MatchingError::ChannelMismatch { .. })));
    }

    #[test]
    fn test_non_finite_templates_are_rejected() {
        let mut templates = dictionary();
        templates.templates_array[[1, 3, 1]] = f32::NAN;

        match MatchingPursuit::new(&templates, &MatchingParameters::default()) {
            Err(SortingError::MatchingRelatedError(MatchingError::NonFiniteTemplate(unit))) => assert_eq!(unit, 1),
            other => panic!("expected a non finite template error, got {:?}", other.map(|_| ())),
        }

        // outside of the mask the sample is never read
        templates.sparsity_mask = Some(ndarray::array![[true, false], [true, false]]);
        templates.templates_array[[1, 2, 0]] = -1.;
        assert!(MatchingPursuit::new(&templates, &MatchingParameters::default()).is_ok());
    }
}
