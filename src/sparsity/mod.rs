//! Per-unit channel masks derived from template amplitudes or probe geometry.

use std::result::Result;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use crate::error::{ConfigurationError, SortingError, invalid_parameter};
use crate::templates::{
    AmplitudeMode, PeakSign, Templates, get_template_amplitudes, get_template_extremum_channel,
};


/// Rule selecting the active channels of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SparsityMethod {
    /// Channels with the largest amplitudes
    BestChannels { num_channels: usize, peak_sign: PeakSign },
    /// Channels within a distance of the extremum channel
    Radius { radius_um: f32, peak_sign: PeakSign },
    /// Channels whose amplitude over noise reaches the threshold
    Snr { threshold: f32, amplitude_mode: AmplitudeMode, peak_sign: PeakSign },
    /// Channels whose peak to peak amplitude over noise reaches the threshold
    Ptp { threshold: f32 },
}

impl SparsityMethod {
    pub fn name(&self) -> &'static str {
        match self {
            SparsityMethod::BestChannels { .. } => "best_channels",
            SparsityMethod::Radius { .. } => "radius",
            SparsityMethod::Snr { .. } => "snr",
            SparsityMethod::Ptp { .. } => "ptp",
        }
    }

    pub fn requires_noise_levels(&self) -> bool {
        matches!(self, SparsityMethod::Snr { .. } | SparsityMethod::Ptp { .. })
    }

    /// Checks the rule against the channel count and the available noise levels
    pub fn validate(&self, num_channels: usize, noise_levels: Option<&Array1<f32>>) -> Result<(), SortingError> {
        match self {
            SparsityMethod::BestChannels { num_channels: 0, .. } => {
                return Err(invalid_parameter("num_channels", "must be at least 1"));
            },
            SparsityMethod::Radius { radius_um, .. } if !(radius_um.is_finite() && *radius_um >= 0.) => {
                return Err(invalid_parameter("radius_um", "must be a non negative distance"));
            },
            SparsityMethod::Snr { threshold, .. } | SparsityMethod::Ptp { threshold }
                if !(threshold.is_finite() && *threshold >= 0.) => {
                return Err(invalid_parameter("threshold", "must be a non negative number"));
            },
            _ => {},
        }

        if self.requires_noise_levels() {
            match noise_levels {
                None => return Err(ConfigurationError::NoiseLevelsRequired(self.name().to_string()).into()),
                Some(levels) if levels.len() != num_channels => {
                    return Err(ConfigurationError::NoiseLevelsLengthMismatch {
                        expected: num_channels, found: levels.len(),
                    }.into());
                },
                _ => {},
            }
        }

        Ok(())
    }
}

/// `(units, channels)` mask of active channels
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSparsity {
    pub mask: Array2<bool>,
    pub unit_ids: Vec<i64>,
    pub channel_ids: Vec<String>,
}

impl ChannelSparsity {
    /// Number of active channels per unit
    pub fn num_active_channels(&self) -> Vec<usize> {
        self.mask.axis_iter(Axis(0))
            .map(|row| row.iter().filter(|active| **active).count())
            .collect()
    }
}

/// Computes the channel mask of every template
pub fn compute_sparsity(
    templates: &Templates,
    noise_levels: Option<&Array1<f32>>,
    method: &SparsityMethod,
) -> Result<ChannelSparsity, SortingError> {
    let num_channels = templates.num_channels();
    method.validate(num_channels, noise_levels)?;

    let shape = (templates.num_units(), num_channels);

    let mask = match method {
        SparsityMethod::BestChannels { num_channels: keep, peak_sign } => {
            let amplitudes = get_template_amplitudes(templates, *peak_sign, AmplitudeMode::Extremum);
            let mut mask = Array2::from_elem(shape, false);

            for (unit, row) in amplitudes.axis_iter(Axis(0)).enumerate() {
                let mut order: Vec<usize> = (0..num_channels).collect();
                order.sort_by(|a, b| row[*b].abs().total_cmp(&row[*a].abs()));
                for channel in order.into_iter().take(*keep) {
                    mask[[unit, channel]] = true;
                }
            }

            mask
        },
        SparsityMethod::Radius { radius_um, peak_sign } => {
            let distances = templates.probe.get_channel_distances();
            if distances.nrows() != num_channels {
                return Err(invalid_parameter("probe", "probe and templates disagree on the channel count"));
            }
            let best = get_template_extremum_channel(templates, *peak_sign, AmplitudeMode::Extremum);

            Array2::from_shape_fn(shape, |(unit, channel)| distances[[best[unit], channel]] <= *radius_um)
        },
        SparsityMethod::Snr { threshold, amplitude_mode, peak_sign } => {
            let amplitudes = get_template_amplitudes(templates, *peak_sign, *amplitude_mode);
            let noise = noise_levels.ok_or_else(|| ConfigurationError::NoiseLevelsRequired(method.name().to_string()))?;

            Array2::from_shape_fn(shape, |(unit, channel)| {
                amplitudes[[unit, channel]].abs() / noise[channel] >= *threshold
            })
        },
        SparsityMethod::Ptp { threshold } => {
            let amplitudes = get_template_amplitudes(templates, PeakSign::Both, AmplitudeMode::PeakToPeak);
            let noise = noise_levels.ok_or_else(|| ConfigurationError::NoiseLevelsRequired(method.name().to_string()))?;

            Array2::from_shape_fn(shape, |(unit, channel)| {
                amplitudes[[unit, channel]] / noise[channel] >= *threshold
            })
        },
    };

    Ok(ChannelSparsity {
        mask,
        unit_ids: templates.unit_ids.clone(),
        channel_ids: templates.channel_ids.clone(),
    })
}
