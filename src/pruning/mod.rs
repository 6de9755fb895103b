//! Removal of templates that are too weak or empty once sparsified, with the labels of
//! removed units reset to noise.

use std::collections::HashSet;
use std::result::Result;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use crate::error::{ConfigurationError, SortingError, invalid_parameter};
use crate::peaks::PeakLabels;
use crate::sparsity::{SparsityMethod, compute_sparsity};
use crate::templates::{AmplitudeMode, PeakSign, Templates, get_template_amplitudes};


/// Settings of [`prune_templates`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningParameters {
    /// Rule producing the channel mask of each template
    pub sparsity: SparsityMethod,
    /// Minimal signal to noise ratio at the peak sample of the best channel,
    /// `None` skips the check
    pub noise_threshold: Option<f32>,
}

impl Default for PruningParameters {
    fn default() -> Self {
        PruningParameters {
            sparsity: SparsityMethod::Ptp { threshold: 0.25 },
            noise_threshold: None,
        }
    }
}

impl PruningParameters {
    pub fn validate(&self, num_channels: usize, noise_levels: Option<&Array1<f32>>) -> Result<(), SortingError> {
        if let Some(threshold) = self.noise_threshold {
            if !(threshold.is_finite() && threshold >= 0.) {
                return Err(invalid_parameter("noise_threshold", "must be a non negative number"));
            }
            if noise_levels.is_none() {
                return Err(ConfigurationError::NoiseLevelsRequired(String::from("noise_threshold")).into());
            }
        }

        self.sparsity.validate(num_channels, noise_levels)
    }
}

/// What pruning removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruningReport {
    pub removed_low_snr: usize,
    pub removed_empty: usize,
    pub reset_peaks: usize,
}

/// Signal to noise ratio of every template at its peak sample, on the channel where
/// the peak sample is largest
pub fn compute_template_snrs(templates: &Templates, noise_levels: &Array1<f32>) -> Vec<f32> {
    let at_peak = get_template_amplitudes(templates, PeakSign::Both, AmplitudeMode::AtIndex);

    at_peak.rows()
        .into_iter()
        .map(|amplitudes| {
            let best = amplitudes.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_value), (channel, value)| {
                    if *value > best_value { (channel, *value) } else { (best, best_value) }
                })
                .0;

            amplitudes[best] / noise_levels[best]
        })
        .collect()
}

/// Drops templates below the signal to noise threshold, sparsifies the rest, drops those
/// left empty and resets every peak label that pointed to a dropped unit
pub fn prune_templates(
    templates: Templates,
    mut peak_labels: PeakLabels,
    noise_levels: &Array1<f32>,
    params: &PruningParameters,
) -> Result<(Templates, PeakLabels, PruningReport), SortingError> {
    params.validate(templates.num_channels(), Some(noise_levels))?;

    let mut report = PruningReport::default();

    let templates = match params.noise_threshold {
        Some(threshold) if !templates.is_empty() => {
            let valid: Vec<usize> = compute_template_snrs(&templates, noise_levels)
                .iter()
                .enumerate()
                .filter(|(_, snr)| **snr > threshold)
                .map(|(unit, _)| unit)
                .collect();
            report.removed_low_snr = templates.num_units() - valid.len();

            templates.select_units(&valid)
        },
        _ => templates,
    };

    let templates = if templates.is_empty() {
        templates
    } else {
        let sparsity = compute_sparsity(&templates, Some(noise_levels), &params.sparsity)?;
        let sparse = templates.to_sparse(&sparsity)?;
        let kept = sparse.remove_empty_templates();
        report.removed_empty = sparse.num_units() - kept.num_units();

        kept
    };

    let valid: HashSet<i64> = templates.unit_ids.iter().copied().collect();
    report.reset_peaks = peak_labels.retain_units(&valid);

    log::debug!(
        "pruning: {} units kept, {} below snr threshold, {} empty, {} peaks reset",
        templates.num_units(), report.removed_low_snr, report.removed_empty, report.reset_peaks,
    );

    Ok((templates, peak_labels, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, array};
    use crate::recording::Probe;

    fn templates() -> Templates {
        let mut array = Array3::<f32>::zeros((3, 4, 2));
        array[[0, 1, 0]] = -10.;
        array[[1, 1, 1]] = -2.;
        array[[2, 1, 1]] = -0.1;

        Templates {
            templates_array: array,
            sparsity_mask: None,
            unit_ids: vec![0, 1, 2],
            channel_ids: vec!["0".into(), "1".into()],
            nbefore: 1,
            sampling_frequency: 1000.,
            probe: Probe::linear(2, 20.),
        }
    }

    #[test]
    fn test_snr_pruning_resets_labels() -> Result<(), SortingError> {
        let labels = PeakLabels::from_vec(vec![0, 1, 2, -1, 1]);
        let params = PruningParameters {
            sparsity: SparsityMethod::Ptp { threshold: 0.25 },
            noise_threshold: Some(4.),
        };

        let (kept, labels, report) = prune_templates(templates(), labels, &array![1., 1.], &params)?;

        assert_eq!(kept.unit_ids, vec![0]);
        assert_eq!(labels.as_slice(), &[0, -1, -1, -1, -1]);
        assert_eq!(report.removed_low_snr, 2);
        assert_eq!(report.reset_peaks, 3);
        assert!(labels.is_consistent_with(&kept.unit_ids));

        Ok(())
    }

    #[test]
    fn test_sparsity_removes_empty() -> Result<(), SortingError> {
        let labels = PeakLabels::from_vec(vec![2, 2, 0]);

        let (kept, labels, report) = prune_templates(templates(), labels, &array![1., 1.], &PruningParameters::default())?;

        assert_eq!(kept.unit_ids, vec![0, 1]);
        assert_eq!(report.removed_empty, 1);
        assert_eq!(labels.as_slice(), &[-1, -1, 0]);
        let mask = kept.sparsity_mask.unwrap();
        assert_eq!(mask.row(0).to_vec(), vec![true, false]);

        Ok(())
    }
}
