//! Peak events, spike records and the label array threaded through the clustering stages.

use std::collections::{BTreeSet, HashMap, HashSet};
use rand::{rngs::StdRng, seq::index::sample};
use serde::{Deserialize, Serialize};


/// Label of a peak that belongs to no unit
pub const NOISE_LABEL: i64 = -1;

/// A detected candidate spike event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Sample of the extremum within its segment
    pub sample_index: i64,
    /// Channel where the extremum was detected
    pub channel_index: usize,
    /// Segment the peak belongs to
    pub segment_index: usize,
    /// Signed amplitude at the extremum
    pub amplitude: f32,
}

/// A spike attributed to a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Spike {
    pub sample_index: i64,
    pub unit_index: usize,
    pub segment_index: usize,
}

/// A spike reconstructed by template matching
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchedSpike {
    pub sample_index: i64,
    pub unit_index: usize,
    pub segment_index: usize,
    /// Scaling of the template that best explains the event
    pub amplitude: f32,
}

/// Indices of `peaks` ordered by `(segment_index, sample_index)`, ties keep input order
pub fn argsort_peaks(peaks: &[Peak]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by_key(|&i| (peaks[i].segment_index, peaks[i].sample_index));

    order
}

/// Selects at most `n_peaks` peaks uniformly at random, the selection is returned
/// ordered by `(segment_index, sample_index)`
pub fn select_peaks(peaks: &[Peak], n_peaks: usize, rng: &mut StdRng) -> Vec<Peak> {
    select_peak_indices(peaks, n_peaks, rng)
        .into_iter()
        .map(|i| peaks[i])
        .collect()
}

/// Same as [`select_peaks`] but returns indices into `peaks`
pub fn select_peak_indices(peaks: &[Peak], n_peaks: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut indices = if peaks.len() <= n_peaks {
        (0..peaks.len()).collect::<Vec<usize>>()
    } else {
        sample(rng, peaks.len(), n_peaks).into_vec()
    };

    indices.sort_by_key(|&i| (peaks[i].segment_index, peaks[i].sample_index, i));

    indices
}

/// Label per peak, `-1` marks noise and any other value a unit identifier
///
/// Stages take the array by value and hand it back, so that only the stage
/// currently running can rewrite it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakLabels(Vec<i64>);

impl PeakLabels {
    /// Every peak marked as noise
    pub fn noise(num_peaks: usize) -> Self {
        PeakLabels(vec![NOISE_LABEL; num_peaks])
    }

    pub fn from_vec(labels: Vec<i64>) -> Self {
        PeakLabels(labels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        self.0.get(index).copied()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &i64> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<i64> {
        self.0
    }

    pub(crate) fn set(&mut self, index: usize, label: i64) {
        self.0[index] = label;
    }

    /// Sorted unique non-noise labels
    pub fn unique_labels(&self) -> Vec<i64> {
        self.0.iter()
            .filter(|label| **label > NOISE_LABEL)
            .copied()
            .collect::<BTreeSet<i64>>()
            .into_iter()
            .collect()
    }

    /// Resets every label that is not in `valid` to noise, returns how many peaks were reset
    pub fn retain_units(&mut self, valid: &HashSet<i64>) -> usize {
        let mut reset = 0;
        for label in self.0.iter_mut() {
            if *label > NOISE_LABEL && !valid.contains(label) {
                *label = NOISE_LABEL;
                reset += 1;
            }
        }

        reset
    }

    /// Rewrites labels through `mapping`, labels absent from the mapping are kept
    pub fn relabel(&mut self, mapping: &HashMap<i64, i64>) {
        for label in self.0.iter_mut() {
            if let Some(new_label) = mapping.get(label) {
                *label = *new_label;
            }
        }
    }

    /// Whether every non-noise label is one of `labels`
    pub fn is_consistent_with(&self, labels: &[i64]) -> bool {
        let valid: HashSet<i64> = labels.iter().copied().collect();
        self.0.iter().all(|label| *label == NOISE_LABEL || valid.contains(label))
    }
}

/// Builds the spike list of labelled peaks where the unit index is the position
/// of the label in `unit_ids`, peaks with noise or unknown labels are skipped
pub fn spikes_from_labels(peaks: &[Peak], peak_labels: &PeakLabels, unit_ids: &[i64]) -> Vec<Spike> {
    let unit_index: HashMap<i64, usize> = unit_ids.iter()
        .enumerate()
        .map(|(index, id)| (*id, index))
        .collect();

    peaks.iter()
        .zip(peak_labels.iter())
        .filter_map(|(peak, label)| {
            unit_index.get(label).map(|unit_index| Spike {
                sample_index: peak.sample_index,
                unit_index: *unit_index,
                segment_index: peak.segment_index,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn peaks_at(samples: &[(usize, i64)]) -> Vec<Peak> {
        samples.iter()
            .map(|(segment_index, sample_index)| Peak {
                sample_index: *sample_index, channel_index: 0, segment_index: *segment_index, amplitude: -10.,
            })
            .collect()
    }

    #[test]
    fn test_select_peaks_is_bounded_and_ordered() {
        let peaks = peaks_at(&(0..100).map(|i| ((i % 2) as usize, 1000 - i as i64)).collect::<Vec<_>>());
        let mut rng = StdRng::seed_from_u64(42);

        let selected = select_peaks(&peaks, 10, &mut rng);
        assert_eq!(selected.len(), 10);
        assert!(selected.windows(2).all(|w| (w[0].segment_index, w[0].sample_index) <= (w[1].segment_index, w[1].sample_index)));

        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(selected, select_peaks(&peaks, 10, &mut rng));

        let all = select_peaks(&peaks, 1000, &mut rng);
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn test_reset_and_relabel() {
        let mut labels = PeakLabels::from_vec(vec![0, 1, 2, -1, 1, 2]);

        let reset = labels.retain_units(&HashSet::from([0, 2]));
        assert_eq!(reset, 2);
        assert_eq!(labels.as_slice(), &[0, -1, 2, -1, -1, 2]);

        labels.relabel(&HashMap::from([(2, 0)]));
        assert_eq!(labels.unique_labels(), vec![0]);
        assert!(labels.is_consistent_with(&[0]));
        assert!(!labels.is_consistent_with(&[1]));
    }

    #[test]
    fn test_spikes_from_labels_skip_noise() {
        let peaks = peaks_at(&[(0, 5), (0, 10), (1, 3)]);
        let labels = PeakLabels::from_vec(vec![7, -1, 3]);

        let spikes = spikes_from_labels(&peaks, &labels, &[3, 7]);

        assert_eq!(spikes.len(), 2);
        assert_eq!(spikes[0].unit_index, 1);
        assert_eq!(spikes[1].unit_index, 0);
        assert_eq!(spikes[1].segment_index, 1);
    }
}
