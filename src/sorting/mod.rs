//! Spike trains grouped by unit and segment, the artifact handed to downstream consumers.

use std::collections::HashMap;
use std::result::Result;
use serde::{Deserialize, Serialize};
use crate::error::{SortingError, invalid_parameter};
use crate::peaks::{MatchedSpike, Peak, PeakLabels, Spike, spikes_from_labels};


/// Sorted spikes, `unit_index` of every spike indexes `unit_ids`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sorting {
    pub sampling_frequency: f64,
    pub unit_ids: Vec<i64>,
    /// Ordered by `(segment_index, sample_index, unit_index)`
    pub spikes: Vec<Spike>,
}

impl Sorting {
    pub fn new(sampling_frequency: f64, unit_ids: Vec<i64>, mut spikes: Vec<Spike>) -> Result<Self, SortingError> {
        if let Some(spike) = spikes.iter().find(|spike| spike.unit_index >= unit_ids.len()) {
            return Err(invalid_parameter("spikes", &format!("unit index {} has no unit id", spike.unit_index)));
        }

        spikes.sort_by_key(|spike| (spike.segment_index, spike.sample_index, spike.unit_index));

        Ok(Sorting { sampling_frequency, unit_ids, spikes })
    }

    /// Builds a sorting from clustered peaks, noise peaks are left out
    pub fn from_peak_labels(
        sampling_frequency: f64,
        peaks: &[Peak],
        peak_labels: &PeakLabels,
        labels: &[i64],
    ) -> Result<Self, SortingError> {
        if peaks.len() != peak_labels.len() {
            return Err(invalid_parameter("peak_labels", "expected one label per peak"));
        }

        Sorting::new(sampling_frequency, labels.to_vec(), spikes_from_labels(peaks, peak_labels, labels))
    }

    /// Builds a sorting from matched spikes, `unit_index` indexes `unit_ids`
    pub fn from_matched_spikes(
        sampling_frequency: f64,
        matched: &[MatchedSpike],
        unit_ids: &[i64],
    ) -> Result<Self, SortingError> {
        let spikes = matched.iter()
            .map(|spike| Spike {
                sample_index: spike.sample_index,
                unit_index: spike.unit_index,
                segment_index: spike.segment_index,
            })
            .collect();

        Sorting::new(sampling_frequency, unit_ids.to_vec(), spikes)
    }

    pub fn num_units(&self) -> usize {
        self.unit_ids.len()
    }

    /// Spike samples of one unit in one segment, in increasing order
    pub fn get_unit_spike_train(&self, unit_id: i64, segment_index: usize) -> Vec<i64> {
        let unit_index = match self.unit_ids.iter().position(|id| *id == unit_id) {
            Some(unit_index) => unit_index,
            None => return Vec::new(),
        };

        self.spikes.iter()
            .filter(|spike| spike.unit_index == unit_index && spike.segment_index == segment_index)
            .map(|spike| spike.sample_index)
            .collect()
    }

    /// Number of spikes of every unit across segments
    pub fn count_num_spikes_per_unit(&self) -> HashMap<i64, usize> {
        let mut counts: HashMap<i64, usize> = self.unit_ids.iter().map(|id| (*id, 0)).collect();
        for spike in &self.spikes {
            if let Some(count) = counts.get_mut(&self.unit_ids[spike.unit_index]) {
                *count += 1;
            }
        }

        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spike_trains_from_labels() -> Result<(), SortingError> {
        let peaks: Vec<Peak> = [(0, 30), (0, 10), (1, 5), (0, 20)].iter()
            .map(|(segment_index, sample_index)| Peak {
                sample_index: *sample_index, channel_index: 0, segment_index: *segment_index, amplitude: -5.,
            })
            .collect();
        let labels = PeakLabels::from_vec(vec![4, 4, 4, -1]);

        let sorting = Sorting::from_peak_labels(30000., &peaks, &labels, &[4, 8])?;

        assert_eq!(sorting.get_unit_spike_train(4, 0), vec![10, 30]);
        assert_eq!(sorting.get_unit_spike_train(4, 1), vec![5]);
        assert!(sorting.get_unit_spike_train(8, 0).is_empty());
        assert_eq!(sorting.count_num_spikes_per_unit(), HashMap::from([(4, 3), (8, 0)]));

        Ok(())
    }

    #[test]
    fn test_unknown_unit_index_is_rejected() {
        let matched = vec![MatchedSpike { sample_index: 3, unit_index: 2, segment_index: 0, amplitude: 1. }];

        assert!(Sorting::from_matched_spikes(30000., &matched, &[0, 1]).is_err());
    }
}
