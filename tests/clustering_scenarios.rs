#[cfg(test)]
mod tests {
    use ndarray::{Array2, array};
    use rand::{SeedableRng, rngs::StdRng};
    use spike_sorting_components::{
        clustering::{
            ClusteringMethod, ClusteringOutput, circus::CircusParameters,
            random_projections::RandomProjectionsParameters,
        },
        error::SortingError,
        generation::{GroundTruth, GroundTruthParameters, UnitParameters, generate_ground_truth_recording},
        job::JobParameters,
        peaks::{NOISE_LABEL, Peak},
        recording::InMemoryRecording,
        sorter::{ClusteringConfig, find_clusters_from_peaks},
    };


    fn single_channel(units: Vec<UnitParameters>, seed: u64) -> Result<GroundTruth, SortingError> {
        let params = GroundTruthParameters {
            num_channels: 1,
            durations_s: vec![2.],
            units,
            ..GroundTruthParameters::default()
        };

        generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(seed))
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig { job: JobParameters::sequential(500.), ..ClusteringConfig::default() }
    }

    /// Share of each unit's peaks that come from its most represented injected population
    fn assert_units_are_pure(output: &ClusteringOutput, truth: &GroundTruth) {
        for unit in &output.labels {
            let injected: Vec<usize> = output.peak_labels.iter()
                .zip(truth.peak_units.iter())
                .filter(|(label, _)| *label == unit)
                .map(|(_, injected)| *injected)
                .collect();
            let first = injected.iter().filter(|injected| **injected == 0).count();
            let majority = first.max(injected.len() - first);
            assert!(majority * 10 >= injected.len() * 9);
        }
    }

    #[test]
    pub fn test_identical_waveforms_give_one_unit() -> Result<(), SortingError> {
        let truth = single_channel(
            vec![UnitParameters { channel_index: 0, amplitude: 100., firing_rate_hz: 50. }], 11,
        )?;
        assert_eq!(truth.peaks.len(), 100);

        let method = ClusteringMethod::Circus(CircusParameters::default());
        let output = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;

        assert_eq!(output.labels.len(), 1);
        let unit = output.labels[0];
        let labelled = output.peak_labels.iter().filter(|label| **label == unit).count();
        assert!(labelled > 50, "only {} of 100 peaks labelled", labelled);
        assert!(output.peak_labels.iter().all(|label| *label == unit || *label == NOISE_LABEL));

        Ok(())
    }

    #[test]
    pub fn test_two_amplitude_populations_give_two_units() -> Result<(), SortingError> {
        let truth = single_channel(
            vec![
                UnitParameters { channel_index: 0, amplitude: 50., firing_rate_hz: 50. },
                UnitParameters { channel_index: 0, amplitude: 200., firing_rate_hz: 50. },
            ],
            12,
        )?;

        let method = ClusteringMethod::Circus(CircusParameters::default());
        let output = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;

        assert_eq!(output.labels.len(), 2);
        assert!(output.peak_labels.is_consistent_with(&output.labels));

        // each unit gathers peaks of a single injected population
        assert_units_are_pure(&output, &truth);

        Ok(())
    }

    #[test]
    pub fn test_random_projections_identical_waveforms_give_one_unit() -> Result<(), SortingError> {
        let truth = single_channel(
            vec![UnitParameters { channel_index: 0, amplitude: 100., firing_rate_hz: 50. }], 14,
        )?;

        let method = ClusteringMethod::RandomProjections(RandomProjectionsParameters::default());
        let output = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;

        assert_eq!(output.labels.len(), 1);
        let unit = output.labels[0];
        let labelled = output.peak_labels.iter().filter(|label| **label == unit).count();
        assert!(labelled >= 40, "only {} of {} peaks labelled", labelled, truth.peaks.len());
        assert!(output.peak_labels.iter().all(|label| *label == unit || *label == NOISE_LABEL));

        Ok(())
    }

    #[test]
    pub fn test_random_projections_two_amplitude_populations_give_two_units() -> Result<(), SortingError> {
        let truth = single_channel(
            vec![
                UnitParameters { channel_index: 0, amplitude: 50., firing_rate_hz: 50. },
                UnitParameters { channel_index: 0, amplitude: 200., firing_rate_hz: 50. },
            ],
            15,
        )?;

        let method = ClusteringMethod::RandomProjections(RandomProjectionsParameters::default());
        let output = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;

        assert_eq!(output.labels.len(), 2);
        assert!(output.peak_labels.is_consistent_with(&output.labels));
        assert_units_are_pure(&output, &truth);

        Ok(())
    }

    #[test]
    pub fn test_failed_partition_is_marked_as_noise() -> Result<(), SortingError> {
        let params = GroundTruthParameters {
            num_channels: 2,
            pitch_um: 500.,
            durations_s: vec![2.],
            units: vec![UnitParameters { channel_index: 0, amplitude: 100., firing_rate_hz: 50. }],
            ..GroundTruthParameters::default()
        };
        let truth = generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(13))?;

        // second segment where channel 1 is corrupted
        let mut corrupted = Array2::<f32>::zeros((30000, 2));
        corrupted.column_mut(1).fill(f32::NAN);
        let traces = vec![truth.recording.segment(0).unwrap().clone(), corrupted];
        let recording = InMemoryRecording::from_traces(params.sampling_frequency, traces, params.pitch_um)?;

        let mut peaks = truth.peaks.clone();
        peaks.extend((0..30).map(|k| Peak {
            sample_index: 1000 + 900 * k, channel_index: 1, segment_index: 1, amplitude: -50.,
        }));

        let config = ClusteringConfig { noise_levels: Some(array![1., 1.]), ..config() };
        let method = ClusteringMethod::Circus(CircusParameters::default());
        let output = find_clusters_from_peaks(&recording, &peaks, &method, &config)?;

        assert_eq!(output.report.failed_partitions, 1);
        assert_eq!(output.labels.len(), 1);
        assert!(output.peak_labels.as_slice()[truth.peaks.len()..].iter().all(|label| *label == NOISE_LABEL));
        assert!(output.peak_labels.is_consistent_with(&output.labels));

        Ok(())
    }

    #[test]
    pub fn test_unfittable_temporal_basis_marks_every_peak_as_noise() -> Result<(), SortingError> {
        let traces = Array2::<f32>::from_elem((30000, 1), f32::NAN);
        let recording = InMemoryRecording::from_traces(30000., vec![traces], 20.)?;
        let peaks: Vec<Peak> = (0..40)
            .map(|k| Peak { sample_index: 500 + 700 * k, channel_index: 0, segment_index: 0, amplitude: -50. })
            .collect();

        let config = ClusteringConfig { noise_levels: Some(array![1.]), ..config() };
        let method = ClusteringMethod::Circus(CircusParameters::default());
        let output = find_clusters_from_peaks(&recording, &peaks, &method, &config)?;

        assert!(output.labels.is_empty());
        assert_eq!(output.peak_labels.len(), peaks.len());
        assert!(output.peak_labels.iter().all(|label| *label == NOISE_LABEL));
        assert_eq!(output.report.failed_partitions, 1);

        Ok(())
    }
}
