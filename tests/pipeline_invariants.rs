#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};
    use spike_sorting_components::{
        clustering::{
            ClusteringMethod, circus::CircusParameters, hdbscan::Hdbscan,
            random_projections::RandomProjectionsParameters,
        },
        error::{ConfigurationError, SortingError},
        generation::{GroundTruth, GroundTruthParameters, generate_ground_truth_recording},
        job::JobParameters,
        peaks::{NOISE_LABEL, Peak},
        recording::Recording,
        sorter::{ClusteringConfig, SelectionParameters, SorterParameters, find_clusters_from_peaks, run_sorter},
    };


    fn ground_truth(duration_s: f64, seed: u64) -> Result<GroundTruth, SortingError> {
        let params = GroundTruthParameters { durations_s: vec![duration_s], ..GroundTruthParameters::default() };

        generate_ground_truth_recording(&params, &mut StdRng::seed_from_u64(seed))
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig { job: JobParameters { n_jobs: 2, ..JobParameters::sequential(500.) }, ..ClusteringConfig::default() }
    }

    fn methods() -> Vec<ClusteringMethod> {
        vec![
            ClusteringMethod::Circus(CircusParameters::default()),
            ClusteringMethod::RandomProjections(RandomProjectionsParameters::default()),
        ]
    }

    #[test]
    pub fn test_fixed_seed_gives_identical_labels() -> Result<(), SortingError> {
        let truth = ground_truth(5., 31)?;

        for method in methods() {
            let first = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;
            let second = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;

            assert_eq!(first.labels, second.labels);
            assert_eq!(first.peak_labels, second.peak_labels);
        }

        Ok(())
    }

    #[test]
    pub fn test_every_label_is_noise_or_a_unit() -> Result<(), SortingError> {
        let truth = ground_truth(5., 32)?;

        for method in methods() {
            let output = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config())?;

            assert_eq!(output.peak_labels.len(), truth.peaks.len());
            assert!(output.labels.windows(2).all(|pair| pair[0] < pair[1]));
            assert!(
                output.peak_labels.iter()
                    .all(|label| *label == NOISE_LABEL || output.labels.contains(label))
            );
        }

        Ok(())
    }

    #[test]
    pub fn test_sorter_templates_are_consistent_with_recording() -> Result<(), SortingError> {
        let truth = ground_truth(5., 33)?;
        let params = SorterParameters { job: JobParameters::sequential(1000.), ..SorterParameters::default() };

        let output = run_sorter(&truth.recording, &truth.peaks, &params)?;

        assert!(output.templates.num_units() >= 1);
        assert_eq!(output.templates.num_channels(), truth.recording.num_channels());
        let mask = output.templates.sparsity_mask.as_ref().unwrap();
        assert_eq!(mask.ncols(), truth.recording.num_channels());
        assert!(mask.rows().into_iter().all(|row| row.iter().any(|active| *active)));

        assert_eq!(output.sorting.unit_ids, output.templates.unit_ids);
        assert!(output.sorting.spikes.iter().all(|spike| spike.unit_index < output.sorting.num_units()));
        assert!(
            output.sorting.spikes.windows(2)
                .all(|pair| (pair[0].segment_index, pair[0].sample_index) <= (pair[1].segment_index, pair[1].sample_index))
        );
        assert!(output.sorting.spikes.len() > truth.spikes.len() / 4);

        Ok(())
    }

    #[test]
    pub fn test_selection_bounds_the_globally_clustered_peaks() -> Result<(), SortingError> {
        let truth = ground_truth(10., 36)?;
        let params = SorterParameters {
            selection: SelectionParameters { n_peaks_per_channel: 50, min_n_peaks: 150 },
            clustering: ClusteringMethod::RandomProjections(RandomProjectionsParameters::default()),
            matching: None,
            job: JobParameters::sequential(1000.),
            ..SorterParameters::default()
        };
        assert!(truth.peaks.len() > 200);

        let output = run_sorter(&truth.recording, &truth.peaks, &params)?;

        assert_eq!(output.selected_peaks.len(), 200);
        assert_eq!(output.clustering.peak_labels.len(), 200);
        assert!(output.selected_peaks.windows(2).all(|pair| {
            (pair[0].segment_index, pair[0].sample_index) <= (pair[1].segment_index, pair[1].sample_index)
        }));

        Ok(())
    }

    #[test]
    pub fn test_noise_levels_of_wrong_length_are_rejected() -> Result<(), SortingError> {
        let truth = ground_truth(1., 34)?;
        let config = ClusteringConfig { noise_levels: Some(array![1., 1.]), ..config() };

        let result = find_clusters_from_peaks(
            &truth.recording, &truth.peaks, &ClusteringMethod::Circus(CircusParameters::default()), &config,
        );

        match result {
            Err(SortingError::ConfigurationRelatedError(ConfigurationError::NoiseLevelsLengthMismatch { expected, found })) => {
                assert_eq!(expected, 4);
                assert_eq!(found, 2);
            },
            other => panic!("expected a noise level length mismatch, got {:?}", other.map(|output| output.labels)),
        }

        Ok(())
    }

    #[test]
    pub fn test_invalid_parameters_fail_before_clustering() -> Result<(), SortingError> {
        let truth = ground_truth(1., 35)?;

        let method = ClusteringMethod::Circus(CircusParameters {
            hdbscan: Hdbscan { min_cluster_size: 1, ..Hdbscan::default() },
            ..CircusParameters::default()
        });
        let result = find_clusters_from_peaks(&truth.recording, &truth.peaks, &method, &config());
        assert!(matches!(result, Err(SortingError::ConfigurationRelatedError(_))));

        let outside = vec![Peak { sample_index: 100, channel_index: 9, segment_index: 0, amplitude: -20. }];
        let result = find_clusters_from_peaks(&truth.recording, &outside, &methods()[0], &config());
        assert!(matches!(result, Err(SortingError::ConfigurationRelatedError(_))));

        let zero_jobs = ClusteringConfig { job: JobParameters { n_jobs: 0, ..JobParameters::default() }, ..config() };
        let result = find_clusters_from_peaks(&truth.recording, &truth.peaks, &methods()[0], &zero_jobs);
        assert!(matches!(result, Err(SortingError::ConfigurationRelatedError(_))));

        Ok(())
    }

    #[test]
    pub fn test_method_is_selected_by_tag() {
        let method: ClusteringMethod = toml::from_str(
            "method = \"random_projections\"\nnb_projections = 3\n"
        ).unwrap();

        match method {
            ClusteringMethod::RandomProjections(params) => assert_eq!(params.nb_projections, 3),
            other => panic!("unexpected method {:?}", other),
        }
    }
}
