#[cfg(test)]
mod tests {
    use ndarray::{Array2, Array3, array};
    use spike_sorting_components::{
        clustering::{
            ClusteringMethod, circus::CircusParameters, random_projections::RandomProjectionsParameters,
        },
        deduplication::{DeduplicationParameters, remove_duplicates_via_matching},
        error::SortingError,
        job::JobParameters,
        peaks::PeakLabels,
        pruning::{PruningParameters, prune_templates},
        recording::{InMemoryRecording, Probe},
        sorter::{ClusteringConfig, SorterParameters, find_clusters_from_peaks, run_sorter},
        templates::Templates,
    };


    fn flat_recording() -> Result<InMemoryRecording, SortingError> {
        Ok(InMemoryRecording::from_traces(30000., vec![Array2::zeros((30000, 3))], 20.)?)
    }

    fn no_templates() -> Templates {
        Templates {
            templates_array: Array3::zeros((0, 10, 3)),
            sparsity_mask: None,
            unit_ids: Vec::new(),
            channel_ids: vec!["0".into(), "1".into(), "2".into()],
            nbefore: 4,
            sampling_frequency: 30000.,
            probe: Probe::linear(3, 20.),
        }
    }

    #[test]
    pub fn test_no_peaks_circus() -> Result<(), SortingError> {
        let recording = flat_recording()?;
        let config = ClusteringConfig { job: JobParameters::sequential(1000.), ..ClusteringConfig::default() };

        let output = find_clusters_from_peaks(
            &recording, &[], &ClusteringMethod::Circus(CircusParameters::default()), &config,
        )?;

        assert!(output.labels.is_empty());
        assert!(output.peak_labels.is_empty());

        Ok(())
    }

    #[test]
    pub fn test_no_peaks_random_projections() -> Result<(), SortingError> {
        let recording = flat_recording()?;
        let config = ClusteringConfig {
            job: JobParameters::sequential(1000.),
            noise_levels: Some(array![1., 1., 1.]),
            ..ClusteringConfig::default()
        };

        let output = find_clusters_from_peaks(
            &recording, &[], &ClusteringMethod::RandomProjections(RandomProjectionsParameters::default()), &config,
        )?;

        assert_eq!(output.num_units(), 0);
        assert!(output.peak_labels.is_empty());

        Ok(())
    }

    #[test]
    pub fn test_no_templates_pruning_and_deduplication() -> Result<(), SortingError> {
        let peak_labels = PeakLabels::from_vec(vec![0, -1, 4]);

        let (templates, peak_labels, report) = prune_templates(
            no_templates(), peak_labels, &array![1., 1., 1.], &PruningParameters::default(),
        )?;
        assert_eq!(templates.num_units(), 0);
        assert_eq!(report.reset_peaks, 2);

        let output = remove_duplicates_via_matching(&templates, peak_labels, &DeduplicationParameters::default())?;
        assert!(output.labels.is_empty());
        assert_eq!(output.peak_labels.as_slice(), &[-1, -1, -1]);

        Ok(())
    }

    #[test]
    pub fn test_no_peaks_sorter() -> Result<(), SortingError> {
        let recording = flat_recording()?;
        let params = SorterParameters { job: JobParameters::sequential(1000.), ..SorterParameters::default() };

        let output = run_sorter(&recording, &[], &params)?;

        assert_eq!(output.sorting.num_units(), 0);
        assert!(output.sorting.spikes.is_empty());
        assert!(output.selected_peaks.is_empty());

        Ok(())
    }
}
