//! Per-channel noise estimation from randomly drawn chunks of a recording.

use std::result::Result;
use ndarray::{Array1, Axis, concatenate};
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use super::{Recording, get_traces_padded};
use crate::error::{SortingError, invalid_parameter};


/// Scales a median absolute deviation into a Gaussian standard deviation
const MAD_TO_STD: f32 = 1. / 0.674_489_75;

/// Settings for [`get_noise_levels`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseLevelParameters {
    /// Number of random chunks drawn from each segment
    pub num_chunks_per_segment: usize,
    /// Length of each chunk in samples
    pub chunk_size: usize,
}

impl Default for NoiseLevelParameters {
    fn default() -> Self {
        NoiseLevelParameters {
            num_chunks_per_segment: 20,
            chunk_size: 10000,
        }
    }
}

fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.;
    }

    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;

    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.
    } else {
        values[mid]
    }
}

/// Estimates one noise level per channel as the scaled median absolute deviation
/// of randomly drawn chunks, chunk positions are drawn from the given generator
pub fn get_noise_levels<R: Recording + ?Sized>(
    recording: &R,
    params: &NoiseLevelParameters,
    rng: &mut StdRng,
) -> Result<Array1<f32>, SortingError> {
    if params.chunk_size == 0 || params.num_chunks_per_segment == 0 {
        return Err(invalid_parameter("noise_levels", "chunk size and chunk count must be positive"));
    }

    let num_channels = recording.num_channels();
    let mut chunks = Vec::new();

    for segment_index in 0..recording.num_segments() {
        let num_samples = recording.num_samples(segment_index)?;
        if num_samples == 0 {
            continue;
        }

        let chunk_size = params.chunk_size.min(num_samples);
        let max_start = num_samples - chunk_size;

        for _ in 0..params.num_chunks_per_segment {
            let start = if max_start > 0 { rng.gen_range(0..=max_start) } else { 0 };
            chunks.push(get_traces_padded(
                recording, segment_index, start as i64, (start + chunk_size) as i64
            )?);
        }
    }

    if chunks.is_empty() {
        return Ok(Array1::zeros(num_channels));
    }

    let views: Vec<_> = chunks.iter().map(|chunk| chunk.view()).collect();
    let all_traces = concatenate(Axis(0), &views)
        .map_err(|err| invalid_parameter("noise_levels", &err.to_string()))?;

    let levels = all_traces.axis_iter(Axis(1))
        .map(|channel| {
            let mut values = channel.to_vec();
            let center = median(&mut values);
            let mut deviations: Vec<f32> = values.iter().map(|x| (x - center).abs()).collect();

            median(&mut deviations) * MAD_TO_STD
        })
        .collect::<Vec<f32>>();

    Ok(Array1::from(levels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use crate::recording::InMemoryRecording;

    #[test]
    fn test_noise_levels_match_gaussian_scale() {
        let mut rng = StdRng::seed_from_u64(0);
        let normal = Normal::new(0., 1.).unwrap();
        let traces = Array2::from_shape_fn((30000, 2), |(_, c)| {
            let x: f32 = normal.sample(&mut rng);
            if c == 0 { x } else { 5. * x }
        });
        let recording = InMemoryRecording::from_traces(30000., vec![traces], 20.).unwrap();

        let levels = get_noise_levels(&recording, &NoiseLevelParameters::default(), &mut rng).unwrap();

        assert!((levels[0] - 1.).abs() < 0.1, "level: {}", levels[0]);
        assert!((levels[1] - 5.).abs() < 0.5, "level: {}", levels[1]);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&mut [3., 1., 2.]), 2.);
        assert_eq!(median(&mut [4., 1., 2., 3.]), 2.5);
    }
}
