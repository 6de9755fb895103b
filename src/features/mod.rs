//! Reduction of waveform snippets to compact feature vectors.
//!
//! Two strategies are provided, a learned temporal basis ([`svd`]) applied channel by
//! channel and random projections of per-channel scalars ([`random_projections`]),
//! optionally after smoothing with [`savgol`].

use std::result::Result;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use crate::error::{SortingError, invalid_parameter};
use self::svd::TruncatedSvd;
pub mod svd;
pub mod savgol;
pub mod random_projections;


/// Checks that waveforms of `num_samples` samples can go through the temporal basis
pub fn check_projection(svd: &TruncatedSvd, num_samples: usize) -> Result<(), SortingError> {
    if num_samples != svd.num_features() {
        return Err(invalid_parameter(
            "svd",
            &format!("basis expects {} samples, waveforms have {}", svd.num_features(), num_samples),
        ));
    }

    Ok(())
}

/// Projects every channel of a `(samples, channels)` waveform through a temporal basis,
/// the row is laid out component by component, `j -> (j / channels, j % channels)`
pub fn project_waveform(svd: &TruncatedSvd, waveform: ArrayView2<f32>) -> Array1<f32> {
    // (samples, channels) -> (components, channels)
    svd.components.dot(&waveform).iter().copied().collect()
}

/// Rows of a feature matrix selected by index
pub fn select_rows(features: ArrayView2<f32>, rows: &[usize]) -> Array2<f32> {
    features.select(Axis(0), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_projection_per_channel() {
        let svd = TruncatedSvd {
            n_components: 2,
            components: array![[1., 0., -1.], [0., 1., 0.]],
            singular_values: array![2., 1.],
        };
        let waveform = array![[4., 0.], [1., 2.], [0., 3.]];

        assert!(check_projection(&svd, 3).is_ok());
        assert!(check_projection(&svd, 4).is_err());

        let projected = project_waveform(&svd, waveform.view());

        assert_eq!(projected.to_vec(), vec![4., -3., 1., 2.]);
    }
}
