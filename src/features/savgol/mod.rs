//! Savitzky-Golay smoothing of waveform snippets.

use std::result::Result;
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use crate::error::{SortingError, invalid_parameter};


/// Least squares polynomial smoothing over an odd sliding window, the edges are
/// filled by evaluating the polynomial fitted on the first and last full windows
#[derive(Debug, Clone)]
pub struct SavGolFilter {
    window_length: usize,
    polyorder: usize,
    /// `(polyorder + 1) x window_length` least squares solver, row `j` yields the
    /// coefficient of `t^j` with `t` centered on the window
    solver: Array2<f64>,
}

impl SavGolFilter {
    pub fn new(window_length: usize, polyorder: usize) -> Result<Self, SortingError> {
        if window_length % 2 == 0 || window_length <= polyorder {
            return Err(invalid_parameter(
                "savgol", "window length must be odd and longer than the polynomial order"
            ));
        }

        let half = (window_length / 2) as f64;
        let design = DMatrix::<f64>::from_fn(window_length, polyorder + 1, |i, j| {
            (i as f64 - half).powi(j as i32)
        });
        let normal = design.transpose() * &design;
        let inverse = normal.try_inverse()
            .ok_or_else(|| invalid_parameter("savgol", "singular design matrix"))?;
        let solver = inverse * design.transpose();

        Ok(SavGolFilter {
            window_length,
            polyorder,
            solver: Array2::from_shape_fn((polyorder + 1, window_length), |(j, i)| solver[(j, i)]),
        })
    }

    /// Builds a filter whose window covers `window_length_ms`, shortened to fit in
    /// `num_samples`, returns `None` when no valid window fits
    pub fn from_ms(
        window_length_ms: f64,
        polyorder: usize,
        sampling_frequency: f64,
        num_samples: usize,
    ) -> Result<Option<Self>, SortingError> {
        let mut window_length = (window_length_ms * sampling_frequency / 1000.) as usize;
        if window_length % 2 == 0 {
            window_length += 1;
        }

        if window_length > num_samples {
            window_length = if num_samples % 2 == 0 { num_samples.saturating_sub(1) } else { num_samples };
        }

        if window_length <= polyorder {
            return Ok(None);
        }

        Ok(Some(SavGolFilter::new(window_length, polyorder)?))
    }

    pub fn window_length(&self) -> usize {
        self.window_length
    }

    fn evaluate(coefficients: &[f64], t: f64) -> f64 {
        coefficients.iter().rev().fold(0., |acc, c| acc * t + c)
    }

    fn fit(&self, window: ArrayView1<f32>) -> Vec<f64> {
        self.solver.rows()
            .into_iter()
            .map(|row| row.iter().zip(window.iter()).map(|(w, x)| w * *x as f64).sum::<f64>())
            .collect()
    }

    /// Smooths one trace, traces shorter than the window are returned unchanged
    pub fn apply(&self, signal: ArrayView1<f32>) -> Array1<f32> {
        let n = signal.len();
        let w = self.window_length;
        if n < w {
            return signal.to_owned();
        }

        let half = w / 2;
        let mut smoothed = Array1::<f32>::zeros(n);

        for center in half..n - half {
            let window = signal.slice(ndarray::s![center - half..center + half + 1]);
            smoothed[center] = self.solver.row(0).iter()
                .zip(window.iter())
                .map(|(w, x)| w * *x as f64)
                .sum::<f64>() as f32;
        }

        let head = self.fit(signal.slice(ndarray::s![..w]));
        let tail = self.fit(signal.slice(ndarray::s![n - w..]));
        for i in 0..half {
            smoothed[i] = SavGolFilter::evaluate(&head, i as f64 - half as f64) as f32;
            smoothed[n - half + i] = SavGolFilter::evaluate(&tail, (i + 1) as f64) as f32;
        }

        smoothed
    }

    /// Smooths every channel of a `(samples, channels)` waveform
    pub fn apply_to_waveform(&self, waveform: ArrayView2<f32>) -> Array2<f32> {
        let mut smoothed = Array2::<f32>::zeros(waveform.raw_dim());

        for (mut output, channel) in smoothed.axis_iter_mut(Axis(1)).zip(waveform.axis_iter(Axis(1))) {
            output.assign(&self.apply(channel));
        }

        smoothed
    }
}
