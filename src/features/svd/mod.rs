//! Truncated singular value decomposition fitted through the eigen decomposition of the
//! Gram matrix, plus persistence of the fitted basis to a scratch folder.

use std::{fs, path::{Path, PathBuf}, result::Result};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use crate::error::{ConfigurationError, DegenerateClusterError, SortingError, invalid_parameter};


/// Uncentered truncated decomposition, `components` holds one basis vector per row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncatedSvd {
    pub n_components: usize,
    pub components: Array2<f32>,
    pub singular_values: Array1<f32>,
}

impl TruncatedSvd {
    /// Fits the leading `n_components` right singular vectors of `data` (`samples x features`),
    /// the number of components is capped at the number of features
    pub fn fit(data: ArrayView2<f32>, n_components: usize) -> Result<Self, SortingError> {
        if n_components == 0 {
            return Err(invalid_parameter("n_components", "must be at least 1"));
        }

        let (num_rows, num_features) = data.dim();
        if num_features == 0 {
            return Err(DegenerateClusterError::NoFeatures.into());
        }
        if num_rows == 0 {
            return Err(DegenerateClusterError::DecompositionFailed(String::from("no samples to fit")).into());
        }
        if data.iter().any(|x| !x.is_finite()) {
            return Err(DegenerateClusterError::NonFiniteFeatures.into());
        }

        let as_f64 = data.mapv(|x| x as f64);
        let gram = as_f64.t().dot(&as_f64);
        let gram = DMatrix::from_fn(num_features, num_features, |i, j| gram[[i, j]]);

        let eigen = SymmetricEigen::new(gram);

        // nalgebra does not order eigenvalues
        let mut order: Vec<usize> = (0..num_features).collect();
        order.sort_by(|a, b| eigen.eigenvalues[*b].total_cmp(&eigen.eigenvalues[*a]));

        let n_components = n_components.min(num_features);
        let mut components = Array2::<f32>::zeros((n_components, num_features));
        let mut singular_values = Array1::<f32>::zeros(n_components);

        for (k, &index) in order.iter().take(n_components).enumerate() {
            let vector = eigen.eigenvectors.column(index);

            let pivot = vector.iter()
                .copied()
                .max_by(|a, b| a.abs().total_cmp(&b.abs()))
                .unwrap_or(1.);
            let sign = if pivot < 0. { -1. } else { 1. };

            for (j, value) in vector.iter().enumerate() {
                components[[k, j]] = (sign * value) as f32;
            }
            singular_values[k] = eigen.eigenvalues[index].max(0.).sqrt() as f32;
        }

        Ok(TruncatedSvd { n_components, components, singular_values })
    }

    pub fn num_features(&self) -> usize {
        self.components.ncols()
    }

    /// Projects `samples x features` data onto the basis
    pub fn transform(&self, data: ArrayView2<f32>) -> Result<Array2<f32>, SortingError> {
        if data.ncols() != self.num_features() {
            return Err(invalid_parameter(
                "svd",
                &format!("expected {} features, found {}", self.num_features(), data.ncols()),
            ));
        }

        Ok(data.dot(&self.components.t()))
    }

    pub fn fit_transform(data: ArrayView2<f32>, n_components: usize) -> Result<(Self, Array2<f32>), SortingError> {
        let svd = TruncatedSvd::fit(data, n_components)?;
        let projected = svd.transform(data)?;

        Ok((svd, projected))
    }

    /// Writes the model as JSON
    pub fn save(&self, path: &Path) -> Result<(), SortingError> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, SortingError> {
        read_json(path)
    }
}

/// Window used to extract the waveforms the basis was fitted on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionParameters {
    pub ms_before: f64,
    pub ms_after: f64,
    pub sampling_frequency: f64,
}

/// Fitted temporal basis together with the window it expects
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionModel {
    pub params: ProjectionParameters,
    pub svd: TruncatedSvd,
}

impl ProjectionModel {
    /// Persists the model as `folder/params.json` and `folder/tsvd_model/model.json`,
    /// returns the folder
    pub fn save(&self, folder: &Path) -> Result<PathBuf, SortingError> {
        fs::create_dir_all(folder.join("tsvd_model")).map_err(scratch_error)?;

        write_json(&folder.join("params.json"), &self.params)?;
        self.svd.save(&folder.join("tsvd_model").join("model.json"))?;

        Ok(folder.to_path_buf())
    }

    pub fn load(folder: &Path) -> Result<Self, SortingError> {
        let params = read_json(&folder.join("params.json"))?;
        let svd = TruncatedSvd::load(&folder.join("tsvd_model").join("model.json"))?;

        Ok(ProjectionModel { params, svd })
    }
}

fn scratch_error<E: std::fmt::Display>(err: E) -> SortingError {
    ConfigurationError::ScratchFolder(err.to_string()).into()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SortingError> {
    let contents = serde_json::to_string(value).map_err(scratch_error)?;
    fs::write(path, contents).map_err(scratch_error)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, SortingError> {
    let contents = fs::read_to_string(path).map_err(scratch_error)?;
    serde_json::from_str(&contents).map_err(scratch_error)
}
