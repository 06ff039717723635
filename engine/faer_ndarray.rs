use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(solvers::EvdError),
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Expected a square matrix, found {0}x{1}")]
    NotSquare(usize, usize),
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl<'a> FaerStorage<'a> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy view of an ndarray matrix as a faer matrix when the memory layout
/// allows it; otherwise an owned copy.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let storage = match array.as_slice_memory_order() {
            Some(slice) if array.is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, rows, cols))
            }
            Some(slice) if array.t().is_standard_layout() => {
                FaerStorage::Borrowed(MatRef::from_column_major_slice(slice, rows, cols))
            }
            _ => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub struct FaerColView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerColView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let storage = if let Some(slice) = array.as_slice() {
            FaerStorage::Borrowed(MatRef::from_row_major_slice(slice, len, 1))
        } else {
            FaerStorage::Owned(Mat::from_fn(len, 1, |i, _| array[i]))
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

pub trait FaerEigh {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let rhs_view = FaerColView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(sol.nrows(), |i| sol[(i, 0)])
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        mat_to_array(sol.as_ref())
    }

    /// The lower-triangular factor `L` with `A = L Lᵀ`.
    pub fn lower(&self) -> Array2<f64> {
        mat_to_array(self.factor.L())
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// A matrix `R` with `R Rᵀ = covariance`, used to turn standard normal draws
/// into correlated ones.
///
/// Positive-definite matrices get their Cholesky factor. Covariances that are
/// only semi-definite (rank-deficient fits, zero variance components) fall back
/// to `U diag(√max(λ, 0))` from the symmetric eigendecomposition.
pub fn covariance_root(covariance: &Array2<f64>) -> Result<Array2<f64>, FaerLinalgError> {
    let (rows, cols) = covariance.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare(rows, cols));
    }
    if rows == 0 {
        return Ok(Array2::zeros((0, 0)));
    }
    match covariance.cholesky(Side::Lower) {
        Ok(factor) => Ok(factor.lower()),
        Err(err) => {
            log::debug!("Cholesky failed ({err}); using eigendecomposition for covariance root");
            let (values, vectors) = covariance.eigh(Side::Lower)?;
            let mut root = vectors;
            for (mut column, &lambda) in root.columns_mut().into_iter().zip(values.iter()) {
                column *= lambda.max(0.0).sqrt();
            }
            Ok(root)
        }
    }
}
