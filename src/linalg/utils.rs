use crate::linalg::faer_ndarray::{FaerArrayView, FaerLinalgError, mat_to_array, pseudo_inverse_solve};
use crate::linalg::sparse::{sparse_gram_upper, sparse_to_dense, sparse_transpose_matvec_strided};
use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2};

const LSTSQ_RCOND: f64 = 1e-12;

pub(crate) fn max_abs_diag(matrix: &Array2<f64>) -> f64 {
    matrix
        .diag()
        .iter()
        .copied()
        .map(f64::abs)
        .fold(0.0, f64::max)
        .max(1.0)
}

/// How a least-squares system was solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeastSquaresMethod {
    SparseCholesky,
    Svd { rank: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct LeastSquaresSolution {
    pub(crate) coefficients: Array2<f64>,
    pub(crate) method: LeastSquaresMethod,
}

/// Least-squares solve of `B X ≈ Y` for a sparse design `B`.
///
/// `BᵀB` and `BᵀY` are formed sparsely and the Gram matrix is factored with a
/// sparse Cholesky. When that factorization fails (a basis function no sample
/// touches, or any other rank loss) the SVD minimum-norm solution of the dense
/// system is used instead.
pub(crate) fn solve_sparse_least_squares(
    design: &SparseColMat<usize, f64>,
    values: &Array2<f64>,
    label: &str,
) -> Result<LeastSquaresSolution, FaerLinalgError> {
    if design.nrows() != values.nrows() {
        return Err(FaerLinalgError::DimensionMismatch(format!(
            "{label}: design has {} rows but the right-hand side has {}",
            design.nrows(),
            values.nrows()
        )));
    }
    let (n, phys) = (design.ncols(), values.ncols());
    let gram = sparse_gram_upper(design)?;
    // Row-major `[N, P]` is the interleaved layout the strided product expects.
    let interleaved = Array1::from_iter(values.iter().copied());
    let rhs = sparse_transpose_matvec_strided(design, interleaved.view(), phys)?
        .into_shape_with_order((n, phys))
        .map_err(|e| FaerLinalgError::DimensionMismatch(e.to_string()))?;

    if let Ok(factor) = gram.as_ref().sp_cholesky(Side::Upper) {
        let rhs_view = FaerArrayView::new(&rhs);
        let solved = factor.solve(rhs_view.as_ref());
        let coefficients = mat_to_array(solved.as_ref());
        if coefficients.iter().all(|v| v.is_finite()) {
            return Ok(LeastSquaresSolution {
                coefficients,
                method: LeastSquaresMethod::SparseCholesky,
            });
        }
    }

    log::warn!("{label}: normal equations not positive definite; using SVD least squares");
    let (coefficients, rank) = pseudo_inverse_solve(&sparse_to_dense(design), values, LSTSQ_RCOND)?;
    log::debug!("{label}: SVD least squares rank {rank} of {n}");
    Ok(LeastSquaresSolution {
        coefficients,
        method: LeastSquaresMethod::Svd { rank },
    })
}
