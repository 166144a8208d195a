use crate::linalg::sparse::SparseOpError;
use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatMut, MatRef, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error(transparent)]
    Sparse(#[from] SparseOpError),
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];
    // SAFETY: dimensions and strides come straight from the live Array2.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: single column over the Array1's own storage.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub(crate) fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

/// Borrowed faer view of an ndarray matrix. Layouts with non-positive strides
/// are materialized into a compact owned copy first.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come from a live ndarray view with
        // positive strides or from the owned copy kept alive inside this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

pub trait FaerSvd {
    /// Economy SVD `A = U Σ Vᵀ` with `U: [m, k]`, `Vᵀ: [k, n]`, `k = min(m, n)`.
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), FaerLinalgError>;
}

fn transposed(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.ncols(), mat.nrows()));
    for j in 0..mat.nrows() {
        for i in 0..mat.ncols() {
            out[[i, j]] = mat[(j, i)];
        }
    }
    out
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();
        let (rows, cols) = faer_mat.shape();
        let k = rows.min(cols);

        let mut singular = Diag::<f64>::zeros(k);
        let mut u = Mat::<f64>::zeros(rows, k);
        let mut v = Mat::<f64>::zeros(cols, k);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Thin,
            ComputeSvdVectors::Thin,
            par,
            Default::default(),
        ));
        let stack = MemStack::new(&mut mem);

        svd::svd(
            faer_mat,
            singular.as_mut(),
            Some(u.as_mut()),
            Some(v.as_mut()),
            par,
            stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

        Ok((
            mat_to_array(u.as_ref()),
            diag_to_array(singular.as_ref()),
            transposed(v.as_ref()),
        ))
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
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

/// Minimum-norm least-squares solution of `A X = B` via the SVD pseudo-inverse.
///
/// Singular values below `rcond * s_max` are treated as zero. Returns the solution
/// together with the numerical rank of `A`.
pub fn pseudo_inverse_solve<S1, S2>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
    rcond: f64,
) -> Result<(Array2<f64>, usize), FaerLinalgError>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (m, n) = a.dim();
    if b.nrows() != m {
        return Err(FaerLinalgError::DimensionMismatch(format!(
            "right-hand side has {} rows but the matrix has {m}",
            b.nrows()
        )));
    }
    if m == 0 || n == 0 {
        return Ok((Array2::zeros((n, b.ncols())), 0));
    }

    let (u, s, vt) = a.thin_svd()?;
    let s_max = s.iter().fold(0.0f64, |acc, &v| acc.max(v));
    let cutoff = rcond.max(0.0) * s_max;

    let mut x = Array2::<f64>::zeros((n, b.ncols()));
    let mut rank = 0usize;
    for (k, &sigma) in s.iter().enumerate() {
        if sigma <= cutoff || sigma == 0.0 {
            continue;
        }
        rank += 1;
        // x += v_k (u_kᵀ b) / σ_k
        let ub = u.column(k).dot(b) / sigma;
        let v_k = vt.row(k);
        for i in 0..n {
            for c in 0..b.ncols() {
                x[[i, c]] += v_k[i] * ub[c];
            }
        }
    }
    Ok((x, rank))
}

/// Vector convenience wrapper over [`pseudo_inverse_solve`].
pub fn pseudo_inverse_solve_vec<S1, S2>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix1>,
    rcond: f64,
) -> Result<(Array1<f64>, usize), FaerLinalgError>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let rhs = b.to_owned().insert_axis(ndarray::Axis(1));
    let (x, rank) = pseudo_inverse_solve(a, &rhs, rcond)?;
    Ok((x.column(0).to_owned(), rank))
}
