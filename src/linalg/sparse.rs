use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SparseOpError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("Failed to assemble sparse matrix: {0}")]
    Assembly(String),
}

pub fn triplets_to_csc(
    nrows: usize,
    ncols: usize,
    triplets: &[Triplet<usize, usize, f64>],
) -> Result<SparseColMat<usize, f64>, SparseOpError> {
    SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
        .map_err(|err| SparseOpError::Assembly(format!("{err:?}")))
}

pub fn dense_to_sparse(
    matrix: &Array2<f64>,
    tol: f64,
) -> Result<SparseColMat<usize, f64>, SparseOpError> {
    let nrows = matrix.nrows();
    let ncols = matrix.ncols();
    let mut triplets = Vec::new();
    for row in 0..nrows {
        for col in 0..ncols {
            let value = matrix[[row, col]];
            if value.abs() > tol {
                triplets.push(Triplet::new(row, col, value));
            }
        }
    }
    triplets_to_csc(nrows, ncols, &triplets)
}

pub fn sparse_to_dense(matrix: &SparseColMat<usize, f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            dense[[row_idx[idx], col]] += values[idx];
        }
    }
    dense
}

pub fn sparse_matvec(
    matrix: &SparseColMat<usize, f64>,
    vector: ArrayView1<'_, f64>,
) -> Result<Array1<f64>, SparseOpError> {
    sparse_matvec_strided(matrix, vector, 1)
}

/// Applies a scalar-basis matrix to a coefficient vector whose entries are
/// interleaved over `stride` physical dimensions.
///
/// `out[i * stride + p] = Σ_j M[i, j] · x[j * stride + p]`, which is the same as
/// multiplying by the block-diagonal expansion of `M` without materializing it.
pub fn sparse_matvec_strided(
    matrix: &SparseColMat<usize, f64>,
    vector: ArrayView1<'_, f64>,
    stride: usize,
) -> Result<Array1<f64>, SparseOpError> {
    if stride == 0 || vector.len() != matrix.ncols() * stride {
        return Err(SparseOpError::DimensionMismatch(format!(
            "vector of length {} does not match {} columns with stride {stride}",
            vector.len(),
            matrix.ncols()
        )));
    }
    let mut out = Array1::<f64>::zeros(matrix.nrows() * stride);
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for p in 0..stride {
            let x = vector[col * stride + p];
            if x == 0.0 {
                continue;
            }
            for idx in col_ptr[col]..col_ptr[col + 1] {
                out[row_idx[idx] * stride + p] += values[idx] * x;
            }
        }
    }
    Ok(out)
}

/// Transposed counterpart of [`sparse_matvec_strided`]; used by reverse sweeps.
pub fn sparse_transpose_matvec_strided(
    matrix: &SparseColMat<usize, f64>,
    vector: ArrayView1<'_, f64>,
    stride: usize,
) -> Result<Array1<f64>, SparseOpError> {
    if stride == 0 || vector.len() != matrix.nrows() * stride {
        return Err(SparseOpError::DimensionMismatch(format!(
            "vector of length {} does not match {} rows with stride {stride}",
            vector.len(),
            matrix.nrows()
        )));
    }
    let mut out = Array1::<f64>::zeros(matrix.ncols() * stride);
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for p in 0..stride {
            let mut acc = 0.0;
            for idx in col_ptr[col]..col_ptr[col + 1] {
                acc += values[idx] * vector[row_idx[idx] * stride + p];
            }
            out[col * stride + p] = acc;
        }
    }
    Ok(out)
}

/// Upper triangle of `MᵀM`, accumulated row by row without densifying `M`.
///
/// Every diagonal entry is stored, including those of empty columns, so a
/// rank-deficient design surfaces as a zero pivot in the factorization.
pub fn sparse_gram_upper(matrix: &SparseColMat<usize, f64>) -> Result<SparseColMat<usize, f64>, SparseOpError> {
    let n = matrix.ncols();
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); matrix.nrows()];
    for col in 0..n {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            rows[row_idx[idx]].push((col, values[idx]));
        }
    }

    let mut entries: BTreeMap<(usize, usize), f64> = (0..n).map(|i| ((i, i), 0.0)).collect();
    for row in &rows {
        for &(i, vi) in row {
            for &(j, vj) in row {
                if i <= j {
                    *entries.entry((i, j)).or_insert(0.0) += vi * vj;
                }
            }
        }
    }
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .into_iter()
        .map(|((i, j), value)| Triplet::new(i, j, value))
        .collect();
    triplets_to_csc(n, n, &triplets)
}

/// Stacks matrices with a common column count on top of each other.
pub fn vstack(blocks: &[&SparseColMat<usize, f64>]) -> Result<SparseColMat<usize, f64>, SparseOpError> {
    let ncols = blocks.first().map_or(0, |b| b.ncols());
    let mut triplets = Vec::new();
    let mut row_offset = 0usize;
    for block in blocks {
        if block.ncols() != ncols {
            return Err(SparseOpError::DimensionMismatch(format!(
                "cannot stack a block with {} columns under one with {ncols}",
                block.ncols()
            )));
        }
        let (symbolic, values) = block.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        for col in 0..ncols {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                triplets.push(Triplet::new(row_offset + row_idx[idx], col, values[idx]));
            }
        }
        row_offset += block.nrows();
    }
    triplets_to_csc(row_offset, ncols, &triplets)
}
