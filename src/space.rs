use crate::basis::{
    BasisError, BasisScratch, evaluate_nonzero_basis_unchecked,
    evaluate_nonzero_derivatives_unchecked, open_uniform_knot_vector, spline_thread_pool,
    validate_knot_vector,
};
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const PAR_THRESHOLD: usize = 256;
const CHUNK_SIZE: usize = 1024;

/// Tensor-product B-spline space: per-dimension orders, knot vectors and
/// coefficient counts. Immutable once built; share it through `Arc`.
#[derive(Clone, Debug)]
pub struct BSplineSpace {
    orders: Vec<usize>,
    knot_vectors: Vec<Array1<f64>>,
    coefficient_shape: Vec<usize>,
}

/// Structural identity of a space. Knots are compared bitwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpaceKey {
    orders: Vec<usize>,
    knots: Vec<Vec<u64>>,
    coefficient_shape: Vec<usize>,
}

impl BSplineSpace {
    pub fn new(
        orders: Vec<usize>,
        knot_vectors: Vec<Array1<f64>>,
        coefficient_shape: Vec<usize>,
    ) -> Result<Self, BasisError> {
        if orders.is_empty() {
            return Err(BasisError::DimensionMismatch(
                "a space needs at least one parametric dimension".to_string(),
            ));
        }
        if knot_vectors.len() != orders.len() || coefficient_shape.len() != orders.len() {
            return Err(BasisError::DimensionMismatch(format!(
                "{} orders, {} knot vectors and {} coefficient counts must agree",
                orders.len(),
                knot_vectors.len(),
                coefficient_shape.len()
            )));
        }
        for dim in 0..orders.len() {
            validate_knot_vector(knot_vectors[dim].view(), orders[dim], coefficient_shape[dim])?;
        }
        Ok(Self {
            orders,
            knot_vectors,
            coefficient_shape,
        })
    }

    /// Space with clamped open-uniform knots in every dimension.
    pub fn open_uniform(orders: &[usize], coefficient_shape: &[usize]) -> Result<Self, BasisError> {
        if orders.len() != coefficient_shape.len() {
            return Err(BasisError::DimensionMismatch(format!(
                "{} orders but {} coefficient counts",
                orders.len(),
                coefficient_shape.len()
            )));
        }
        let knots = orders
            .iter()
            .zip(coefficient_shape)
            .map(|(&order, &n)| open_uniform_knot_vector(n, order))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(orders.to_vec(), knots, coefficient_shape.to_vec())
    }

    pub fn orders(&self) -> &[usize] {
        &self.orders
    }

    pub fn knot_vectors(&self) -> &[Array1<f64>] {
        &self.knot_vectors
    }

    pub fn coefficient_shape(&self) -> &[usize] {
        &self.coefficient_shape
    }

    pub fn num_parametric_dimensions(&self) -> usize {
        self.orders.len()
    }

    /// Parametric domain `[t_{order-1}, t_{n}]` of dimension `dim`.
    pub fn domain(&self, dim: usize) -> (f64, f64) {
        let knots = &self.knot_vectors[dim];
        (knots[self.orders[dim] - 1], knots[self.coefficient_shape[dim]])
    }

    pub fn domains(&self) -> Vec<(f64, f64)> {
        (0..self.orders.len()).map(|dim| self.domain(dim)).collect()
    }

    /// Number of scalar basis functions (product of the coefficient shape).
    pub fn num_coefficients(&self) -> usize {
        self.coefficient_shape.iter().product()
    }

    pub fn key(&self) -> SpaceKey {
        SpaceKey {
            orders: self.orders.clone(),
            knots: self
                .knot_vectors
                .iter()
                .map(|k| k.iter().map(|v| v.to_bits()).collect())
                .collect(),
            coefficient_shape: self.coefficient_shape.clone(),
        }
    }

    fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.coefficient_shape.len()];
        let mut acc = 1usize;
        for i in (0..self.coefficient_shape.len()).rev() {
            strides[i] = acc;
            acc *= self.coefficient_shape[i];
        }
        strides
    }

    /// Sparse evaluation matrix at `parametric_coordinates` (`[N, D]`).
    ///
    /// Each row is the tensor product of the per-dimension nonzero basis values
    /// (differentiated `derivative_orders[d]` times in dimension `d`), scattered
    /// into row-major coefficient columns. With `expansion = P > 1` the matrix is
    /// expanded block-diagonally to `[N·P, n·P]` so it acts directly on
    /// coefficients interleaved over `P` physical dimensions.
    pub fn compute_basis_matrix(
        &self,
        parametric_coordinates: ArrayView2<'_, f64>,
        derivative_orders: &[usize],
        expansion: usize,
    ) -> Result<SparseColMat<usize, f64>, BasisError> {
        let dims = self.num_parametric_dimensions();
        if parametric_coordinates.ncols() != dims {
            return Err(BasisError::DimensionMismatch(format!(
                "parametric coordinates have {} columns but the space has {dims} dimensions",
                parametric_coordinates.ncols()
            )));
        }
        if derivative_orders.len() != dims {
            return Err(BasisError::DimensionMismatch(format!(
                "{} derivative orders given for {dims} dimensions",
                derivative_orders.len()
            )));
        }
        if expansion == 0 {
            return Err(BasisError::DimensionMismatch(
                "expansion must be at least 1".to_string(),
            ));
        }

        let nrows = parametric_coordinates.nrows();
        let strides = self.strides();
        let per_row_nnz: usize = self.orders.iter().product();

        let make_locals = || {
            (
                self.orders
                    .iter()
                    .map(|&order| BasisScratch::new(order))
                    .collect::<Vec<_>>(),
                self.orders.iter().map(|&o| vec![0.0; o]).collect::<Vec<_>>(),
                vec![0usize; dims],
                vec![0usize; dims],
            )
        };

        let fill_range = |range: std::ops::Range<usize>,
                          (scratch, values, starts, indices): &mut (
            Vec<BasisScratch>,
            Vec<Vec<f64>>,
            Vec<usize>,
            Vec<usize>,
        )| {
            let mut local = Vec::with_capacity(range.len() * per_row_nnz * expansion);
            for row_idx in range {
                fill_tensor_row(
                    self,
                    parametric_coordinates.row(row_idx),
                    derivative_orders,
                    &strides,
                    scratch,
                    values,
                    starts,
                    indices,
                    |col, value| {
                        for p in 0..expansion {
                            local.push(Triplet::new(
                                row_idx * expansion + p,
                                col * expansion + p,
                                value,
                            ));
                        }
                    },
                );
            }
            local
        };

        let triplets: Vec<Triplet<usize, usize, f64>> = if nrows >= PAR_THRESHOLD {
            spline_thread_pool().install(|| {
                let row_starts: Vec<usize> = (0..nrows).step_by(CHUNK_SIZE).collect();
                row_starts
                    .into_par_iter()
                    .map_init(make_locals, |locals, chunk_start| {
                        let row_end = (chunk_start + CHUNK_SIZE).min(nrows);
                        fill_range(chunk_start..row_end, locals)
                    })
                    .reduce(Vec::new, |mut acc, mut chunk| {
                        acc.append(&mut chunk);
                        acc
                    })
            })
        } else {
            let mut locals = make_locals();
            fill_range(0..nrows, &mut locals)
        };

        SparseColMat::try_new_from_triplets(
            nrows * expansion,
            self.num_coefficients() * expansion,
            &triplets,
        )
        .map_err(|err| BasisError::SparseCreation(format!("{err:?}")))
    }

    /// Value plus first and second parametric derivatives at a single point.
    ///
    /// `coefficients` is `[num_coefficients, P]`. Used by the Newton projection
    /// loop, which needs the local jet but not a matrix.
    pub fn evaluate_local(
        &self,
        u: &[f64],
        coefficients: ArrayView2<'_, f64>,
        scratch: &mut SpaceScratch,
    ) -> Result<PointJet, BasisError> {
        let dims = self.num_parametric_dimensions();
        if u.len() != dims {
            return Err(BasisError::DimensionMismatch(format!(
                "point has {} parametric coordinates but the space has {dims}",
                u.len()
            )));
        }
        if coefficients.nrows() != self.num_coefficients() {
            return Err(BasisError::DimensionMismatch(format!(
                "{} coefficient rows for a space with {} basis functions",
                coefficients.nrows(),
                self.num_coefficients()
            )));
        }
        let phys = coefficients.ncols();
        let strides = self.strides();

        for dim in 0..dims {
            let order = self.orders[dim];
            let table = &mut scratch.tables[dim];
            table.resize(3 * order, 0.0);
            scratch.starts[dim] = evaluate_nonzero_derivatives_unchecked(
                order,
                self.knot_vectors[dim].view(),
                self.coefficient_shape[dim],
                2,
                u[dim],
                table,
                &mut scratch.basis[dim],
            );
        }

        let mut jet = PointJet {
            value: Array1::zeros(phys),
            first: Array2::zeros((dims, phys)),
            second: Array3::zeros((dims, dims, phys)),
        };

        let indices = &mut scratch.indices;
        indices.fill(0);
        let mut first_factors = vec![0.0; dims];
        let mut second_factors = vec![0.0; dims * dims];
        loop {
            let mut row = 0usize;
            let mut value = 1.0;
            for dim in 0..dims {
                row += (scratch.starts[dim] + indices[dim]) * strides[dim];
                value *= scratch.tables[dim][indices[dim]];
            }
            for a in 0..dims {
                let mut prod = 1.0;
                for dim in 0..dims {
                    let order = self.orders[dim];
                    let k = usize::from(dim == a);
                    prod *= scratch.tables[dim][k * order + indices[dim]];
                }
                first_factors[a] = prod;
                for b in a..dims {
                    let mut prod = 1.0;
                    for dim in 0..dims {
                        let order = self.orders[dim];
                        let k = usize::from(dim == a) + usize::from(dim == b);
                        prod *= scratch.tables[dim][k * order + indices[dim]];
                    }
                    second_factors[a * dims + b] = prod;
                    second_factors[b * dims + a] = prod;
                }
            }

            let coeff_row = coefficients.row(row);
            for p in 0..phys {
                let c = coeff_row[p];
                if c == 0.0 {
                    continue;
                }
                jet.value[p] += value * c;
                for a in 0..dims {
                    jet.first[[a, p]] += first_factors[a] * c;
                    for b in 0..dims {
                        jet.second[[a, b, p]] += second_factors[a * dims + b] * c;
                    }
                }
            }

            let mut carried = true;
            for dim in (0..dims).rev() {
                indices[dim] += 1;
                if indices[dim] < self.orders[dim] {
                    carried = false;
                    break;
                }
                indices[dim] = 0;
            }
            if carried {
                break;
            }
        }
        Ok(jet)
    }
}

/// Reusable per-thread buffers for [`BSplineSpace::evaluate_local`].
#[derive(Clone, Debug)]
pub struct SpaceScratch {
    basis: Vec<BasisScratch>,
    tables: Vec<Vec<f64>>,
    starts: Vec<usize>,
    indices: Vec<usize>,
}

impl SpaceScratch {
    pub fn new(space: &BSplineSpace) -> Self {
        let dims = space.num_parametric_dimensions();
        Self {
            basis: space.orders.iter().map(|&o| BasisScratch::new(o)).collect(),
            tables: space.orders.iter().map(|&o| vec![0.0; 3 * o]).collect(),
            starts: vec![0; dims],
            indices: vec![0; dims],
        }
    }
}

/// Local jet of a function at one parametric point.
#[derive(Clone, Debug)]
pub struct PointJet {
    /// `[P]`
    pub value: Array1<f64>,
    /// `[D, P]`, `first[[a, p]] = ∂x_p/∂u_a`
    pub first: Array2<f64>,
    /// `[D, D, P]`
    pub second: Array3<f64>,
}

#[allow(clippy::too_many_arguments)]
fn fill_tensor_row<F>(
    space: &BSplineSpace,
    coordinates: ArrayView1<'_, f64>,
    derivative_orders: &[usize],
    strides: &[usize],
    scratch: &mut [BasisScratch],
    values: &mut [Vec<f64>],
    starts: &mut [usize],
    indices: &mut [usize],
    mut write_entry: F,
) where
    F: FnMut(usize, f64),
{
    let dims = space.orders.len();
    for dim in 0..dims {
        starts[dim] = evaluate_nonzero_basis_unchecked(
            space.orders[dim],
            space.knot_vectors[dim].view(),
            space.coefficient_shape[dim],
            derivative_orders[dim],
            coordinates[dim],
            &mut values[dim],
            &mut scratch[dim],
        );
    }

    indices.fill(0);
    loop {
        let mut product = 1.0f64;
        let mut col = 0usize;
        for dim in 0..dims {
            let v = values[dim][indices[dim]];
            product *= v;
            if product == 0.0 {
                break;
            }
            col += (starts[dim] + indices[dim]) * strides[dim];
        }
        if product != 0.0 {
            write_entry(col, product);
        }

        let mut carried = true;
        for dim in (0..dims).rev() {
            indices[dim] += 1;
            if indices[dim] < space.orders[dim] {
                carried = false;
                break;
            }
            indices[dim] = 0;
        }
        if carried {
            break;
        }
    }
}

/// Deduplicates structurally identical spaces and hands out shared handles.
#[derive(Clone, Debug, Default)]
pub struct SpaceRegistry {
    spaces: HashMap<SpaceKey, Arc<BSplineSpace>>,
}

impl SpaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, space: BSplineSpace) -> Arc<BSplineSpace> {
        self.spaces
            .entry(space.key())
            .or_insert_with(|| Arc::new(space))
            .clone()
    }

    /// Registers an existing handle, returning the canonical one for its key.
    pub fn intern(&mut self, space: &Arc<BSplineSpace>) -> Arc<BSplineSpace> {
        self.spaces
            .entry(space.key())
            .or_insert_with(|| Arc::clone(space))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::sparse_to_dense;
    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, array};

    fn grid(n: usize) -> Array2<f64> {
        let mut coords = Array2::zeros((n * n, 2));
        for i in 0..n {
            for j in 0..n {
                coords[[i * n + j, 0]] = i as f64 / (n - 1) as f64;
                coords[[i * n + j, 1]] = j as f64 / (n - 1) as f64;
            }
        }
        coords
    }

    #[test]
    fn tensor_rows_sum_to_one() {
        let space = BSplineSpace::open_uniform(&[3, 4], &[5, 6]).unwrap();
        // Large enough to take the parallel branch.
        let coords = grid(20);
        let matrix = sparse_to_dense(&space.compute_basis_matrix(coords.view(), &[0, 0], 1).unwrap());
        assert_eq!(matrix.dim(), (400, 30));
        for row in matrix.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn expanded_matrix_is_block_diagonal_copy() {
        let space = BSplineSpace::open_uniform(&[2, 2], &[3, 2]).unwrap();
        let coords = array![[0.3, 0.7], [1.0, 0.0]];
        let scalar = sparse_to_dense(&space.compute_basis_matrix(coords.view(), &[0, 0], 1).unwrap());
        let expanded = sparse_to_dense(&space.compute_basis_matrix(coords.view(), &[0, 0], 3).unwrap());
        assert_eq!(expanded.dim(), (6, 18));
        for i in 0..2 {
            for j in 0..6 {
                for p in 0..3 {
                    for q in 0..3 {
                        let expected = if p == q { scalar[[i, j]] } else { 0.0 };
                        assert_eq!(expanded[[i * 3 + p, j * 3 + q]], expected);
                    }
                }
            }
        }
    }

    #[test]
    fn local_jet_matches_derivative_matrices() {
        let space = BSplineSpace::open_uniform(&[3, 3], &[4, 5]).unwrap();
        let n = space.num_coefficients();
        let coefficients = Array2::from_shape_fn((n, 2), |(i, p)| ((i * 7 + p * 3) % 11) as f64 * 0.1);
        let u = [0.37, 0.61];
        let coords = array![[u[0], u[1]]];
        let mut scratch = SpaceScratch::new(&space);
        let jet = space.evaluate_local(&u, coefficients.view(), &mut scratch).unwrap();

        let eval = |d: [usize; 2]| {
            let m = sparse_to_dense(&space.compute_basis_matrix(coords.view(), &d, 1).unwrap());
            m.dot(&coefficients).row(0).to_owned()
        };
        let value = eval([0, 0]);
        let du = eval([1, 0]);
        let dv = eval([0, 1]);
        let duv = eval([1, 1]);
        let dvv = eval([0, 2]);
        for p in 0..2 {
            assert_abs_diff_eq!(jet.value[p], value[p], epsilon = 1e-12);
            assert_abs_diff_eq!(jet.first[[0, p]], du[p], epsilon = 1e-10);
            assert_abs_diff_eq!(jet.first[[1, p]], dv[p], epsilon = 1e-10);
            assert_abs_diff_eq!(jet.second[[0, 1, p]], duv[p], epsilon = 1e-9);
            assert_abs_diff_eq!(jet.second[[1, 0, p]], duv[p], epsilon = 1e-9);
            assert_abs_diff_eq!(jet.second[[1, 1, p]], dvv[p], epsilon = 1e-9);
        }
    }

    #[test]
    fn domain_follows_the_knot_vectors() {
        let space = BSplineSpace::new(
            vec![2, 3],
            vec![array![0.0, 0.0, 2.0, 2.0], array![-1.0, -1.0, -1.0, 0.5, 3.0, 3.0, 3.0]],
            vec![2, 4],
        )
        .unwrap();
        assert_eq!(space.domain(0), (0.0, 2.0));
        assert_eq!(space.domains(), vec![(0.0, 2.0), (-1.0, 3.0)]);
    }

    #[test]
    fn registry_deduplicates_structurally_equal_spaces() {
        let mut registry = SpaceRegistry::new();
        let a = registry.get_or_insert(BSplineSpace::open_uniform(&[4, 4], &[6, 6]).unwrap());
        let b = registry.get_or_insert(BSplineSpace::open_uniform(&[4, 4], &[6, 6]).unwrap());
        let c = registry.get_or_insert(BSplineSpace::open_uniform(&[4, 4], &[6, 7]).unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn mismatched_inputs_are_rejected() {
        assert!(BSplineSpace::new(vec![3], vec![], vec![4]).is_err());
        let space = BSplineSpace::open_uniform(&[2, 2], &[2, 2]).unwrap();
        let coords = array![[0.5, 0.5, 0.5]];
        assert!(space.compute_basis_matrix(coords.view(), &[0, 0], 1).is_err());
        let coords = array![[0.5, 0.5]];
        assert!(space.compute_basis_matrix(coords.view(), &[0], 1).is_err());
    }
}
