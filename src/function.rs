use crate::basis::{BasisError, spline_thread_pool};
use crate::layout::LayoutBuildError;
use crate::linalg::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::linalg::sparse::{SparseOpError, sparse_matvec_strided};
use crate::linalg::utils::max_abs_diag;
use crate::space::{BSplineSpace, PointJet, SpaceScratch};
use crate::tape::{Tape, TapeError, Var};
use crate::types::{EnclosureOptions, ProjectionOptions};
use faer::Side;
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

const MAX_DAMPING_STEPS: usize = 12;

#[derive(Error, Debug)]
pub enum SplineError {
    #[error(transparent)]
    Basis(#[from] BasisError),
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
    #[error(transparent)]
    Sparse(#[from] SparseOpError),
    #[error(transparent)]
    Tape(#[from] TapeError),
    #[error("Invalid coefficient layout: {0}")]
    Layout(#[from] LayoutBuildError),
    #[error("Expected {expected} coefficients but {provided} were provided")]
    CoefficientShape { expected: usize, provided: usize },
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("No function named '{0}'")]
    UnknownFunction(String),
    #[error("Unsupported entity: {0}")]
    UnsupportedEntity(String),
}

/// Tensor-product B-spline function with coefficients interleaved over
/// `num_physical_dimensions` (the physical index varies fastest).
#[derive(Clone, Debug)]
pub struct BSplineFunction {
    space: Arc<BSplineSpace>,
    coefficients: Array1<f64>,
    num_physical_dimensions: usize,
}

/// Result of projecting a batch of points.
#[derive(Clone, Debug)]
pub struct Projection {
    /// `[N, D]`
    pub parametric_coordinates: Array2<f64>,
    /// `[N, P]`, the function evaluated at `parametric_coordinates`.
    pub points: Array2<f64>,
    pub distances: Array1<f64>,
    pub converged: Vec<bool>,
}

impl Projection {
    pub fn num_converged(&self) -> usize {
        self.converged.iter().filter(|&&c| c).count()
    }

    pub fn all_converged(&self) -> bool {
        self.converged.iter().all(|&c| c)
    }
}

struct PointProjection {
    parametric: Vec<f64>,
    point: Array1<f64>,
    distance: f64,
    converged: bool,
}

impl BSplineFunction {
    pub fn new(
        space: Arc<BSplineSpace>,
        coefficients: Array1<f64>,
        num_physical_dimensions: usize,
    ) -> Result<Self, SplineError> {
        if num_physical_dimensions == 0 {
            return Err(SplineError::InvalidInput(
                "a function needs at least one physical dimension".to_string(),
            ));
        }
        let expected = space.num_coefficients() * num_physical_dimensions;
        if coefficients.len() != expected {
            return Err(SplineError::CoefficientShape {
                expected,
                provided: coefficients.len(),
            });
        }
        Ok(Self {
            space,
            coefficients,
            num_physical_dimensions,
        })
    }

    /// Caller guarantees `coefficients.len() == space.num_coefficients() * P`.
    pub(crate) fn from_validated(
        space: Arc<BSplineSpace>,
        coefficients: Array1<f64>,
        num_physical_dimensions: usize,
    ) -> Self {
        debug_assert_eq!(
            coefficients.len(),
            space.num_coefficients() * num_physical_dimensions
        );
        Self {
            space,
            coefficients,
            num_physical_dimensions,
        }
    }

    /// Builds a function from a 2-D coefficient array, flattened row-major.
    ///
    /// Any shape is accepted as long as the element count matches; `[n, P]` is
    /// the natural one.
    pub fn from_coefficient_matrix(
        space: Arc<BSplineSpace>,
        coefficients: ArrayView2<'_, f64>,
        num_physical_dimensions: usize,
    ) -> Result<Self, SplineError> {
        let flat = Array1::from_iter(coefficients.iter().copied());
        Self::new(space, flat, num_physical_dimensions)
    }

    pub fn space(&self) -> &Arc<BSplineSpace> {
        &self.space
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn num_physical_dimensions(&self) -> usize {
        self.num_physical_dimensions
    }

    pub fn num_parametric_dimensions(&self) -> usize {
        self.space.num_parametric_dimensions()
    }

    /// `[num_coefficients, P]` view of the interleaved coefficients.
    pub fn coefficient_matrix(&self) -> Result<ArrayView2<'_, f64>, SplineError> {
        self.coefficients
            .view()
            .into_shape_with_order((self.space.num_coefficients(), self.num_physical_dimensions))
            .map_err(|e| SplineError::DimensionMismatch(e.to_string()))
    }

    /// Replaces all coefficients. The length must not change.
    pub fn assign_coefficients(&mut self, coefficients: Array1<f64>) -> Result<(), SplineError> {
        if coefficients.len() != self.coefficients.len() {
            return Err(SplineError::CoefficientShape {
                expected: self.coefficients.len(),
                provided: coefficients.len(),
            });
        }
        self.coefficients = coefficients;
        Ok(())
    }

    fn resolve_derivatives(&self, derivative_orders: &[usize]) -> Vec<usize> {
        if derivative_orders.is_empty() {
            vec![0; self.num_parametric_dimensions()]
        } else {
            derivative_orders.to_vec()
        }
    }

    /// Sparse map from the interleaved coefficients to evaluated values.
    ///
    /// With `expand` the map is block-diagonal (`[N·P, n·P]`); otherwise it is
    /// the scalar basis matrix `[N, n]` meant to be applied with stride `P`.
    /// An empty `derivative_orders` means plain values.
    pub fn evaluation_map(
        &self,
        parametric_coordinates: ArrayView2<'_, f64>,
        derivative_orders: &[usize],
        expand: bool,
    ) -> Result<SparseColMat<usize, f64>, SplineError> {
        let derivatives = self.resolve_derivatives(derivative_orders);
        let expansion = if expand { self.num_physical_dimensions } else { 1 };
        Ok(self
            .space
            .compute_basis_matrix(parametric_coordinates, &derivatives, expansion)?)
    }

    /// Values (or parametric derivatives) at `parametric_coordinates`, `[N, P]`.
    pub fn evaluate(
        &self,
        parametric_coordinates: ArrayView2<'_, f64>,
        derivative_orders: &[usize],
    ) -> Result<Array2<f64>, SplineError> {
        let map = self.evaluation_map(parametric_coordinates, derivative_orders, false)?;
        let flat = sparse_matvec_strided(&map, self.coefficients.view(), self.num_physical_dimensions)?;
        flat.into_shape_with_order((parametric_coordinates.nrows(), self.num_physical_dimensions))
            .map_err(|e| SplineError::DimensionMismatch(e.to_string()))
    }

    /// Records `evaluate` on `tape` with `coefficients` as the coefficient vector.
    /// The output is flat and interleaved (`N·P` values).
    pub fn evaluate_traced(
        &self,
        tape: &Tape,
        coefficients: Var,
        parametric_coordinates: ArrayView2<'_, f64>,
        derivative_orders: &[usize],
    ) -> Result<Var, SplineError> {
        let len = tape.var_len(coefficients)?;
        if len != self.coefficients.len() {
            return Err(SplineError::CoefficientShape {
                expected: self.coefficients.len(),
                provided: len,
            });
        }
        let map = self.evaluation_map(parametric_coordinates, derivative_orders, false)?;
        Ok(tape.linear(Arc::new(map), coefficients, self.num_physical_dimensions)?)
    }

    /// Projects each row of `points` (`[N, P]`) onto the function.
    ///
    /// Without `direction` this finds the closest point. With `direction` only
    /// the residual orthogonal to it is minimized, i.e. the result is where the
    /// ray through the point along `direction` meets the function (or comes
    /// closest to it). Non-converged points keep their best iterate and are
    /// flagged; the batch itself never fails on convergence.
    pub fn project(
        &self,
        points: ArrayView2<'_, f64>,
        direction: Option<ArrayView1<'_, f64>>,
        options: &ProjectionOptions,
    ) -> Result<Projection, SplineError> {
        let phys = self.num_physical_dimensions;
        let dims = self.num_parametric_dimensions();
        if points.ncols() != phys {
            return Err(SplineError::DimensionMismatch(format!(
                "points have {} components but the function has {phys}",
                points.ncols()
            )));
        }
        if points.iter().any(|v| !v.is_finite()) {
            return Err(SplineError::InvalidInput(
                "points to project must be finite".to_string(),
            ));
        }
        let direction = match direction {
            Some(d) => {
                if d.len() != phys {
                    return Err(SplineError::DimensionMismatch(format!(
                        "direction has {} components but the function has {phys}",
                        d.len()
                    )));
                }
                let norm = d.dot(&d).sqrt();
                if !norm.is_finite() || norm == 0.0 {
                    return Err(SplineError::InvalidInput(
                        "projection direction must be finite and nonzero".to_string(),
                    ));
                }
                Some(&d / norm)
            }
            None => None,
        };

        let space = self.space.as_ref();
        let domains = space.domains();
        let grid = map_to_domains(tensor_grid(&vec![options.grid_search_density.max(2); dims]), &domains);
        let grid_values = self.evaluate(grid.view(), &[])?;
        let coefficients = self.coefficient_matrix()?;

        let results: Vec<PointProjection> = spline_thread_pool().install(|| {
            points
                .axis_iter(Axis(0))
                .into_par_iter()
                .map_init(
                    || SpaceScratch::new(space),
                    |scratch, target| {
                        let start = closest_sample(&grid, &grid_values, target, direction.as_ref());
                        project_point(
                            space,
                            coefficients,
                            target,
                            direction.as_ref(),
                            &start,
                            &domains,
                            options,
                            scratch,
                        )
                    },
                )
                .collect::<Result<Vec<_>, SplineError>>()
        })?;

        let n = points.nrows();
        let mut projection = Projection {
            parametric_coordinates: Array2::zeros((n, dims)),
            points: Array2::zeros((n, phys)),
            distances: Array1::zeros(n),
            converged: Vec::with_capacity(n),
        };
        for (i, result) in results.into_iter().enumerate() {
            for (d, &u) in result.parametric.iter().enumerate() {
                projection.parametric_coordinates[[i, d]] = u;
            }
            projection.points.row_mut(i).assign(&result.point);
            projection.distances[i] = result.distance;
            projection.converged.push(result.converged);
        }

        let failed = n - projection.num_converged();
        if failed > 0 {
            log::warn!(
                "Projection did not converge for {failed} of {n} points within {} iterations",
                options.max_iterations
            );
        } else {
            log::debug!("Projected {n} points onto a {dims}-parametric function");
        }
        Ok(projection)
    }

    /// Multilinear interpolation of `corners` over an open-uniform space.
    ///
    /// `corners` holds `2^D` rows of `P` values ordered like a row-major
    /// `2 × … × 2` array (the last parametric dimension varies fastest). Control
    /// points sit at the multilinear map of their Greville abscissae, so the
    /// function reproduces the map exactly and interpolates every corner.
    pub fn from_corners(
        corners: ArrayView2<'_, f64>,
        orders: &[usize],
        num_coefficients: &[usize],
    ) -> Result<Self, SplineError> {
        let dims = orders.len();
        if num_coefficients.len() != dims {
            return Err(SplineError::DimensionMismatch(format!(
                "{dims} orders but {} coefficient counts",
                num_coefficients.len()
            )));
        }
        if corners.nrows() != 1 << dims {
            return Err(SplineError::DimensionMismatch(format!(
                "{dims} parametric dimensions need {} corners, got {}",
                1 << dims,
                corners.nrows()
            )));
        }
        let phys = corners.ncols();
        let space = BSplineSpace::open_uniform(orders, num_coefficients)?;
        let abscissae: Vec<Vec<f64>> = (0..dims)
            .map(|d| greville_abscissae(space.knot_vectors()[d].view(), orders[d], num_coefficients[d]))
            .collect();

        let total = space.num_coefficients();
        let mut coefficients = Array1::<f64>::zeros(total * phys);
        let mut index = vec![0usize; dims];
        for row in 0..total {
            // Row-major multi-index of this coefficient.
            let mut rem = row;
            for d in (0..dims).rev() {
                index[d] = rem % num_coefficients[d];
                rem /= num_coefficients[d];
            }
            for corner in 0..(1usize << dims) {
                let mut weight = 1.0;
                for d in 0..dims {
                    let bit = (corner >> (dims - 1 - d)) & 1;
                    let t = abscissae[d][index[d]];
                    weight *= if bit == 1 { t } else { 1.0 - t };
                }
                if weight == 0.0 {
                    continue;
                }
                for p in 0..phys {
                    coefficients[row * phys + p] += weight * corners[[corner, p]];
                }
            }
        }
        Self::new(Arc::new(space), coefficients, phys)
    }

    /// Axis-aligned block whose parametric and physical dimensions both equal
    /// `points.ncols()`, tightly enclosing `points`.
    ///
    /// Flat extents are widened to `minimum_thickness` about their midpoint.
    pub fn enclosure_block(
        points: ArrayView2<'_, f64>,
        num_coefficients: &[usize],
        orders: &[usize],
        options: &EnclosureOptions,
    ) -> Result<Self, SplineError> {
        let dims = points.ncols();
        if points.nrows() == 0 || dims == 0 {
            return Err(SplineError::InvalidInput(
                "cannot enclose an empty point cloud".to_string(),
            ));
        }
        if points.iter().any(|v| !v.is_finite()) {
            return Err(SplineError::InvalidInput(
                "cannot enclose non-finite points".to_string(),
            ));
        }
        if num_coefficients.len() != dims || orders.len() != dims {
            return Err(SplineError::DimensionMismatch(format!(
                "points have {dims} components but {} coefficient counts and {} orders were given",
                num_coefficients.len(),
                orders.len()
            )));
        }

        let mut lower = vec![0.0; dims];
        let mut upper = vec![0.0; dims];
        for d in 0..dims {
            let column = points.column(d);
            let mut lo = column.fold(f64::INFINITY, |acc, &v| acc.min(v));
            let mut hi = column.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
            let extent = hi - lo;
            if extent < options.minimum_thickness {
                let mid = 0.5 * (lo + hi);
                lo = mid - 0.5 * options.minimum_thickness;
                hi = mid + 0.5 * options.minimum_thickness;
            } else {
                let pad = options.padding * extent;
                lo -= pad;
                hi += pad;
            }
            lower[d] = lo;
            upper[d] = hi;
        }

        let mut corners = Array2::<f64>::zeros((1 << dims, dims));
        for corner in 0..(1usize << dims) {
            for d in 0..dims {
                let bit = (corner >> (dims - 1 - d)) & 1;
                corners[[corner, d]] = if bit == 1 { upper[d] } else { lower[d] };
            }
        }
        Self::from_corners(corners.view(), orders, num_coefficients)
    }
}

pub(crate) fn greville_abscissae(knots: ArrayView1<'_, f64>, order: usize, num_coefficients: usize) -> Vec<f64> {
    let degree = order - 1;
    (0..num_coefficients)
        .map(|i| {
            if degree == 0 {
                0.5 * (knots[i] + knots[i + 1])
            } else {
                (1..=degree).map(|j| knots[i + j]).sum::<f64>() / degree as f64
            }
        })
        .collect()
}

/// Regular row-major grid over `[0, 1]^D` with `resolution[d]` samples in dimension `d`.
pub(crate) fn tensor_grid(resolution: &[usize]) -> Array2<f64> {
    let dims = resolution.len();
    let total: usize = resolution.iter().product();
    let mut grid = Array2::<f64>::zeros((total, dims));
    for row in 0..total {
        let mut rem = row;
        for d in (0..dims).rev() {
            let n = resolution[d];
            grid[[row, d]] = if n > 1 { (rem % n) as f64 / (n - 1) as f64 } else { 0.5 };
            rem /= n;
        }
    }
    grid
}

/// Affinely maps unit-cube coordinates onto each dimension's `(lo, hi)` domain.
pub(crate) fn map_to_domains(mut unit: Array2<f64>, domains: &[(f64, f64)]) -> Array2<f64> {
    for (d, &(lo, hi)) in domains.iter().enumerate() {
        unit.column_mut(d).mapv_inplace(|t| lo + t * (hi - lo));
    }
    unit
}

fn residual(value: ArrayView1<'_, f64>, target: ArrayView1<'_, f64>, direction: Option<&Array1<f64>>) -> Array1<f64> {
    let r = &value - &target;
    match direction {
        Some(d) => {
            let along = r.dot(d);
            r - &(d * along)
        }
        None => r,
    }
}

fn closest_sample(
    grid: &Array2<f64>,
    grid_values: &Array2<f64>,
    target: ArrayView1<'_, f64>,
    direction: Option<&Array1<f64>>,
) -> Vec<f64> {
    let mut best = 0usize;
    let mut best_value = f64::INFINITY;
    for (i, value) in grid_values.axis_iter(Axis(0)).enumerate() {
        let r = residual(value, target, direction);
        let f = r.dot(&r);
        if f < best_value {
            best_value = f;
            best = i;
        }
    }
    grid.row(best).to_vec()
}

/// Gradient and Gauss-Newton-plus-curvature Hessian of `½‖Π r‖²`, where `Π`
/// removes the component along `direction` (identity when absent).
fn newton_terms(jet: &PointJet, r: &Array1<f64>, direction: Option<&Array1<f64>>) -> (Array1<f64>, Array2<f64>) {
    let dims = jet.first.nrows();
    let projected: Vec<Array1<f64>> = (0..dims)
        .map(|a| {
            let column = jet.first.row(a).to_owned();
            match direction {
                Some(d) => {
                    let along = column.dot(d);
                    column - &(d * along)
                }
                None => column,
            }
        })
        .collect();

    let mut gradient = Array1::<f64>::zeros(dims);
    let mut hessian = Array2::<f64>::zeros((dims, dims));
    for a in 0..dims {
        gradient[a] = projected[a].dot(r);
        for b in 0..dims {
            let curvature: f64 = (0..r.len()).map(|p| r[p] * jet.second[[a, b, p]]).sum();
            hessian[[a, b]] = projected[a].dot(&projected[b]) + curvature;
        }
    }
    (gradient, hessian)
}

/// Norm of the gradient after zeroing components blocked by the domain bounds.
fn projected_gradient_norm(u: &[f64], gradient: &Array1<f64>, domains: &[(f64, f64)]) -> f64 {
    u.iter()
        .zip(gradient.iter())
        .zip(domains)
        .map(|((&x, &g), &(lo, hi))| {
            let blocked = (x <= lo && g > 0.0) || (x >= hi && g < 0.0);
            if blocked { 0.0 } else { g * g }
        })
        .sum::<f64>()
        .sqrt()
}

fn damped_step(hessian: &Array2<f64>, gradient: &Array1<f64>, lambda: f64) -> Option<Array1<f64>> {
    let mut system = hessian.clone();
    for i in 0..system.nrows() {
        system[[i, i]] += lambda;
    }
    let factor = system.cholesky(Side::Lower).ok()?;
    let step = -factor.solve_vec(gradient);
    step.iter().all(|v| v.is_finite()).then_some(step)
}

fn project_point(
    space: &BSplineSpace,
    coefficients: ArrayView2<'_, f64>,
    target: ArrayView1<'_, f64>,
    direction: Option<&Array1<f64>>,
    start: &[f64],
    domains: &[(f64, f64)],
    options: &ProjectionOptions,
    scratch: &mut SpaceScratch,
) -> Result<PointProjection, SplineError> {
    let mut u = start.to_vec();
    let mut jet = space.evaluate_local(&u, coefficients, scratch)?;
    let mut r = residual(jet.value.view(), target, direction);
    let mut objective = 0.5 * r.dot(&r);
    let mut lambda = 0.0f64;
    let mut converged = false;

    'newton: for _ in 0..options.max_iterations {
        let (gradient, hessian) = newton_terms(&jet, &r, direction);
        let pg = projected_gradient_norm(&u, &gradient, domains);
        if pg <= options.tolerance {
            converged = true;
            break;
        }
        let scale = max_abs_diag(&hessian);

        let mut accepted = false;
        for _ in 0..MAX_DAMPING_STEPS {
            let Some(step) = damped_step(&hessian, &gradient, lambda) else {
                lambda = if lambda == 0.0 { 1e-6 * scale } else { lambda * 10.0 };
                continue;
            };
            let trial: Vec<f64> = u
                .iter()
                .zip(step.iter())
                .zip(domains)
                .map(|((&x, &dx), &(lo, hi))| (x + dx).clamp(lo, hi))
                .collect();
            let step_norm = trial
                .iter()
                .zip(&u)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                .sqrt();
            if step_norm <= options.tolerance {
                converged = true;
                break 'newton;
            }
            let trial_jet = space.evaluate_local(&trial, coefficients, scratch)?;
            let trial_r = residual(trial_jet.value.view(), target, direction);
            let trial_objective = 0.5 * trial_r.dot(&trial_r);
            if trial_objective <= objective {
                u = trial;
                jet = trial_jet;
                r = trial_r;
                objective = trial_objective;
                lambda *= 0.1;
                if lambda < 1e-12 * scale {
                    lambda = 0.0;
                }
                accepted = true;
                break;
            }
            lambda = if lambda == 0.0 { 1e-6 * scale } else { lambda * 10.0 };
        }
        if !accepted {
            // No descent left at this precision.
            converged = pg <= options.tolerance.sqrt();
            break;
        }
    }

    let distance = (&jet.value - &target).mapv(|v| v * v).sum().sqrt();
    Ok(PointProjection {
        parametric: u,
        point: jet.value,
        distance,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn curved_surface() -> BSplineFunction {
        let space = Arc::new(BSplineSpace::open_uniform(&[3, 3], &[4, 4]).unwrap());
        let mut coefficients = Array1::<f64>::zeros(16 * 3);
        for i in 0..4 {
            for j in 0..4 {
                let row = i * 4 + j;
                let x = i as f64 / 3.0;
                let y = j as f64 / 3.0;
                coefficients[row * 3] = x;
                coefficients[row * 3 + 1] = y;
                coefficients[row * 3 + 2] = 0.3 * (x - 0.5) * (y - 0.5) + 0.1 * x * x;
            }
        }
        BSplineFunction::new(space, coefficients, 3).unwrap()
    }

    #[test]
    fn new_rejects_wrong_coefficient_count() {
        let space = Arc::new(BSplineSpace::open_uniform(&[2, 2], &[3, 3]).unwrap());
        let err = BSplineFunction::new(space, Array1::zeros(26), 3).unwrap_err();
        assert!(matches!(
            err,
            SplineError::CoefficientShape {
                expected: 27,
                provided: 26
            }
        ));
    }

    #[test]
    fn coefficient_matrix_flattening_is_accepted() {
        let space = Arc::new(BSplineSpace::open_uniform(&[2], &[3]).unwrap());
        let matrix = array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]];
        let f = BSplineFunction::from_coefficient_matrix(space, matrix.view(), 2).unwrap();
        assert_eq!(f.coefficients().to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(f.coefficient_matrix().unwrap(), matrix);
    }

    #[test]
    fn corners_are_interpolated_and_interior_is_multilinear() {
        let corners = array![
            [0.0, 0.0, 0.0],
            [0.0, 2.0, 0.5],
            [3.0, 0.0, 0.0],
            [3.0, 2.0, 1.0]
        ];
        let f = BSplineFunction::from_corners(corners.view(), &[4, 3], &[6, 5]).unwrap();
        let at_corners = f
            .evaluate(array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]].view(), &[])
            .unwrap();
        for (a, b) in at_corners.iter().zip(corners.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        let mid = f.evaluate(array![[0.25, 0.5]].view(), &[]).unwrap();
        assert_abs_diff_eq!(mid[[0, 0]], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(mid[[0, 1]], 1.0, epsilon = 1e-12);
        let bilinear_z = 0.75 * 0.5 * 0.5 + 0.25 * 0.5 * 1.0;
        assert_abs_diff_eq!(mid[[0, 2]], bilinear_z, epsilon = 1e-12);
    }

    #[test]
    fn enclosure_pads_flat_axes() {
        let points = array![[0.0, -2.0, 0.0], [1.0, 2.0, 0.0], [0.5, 0.0, 0.0]];
        let options = EnclosureOptions {
            padding: 0.0,
            minimum_thickness: 0.2,
        };
        let block = BSplineFunction::enclosure_block(points.view(), &[2, 3, 2], &[2, 2, 2], &options).unwrap();
        let lo = block.evaluate(array![[0.0, 0.0, 0.0]].view(), &[]).unwrap();
        let hi = block.evaluate(array![[1.0, 1.0, 1.0]].view(), &[]).unwrap();
        assert_abs_diff_eq!(lo[[0, 1]], -2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hi[[0, 1]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(lo[[0, 2]], -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(hi[[0, 2]], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn projection_recovers_points_on_the_surface() {
        let f = curved_surface();
        let params = array![[0.2, 0.3], [0.75, 0.6], [0.5, 0.95], [0.0, 0.4]];
        let on_surface = f.evaluate(params.view(), &[]).unwrap();
        let projection = f.project(on_surface.view(), None, &ProjectionOptions::default()).unwrap();
        assert!(projection.all_converged());
        for i in 0..params.nrows() {
            assert!(projection.distances[i] < 1e-8, "distance {:.3e}", projection.distances[i]);
            for d in 0..2 {
                assert_abs_diff_eq!(projection.parametric_coordinates[[i, d]], params[[i, d]], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn directional_projection_follows_the_ray() {
        let f = curved_surface();
        let params = array![[0.4, 0.35]];
        let on_surface = f.evaluate(params.view(), &[]).unwrap();
        // Offset the point straight up; projecting along z must come back down.
        let mut lifted = on_surface.clone();
        lifted[[0, 2]] += 0.7;
        let direction = array![0.0, 0.0, 1.0];
        let projection = f
            .project(lifted.view(), Some(direction.view()), &ProjectionOptions::default())
            .unwrap();
        assert!(projection.converged[0]);
        assert_abs_diff_eq!(projection.parametric_coordinates[[0, 0]], 0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(projection.parametric_coordinates[[0, 1]], 0.35, epsilon = 1e-6);
        assert_abs_diff_eq!(projection.distances[0], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn projection_searches_the_whole_knot_domain() {
        let space = BSplineSpace::new(vec![2], vec![array![0.0, 0.0, 2.0, 2.0]], vec![2]).unwrap();
        let line = BSplineFunction::new(Arc::new(space), array![0.0, 2.0], 1).unwrap();
        let value = line.evaluate(array![[1.5]].view(), &[]).unwrap();
        assert_abs_diff_eq!(value[[0, 0]], 1.5, epsilon = 1e-14);

        let projection = line
            .project(array![[1.5], [0.25], [3.0]].view(), None, &ProjectionOptions::default())
            .unwrap();
        assert!(projection.all_converged());
        assert_abs_diff_eq!(projection.parametric_coordinates[[0, 0]], 1.5, epsilon = 1e-8);
        assert_abs_diff_eq!(projection.distances[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(projection.parametric_coordinates[[1, 0]], 0.25, epsilon = 1e-8);
        // Beyond the end the closest point is the upper domain bound.
        assert_abs_diff_eq!(projection.parametric_coordinates[[2, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(projection.distances[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn projection_rejects_bad_input() {
        let f = curved_surface();
        assert!(f.project(array![[0.0, 0.0]].view(), None, &ProjectionOptions::default()).is_err());
        let zero = array![0.0, 0.0, 0.0];
        assert!(
            f.project(array![[0.0, 0.0, 0.0]].view(), Some(zero.view()), &ProjectionOptions::default())
                .is_err()
        );
    }

    #[test]
    fn traced_evaluation_matches_plain_evaluation() {
        let f = curved_surface();
        let coords = array![[0.1, 0.9], [0.6, 0.2]];
        let tape = Tape::new();
        let c = tape.leaf(f.coefficients().clone());
        let out = f.evaluate_traced(&tape, c, coords.view(), &[]).unwrap();
        let plain = f.evaluate(coords.view(), &[]).unwrap();
        let traced = tape.value(out).unwrap();
        for (a, b) in traced.iter().zip(plain.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-14);
        }
    }
}
