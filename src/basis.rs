use ndarray::{Array1, Array2, ArrayView1};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::OnceLock;
use thiserror::Error;

#[cfg(test)]
use approx::assert_abs_diff_eq;

/// Shared pool for the embarrassingly parallel fan-out (basis rows, projections, refits).
pub(crate) fn spline_thread_pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .build()
            .expect("spline thread pool initialization should succeed")
    })
}

const KNOT_SPAN_TOL: f64 = 1e-12;

/// Errors raised while building or validating B-spline bases.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("B-spline order must be at least 1, but was {0}.")]
    InvalidOrder(usize),

    #[error(
        "Order {order} needs at least {order} coefficients, but only {num_coefficients} were requested."
    )]
    TooFewCoefficients {
        order: usize,
        num_coefficients: usize,
    },

    #[error(
        "Knot vector length {provided} is inconsistent with order {order} and {num_coefficients} coefficients (expected {expected})."
    )]
    KnotLengthMismatch {
        order: usize,
        num_coefficients: usize,
        expected: usize,
        provided: usize,
    },

    #[error(
        "The provided knot vector is invalid: {0}. It must be non-decreasing and contain only finite values."
    )]
    InvalidKnotVector(String),

    #[error("Failed to build sparse basis matrix: {0}")]
    SparseCreation(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Builds a clamped, open-uniform knot vector normalized to [0, 1].
///
/// The first and last knots are repeated `order` times and the
/// `num_coefficients - order` interior knots are evenly spaced.
pub fn open_uniform_knot_vector(
    num_coefficients: usize,
    order: usize,
) -> Result<Array1<f64>, BasisError> {
    if order < 1 {
        return Err(BasisError::InvalidOrder(order));
    }
    if num_coefficients < order {
        return Err(BasisError::TooFewCoefficients {
            order,
            num_coefficients,
        });
    }

    let num_internal = num_coefficients - order;
    let h = 1.0 / (num_internal as f64 + 1.0);
    let mut knots = Vec::with_capacity(num_coefficients + order);
    knots.extend(std::iter::repeat_n(0.0, order));
    for i in 1..=num_internal {
        knots.push(i as f64 * h);
    }
    knots.extend(std::iter::repeat_n(1.0, order));
    Ok(Array1::from_vec(knots))
}

/// Checks that `knots` is a valid knot vector for `num_coefficients` basis functions of `order`.
pub fn validate_knot_vector(
    knots: ArrayView1<f64>,
    order: usize,
    num_coefficients: usize,
) -> Result<(), BasisError> {
    if order < 1 {
        return Err(BasisError::InvalidOrder(order));
    }
    if num_coefficients < order {
        return Err(BasisError::TooFewCoefficients {
            order,
            num_coefficients,
        });
    }
    let expected = num_coefficients + order;
    if knots.len() != expected {
        return Err(BasisError::KnotLengthMismatch {
            order,
            num_coefficients,
            expected,
            provided: knots.len(),
        });
    }
    if knots.iter().any(|k| !k.is_finite()) {
        return Err(BasisError::InvalidKnotVector(
            "knot vector contains non-finite (NaN or Infinity) values".to_string(),
        ));
    }
    if knots.windows(2).into_iter().any(|w| w[0] > w[1]) {
        return Err(BasisError::InvalidKnotVector(
            "knot vector is not non-decreasing".to_string(),
        ));
    }
    if knots[num_coefficients] - knots[order - 1] <= KNOT_SPAN_TOL {
        return Err(BasisError::InvalidKnotVector(
            "parametric domain has zero width".to_string(),
        ));
    }
    Ok(())
}

/// Reusable buffers for basis evaluation in tight loops.
#[derive(Clone, Debug)]
pub struct BasisScratch {
    order: usize,
    left: Vec<f64>,
    right: Vec<f64>,
    ndu: Vec<f64>,
    a: Vec<f64>,
    ders: Vec<f64>,
}

impl BasisScratch {
    pub fn new(order: usize) -> Self {
        let order = order.max(1);
        Self {
            order,
            left: vec![0.0; order],
            right: vec![0.0; order],
            ndu: vec![0.0; order * order],
            a: vec![0.0; 2 * order],
            ders: Vec::new(),
        }
    }

    #[inline]
    fn ensure_order(&mut self, order: usize) {
        if self.order != order {
            *self = Self::new(order);
        }
    }
}

#[inline]
fn guarded_div(num: f64, den: f64) -> f64 {
    if den.abs() > KNOT_SPAN_TOL { num / den } else { 0.0 }
}

/// Index `mu` of the knot span `[t_mu, t_mu+1)` containing `x`.
///
/// `x` must already be clamped to the domain. The right end of the domain maps
/// to the last nonempty span.
#[inline]
pub(crate) fn find_span(knots: ArrayView1<f64>, order: usize, num_coefficients: usize, x: f64) -> usize {
    let degree = order - 1;
    if x >= knots[num_coefficients] {
        let mut span = num_coefficients - 1;
        while span > degree && knots[span] >= knots[num_coefficients] {
            span -= 1;
        }
        return span;
    }
    let mut lo = degree + 1;
    let mut hi = num_coefficients;
    // Count knots in [degree + 1, num_coefficients) that are <= x.
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if knots[mid] <= x {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo - 1
}

/// Clamps `x` into the parametric domain `[t_{order-1}, t_{num_coefficients}]`.
#[inline]
pub(crate) fn clamp_to_domain(knots: ArrayView1<f64>, order: usize, num_coefficients: usize, x: f64) -> f64 {
    let lo = knots[order - 1];
    let hi = knots[num_coefficients];
    if x.is_nan() { lo } else { x.clamp(lo, hi) }
}

/// Evaluates the nonzero basis functions and their derivatives up to `max_derivative`.
///
/// On return `out[k * order + j]` holds the k-th derivative of basis function
/// `first + j`, where `first` is the returned index. `out` must hold at least
/// `(max_derivative + 1) * order` values. Derivatives of order `>= order` are zero.
/// This is the triangular-table form of Cox-de Boor with the derivative recurrence
/// from "The NURBS Book" (A2.3).
pub(crate) fn evaluate_nonzero_derivatives_unchecked(
    order: usize,
    knots: ArrayView1<f64>,
    num_coefficients: usize,
    max_derivative: usize,
    x: f64,
    out: &mut [f64],
    scratch: &mut BasisScratch,
) -> usize {
    scratch.ensure_order(order);
    let p = order - 1;
    let x = clamp_to_domain(knots, order, num_coefficients, x);
    let span = find_span(knots, order, num_coefficients, x);

    let BasisScratch {
        left, right, ndu, a, ..
    } = scratch;
    let idx = |row: usize, col: usize| row * order + col;

    ndu[idx(0, 0)] = 1.0;
    for j in 1..=p {
        left[j] = x - knots[span + 1 - j];
        right[j] = knots[span + j] - x;
        let mut saved = 0.0;
        for r in 0..j {
            ndu[idx(j, r)] = right[r + 1] + left[j - r];
            let temp = guarded_div(ndu[idx(r, j - 1)], ndu[idx(j, r)]);
            ndu[idx(r, j)] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        ndu[idx(j, j)] = saved;
    }

    let used = (max_derivative + 1) * order;
    out[..used].fill(0.0);
    for j in 0..=p {
        out[j] = ndu[idx(j, p)];
    }

    let n = max_derivative.min(p);
    if n > 0 {
        for r in 0..=p {
            let (mut s1, mut s2) = (0usize, 1usize);
            a[0] = 1.0;
            for k in 1..=n {
                let mut d = 0.0;
                let rk = r as isize - k as isize;
                let pk = p - k;
                if rk >= 0 {
                    let rk = rk as usize;
                    a[s2 * order] = guarded_div(a[s1 * order], ndu[idx(pk + 1, rk)]);
                    d = a[s2 * order] * ndu[idx(rk, pk)];
                }
                let j1 = if rk >= -1 { 1 } else { (-rk) as usize };
                let j2 = if r as isize - 1 <= pk as isize { k - 1 } else { p - r };
                for j in j1..=j2 {
                    let col = (rk + j as isize) as usize;
                    a[s2 * order + j] = guarded_div(
                        a[s1 * order + j] - a[s1 * order + j - 1],
                        ndu[idx(pk + 1, col)],
                    );
                    d += a[s2 * order + j] * ndu[idx(col, pk)];
                }
                if r <= pk {
                    a[s2 * order + k] = guarded_div(-a[s1 * order + k - 1], ndu[idx(pk + 1, r)]);
                    d += a[s2 * order + k] * ndu[idx(r, pk)];
                }
                out[k * order + r] = d;
                std::mem::swap(&mut s1, &mut s2);
            }
        }

        let mut factor = p as f64;
        for k in 1..=n {
            for j in 0..=p {
                out[k * order + j] *= factor;
            }
            factor *= (p - k) as f64;
        }
    }

    span - p
}

/// Evaluates the `order` nonzero basis values (or their `derivative_order`-th
/// derivative) at `x` into `out`, returning the index of the first active function.
pub(crate) fn evaluate_nonzero_basis_unchecked(
    order: usize,
    knots: ArrayView1<f64>,
    num_coefficients: usize,
    derivative_order: usize,
    x: f64,
    out: &mut [f64],
    scratch: &mut BasisScratch,
) -> usize {
    if derivative_order == 0 {
        let mut table = std::mem::take(&mut scratch.ders);
        table.resize(order, 0.0);
        let first = evaluate_nonzero_derivatives_unchecked(
            order,
            knots,
            num_coefficients,
            0,
            x,
            &mut table,
            scratch,
        );
        out[..order].copy_from_slice(&table[..order]);
        scratch.ders = table;
        return first;
    }

    let mut table = std::mem::take(&mut scratch.ders);
    table.resize((derivative_order + 1) * order, 0.0);
    let first = evaluate_nonzero_derivatives_unchecked(
        order,
        knots,
        num_coefficients,
        derivative_order,
        x,
        &mut table,
        scratch,
    );
    let offset = derivative_order * order;
    out[..order].copy_from_slice(&table[offset..offset + order]);
    scratch.ders = table;
    first
}

/// Checked, allocation-free entry into the basis engine.
///
/// Writes the `order` nonzero values into `out` and returns the first active index.
pub fn evaluate_nonzero_basis(
    order: usize,
    knots: ArrayView1<f64>,
    num_coefficients: usize,
    derivative_order: usize,
    x: f64,
    out: &mut [f64],
    scratch: &mut BasisScratch,
) -> Result<usize, BasisError> {
    validate_knot_vector(knots, order, num_coefficients)?;
    if out.len() < order {
        return Err(BasisError::DimensionMismatch(format!(
            "output buffer holds {} values but order {order} needs {order}",
            out.len()
        )));
    }
    Ok(evaluate_nonzero_basis_unchecked(
        order,
        knots,
        num_coefficients,
        derivative_order,
        x,
        out,
        scratch,
    ))
}

/// Evaluates the nonzero basis functions of a single parametric dimension.
///
/// Returns the `order` nonzero values (or their `derivative_order`-th derivative)
/// and the coefficient index of the first one. `x` is clamped to the knot domain.
pub fn basis(
    order: usize,
    num_coefficients: usize,
    knots: ArrayView1<f64>,
    derivative_order: usize,
    x: f64,
) -> Result<(Array1<f64>, usize), BasisError> {
    let mut values = vec![0.0; order];
    let mut scratch = BasisScratch::new(order);
    let first = evaluate_nonzero_basis(
        order,
        knots,
        num_coefficients,
        derivative_order,
        x,
        &mut values,
        &mut scratch,
    )?;
    Ok((Array1::from_vec(values), first))
}

/// Evaluates every nonzero basis derivative up to `max_derivative` at `x`.
///
/// Row `k` of the returned `(max_derivative + 1, order)` table is the k-th derivative.
pub fn basis_derivatives(
    order: usize,
    num_coefficients: usize,
    knots: ArrayView1<f64>,
    max_derivative: usize,
    x: f64,
) -> Result<(Array2<f64>, usize), BasisError> {
    validate_knot_vector(knots, order, num_coefficients)?;
    let mut table = vec![0.0; (max_derivative + 1) * order];
    let mut scratch = BasisScratch::new(order);
    let first = evaluate_nonzero_derivatives_unchecked(
        order,
        knots,
        num_coefficients,
        max_derivative,
        x,
        &mut table,
        &mut scratch,
    );
    let table = Array2::from_shape_vec((max_derivative + 1, order), table)
        .map_err(|e| BasisError::DimensionMismatch(e.to_string()))?;
    Ok((table, first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// Independent recursive Cox-de Boor evaluation of B_{i,order}(x), used to
    /// cross-check the triangular-table implementation.
    fn reference_basis(x: f64, knots: &Array1<f64>, i: usize, order: usize, num_coefficients: usize) -> f64 {
        let last = knots[num_coefficients];
        if order == 1 {
            if x >= knots[i] && x < knots[i + 1] {
                return 1.0;
            }
            // Closed right end on the last nonempty span.
            if (x - last).abs() < 1e-14 && knots[i + 1] == last && knots[i] < last {
                return 1.0;
            }
            return 0.0;
        }
        let mut result = 0.0;
        let den1 = knots[i + order - 1] - knots[i];
        if den1.abs() > 1e-12 {
            result += (x - knots[i]) / den1 * reference_basis(x, knots, i, order - 1, num_coefficients);
        }
        let den2 = knots[i + order] - knots[i + 1];
        if den2.abs() > 1e-12 {
            result += (knots[i + order] - x) / den2
                * reference_basis(x, knots, i + 1, order - 1, num_coefficients);
        }
        result
    }

    #[test]
    fn open_uniform_knots_are_clamped_and_normalized() {
        let knots = open_uniform_knot_vector(6, 3).unwrap();
        let expected = array![0.0, 0.0, 0.0, 0.25, 0.5, 0.75, 1.0, 1.0, 1.0];
        assert_abs_diff_eq!(
            knots.as_slice().unwrap(),
            expected.as_slice().unwrap(),
            epsilon = 1e-12
        );

        let linear = open_uniform_knot_vector(2, 2).unwrap();
        assert_eq!(linear.to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn basis_partition_of_unity_across_orders_and_knots() {
        let non_uniform = array![0.0, 0.0, 0.0, 0.0, 0.1, 0.15, 0.6, 0.6, 0.9, 1.0, 1.0, 1.0, 1.0];
        for order in 1..=5 {
            for num_coefficients in order..order + 6 {
                let knots = open_uniform_knot_vector(num_coefficients, order).unwrap();
                for step in 0..=100 {
                    let x = step as f64 / 100.0;
                    let (values, _) = basis(order, num_coefficients, knots.view(), 0, x).unwrap();
                    assert_abs_diff_eq!(values.sum(), 1.0, epsilon = 1e-12);
                }
            }
        }
        for step in 0..=200 {
            let x = step as f64 / 200.0;
            let (values, _) = basis(4, 9, non_uniform.view(), 0, x).unwrap();
            assert_abs_diff_eq!(values.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn basis_matches_recursive_reference() {
        let knots = array![0.0, 0.0, 0.0, 0.0, 0.2, 0.5, 0.5, 0.8, 1.0, 1.0, 1.0, 1.0];
        let order = 4;
        let n = knots.len() - order;
        for step in 0..=50 {
            let x = step as f64 / 50.0;
            let (values, first) = basis(order, n, knots.view(), 0, x).unwrap();
            for i in 0..n {
                let expected = reference_basis(x, &knots, i, order, n);
                let actual = if i >= first && i < first + order {
                    values[i - first]
                } else {
                    0.0
                };
                assert_abs_diff_eq!(actual, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let knots = open_uniform_knot_vector(7, 4).unwrap();
        let n = 7;
        let h = 1e-6;
        for &x in &[0.05, 0.21, 0.45, 0.63, 0.9] {
            let (table, first) = basis_derivatives(4, n, knots.view(), 2, x).unwrap();
            let (plus, first_plus) = basis_derivatives(4, n, knots.view(), 1, x + h).unwrap();
            let (minus, first_minus) = basis_derivatives(4, n, knots.view(), 1, x - h).unwrap();
            assert_eq!(first, first_plus);
            assert_eq!(first, first_minus);
            for j in 0..4 {
                let fd_first = (plus[[0, j]] - minus[[0, j]]) / (2.0 * h);
                let fd_second = (plus[[1, j]] - minus[[1, j]]) / (2.0 * h);
                assert_abs_diff_eq!(table[[1, j]], fd_first, epsilon = 1e-6);
                assert_abs_diff_eq!(table[[2, j]], fd_second, epsilon = 1e-4);
            }
            // Derivatives of a partition of unity sum to zero.
            assert_abs_diff_eq!(table.row(1).sum(), 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(table.row(2).sum(), 0.0, epsilon = 1e-7);
        }
    }

    #[test]
    fn derivative_beyond_degree_is_zero() {
        let knots = open_uniform_knot_vector(3, 2).unwrap();
        let (values, _) = basis(2, 3, knots.view(), 2, 0.3).unwrap();
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn endpoints_and_out_of_domain_values_are_clamped() {
        let knots = open_uniform_knot_vector(5, 3).unwrap();
        let (at_one, first) = basis(3, 5, knots.view(), 0, 1.0).unwrap();
        assert_eq!(first, 2);
        assert_abs_diff_eq!(at_one[2], 1.0, epsilon = 1e-14);

        let (beyond, first_beyond) = basis(3, 5, knots.view(), 0, 1.7).unwrap();
        assert_eq!(first, first_beyond);
        assert_abs_diff_eq!(
            beyond.as_slice().unwrap(),
            at_one.as_slice().unwrap(),
            epsilon = 1e-14
        );

        let (below, first_below) = basis(3, 5, knots.view(), 0, -0.5).unwrap();
        assert_eq!(first_below, 0);
        assert_abs_diff_eq!(below[0], 1.0, epsilon = 1e-14);
    }

    #[test]
    fn interior_knot_uses_right_continuity() {
        // Linear basis with an interior knot at 0.5: at x = 0.5 the right span is used.
        let knots = array![0.0, 0.0, 0.5, 1.0, 1.0];
        let (values, first) = basis(2, 3, knots.view(), 0, 0.5).unwrap();
        assert_eq!(first, 1);
        assert_abs_diff_eq!(values[0], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(values[1], 0.0, epsilon = 1e-14);
    }

    #[test]
    fn scratch_is_reused_across_orders() {
        let mut scratch = BasisScratch::new(2);
        let mut out = [0.0; 5];
        for order in [2, 5, 3] {
            let knots = open_uniform_knot_vector(order + 2, order).unwrap();
            let first = evaluate_nonzero_basis(order, knots.view(), order + 2, 0, 0.42, &mut out, &mut scratch)
                .unwrap();
            let (expected, expected_first) = basis(order, order + 2, knots.view(), 0, 0.42).unwrap();
            assert_eq!(first, expected_first);
            assert_abs_diff_eq!(&out[..order], expected.as_slice().unwrap(), epsilon = 1e-15);
            assert_abs_diff_eq!(out[..order].iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        }

        let knots = open_uniform_knot_vector(4, 4).unwrap();
        assert!(matches!(
            evaluate_nonzero_basis(4, knots.view(), 4, 0, 0.5, &mut out[..3], &mut scratch),
            Err(BasisError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn invalid_knot_vectors_are_rejected() {
        let decreasing = array![0.0, 0.0, 0.7, 0.3, 1.0, 1.0];
        assert!(matches!(
            validate_knot_vector(decreasing.view(), 2, 4),
            Err(BasisError::InvalidKnotVector(_))
        ));

        let with_nan = array![0.0, 0.0, f64::NAN, 1.0, 1.0];
        assert!(matches!(
            validate_knot_vector(with_nan.view(), 2, 3),
            Err(BasisError::InvalidKnotVector(_))
        ));

        let short = array![0.0, 0.0, 1.0, 1.0];
        assert!(matches!(
            validate_knot_vector(short.view(), 2, 3),
            Err(BasisError::KnotLengthMismatch {
                expected: 5,
                provided: 4,
                ..
            })
        ));

        assert!(matches!(
            open_uniform_knot_vector(2, 4),
            Err(BasisError::TooFewCoefficients { .. })
        ));
        assert!(matches!(
            open_uniform_knot_vector(2, 0),
            Err(BasisError::InvalidOrder(0))
        ));
    }
}
