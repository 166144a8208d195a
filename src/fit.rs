use crate::function::{BSplineFunction, SplineError, map_to_domains, tensor_grid};
use crate::linalg::utils::solve_sparse_least_squares;
use crate::space::BSplineSpace;
use crate::types::RefitOptions;
use ndarray::{Array2, ArrayView2, ArrayView3};
use std::sync::Arc;

/// Least-squares fit of an open-uniform B-spline to scattered samples.
///
/// `parametric_coordinates` is `[N, D]`, `values` is `[N, P]`. Solves
/// `min ‖B c − values‖²` through the sparse normal equations; the basis matrix
/// is never densified unless the Gram matrix turns out singular.
pub fn fit_function(
    parametric_coordinates: ArrayView2<'_, f64>,
    values: ArrayView2<'_, f64>,
    orders: &[usize],
    num_coefficients: &[usize],
) -> Result<BSplineFunction, SplineError> {
    if parametric_coordinates.nrows() != values.nrows() {
        return Err(SplineError::DimensionMismatch(format!(
            "{} parametric coordinates for {} samples",
            parametric_coordinates.nrows(),
            values.nrows()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SplineError::InvalidInput(
            "fitting data must be finite".to_string(),
        ));
    }
    let space = BSplineSpace::open_uniform(orders, num_coefficients)?;
    let dims = space.num_parametric_dimensions();
    let basis = space.compute_basis_matrix(parametric_coordinates, &vec![0; dims], 1)?;
    let solution = solve_sparse_least_squares(&basis, &values.to_owned(), "surface fit")?;
    BSplineFunction::from_coefficient_matrix(Arc::new(space), solution.coefficients.view(), values.ncols())
}

/// Fits a surface to a structured `[nu, nv, P]` grid of points.
///
/// Without explicit `parametric_coordinates` (`[nu·nv, 2]`, row-major over the
/// grid) the samples are placed uniformly on `[0, 1]²`.
pub fn fit_surface(
    points: ArrayView3<'_, f64>,
    orders: &[usize],
    num_coefficients: &[usize],
    parametric_coordinates: Option<ArrayView2<'_, f64>>,
) -> Result<BSplineFunction, SplineError> {
    let (nu, nv, phys) = points.dim();
    if orders.len() != 2 || num_coefficients.len() != 2 {
        return Err(SplineError::DimensionMismatch(
            "surface fitting needs two orders and two coefficient counts".to_string(),
        ));
    }
    if nu < num_coefficients[0] || nv < num_coefficients[1] {
        return Err(SplineError::InvalidInput(format!(
            "a {nu}x{nv} grid cannot determine {}x{} coefficients",
            num_coefficients[0], num_coefficients[1]
        )));
    }
    let values = points
        .to_owned()
        .into_shape_with_order((nu * nv, phys))
        .map_err(|e| SplineError::DimensionMismatch(e.to_string()))?;
    let params = match parametric_coordinates {
        Some(params) => params.to_owned(),
        None => tensor_grid(&[nu, nv]),
    };
    fit_function(params.view(), values.view(), orders, num_coefficients)
}

/// Samples `function` on the `fit_resolution` grid over its own knot domain
/// and fits a new function in the open-uniform space described by `options`.
pub fn refit(function: &BSplineFunction, options: &RefitOptions) -> Result<BSplineFunction, SplineError> {
    let dims = function.num_parametric_dimensions();
    if options.orders.len() != dims
        || options.num_coefficients.len() != dims
        || options.fit_resolution.len() != dims
    {
        return Err(SplineError::DimensionMismatch(format!(
            "refit options describe {}/{}/{} dimensions but the function has {dims}",
            options.orders.len(),
            options.num_coefficients.len(),
            options.fit_resolution.len()
        )));
    }
    let params = tensor_grid(&options.fit_resolution);
    let sample_at = map_to_domains(params.clone(), &function.space().domains());
    let samples: Array2<f64> = function.evaluate(sample_at.view(), &[])?;
    let refitted = fit_function(params.view(), samples.view(), &options.orders, &options.num_coefficients)?;
    log::debug!(
        "Refit {:?} -> {:?} coefficients from {} samples",
        function.space().coefficient_shape(),
        options.num_coefficients,
        params.nrows()
    );
    Ok(refitted)
}
