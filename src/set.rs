use crate::basis::spline_thread_pool;
use crate::fit::refit;
use crate::function::{BSplineFunction, Projection, SplineError};
use crate::layout::{CoefficientLayout, CoefficientLayoutBuilder};
use crate::linalg::sparse::{sparse_matvec, triplets_to_csc};
use crate::space::{BSplineSpace, SpaceRegistry};
use crate::tape::{Tape, Var};
use crate::types::{ProjectionOptions, RefitOptions};
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, s};
use rayon::prelude::*;
use std::sync::Arc;

/// A point on one member of a set.
#[derive(Clone, Debug, PartialEq)]
pub struct SetLocation {
    pub function_index: usize,
    pub parametric_coordinates: Array1<f64>,
}

/// Projection of a batch of points onto the closest member of a set.
#[derive(Clone, Debug)]
pub struct SetProjection {
    pub locations: Vec<SetLocation>,
    /// `[N, P]`
    pub points: Array2<f64>,
    pub distances: Array1<f64>,
    pub converged: Vec<bool>,
}

impl SetProjection {
    pub fn all_converged(&self) -> bool {
        self.converged.iter().all(|&c| c)
    }
}

/// Anything geometry can be measured on: project points, evaluate at the
/// resulting locations, and take new coefficients wholesale.
pub trait GeometryContainer {
    fn num_physical_dimensions(&self) -> usize;

    fn coefficients(&self) -> &Array1<f64>;

    fn project(
        &self,
        points: ArrayView2<'_, f64>,
        direction: Option<ArrayView1<'_, f64>>,
        options: &ProjectionOptions,
    ) -> Result<SetProjection, SplineError>;

    fn evaluate(&self, locations: &[SetLocation]) -> Result<Array2<f64>, SplineError>;

    /// Sparse `[N·P, coefficients.len()]` map from the flat coefficients to
    /// the points at `locations`.
    fn evaluation_map(&self, locations: &[SetLocation]) -> Result<SparseColMat<usize, f64>, SplineError>;

    fn assign_coefficients(&mut self, coefficients: Array1<f64>) -> Result<(), SplineError>;
}

/// Named B-spline functions sharing one flat coefficient buffer.
#[derive(Clone, Debug)]
pub struct BSplineSet {
    name: String,
    registry: SpaceRegistry,
    spaces: Vec<Arc<BSplineSpace>>,
    num_physical_dimensions: usize,
    coefficients: Array1<f64>,
    layout: CoefficientLayout,
}

impl BSplineSet {
    /// Collects `functions` in declaration order. Every member must have the
    /// same number of physical dimensions.
    pub fn new(
        name: impl Into<String>,
        functions: Vec<(String, BSplineFunction)>,
    ) -> Result<Self, SplineError> {
        let name = name.into();
        let Some(first) = functions.first() else {
            return Err(SplineError::InvalidInput(format!(
                "set '{name}' needs at least one function"
            )));
        };
        let num_physical_dimensions = first.1.num_physical_dimensions();

        let mut registry = SpaceRegistry::new();
        let mut builder = CoefficientLayoutBuilder::new();
        let mut spaces = Vec::with_capacity(functions.len());
        let mut buffer = Vec::new();
        for (member, function) in &functions {
            if function.num_physical_dimensions() != num_physical_dimensions {
                return Err(SplineError::DimensionMismatch(format!(
                    "function '{member}' has {} physical dimensions but set '{name}' uses {num_physical_dimensions}",
                    function.num_physical_dimensions()
                )));
            }
            builder.push_entity(member.clone(), function.coefficients().len())?;
            spaces.push(registry.intern(function.space()));
            buffer.extend(function.coefficients().iter().copied());
        }
        let layout = builder.build();
        log::debug!(
            "Set '{name}': {} functions, {} distinct spaces, {} coefficients",
            layout.len(),
            registry.len(),
            layout.total_coeffs
        );
        Ok(Self {
            name,
            registry,
            spaces,
            num_physical_dimensions,
            coefficients: Array1::from_vec(buffer),
            layout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn layout(&self) -> &CoefficientLayout {
        &self.layout
    }

    pub fn registry(&self) -> &SpaceRegistry {
        &self.registry
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.layout.entries.iter().map(|e| e.name.as_str())
    }

    pub fn function_at(&self, index: usize) -> Option<BSplineFunction> {
        let entry = self.layout.entries.get(index)?;
        Some(BSplineFunction::from_validated(
            Arc::clone(&self.spaces[index]),
            self.coefficients
                .slice(s![entry.coeff_range.clone()])
                .to_owned(),
            self.num_physical_dimensions,
        ))
    }

    pub fn function(&self, name: &str) -> Result<BSplineFunction, SplineError> {
        self.layout
            .index_of(name)
            .and_then(|index| self.function_at(index))
            .ok_or_else(|| SplineError::UnknownFunction(name.to_string()))
    }

    /// Materializes every member, in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = (&str, BSplineFunction)> + '_ {
        self.layout
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| Some((entry.name.as_str(), self.function_at(index)?)))
    }

    pub fn num_physical_dimensions(&self) -> usize {
        self.num_physical_dimensions
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    pub fn assign_coefficients(&mut self, coefficients: Array1<f64>) -> Result<(), SplineError> {
        if coefficients.len() != self.layout.total_coeffs {
            return Err(SplineError::CoefficientShape {
                expected: self.layout.total_coeffs,
                provided: coefficients.len(),
            });
        }
        self.coefficients = coefficients;
        Ok(())
    }

    /// Projects every point onto every member and keeps the closest hit.
    /// Ties go to the earlier member.
    pub fn project(
        &self,
        points: ArrayView2<'_, f64>,
        direction: Option<ArrayView1<'_, f64>>,
        options: &ProjectionOptions,
    ) -> Result<SetProjection, SplineError> {
        let per_member: Vec<Projection> = self
            .functions()
            .map(|(_, function)| function.project(points, direction, options))
            .collect::<Result<_, _>>()?;

        let n = points.nrows();
        let mut result = SetProjection {
            locations: Vec::with_capacity(n),
            points: Array2::zeros((n, self.num_physical_dimensions)),
            distances: Array1::zeros(n),
            converged: Vec::with_capacity(n),
        };
        for i in 0..n {
            let mut best = 0usize;
            for (index, projection) in per_member.iter().enumerate().skip(1) {
                if projection.distances[i] < per_member[best].distances[i] {
                    best = index;
                }
            }
            let winner = &per_member[best];
            result.locations.push(SetLocation {
                function_index: best,
                parametric_coordinates: winner.parametric_coordinates.row(i).to_owned(),
            });
            result.points.row_mut(i).assign(&winner.points.row(i));
            result.distances[i] = winner.distances[i];
            result.converged.push(winner.converged[i]);
        }
        Ok(result)
    }

    pub fn evaluation_map(&self, locations: &[SetLocation]) -> Result<SparseColMat<usize, f64>, SplineError> {
        let phys = self.num_physical_dimensions;
        let mut triplets = Vec::new();
        for (index, entry) in self.layout.entries.iter().enumerate() {
            let rows: Vec<usize> = locations
                .iter()
                .enumerate()
                .filter(|(_, loc)| loc.function_index == index)
                .map(|(row, _)| row)
                .collect();
            if rows.is_empty() {
                continue;
            }
            let space = &self.spaces[index];
            let dims = space.num_parametric_dimensions();
            let mut coords = Array2::<f64>::zeros((rows.len(), dims));
            for (local, &row) in rows.iter().enumerate() {
                let params = &locations[row].parametric_coordinates;
                if params.len() != dims {
                    return Err(SplineError::DimensionMismatch(format!(
                        "location {row} has {} parametric coordinates but '{}' has {dims}",
                        params.len(),
                        entry.name
                    )));
                }
                coords.row_mut(local).assign(params);
            }
            let basis = space.compute_basis_matrix(coords.view(), &vec![0; dims], 1)?;
            let (symbolic, values) = basis.parts();
            let col_ptr = symbolic.col_ptr();
            let row_idx = symbolic.row_idx();
            let offset = entry.coeff_range.start;
            for col in 0..basis.ncols() {
                for idx in col_ptr[col]..col_ptr[col + 1] {
                    let global_row = rows[row_idx[idx]];
                    for p in 0..phys {
                        triplets.push(Triplet::new(
                            global_row * phys + p,
                            offset + col * phys + p,
                            values[idx],
                        ));
                    }
                }
            }
        }
        if let Some(bad) = locations.iter().find(|loc| loc.function_index >= self.len()) {
            return Err(SplineError::InvalidInput(format!(
                "location refers to function {} but set '{}' has {}",
                bad.function_index,
                self.name,
                self.len()
            )));
        }
        Ok(triplets_to_csc(
            locations.len() * phys,
            self.layout.total_coeffs,
            &triplets,
        )?)
    }

    /// Points at `locations`, `[N, P]`.
    pub fn evaluate(&self, locations: &[SetLocation]) -> Result<Array2<f64>, SplineError> {
        let map = self.evaluation_map(locations)?;
        let flat = sparse_matvec(&map, self.coefficients.view())?;
        flat.into_shape_with_order((locations.len(), self.num_physical_dimensions))
            .map_err(|e| SplineError::DimensionMismatch(e.to_string()))
    }

    /// Records `evaluate` on `tape`; `coefficients` stands for the whole buffer.
    pub fn evaluate_traced(
        &self,
        tape: &Tape,
        coefficients: Var,
        locations: &[SetLocation],
    ) -> Result<Var, SplineError> {
        let len = tape.var_len(coefficients)?;
        if len != self.layout.total_coeffs {
            return Err(SplineError::CoefficientShape {
                expected: self.layout.total_coeffs,
                provided: len,
            });
        }
        let map = self.evaluation_map(locations)?;
        Ok(tape.linear(Arc::new(map), coefficients, 1)?)
    }

    /// Refits every member into the space described by `options`, in parallel.
    pub fn refit(&self, options: &RefitOptions) -> Result<BSplineSet, SplineError> {
        let members: Vec<(String, BSplineFunction)> = self
            .functions()
            .map(|(name, function)| (name.to_string(), function))
            .collect();
        let refitted = spline_thread_pool().install(|| {
            members
                .into_par_iter()
                .map(|(name, function)| refit(&function, options).map(|f| (name, f)))
                .collect::<Result<Vec<_>, SplineError>>()
        })?;
        BSplineSet::new(self.name.clone(), refitted)
    }
}

impl GeometryContainer for BSplineSet {
    fn num_physical_dimensions(&self) -> usize {
        BSplineSet::num_physical_dimensions(self)
    }

    fn coefficients(&self) -> &Array1<f64> {
        BSplineSet::coefficients(self)
    }

    fn project(
        &self,
        points: ArrayView2<'_, f64>,
        direction: Option<ArrayView1<'_, f64>>,
        options: &ProjectionOptions,
    ) -> Result<SetProjection, SplineError> {
        BSplineSet::project(self, points, direction, options)
    }

    fn evaluate(&self, locations: &[SetLocation]) -> Result<Array2<f64>, SplineError> {
        BSplineSet::evaluate(self, locations)
    }

    fn evaluation_map(&self, locations: &[SetLocation]) -> Result<SparseColMat<usize, f64>, SplineError> {
        BSplineSet::evaluation_map(self, locations)
    }

    fn assign_coefficients(&mut self, coefficients: Array1<f64>) -> Result<(), SplineError> {
        BSplineSet::assign_coefficients(self, coefficients)
    }
}

impl GeometryContainer for BSplineFunction {
    fn num_physical_dimensions(&self) -> usize {
        BSplineFunction::num_physical_dimensions(self)
    }

    fn coefficients(&self) -> &Array1<f64> {
        BSplineFunction::coefficients(self)
    }

    fn project(
        &self,
        points: ArrayView2<'_, f64>,
        direction: Option<ArrayView1<'_, f64>>,
        options: &ProjectionOptions,
    ) -> Result<SetProjection, SplineError> {
        let projection = BSplineFunction::project(self, points, direction, options)?;
        let locations = projection
            .parametric_coordinates
            .outer_iter()
            .map(|row| SetLocation {
                function_index: 0,
                parametric_coordinates: row.to_owned(),
            })
            .collect();
        Ok(SetProjection {
            locations,
            points: projection.points,
            distances: projection.distances,
            converged: projection.converged,
        })
    }

    fn evaluate(&self, locations: &[SetLocation]) -> Result<Array2<f64>, SplineError> {
        let coords = single_member_coordinates(self, locations)?;
        BSplineFunction::evaluate(self, coords.view(), &[])
    }

    fn evaluation_map(&self, locations: &[SetLocation]) -> Result<SparseColMat<usize, f64>, SplineError> {
        let coords = single_member_coordinates(self, locations)?;
        BSplineFunction::evaluation_map(self, coords.view(), &[], true)
    }

    fn assign_coefficients(&mut self, coefficients: Array1<f64>) -> Result<(), SplineError> {
        BSplineFunction::assign_coefficients(self, coefficients)
    }
}

fn single_member_coordinates(
    function: &BSplineFunction,
    locations: &[SetLocation],
) -> Result<Array2<f64>, SplineError> {
    let dims = function.num_parametric_dimensions();
    let mut coords = Array2::<f64>::zeros((locations.len(), dims));
    for (row, location) in locations.iter().enumerate() {
        if location.function_index != 0 || location.parametric_coordinates.len() != dims {
            return Err(SplineError::InvalidInput(format!(
                "location {row} does not address this {dims}-parametric function"
            )));
        }
        coords.row_mut(row).assign(&location.parametric_coordinates);
    }
    Ok(coords)
}
