use crate::basis::spline_thread_pool;
use crate::function::{BSplineFunction, SplineError};
use crate::linalg::sparse::{sparse_matvec_strided, vstack};
use crate::set::BSplineSet;
use crate::tape::{Tape, Var};
use crate::types::ProjectionOptions;
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use std::sync::Arc;

/// Relative distance beyond which an embedded point is reported as lying
/// outside the lattice.
const OUTSIDE_TOL: f64 = 1e-6;

/// Geometry that can be embedded in a lattice.
#[derive(Clone, Debug)]
pub enum EmbeddedEntity {
    /// Raw points, `[N, P]`.
    Points(Array2<f64>),
    /// A function; its control points are embedded.
    Function(BSplineFunction),
    /// A set; the control points of every member are embedded.
    Set(BSplineSet),
}

impl EmbeddedEntity {
    fn describe(&self) -> &'static str {
        match self {
            EmbeddedEntity::Points(_) => "point array",
            EmbeddedEntity::Function(_) => "function",
            EmbeddedEntity::Set(_) => "set",
        }
    }

    /// The point clouds to embed, one per basis matrix.
    fn point_clouds(&self) -> Result<Vec<Array2<f64>>, SplineError> {
        match self {
            EmbeddedEntity::Points(points) => Ok(vec![points.clone()]),
            EmbeddedEntity::Function(function) => Ok(vec![function.coefficient_matrix()?.to_owned()]),
            EmbeddedEntity::Set(set) => set
                .functions()
                .map(|(_, function)| Ok(function.coefficient_matrix()?.to_owned()))
                .collect(),
        }
    }

    fn num_physical_dimensions(&self) -> usize {
        match self {
            EmbeddedEntity::Points(points) => points.ncols(),
            EmbeddedEntity::Function(function) => function.num_physical_dimensions(),
            EmbeddedEntity::Set(set) => set.num_physical_dimensions(),
        }
    }

    /// Copy of this entity carrying `values` (flat, interleaved) instead of its
    /// own points or coefficients.
    fn with_values(&self, values: Array1<f64>) -> Result<EmbeddedEntity, SplineError> {
        match self {
            EmbeddedEntity::Points(points) => {
                let reshaped = values
                    .into_shape_with_order(points.dim())
                    .map_err(|e| SplineError::DimensionMismatch(e.to_string()))?;
                Ok(EmbeddedEntity::Points(reshaped))
            }
            EmbeddedEntity::Function(function) => {
                let mut updated = function.clone();
                updated.assign_coefficients(values)?;
                Ok(EmbeddedEntity::Function(updated))
            }
            EmbeddedEntity::Set(set) => {
                let mut updated = set.clone();
                updated.assign_coefficients(values)?;
                Ok(EmbeddedEntity::Set(updated))
            }
        }
    }
}

/// Per-point outcome of embedding one entity, in the entity's point order
/// (members concatenated for sets).
#[derive(Clone, Debug, Default)]
pub struct EmbeddingReport {
    /// Whether the projection into the lattice converged.
    pub converged: Vec<bool>,
    /// Distance from each point to its image in the lattice.
    pub distances: Array1<f64>,
    /// Points farther than a small relative tolerance from the lattice; they
    /// are clamped to its boundary and deform like their clamped image.
    pub outside: Vec<bool>,
}

impl EmbeddingReport {
    pub fn num_outside(&self) -> usize {
        self.outside.iter().filter(|&&o| o).count()
    }

    pub fn all_converged(&self) -> bool {
        self.converged.iter().all(|&c| c)
    }

    fn concat(parts: Vec<EmbeddingReport>) -> Self {
        let mut distances = Vec::new();
        let mut report = EmbeddingReport::default();
        for part in parts {
            report.converged.extend(part.converged);
            report.outside.extend(part.outside);
            distances.extend(part.distances);
        }
        report.distances = Array1::from_vec(distances);
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmbeddedEntityId(usize);

impl EmbeddedEntityId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct EmbeddedRecord {
    entity: EmbeddedEntity,
    /// Scalar basis matrices, one per point cloud (per member for sets).
    basis_matrices: Vec<Arc<SparseColMat<usize, f64>>>,
    /// `basis_matrices` stacked in order; maps lattice coefficients to the
    /// entity's whole flat buffer.
    stacked: Arc<SparseColMat<usize, f64>>,
    report: EmbeddingReport,
}

/// Free-form deformation lattice: a trivariate function whose coefficients
/// drive every embedded entity linearly.
#[derive(Debug)]
pub struct FfdBlock {
    lattice: BSplineFunction,
    entities: Vec<EmbeddedRecord>,
    projection_options: ProjectionOptions,
}

impl FfdBlock {
    pub fn new(lattice: BSplineFunction) -> Result<Self, SplineError> {
        if lattice.num_parametric_dimensions() != 3 {
            return Err(SplineError::DimensionMismatch(format!(
                "an FFD lattice must be trivariate, got {} parametric dimensions",
                lattice.num_parametric_dimensions()
            )));
        }
        Ok(Self {
            lattice,
            entities: Vec::new(),
            projection_options: ProjectionOptions::for_volume(),
        })
    }

    pub fn with_projection_options(mut self, options: ProjectionOptions) -> Self {
        self.projection_options = options;
        self
    }

    pub fn lattice(&self) -> &BSplineFunction {
        &self.lattice
    }

    /// Lattice coefficient array shape `(n0, n1, n2)`.
    pub fn coefficient_shape(&self) -> [usize; 3] {
        let shape = self.lattice.space().coefficient_shape();
        [shape[0], shape[1], shape[2]]
    }

    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    pub fn entity(&self, id: EmbeddedEntityId) -> Option<&EmbeddedEntity> {
        self.entities.get(id.0).map(|record| &record.entity)
    }

    pub fn basis_matrices(&self, id: EmbeddedEntityId) -> Option<&[Arc<SparseColMat<usize, f64>>]> {
        self.entities
            .get(id.0)
            .map(|record| record.basis_matrices.as_slice())
    }

    pub fn embedding_report(&self, id: EmbeddedEntityId) -> Option<&EmbeddingReport> {
        self.entities.get(id.0).map(|record| &record.report)
    }

    /// Projects `entity` into the lattice once and freezes its basis matrices.
    /// Per-point convergence and out-of-lattice flags are kept in the
    /// entity's [`EmbeddingReport`].
    pub fn embed(&mut self, entity: EmbeddedEntity) -> Result<EmbeddedEntityId, SplineError> {
        let phys = self.lattice.num_physical_dimensions();
        if entity.num_physical_dimensions() != phys {
            return Err(SplineError::UnsupportedEntity(format!(
                "{} with {} physical dimensions cannot be embedded in a {phys}-dimensional lattice",
                entity.describe(),
                entity.num_physical_dimensions()
            )));
        }
        let clouds = entity.point_clouds()?;
        if clouds.is_empty() || clouds.iter().all(|c| c.nrows() == 0) {
            return Err(SplineError::UnsupportedEntity(format!(
                "{} has no points to embed",
                entity.describe()
            )));
        }
        if clouds.iter().any(|c| c.iter().any(|v| !v.is_finite())) {
            return Err(SplineError::UnsupportedEntity(format!(
                "{} contains non-finite values",
                entity.describe()
            )));
        }

        let lattice = &self.lattice;
        let options = &self.projection_options;
        let embed_cloud = |points: &Array2<f64>| embed_points(lattice, points.view(), options);
        let embedded: Vec<(Arc<SparseColMat<usize, f64>>, EmbeddingReport)> = if clouds.len() > 1 {
            spline_thread_pool().install(|| {
                clouds
                    .par_iter()
                    .map(embed_cloud)
                    .collect::<Result<Vec<_>, SplineError>>()
            })?
        } else {
            clouds.iter().map(embed_cloud).collect::<Result<Vec<_>, _>>()?
        };
        let (basis_matrices, reports): (Vec<_>, Vec<_>) = embedded.into_iter().unzip();
        let report = EmbeddingReport::concat(reports);

        let stacked = if basis_matrices.len() == 1 {
            Arc::clone(&basis_matrices[0])
        } else {
            let blocks: Vec<&SparseColMat<usize, f64>> =
                basis_matrices.iter().map(|m| m.as_ref()).collect();
            Arc::new(vstack(&blocks)?)
        };

        log::debug!(
            "Embedded {} ({} basis matrices, {} rows) into the lattice",
            entity.describe(),
            basis_matrices.len(),
            stacked.nrows()
        );
        self.entities.push(EmbeddedRecord {
            entity,
            basis_matrices,
            stacked,
            report,
        });
        Ok(EmbeddedEntityId(self.entities.len() - 1))
    }

    fn check_lattice_len(&self, len: usize) -> Result<(), SplineError> {
        let expected = self.lattice.coefficients().len();
        if len != expected {
            return Err(SplineError::CoefficientShape {
                expected,
                provided: len,
            });
        }
        Ok(())
    }

    /// Flat, interleaved points or coefficients of every embedded entity for
    /// the given lattice coefficients. Linear in `coefficients`.
    pub fn evaluate(&self, coefficients: ArrayView1<'_, f64>) -> Result<Vec<Array1<f64>>, SplineError> {
        self.check_lattice_len(coefficients.len())?;
        let phys = self.lattice.num_physical_dimensions();
        self.entities
            .iter()
            .map(|record| Ok(sparse_matvec_strided(&record.stacked, coefficients, phys)?))
            .collect()
    }

    pub fn evaluate_traced(&self, tape: &Tape, coefficients: Var) -> Result<Vec<Var>, SplineError> {
        self.check_lattice_len(tape.var_len(coefficients)?)?;
        let phys = self.lattice.num_physical_dimensions();
        self.entities
            .iter()
            .map(|record| Ok(tape.linear(Arc::clone(&record.stacked), coefficients, phys)?))
            .collect()
    }

    /// Embedded entities rebuilt with the deformation of `coefficients` applied.
    pub fn deform(&self, coefficients: ArrayView1<'_, f64>) -> Result<Vec<EmbeddedEntity>, SplineError> {
        let values = self.evaluate(coefficients)?;
        self.entities
            .iter()
            .zip(values)
            .map(|(record, values)| record.entity.with_values(values))
            .collect()
    }

    /// Replaces the lattice coefficients (e.g. with a sectional output).
    pub fn assign_coefficients(&mut self, coefficients: Array1<f64>) -> Result<(), SplineError> {
        self.lattice.assign_coefficients(coefficients)
    }
}

fn embed_points(
    lattice: &BSplineFunction,
    points: ArrayView2<'_, f64>,
    options: &ProjectionOptions,
) -> Result<(Arc<SparseColMat<usize, f64>>, EmbeddingReport), SplineError> {
    let projection = lattice.project(points, None, options)?;
    let extent = points
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()))
        .max(1.0);
    let flags: Vec<bool> = projection
        .distances
        .iter()
        .map(|&d| d > OUTSIDE_TOL * extent)
        .collect();
    let outside = flags.iter().filter(|&&o| o).count();
    if outside > 0 {
        log::warn!(
            "{outside} of {} embedded points lie outside the FFD lattice and will be clamped to it",
            points.nrows()
        );
    }
    let basis = lattice.evaluation_map(projection.parametric_coordinates.view(), &[], false)?;
    let report = EmbeddingReport {
        converged: projection.converged,
        distances: projection.distances,
        outside: flags,
    };
    Ok((Arc::new(basis), report))
}
