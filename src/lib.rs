#![allow(non_snake_case)]

pub mod basis;
pub mod ffd;
pub mod fit;
pub mod function;
pub mod layout;
pub mod linalg;
pub mod sectional;
pub mod set;
pub mod solver;
pub mod space;
pub mod tape;
pub mod types;

pub use basis::{
    BasisError, BasisScratch, basis, basis_derivatives, evaluate_nonzero_basis,
    open_uniform_knot_vector,
};
pub use ffd::{EmbeddedEntity, EmbeddedEntityId, EmbeddingReport, FfdBlock};
pub use fit::{fit_function, fit_surface, refit};
pub use function::{BSplineFunction, Projection, SplineError};
pub use layout::{CoefficientLayout, CoefficientLayoutBuilder, LayoutEntry};
pub use sectional::{
    SectionalError, VolumeSectionalParameterization, VolumeSectionalParameterizationInputs,
};
pub use set::{BSplineSet, GeometryContainer, SetLocation, SetProjection};
pub use solver::{ParameterizationSolver, SolverError, SolverOutcome};
pub use space::{BSplineSpace, PointJet, SpaceRegistry, SpaceScratch};
pub use tape::{Gradients, Tape, TapeError, Var};
pub use types::{EnclosureOptions, ProjectionOptions, RefitOptions, SolverOptions};
