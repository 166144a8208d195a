use serde::{Deserialize, Serialize};

pub fn default_grid_search_density() -> usize {
    50
}

pub fn default_projection_max_iterations() -> usize {
    100
}

pub fn default_projection_tolerance() -> f64 {
    1e-10
}

/// Settings for point projection onto a B-spline function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionOptions {
    /// Samples per parametric dimension in the coarse search (`density^D` total).
    #[serde(default = "default_grid_search_density")]
    pub grid_search_density: usize,
    #[serde(default = "default_projection_max_iterations")]
    pub max_iterations: usize,
    /// Stop when the step and the gradient both fall below this.
    #[serde(default = "default_projection_tolerance")]
    pub tolerance: f64,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            grid_search_density: default_grid_search_density(),
            max_iterations: default_projection_max_iterations(),
            tolerance: default_projection_tolerance(),
        }
    }
}

impl ProjectionOptions {
    /// Coarser search suited to trivariate lattices, where `density^3` grows fast.
    pub fn for_volume() -> Self {
        Self {
            grid_search_density: 12,
            ..Self::default()
        }
    }
}

pub fn default_refit_orders() -> Vec<usize> {
    vec![4, 4]
}

pub fn default_refit_num_coefficients() -> Vec<usize> {
    vec![25, 25]
}

pub fn default_fit_resolution() -> Vec<usize> {
    vec![100, 100]
}

/// Target space and sampling for refitting surfaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefitOptions {
    #[serde(default = "default_refit_orders")]
    pub orders: Vec<usize>,
    #[serde(default = "default_refit_num_coefficients")]
    pub num_coefficients: Vec<usize>,
    /// Evaluation grid (per parametric dimension) used as fitting data.
    #[serde(default = "default_fit_resolution")]
    pub fit_resolution: Vec<usize>,
}

impl Default for RefitOptions {
    fn default() -> Self {
        Self {
            orders: default_refit_orders(),
            num_coefficients: default_refit_num_coefficients(),
            fit_resolution: default_fit_resolution(),
        }
    }
}

pub fn default_enclosure_padding() -> f64 {
    0.0
}

pub fn default_minimum_thickness() -> f64 {
    1e-3
}

/// Padding applied when wrapping a point cloud in a lattice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclosureOptions {
    /// Relative padding added on each side of every axis (fraction of the extent).
    #[serde(default = "default_enclosure_padding")]
    pub padding: f64,
    /// Extent given to axes along which the points are (nearly) flat.
    #[serde(default = "default_minimum_thickness")]
    pub minimum_thickness: f64,
}

impl Default for EnclosureOptions {
    fn default() -> Self {
        Self {
            padding: default_enclosure_padding(),
            minimum_thickness: default_minimum_thickness(),
        }
    }
}

pub fn default_solver_max_iterations() -> usize {
    50
}

pub fn default_residual_tolerance() -> f64 {
    1e-8
}

pub fn default_singular_value_tolerance() -> f64 {
    1e-10
}

pub fn default_max_backtracking_steps() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    #[serde(default = "default_solver_max_iterations")]
    pub max_iterations: usize,
    /// Converged once `‖outputs − targets‖₂` drops below this.
    #[serde(default = "default_residual_tolerance")]
    pub residual_tolerance: f64,
    /// Relative cutoff for singular values in the pseudo-inverse and rank test.
    #[serde(default = "default_singular_value_tolerance")]
    pub singular_value_tolerance: f64,
    #[serde(default = "default_max_backtracking_steps")]
    pub max_backtracking_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: default_solver_max_iterations(),
            residual_tolerance: default_residual_tolerance(),
            singular_value_tolerance: default_singular_value_tolerance(),
            max_backtracking_steps: default_max_backtracking_steps(),
        }
    }
}
