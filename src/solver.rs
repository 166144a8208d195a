use crate::function::SplineError;
use crate::linalg::faer_ndarray::{FaerLinalgError, pseudo_inverse_solve_vec};
use crate::sectional::SectionalError;
use crate::tape::{Tape, TapeError, Var};
use crate::types::SolverOptions;
use ndarray::{Array1, Array2, s};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error(
        "The parameterization has no unique solution: {targets} targets against {degrees_of_freedom} degrees of freedom (Jacobian rank {rank})"
    )]
    NoUniqueSolution {
        targets: usize,
        degrees_of_freedom: usize,
        rank: usize,
    },
    #[error("Solver did not converge after {iterations} iterations (residual norm {residual_norm:.3e})")]
    DidNotConverge {
        iterations: usize,
        residual_norm: f64,
    },
    #[error("The forward model produced no output for input '{0}'")]
    MissingOutput(String),
    #[error("Output '{name}' has {provided} values but its target has {expected}")]
    OutputShape {
        name: String,
        expected: usize,
        provided: usize,
    },
    #[error("No states were declared")]
    NoStates,
    #[error(transparent)]
    Tape(#[from] TapeError),
    #[error(transparent)]
    Spline(#[from] SplineError),
    #[error(transparent)]
    Sectional(#[from] SectionalError),
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
}

/// Final states of a successful solve.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub states: BTreeMap<String, Array1<f64>>,
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Solves `outputs(states) = targets` for declared states.
///
/// The forward model is any closure that records the outputs on a [`Tape`]
/// from the state leaves it is given; each iteration uses a fresh tape. Steps
/// are minimum-norm Newton steps `Δ = −J⁺ r`, so under-determined systems move
/// the states as little as possible.
#[derive(Debug, Clone, Default)]
pub struct ParameterizationSolver {
    states: BTreeMap<String, Array1<f64>>,
    inputs: BTreeMap<String, Array1<f64>>,
}

struct Linearization {
    residual: Array1<f64>,
    jacobian: Option<Array2<f64>>,
}

impl ParameterizationSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a state with its initial value. A repeated name replaces the
    /// earlier declaration.
    pub fn declare_state(&mut self, name: impl Into<String>, initial: Array1<f64>) {
        let name = name.into();
        if self.states.insert(name.clone(), initial).is_some() {
            log::debug!("State '{name}' redeclared; keeping the latest value");
        }
    }

    /// Declares a target for the forward-model output called `name`.
    pub fn declare_input(&mut self, name: impl Into<String>, target: Array1<f64>) {
        let name = name.into();
        if self.inputs.insert(name.clone(), target).is_some() {
            log::debug!("Input '{name}' redeclared; keeping the latest target");
        }
    }

    pub fn states(&self) -> &BTreeMap<String, Array1<f64>> {
        &self.states
    }

    pub fn inputs(&self) -> &BTreeMap<String, Array1<f64>> {
        &self.inputs
    }

    fn degrees_of_freedom(&self) -> usize {
        self.states.values().map(|v| v.len()).sum()
    }

    fn num_targets(&self) -> usize {
        self.inputs.values().map(|v| v.len()).sum()
    }

    fn unflatten(&self, x: &Array1<f64>) -> BTreeMap<String, Array1<f64>> {
        let mut offset = 0;
        self.states
            .iter()
            .map(|(name, value)| {
                let part = x.slice(s![offset..offset + value.len()]).to_owned();
                offset += value.len();
                (name.clone(), part)
            })
            .collect()
    }

    fn linearize<F>(&self, forward: &F, x: &Array1<f64>, with_jacobian: bool) -> Result<Linearization, SolverError>
    where
        F: Fn(&Tape, &BTreeMap<String, Var>) -> Result<BTreeMap<String, Var>, SolverError>,
    {
        let tape = Tape::new();
        let leaves: BTreeMap<String, Var> = self
            .unflatten(x)
            .into_iter()
            .map(|(name, value)| (name, tape.leaf(value)))
            .collect();
        let outputs = forward(&tape, &leaves)?;

        let mut ordered = Vec::with_capacity(self.inputs.len());
        let mut targets = Vec::with_capacity(self.num_targets());
        for (name, target) in &self.inputs {
            let var = *outputs
                .get(name)
                .ok_or_else(|| SolverError::MissingOutput(name.clone()))?;
            let provided = tape.var_len(var)?;
            if provided != target.len() {
                return Err(SolverError::OutputShape {
                    name: name.clone(),
                    expected: target.len(),
                    provided,
                });
            }
            ordered.push(var);
            targets.extend(target.iter().copied());
        }
        let stacked = tape.concat(&ordered)?;
        let residual = tape.value(stacked)? - &Array1::from_vec(targets);
        let jacobian = if with_jacobian {
            let wrt: Vec<Var> = leaves.values().copied().collect();
            Some(tape.jacobian(stacked, &wrt)?)
        } else {
            None
        };
        Ok(Linearization { residual, jacobian })
    }

    /// Runs the Newton iteration. On success the solved states are also stored
    /// as the solver's current states.
    ///
    /// Fails with `DidNotConverge` when the iteration cap is reached or when
    /// halving the step never reduces the residual; in the latter case the
    /// states are left at the best iterate.
    pub fn solve<F>(&mut self, forward: F, options: &SolverOptions) -> Result<SolverOutcome, SolverError>
    where
        F: Fn(&Tape, &BTreeMap<String, Var>) -> Result<BTreeMap<String, Var>, SolverError>,
    {
        if self.states.is_empty() {
            return Err(SolverError::NoStates);
        }
        let dof = self.degrees_of_freedom();
        let targets = self.num_targets();
        if targets > dof {
            return Err(SolverError::NoUniqueSolution {
                targets,
                degrees_of_freedom: dof,
                rank: 0,
            });
        }

        let mut x = Array1::from_iter(self.states.values().flat_map(|v| v.iter().copied()));
        let mut residual_norm = f64::INFINITY;
        for iteration in 0..=options.max_iterations {
            let Linearization { residual, jacobian } = self.linearize(&forward, &x, true)?;
            residual_norm = residual.dot(&residual).sqrt();
            log::debug!("Parameterization solve iteration {iteration}: residual norm {residual_norm:.3e}");
            if residual_norm <= options.residual_tolerance {
                self.states = self.unflatten(&x);
                return Ok(SolverOutcome {
                    states: self.states.clone(),
                    iterations: iteration,
                    residual_norm,
                });
            }
            if iteration == options.max_iterations {
                break;
            }
            let Some(jacobian) = jacobian else {
                break;
            };

            let (step, rank) =
                pseudo_inverse_solve_vec(&jacobian, &(-&residual), options.singular_value_tolerance)?;
            if rank < targets {
                return Err(SolverError::NoUniqueSolution {
                    targets,
                    degrees_of_freedom: dof,
                    rank,
                });
            }

            let mut scale = 1.0;
            let mut trial = &x + &step;
            let mut accepted = false;
            for _ in 0..=options.max_backtracking_steps {
                let trial_residual = self.linearize(&forward, &trial, false)?.residual;
                if trial_residual.dot(&trial_residual).sqrt() < residual_norm {
                    accepted = true;
                    break;
                }
                scale *= 0.5;
                trial = &x + &(&step * scale);
            }
            if !accepted {
                log::warn!(
                    "Backtracking exhausted at iteration {iteration} (last scale {scale:.3e}); no step reduces the residual"
                );
                self.states = self.unflatten(&x);
                return Err(SolverError::DidNotConverge {
                    iterations: iteration,
                    residual_norm,
                });
            }
            x = trial;
        }

        Err(SolverError::DidNotConverge {
            iterations: options.max_iterations,
            residual_norm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn nonlinear_scalar_equation_converges() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("angle", array![0.2]);
        solver.declare_input("sine", array![0.5]);
        let outcome = solver
            .solve(
                |tape, states| {
                    let mut out = BTreeMap::new();
                    out.insert("sine".to_string(), tape.sin(states["angle"])?);
                    Ok(out)
                },
                &SolverOptions::default(),
            )
            .unwrap();
        assert_abs_diff_eq!(outcome.states["angle"][0], std::f64::consts::FRAC_PI_6, epsilon = 1e-7);
        assert!(outcome.iterations <= 6);
        assert_abs_diff_eq!(solver.states()["angle"][0], std::f64::consts::FRAC_PI_6, epsilon = 1e-7);
    }

    #[test]
    fn underdetermined_solve_takes_minimum_norm_update() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("a", array![1.0]);
        solver.declare_state("b", array![1.0]);
        solver.declare_input("sum", array![5.0]);
        let outcome = solver
            .solve(
                |tape, states| {
                    let sum = tape.add(states["a"], states["b"])?;
                    Ok(BTreeMap::from([("sum".to_string(), sum)]))
                },
                &SolverOptions::default(),
            )
            .unwrap();
        // a + b = 5 from (1, 1): the minimum-norm update is (1.5, 1.5).
        assert_abs_diff_eq!(outcome.states["a"][0], 2.5, epsilon = 1e-10);
        assert_abs_diff_eq!(outcome.states["b"][0], 2.5, epsilon = 1e-10);
    }

    #[test]
    fn redeclaring_replaces_the_earlier_value() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![1.0]);
        solver.declare_state("x", array![2.0, 3.0]);
        solver.declare_input("y", array![0.0]);
        solver.declare_input("y", array![4.0]);
        assert_eq!(solver.states().len(), 1);
        assert_eq!(solver.states()["x"].len(), 2);
        assert_eq!(solver.inputs()["y"][0], 4.0);
    }

    #[test]
    fn too_many_targets_has_no_unique_solution() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![1.0]);
        solver.declare_input("y", array![1.0, 2.0]);
        let err = solver
            .solve(
                |_, states| Ok(BTreeMap::from([("y".to_string(), states["x"])])),
                &SolverOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SolverError::NoUniqueSolution { targets: 2, .. }));
    }

    #[test]
    fn rank_deficient_jacobian_has_no_unique_solution() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![1.0, 2.0]);
        solver.declare_input("pair", array![3.0, 4.0]);
        // Both outputs depend on x0 + x1 only.
        let err = solver
            .solve(
                |tape, states| {
                    let x = states["x"];
                    let sum = tape.add(tape.slice(x, 0..1)?, tape.slice(x, 1..2)?)?;
                    Ok(BTreeMap::from([("pair".to_string(), tape.concat(&[sum, sum])?)]))
                },
                &SolverOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SolverError::NoUniqueSolution { rank: 1, .. }));
    }

    #[test]
    fn missing_output_is_a_configuration_error() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![1.0]);
        solver.declare_input("y", array![1.0]);
        let err = solver
            .solve(|_, _| Ok(BTreeMap::new()), &SolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, SolverError::MissingOutput(name) if name == "y"));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![1.0]);
        solver.declare_input("cube", array![0.0]);
        let options = SolverOptions {
            max_iterations: 5,
            ..SolverOptions::default()
        };
        // Newton on x³ = 0 only shrinks x by a third per step.
        let err = solver
            .solve(
                |tape, states| {
                    let x = states["x"];
                    let cube = tape.mul(tape.mul(x, x)?, x)?;
                    Ok(BTreeMap::from([("cube".to_string(), cube)]))
                },
                &options,
            )
            .unwrap_err();
        let SolverError::DidNotConverge { iterations, residual_norm } = err else {
            panic!("expected DidNotConverge, got {err:?}");
        };
        assert_eq!(iterations, 5);
        assert_abs_diff_eq!(residual_norm, (2.0f64 / 3.0).powi(15), epsilon = 1e-12);
    }

    #[test]
    fn unreachable_target_stops_instead_of_climbing() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![0.3]);
        solver.declare_input("bounded", array![2.0]);
        let err = solver
            .solve(
                |tape, states| Ok(BTreeMap::from([("bounded".to_string(), tape.sin(states["x"])?)])),
                &SolverOptions::default(),
            )
            .unwrap_err();
        let SolverError::DidNotConverge { iterations, residual_norm } = err else {
            panic!("expected DidNotConverge, got {err:?}");
        };
        assert!(iterations < SolverOptions::default().max_iterations);
        assert!(residual_norm >= 1.0);
        // The states stay at the last accepted iterate, near the peak of sin.
        assert_abs_diff_eq!(solver.states()["x"][0], std::f64::consts::FRAC_PI_2, epsilon = 0.05);
    }

    #[test]
    fn exhausted_backtracking_keeps_the_starting_state() {
        let mut solver = ParameterizationSolver::new();
        solver.declare_state("x", array![1e-3]);
        solver.declare_input("bounded", array![2.0]);
        // The Newton step lands near x = -1000 and none of its halvings climb
        // closer to cos(x) = 1 than the start.
        let err = solver
            .solve(
                |tape, states| Ok(BTreeMap::from([("bounded".to_string(), tape.cos(states["x"])?)])),
                &SolverOptions::default(),
            )
            .unwrap_err();
        let SolverError::DidNotConverge { iterations, residual_norm } = err else {
            panic!("expected DidNotConverge, got {err:?}");
        };
        assert_eq!(iterations, 0);
        assert_abs_diff_eq!(residual_norm, 2.0 - 1e-3f64.cos(), epsilon = 1e-12);
        assert_eq!(solver.states()["x"][0], 1e-3);
    }
}
