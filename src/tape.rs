//! Minimal reverse-mode differentiation over vector-valued nodes.
//!
//! A [`Tape`] records operations in insertion order; every node only refers to
//! earlier nodes, so a reverse sweep over indices is a valid reverse topological
//! order. Tapes are cheap and meant to be thrown away after one evaluation.

use crate::linalg::sparse::{
    SparseOpError, sparse_matvec_strided, sparse_transpose_matvec_strided,
};
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView1, s};
use std::cell::RefCell;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TapeError {
    #[error("{op}: operand lengths {left} and {right} do not match")]
    LengthMismatch {
        op: &'static str,
        left: usize,
        right: usize,
    },
    #[error("Variable {0} does not belong to this tape")]
    UnknownVar(usize),
    #[error("Slice {start}..{end} is out of bounds for a vector of length {len}")]
    SliceOutOfBounds { start: usize, end: usize, len: usize },
    #[error(transparent)]
    Sparse(#[from] SparseOpError),
}

/// Handle to a recorded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

impl Var {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
enum Op {
    Leaf,
    Constant,
    Linear {
        input: usize,
        matrix: Arc<SparseColMat<usize, f64>>,
        stride: usize,
    },
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Scale(usize, f64),
    Offset(usize),
    Sin(usize),
    Cos(usize),
    Norm(usize),
    Concat(Vec<usize>),
    Slice { input: usize, start: usize },
}

#[derive(Debug)]
struct Node {
    op: Op,
    value: Array1<f64>,
}

#[derive(Debug, Default)]
pub struct Tape {
    nodes: RefCell<Vec<Node>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    fn push(&self, op: Op, value: Array1<f64>) -> Var {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(Node { op, value });
        Var(nodes.len() - 1)
    }

    fn check(&self, var: Var) -> Result<usize, TapeError> {
        let nodes = self.nodes.borrow();
        if var.0 < nodes.len() {
            Ok(nodes[var.0].value.len())
        } else {
            Err(TapeError::UnknownVar(var.0))
        }
    }

    fn check_pair(&self, op: &'static str, a: Var, b: Var) -> Result<(), TapeError> {
        let left = self.check(a)?;
        let right = self.check(b)?;
        if left != right {
            return Err(TapeError::LengthMismatch { op, left, right });
        }
        Ok(())
    }

    fn map_value<F>(&self, var: Var, f: F) -> Result<Array1<f64>, TapeError>
    where
        F: Fn(&Array1<f64>) -> Array1<f64>,
    {
        self.check(var)?;
        Ok(f(&self.nodes.borrow()[var.0].value))
    }

    /// Independent variable; derivatives are taken with respect to leaves.
    pub fn leaf(&self, value: Array1<f64>) -> Var {
        self.push(Op::Leaf, value)
    }

    pub fn constant(&self, value: Array1<f64>) -> Var {
        self.push(Op::Constant, value)
    }

    pub fn value(&self, var: Var) -> Result<Array1<f64>, TapeError> {
        self.map_value(var, |v| v.clone())
    }

    pub fn var_len(&self, var: Var) -> Result<usize, TapeError> {
        self.check(var)
    }

    /// `y = M x` where `x` is interleaved over `stride` physical components.
    pub fn linear(
        &self,
        matrix: Arc<SparseColMat<usize, f64>>,
        x: Var,
        stride: usize,
    ) -> Result<Var, TapeError> {
        self.check(x)?;
        let value = {
            let nodes = self.nodes.borrow();
            sparse_matvec_strided(&matrix, nodes[x.0].value.view(), stride)?
        };
        Ok(self.push(
            Op::Linear {
                input: x.0,
                matrix,
                stride,
            },
            value,
        ))
    }

    pub fn add(&self, a: Var, b: Var) -> Result<Var, TapeError> {
        self.check_pair("add", a, b)?;
        let value = {
            let nodes = self.nodes.borrow();
            &nodes[a.0].value + &nodes[b.0].value
        };
        Ok(self.push(Op::Add(a.0, b.0), value))
    }

    pub fn sub(&self, a: Var, b: Var) -> Result<Var, TapeError> {
        self.check_pair("sub", a, b)?;
        let value = {
            let nodes = self.nodes.borrow();
            &nodes[a.0].value - &nodes[b.0].value
        };
        Ok(self.push(Op::Sub(a.0, b.0), value))
    }

    /// Elementwise product.
    pub fn mul(&self, a: Var, b: Var) -> Result<Var, TapeError> {
        self.check_pair("mul", a, b)?;
        let value = {
            let nodes = self.nodes.borrow();
            &nodes[a.0].value * &nodes[b.0].value
        };
        Ok(self.push(Op::Mul(a.0, b.0), value))
    }

    pub fn scale(&self, a: Var, factor: f64) -> Result<Var, TapeError> {
        let value = self.map_value(a, |v| v * factor)?;
        Ok(self.push(Op::Scale(a.0, factor), value))
    }

    /// Adds `shift` to every entry.
    pub fn offset(&self, a: Var, shift: f64) -> Result<Var, TapeError> {
        let value = self.map_value(a, |v| v + shift)?;
        Ok(self.push(Op::Offset(a.0), value))
    }

    pub fn sin(&self, a: Var) -> Result<Var, TapeError> {
        let value = self.map_value(a, |v| v.mapv(f64::sin))?;
        Ok(self.push(Op::Sin(a.0), value))
    }

    pub fn cos(&self, a: Var) -> Result<Var, TapeError> {
        let value = self.map_value(a, |v| v.mapv(f64::cos))?;
        Ok(self.push(Op::Cos(a.0), value))
    }

    /// Euclidean norm of the whole vector, as a length-1 node.
    pub fn norm(&self, a: Var) -> Result<Var, TapeError> {
        let value = self.map_value(a, |v| Array1::from_elem(1, v.dot(v).sqrt()))?;
        Ok(self.push(Op::Norm(a.0), value))
    }

    pub fn concat(&self, parts: &[Var]) -> Result<Var, TapeError> {
        for &part in parts {
            self.check(part)?;
        }
        let value = {
            let nodes = self.nodes.borrow();
            let mut out = Vec::new();
            for part in parts {
                out.extend(nodes[part.0].value.iter().copied());
            }
            Array1::from_vec(out)
        };
        Ok(self.push(Op::Concat(parts.iter().map(|v| v.0).collect()), value))
    }

    pub fn slice(&self, a: Var, range: Range<usize>) -> Result<Var, TapeError> {
        let len = self.check(a)?;
        if range.start > range.end || range.end > len {
            return Err(TapeError::SliceOutOfBounds {
                start: range.start,
                end: range.end,
                len,
            });
        }
        let value = self.map_value(a, |v| v.slice(s![range.clone()]).to_owned())?;
        Ok(self.push(
            Op::Slice {
                input: a.0,
                start: range.start,
            },
            value,
        ))
    }

    /// Reverse sweep from `output` seeded with `seed`. Returns the adjoint of
    /// every node recorded up to `output`.
    pub fn gradient(&self, output: Var, seed: ArrayView1<'_, f64>) -> Result<Gradients, TapeError> {
        let out_len = self.check(output)?;
        if seed.len() != out_len {
            return Err(TapeError::LengthMismatch {
                op: "gradient seed",
                left: seed.len(),
                right: out_len,
            });
        }
        let nodes = self.nodes.borrow();
        let mut adjoints: Vec<Option<Array1<f64>>> = vec![None; output.0 + 1];
        adjoints[output.0] = Some(seed.to_owned());

        for idx in (0..=output.0).rev() {
            let Some(adj) = adjoints[idx].take() else {
                continue;
            };
            match &nodes[idx].op {
                Op::Leaf | Op::Constant => {}
                Op::Linear {
                    input,
                    matrix,
                    stride,
                } => {
                    let back = sparse_transpose_matvec_strided(matrix, adj.view(), *stride)?;
                    accumulate(&mut adjoints, *input, back);
                }
                Op::Add(a, b) => {
                    accumulate(&mut adjoints, *a, adj.clone());
                    accumulate(&mut adjoints, *b, adj.clone());
                }
                Op::Sub(a, b) => {
                    accumulate(&mut adjoints, *a, adj.clone());
                    accumulate(&mut adjoints, *b, -&adj);
                }
                Op::Mul(a, b) => {
                    accumulate(&mut adjoints, *a, &adj * &nodes[*b].value);
                    accumulate(&mut adjoints, *b, &adj * &nodes[*a].value);
                }
                Op::Scale(a, factor) => accumulate(&mut adjoints, *a, &adj * *factor),
                Op::Offset(a) => accumulate(&mut adjoints, *a, adj.clone()),
                Op::Sin(a) => {
                    let d = nodes[*a].value.mapv(f64::cos);
                    accumulate(&mut adjoints, *a, &adj * &d);
                }
                Op::Cos(a) => {
                    let d = nodes[*a].value.mapv(|v| -v.sin());
                    accumulate(&mut adjoints, *a, &adj * &d);
                }
                Op::Norm(a) => {
                    let n = nodes[idx].value[0];
                    let back = if n > 0.0 {
                        &nodes[*a].value * (adj[0] / n)
                    } else {
                        // Subgradient at the origin.
                        Array1::zeros(nodes[*a].value.len())
                    };
                    accumulate(&mut adjoints, *a, back);
                }
                Op::Concat(parts) => {
                    let mut start = 0;
                    for &part in parts {
                        let len = nodes[part].value.len();
                        accumulate(
                            &mut adjoints,
                            part,
                            adj.slice(s![start..start + len]).to_owned(),
                        );
                        start += len;
                    }
                }
                Op::Slice { input, start } => {
                    let mut back = Array1::zeros(nodes[*input].value.len());
                    back.slice_mut(s![*start..*start + adj.len()]).assign(&adj);
                    accumulate(&mut adjoints, *input, back);
                }
            }
            adjoints[idx] = Some(adj);
        }

        let adjoints = adjoints
            .into_iter()
            .zip(nodes.iter())
            .map(|(adj, node)| adj.unwrap_or_else(|| Array1::zeros(node.value.len())))
            .collect();
        Ok(Gradients { adjoints })
    }

    /// Dense Jacobian of `output` with respect to `wrt`, columns concatenated
    /// in `wrt` order. One reverse sweep per output component.
    pub fn jacobian(&self, output: Var, wrt: &[Var]) -> Result<Array2<f64>, TapeError> {
        let out_len = self.check(output)?;
        let widths = wrt
            .iter()
            .map(|&v| self.check(v))
            .collect::<Result<Vec<_>, _>>()?;
        let total: usize = widths.iter().sum();
        let mut jac = Array2::<f64>::zeros((out_len, total));
        let mut seed = Array1::<f64>::zeros(out_len);
        for row in 0..out_len {
            seed.fill(0.0);
            seed[row] = 1.0;
            let grads = self.gradient(output, seed.view())?;
            let mut col = 0;
            for (&var, &width) in wrt.iter().zip(&widths) {
                jac.slice_mut(s![row, col..col + width])
                    .assign(&grads.wrt(var));
                col += width;
            }
        }
        Ok(jac)
    }
}

fn accumulate(adjoints: &mut [Option<Array1<f64>>], idx: usize, contribution: Array1<f64>) {
    match &mut adjoints[idx] {
        Some(existing) => *existing += &contribution,
        slot @ None => *slot = Some(contribution),
    }
}

/// Adjoints from one reverse sweep.
#[derive(Debug, Clone)]
pub struct Gradients {
    adjoints: Vec<Array1<f64>>,
}

impl Gradients {
    /// Adjoint of `var`; zero for nodes the output does not depend on.
    pub fn wrt(&self, var: Var) -> ArrayView1<'_, f64> {
        self.adjoints
            .get(var.0)
            .map(|a| a.view())
            .unwrap_or_else(|| ArrayView1::from(&[] as &[f64]))
    }
}
