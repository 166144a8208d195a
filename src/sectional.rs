//! Sectional re-composition of an FFD lattice.
//!
//! The lattice is viewed as a stack of sections along one parametric
//! dimension. Per-section stretches, translations and rotations are applied in
//! that fixed order:
//!
//! * stretch on axis `a`: `x_a ← x_a + s_k (x_a − ref_a)`, where `ref_a` is the
//!   section centroid, or the lattice centroid when `a` is the principal axis;
//! * translation on axis `a`: `x_a ← x_a + t_k`;
//! * rotation on axis `a` by `θ_k` degrees about the section centroid, axes in
//!   ascending order.
//!
//! The lattice is assumed axis-aligned, so physical axis `d` runs along
//! parametric dimension `d` and the principal axis equals the principal
//! parametric dimension. Every contribution is written as a displacement from
//! the unmodified lattice, so all-zero inputs reproduce it exactly.

use crate::ffd::FfdBlock;
use crate::linalg::sparse::{SparseOpError, triplets_to_csc};
use crate::tape::{Tape, TapeError, Var};
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, ArrayView1};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SectionalError {
    #[error("{kind} on axis {axis} has {provided} values but the lattice has {expected} sections")]
    SectionCountMismatch {
        kind: &'static str,
        axis: usize,
        expected: usize,
        provided: usize,
    },
    #[error("Axis {axis} is out of range for {num_physical_dimensions} physical dimensions")]
    InvalidAxis {
        axis: usize,
        num_physical_dimensions: usize,
    },
    #[error("Rotations need three physical dimensions, the lattice has {0}")]
    RotationUnsupported(usize),
    #[error("Invalid lattice: {0}")]
    InvalidLattice(String),
    #[error(transparent)]
    Tape(#[from] TapeError),
    #[error(transparent)]
    Sparse(#[from] SparseOpError),
}

/// Per-axis sectional inputs. `T` is `Array1<f64>` for plain evaluation and
/// [`Var`] for traced evaluation.
#[derive(Clone, Debug)]
pub struct VolumeSectionalParameterizationInputs<T = Array1<f64>> {
    pub stretches: BTreeMap<usize, T>,
    pub translations: BTreeMap<usize, T>,
    /// Angles in degrees.
    pub rotations: BTreeMap<usize, T>,
}

impl<T> Default for VolumeSectionalParameterizationInputs<T> {
    fn default() -> Self {
        Self {
            stretches: BTreeMap::new(),
            translations: BTreeMap::new(),
            rotations: BTreeMap::new(),
        }
    }
}

impl<T> VolumeSectionalParameterizationInputs<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sectional_stretch(&mut self, axis: usize, stretch: T) -> &mut Self {
        self.stretches.insert(axis, stretch);
        self
    }

    pub fn add_sectional_translation(&mut self, axis: usize, translation: T) -> &mut Self {
        self.translations.insert(axis, translation);
        self
    }

    pub fn add_sectional_rotation(&mut self, axis: usize, rotation: T) -> &mut Self {
        self.rotations.insert(axis, rotation);
        self
    }
}

type SparseMap = Arc<SparseColMat<usize, f64>>;

#[derive(Debug, Clone)]
pub struct VolumeSectionalParameterization {
    base: Array1<f64>,
    shape: [usize; 3],
    principal_dimension: usize,
    num_physical_dimensions: usize,
    num_sections: usize,
    /// `[n_pts·P, n_sections]`: `s ↦` stretch displacement, one per axis.
    stretch_maps: Vec<SparseMap>,
    /// `[n_pts·P, n_sections]`: broadcast a section value onto axis `a`.
    section_scatter: Vec<SparseMap>,
    /// `[n_pts, n_pts·P]`: coordinate `a` minus its section centroid.
    centered_select: Vec<SparseMap>,
    /// `[n_pts·P, n_pts]`: place a per-point value on axis `a`.
    point_scatter: Vec<SparseMap>,
    /// `[n_pts, n_sections]`: section angle in degrees to per-point radians.
    angle_expand: SparseMap,
}

impl VolumeSectionalParameterization {
    /// `lattice_coefficients` is flat and interleaved, row-major over `shape`.
    pub fn new(
        lattice_coefficients: ArrayView1<'_, f64>,
        shape: [usize; 3],
        principal_dimension: usize,
        num_physical_dimensions: usize,
    ) -> Result<Self, SectionalError> {
        if principal_dimension >= 3 {
            return Err(SectionalError::InvalidLattice(format!(
                "principal dimension {principal_dimension} is not one of the three lattice dimensions"
            )));
        }
        if principal_dimension >= num_physical_dimensions {
            return Err(SectionalError::InvalidAxis {
                axis: principal_dimension,
                num_physical_dimensions,
            });
        }
        let num_points: usize = shape.iter().product();
        let phys = num_physical_dimensions;
        if num_points == 0 || lattice_coefficients.len() != num_points * phys {
            return Err(SectionalError::InvalidLattice(format!(
                "{} coefficients do not fill a {shape:?} lattice with {phys} physical dimensions",
                lattice_coefficients.len()
            )));
        }
        let num_sections = shape[principal_dimension];
        let per_section = num_points / num_sections;

        let section_of: Vec<usize> = (0..num_points)
            .map(|row| {
                let index = [
                    row / (shape[1] * shape[2]),
                    (row / shape[2]) % shape[1],
                    row % shape[2],
                ];
                index[principal_dimension]
            })
            .collect();
        let mut members: Vec<Vec<usize>> = vec![Vec::with_capacity(per_section); num_sections];
        for (row, &section) in section_of.iter().enumerate() {
            members[section].push(row);
        }

        let coordinate = |row: usize, axis: usize| lattice_coefficients[row * phys + axis];
        let mut section_centroids = vec![vec![0.0; phys]; num_sections];
        let mut lattice_centroid = vec![0.0; phys];
        for (section, rows) in members.iter().enumerate() {
            for &row in rows {
                for axis in 0..phys {
                    section_centroids[section][axis] += coordinate(row, axis) / per_section as f64;
                    lattice_centroid[axis] += coordinate(row, axis) / num_points as f64;
                }
            }
        }

        let mut stretch_maps = Vec::with_capacity(phys);
        let mut section_scatter = Vec::with_capacity(phys);
        let mut centered_select = Vec::with_capacity(phys);
        let mut point_scatter = Vec::with_capacity(phys);
        for axis in 0..phys {
            let mut stretch = Vec::with_capacity(num_points);
            let mut scatter = Vec::with_capacity(num_points);
            let mut centered = Vec::with_capacity(num_points * (per_section + 1));
            let mut place = Vec::with_capacity(num_points);
            for row in 0..num_points {
                let section = section_of[row];
                let reference = if axis == principal_dimension {
                    lattice_centroid[axis]
                } else {
                    section_centroids[section][axis]
                };
                let offset = coordinate(row, axis) - reference;
                if offset != 0.0 {
                    stretch.push(Triplet::new(row * phys + axis, section, offset));
                }
                scatter.push(Triplet::new(row * phys + axis, section, 1.0));
                place.push(Triplet::new(row * phys + axis, row, 1.0));
                centered.push(Triplet::new(row, row * phys + axis, 1.0));
                for &other in &members[section] {
                    centered.push(Triplet::new(row, other * phys + axis, -1.0 / per_section as f64));
                }
            }
            stretch_maps.push(Arc::new(triplets_to_csc(num_points * phys, num_sections, &stretch)?));
            section_scatter.push(Arc::new(triplets_to_csc(num_points * phys, num_sections, &scatter)?));
            centered_select.push(Arc::new(triplets_to_csc(num_points, num_points * phys, &centered)?));
            point_scatter.push(Arc::new(triplets_to_csc(num_points * phys, num_points, &place)?));
        }
        let angles: Vec<Triplet<usize, usize, f64>> = section_of
            .iter()
            .enumerate()
            .map(|(row, &section)| Triplet::new(row, section, PI / 180.0))
            .collect();
        let angle_expand = Arc::new(triplets_to_csc(num_points, num_sections, &angles)?);

        Ok(Self {
            base: lattice_coefficients.to_owned(),
            shape,
            principal_dimension,
            num_physical_dimensions,
            num_sections,
            stretch_maps,
            section_scatter,
            centered_select,
            point_scatter,
            angle_expand,
        })
    }

    /// Parameterizes the current lattice of `block`.
    pub fn from_ffd_block(block: &FfdBlock, principal_dimension: usize) -> Result<Self, SectionalError> {
        Self::new(
            block.lattice().coefficients().view(),
            block.coefficient_shape(),
            principal_dimension,
            block.lattice().num_physical_dimensions(),
        )
    }

    pub fn num_sections(&self) -> usize {
        self.num_sections
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn principal_dimension(&self) -> usize {
        self.principal_dimension
    }

    pub fn base_coefficients(&self) -> &Array1<f64> {
        &self.base
    }

    fn check_inputs<T, F>(
        &self,
        inputs: &VolumeSectionalParameterizationInputs<T>,
        len_of: F,
    ) -> Result<(), SectionalError>
    where
        F: Fn(&T) -> Result<usize, SectionalError>,
    {
        let groups = [
            ("stretch", &inputs.stretches),
            ("translation", &inputs.translations),
            ("rotation", &inputs.rotations),
        ];
        for (kind, group) in groups {
            for (&axis, values) in group {
                if axis >= self.num_physical_dimensions {
                    return Err(SectionalError::InvalidAxis {
                        axis,
                        num_physical_dimensions: self.num_physical_dimensions,
                    });
                }
                let provided = len_of(values)?;
                if provided != self.num_sections {
                    return Err(SectionalError::SectionCountMismatch {
                        kind,
                        axis,
                        expected: self.num_sections,
                        provided,
                    });
                }
            }
        }
        if !inputs.rotations.is_empty() && self.num_physical_dimensions != 3 {
            return Err(SectionalError::RotationUnsupported(self.num_physical_dimensions));
        }
        Ok(())
    }

    /// New lattice coefficients for `inputs`.
    pub fn evaluate(
        &self,
        inputs: &VolumeSectionalParameterizationInputs,
    ) -> Result<Array1<f64>, SectionalError> {
        self.check_inputs(inputs, |values| Ok(values.len()))?;
        let tape = Tape::new();
        let as_constants = |group: &BTreeMap<usize, Array1<f64>>| {
            group
                .iter()
                .map(|(&axis, values)| (axis, tape.constant(values.clone())))
                .collect::<BTreeMap<_, _>>()
        };
        let traced = VolumeSectionalParameterizationInputs {
            stretches: as_constants(&inputs.stretches),
            translations: as_constants(&inputs.translations),
            rotations: as_constants(&inputs.rotations),
        };
        let output = self.evaluate_traced(&tape, &traced)?;
        Ok(tape.value(output)?)
    }

    /// Records the composition on `tape`; the result is the flat lattice.
    pub fn evaluate_traced(
        &self,
        tape: &Tape,
        inputs: &VolumeSectionalParameterizationInputs<Var>,
    ) -> Result<Var, SectionalError> {
        self.check_inputs(inputs, |&var| Ok(tape.var_len(var)?))?;

        let mut x = tape.constant(self.base.clone());
        for (&axis, &stretch) in &inputs.stretches {
            let delta = tape.linear(Arc::clone(&self.stretch_maps[axis]), stretch, 1)?;
            x = tape.add(x, delta)?;
        }
        for (&axis, &translation) in &inputs.translations {
            let delta = tape.linear(Arc::clone(&self.section_scatter[axis]), translation, 1)?;
            x = tape.add(x, delta)?;
        }
        for (&axis, &angle) in &inputs.rotations {
            let i = (axis + 1) % 3;
            let j = (axis + 2) % 3;
            let theta = tape.linear(Arc::clone(&self.angle_expand), angle, 1)?;
            let cos_minus_one = tape.offset(tape.cos(theta)?, -1.0)?;
            let sin = tape.sin(theta)?;
            let di = tape.linear(Arc::clone(&self.centered_select[i]), x, 1)?;
            let dj = tape.linear(Arc::clone(&self.centered_select[j]), x, 1)?;

            let delta_i = tape.sub(tape.mul(cos_minus_one, di)?, tape.mul(sin, dj)?)?;
            let delta_j = tape.add(tape.mul(sin, di)?, tape.mul(cos_minus_one, dj)?)?;
            let placed_i = tape.linear(Arc::clone(&self.point_scatter[i]), delta_i, 1)?;
            let placed_j = tape.linear(Arc::clone(&self.point_scatter[j]), delta_j, 1)?;
            x = tape.add(tape.add(x, placed_i)?, placed_j)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// `(2, 5, 2)` lattice over `[0, 1] × [-2, 2] × [0, 0.5]`.
    fn lattice() -> (Array1<f64>, [usize; 3]) {
        let shape = [2, 5, 2];
        let mut coefficients = Array1::zeros(20 * 3);
        for i in 0..2 {
            for j in 0..5 {
                for k in 0..2 {
                    let row = (i * 5 + j) * 2 + k;
                    coefficients[row * 3] = i as f64;
                    coefficients[row * 3 + 1] = -2.0 + j as f64;
                    coefficients[row * 3 + 2] = 0.5 * k as f64;
                }
            }
        }
        (coefficients, shape)
    }

    fn point(coefficients: &Array1<f64>, row: usize) -> [f64; 3] {
        [coefficients[row * 3], coefficients[row * 3 + 1], coefficients[row * 3 + 2]]
    }

    #[test]
    fn zero_inputs_reproduce_the_lattice_exactly() {
        let (base, shape) = lattice();
        let param = VolumeSectionalParameterization::new(base.view(), shape, 1, 3).unwrap();
        let mut inputs = VolumeSectionalParameterizationInputs::new();
        inputs
            .add_sectional_stretch(0, Array1::zeros(5))
            .add_sectional_translation(2, Array1::zeros(5))
            .add_sectional_rotation(1, Array1::zeros(5));
        let out = param.evaluate(&inputs).unwrap();
        assert_eq!(out, base);
    }

    #[test]
    fn chord_stretch_scales_about_the_section_centroid() {
        let (base, shape) = lattice();
        let param = VolumeSectionalParameterization::new(base.view(), shape, 1, 3).unwrap();
        let mut inputs = VolumeSectionalParameterizationInputs::new();
        inputs.add_sectional_stretch(0, Array1::from_vec(vec![0.0, 0.5, 1.0, 0.0, 0.0]));
        let out = param.evaluate(&inputs).unwrap();
        // Section 2 (y = 0): x ∈ {0, 1} about 0.5, doubled to {-0.5, 1.5}.
        let leading = point(&out, 2 * 2);
        let trailing = point(&out, (5 + 2) * 2);
        assert_abs_diff_eq!(leading[0], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(trailing[0], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(leading[1], 0.0, epsilon = 1e-12);
        // Section 0 untouched.
        assert_eq!(point(&out, 0), point(&base, 0));
    }

    #[test]
    fn translation_then_rotation_about_section_centroid() {
        let (base, shape) = lattice();
        let param = VolumeSectionalParameterization::new(base.view(), shape, 1, 3).unwrap();
        let mut inputs = VolumeSectionalParameterizationInputs::new();
        inputs
            .add_sectional_translation(0, Array1::from_elem(5, 3.0))
            .add_sectional_rotation(1, Array1::from_vec(vec![0.0, 0.0, 90.0, 0.0, 0.0]));
        let out = param.evaluate(&inputs).unwrap();

        // Rotation about y maps (dz, dx) -> (dz cos - dx sin, dz sin + dx cos) with
        // i = z, j = x. Centroid of section 2 after translation: x = 3.5, z = 0.25.
        let row = (5 + 2) * 2; // x = 1 (→ 4 after translation), z = 0
        let p = point(&out, row);
        let (dz, dx) = (0.0 - 0.25, 4.0 - 3.5);
        assert_abs_diff_eq!(p[2], 0.25 + (-dx), epsilon = 1e-12);
        assert_abs_diff_eq!(p[0], 3.5 + dz, epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], 0.0, epsilon = 1e-12);
        // Other sections only translate.
        let q = point(&out, 0);
        assert_abs_diff_eq!(q[0], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn principal_stretch_scales_about_the_lattice_centroid() {
        let (base, shape) = lattice();
        let param = VolumeSectionalParameterization::new(base.view(), shape, 1, 3).unwrap();
        let mut inputs = VolumeSectionalParameterizationInputs::new();
        inputs.add_sectional_stretch(1, Array1::from_elem(5, 0.25));
        let out = param.evaluate(&inputs).unwrap();
        assert_abs_diff_eq!(point(&out, 0)[1], -2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(point(&out, 4 * 2)[1], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn traced_jacobian_matches_finite_differences() {
        let (base, shape) = lattice();
        let param = VolumeSectionalParameterization::new(base.view(), shape, 1, 3).unwrap();
        let stretch0 = Array1::from_vec(vec![0.1, -0.2, 0.05, 0.3, 0.0]);
        let twist0 = Array1::from_vec(vec![5.0, -10.0, 20.0, 0.0, 7.0]);

        let tape = Tape::new();
        let s = tape.leaf(stretch0.clone());
        let t = tape.leaf(twist0.clone());
        let mut traced = VolumeSectionalParameterizationInputs::new();
        traced.add_sectional_stretch(0, s).add_sectional_rotation(1, t);
        let out = param.evaluate_traced(&tape, &traced).unwrap();
        let jac = tape.jacobian(out, &[s, t]).unwrap();

        let eval = |stretch: &Array1<f64>, twist: &Array1<f64>| {
            let mut inputs = VolumeSectionalParameterizationInputs::new();
            inputs
                .add_sectional_stretch(0, stretch.clone())
                .add_sectional_rotation(1, twist.clone());
            param.evaluate(&inputs).unwrap()
        };
        let h = 1e-6;
        for col in 0..10 {
            let (mut sp, mut sm, mut tp, mut tm) =
                (stretch0.clone(), stretch0.clone(), twist0.clone(), twist0.clone());
            if col < 5 {
                sp[col] += h;
                sm[col] -= h;
            } else {
                tp[col - 5] += h;
                tm[col - 5] -= h;
            }
            let fd = (eval(&sp, &tp) - eval(&sm, &tm)) / (2.0 * h);
            for row in 0..fd.len() {
                assert_abs_diff_eq!(jac[[row, col]], fd[row], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let (base, shape) = lattice();
        let param = VolumeSectionalParameterization::new(base.view(), shape, 1, 3).unwrap();
        let mut inputs = VolumeSectionalParameterizationInputs::new();
        inputs.add_sectional_translation(0, Array1::zeros(4));
        assert!(matches!(
            param.evaluate(&inputs),
            Err(SectionalError::SectionCountMismatch { provided: 4, .. })
        ));
        let mut inputs = VolumeSectionalParameterizationInputs::new();
        inputs.add_sectional_stretch(3, Array1::zeros(5));
        assert!(matches!(param.evaluate(&inputs), Err(SectionalError::InvalidAxis { axis: 3, .. })));
        assert!(VolumeSectionalParameterization::new(base.view(), [2, 5, 3], 1, 3).is_err());
    }
}
