use ndarray::{Array1, array};
use splinegeo::{
    BSplineFunction, BSplineSet, BSplineSpace, EmbeddedEntity, EnclosureOptions, FfdBlock,
    ParameterizationSolver, ProjectionOptions, SolverError, SolverOptions,
    VolumeSectionalParameterization, VolumeSectionalParameterizationInputs,
};
use std::collections::BTreeMap;
use std::sync::Arc;

struct Wing {
    set: BSplineSet,
    block: FfdBlock,
    sectional: VolumeSectionalParameterization,
}

fn wing() -> Wing {
    let plate = BSplineFunction::from_corners(
        array![
            [0.0, -2.0, 0.0],
            [0.0, 2.0, 0.0],
            [1.0, -2.0, 0.0],
            [1.0, 2.0, 0.0],
        ]
        .view(),
        &[2, 2],
        &[3, 5],
    )
    .expect("plate");
    let set = BSplineSet::new("wing", vec![("plate".to_string(), plate)]).expect("set");

    let control_points = set
        .function("plate")
        .expect("member")
        .coefficient_matrix()
        .expect("coefficient matrix")
        .to_owned();
    let lattice = BSplineFunction::enclosure_block(
        control_points.view(),
        &[2, 3, 2],
        &[2, 2, 2],
        &EnclosureOptions::default(),
    )
    .expect("enclosure block");
    let mut block = FfdBlock::new(lattice).expect("ffd block");
    block
        .embed(EmbeddedEntity::Set(set.clone()))
        .expect("embed set");
    let sectional = VolumeSectionalParameterization::from_ffd_block(&block, 1).expect("sectional");
    Wing {
        set,
        block,
        sectional,
    }
}

#[test]
fn span_target_is_met_through_the_full_chain() {
    let Wing {
        set,
        block,
        sectional,
    } = wing();

    let ends = set
        .project(
            array![[0.5, -2.0, 0.0], [0.5, 2.0, 0.0]].view(),
            None,
            &ProjectionOptions::default(),
        )
        .expect("projection");
    assert!(ends.all_converged());
    let locations = ends.locations;

    // A linear curve of two equal coefficients spreads one scalar over all sections.
    let stretch_space = Arc::new(BSplineSpace::open_uniform(&[2], &[2]).expect("space"));
    let stretch_curve =
        BSplineFunction::new(stretch_space, Array1::zeros(2), 1).expect("stretch curve");
    let section_params = Array1::linspace(0.0, 1.0, sectional.num_sections())
        .insert_axis(ndarray::Axis(1));

    let mut solver = ParameterizationSolver::new();
    solver.declare_state("span_stretch", array![0.0]);
    solver.declare_input("span", array![6.0]);

    let outcome = solver
        .solve(
            |tape, states| {
                let s = states["span_stretch"];
                let curve_coefficients = tape.concat(&[s, s])?;
                let per_section = stretch_curve.evaluate_traced(
                    tape,
                    curve_coefficients,
                    section_params.view(),
                    &[],
                )?;
                let mut inputs = VolumeSectionalParameterizationInputs::new();
                inputs.add_sectional_stretch(1, per_section);
                let lattice = sectional.evaluate_traced(tape, &inputs)?;
                let embedded = block.evaluate_traced(tape, lattice)?;
                let points = set.evaluate_traced(tape, embedded[0], &locations)?;
                let root = tape.slice(points, 0..3)?;
                let tip = tape.slice(points, 3..6)?;
                let span = tape.norm(tape.sub(tip, root)?)?;
                Ok(BTreeMap::from([("span".to_string(), span)]))
            },
            &SolverOptions::default(),
        )
        .expect("solve");

    let s = outcome.states["span_stretch"][0];
    assert!((s - 0.5).abs() < 1e-8, "span stretch {s:.6e}");
    assert!(outcome.residual_norm < 1e-8);
    assert_eq!(solver.states()["span_stretch"][0], s);
}

#[test]
fn underdetermined_sections_move_as_little_as_possible() {
    let Wing {
        set,
        block,
        sectional,
    } = wing();
    let locations = set
        .project(
            array![[0.5, -2.0, 0.0], [0.5, 2.0, 0.0]].view(),
            None,
            &ProjectionOptions::default(),
        )
        .expect("projection")
        .locations;

    let mut solver = ParameterizationSolver::new();
    solver.declare_state("stretches", Array1::zeros(sectional.num_sections()));
    solver.declare_input("span", array![6.0]);
    let outcome = solver
        .solve(
            |tape, states| {
                let mut inputs = VolumeSectionalParameterizationInputs::new();
                inputs.add_sectional_stretch(1, states["stretches"]);
                let lattice = sectional.evaluate_traced(tape, &inputs)?;
                let embedded = block.evaluate_traced(tape, lattice)?;
                let points = set.evaluate_traced(tape, embedded[0], &locations)?;
                let span = tape.norm(tape.sub(tape.slice(points, 3..6)?, tape.slice(points, 0..3)?)?)?;
                Ok(BTreeMap::from([("span".to_string(), span)]))
            },
            &SolverOptions::default(),
        )
        .expect("solve");

    // The span only sees the end sections; the middle one stays put.
    let stretches = &outcome.states["stretches"];
    assert!(stretches[1].abs() < 1e-10, "middle stretch {:.6e}", stretches[1]);
    assert!((stretches[0] - stretches[2]).abs() < 1e-8);
    assert!((stretches[0] - 0.5).abs() < 1e-8, "end stretch {:.6e}", stretches[0]);
}

#[test]
fn more_targets_than_states_is_rejected() {
    let Wing { sectional, .. } = wing();
    let mut solver = ParameterizationSolver::new();
    solver.declare_state("s", array![0.0]);
    solver.declare_input("lattice", Array1::zeros(sectional.base_coefficients().len()));
    let err = solver
        .solve(
            |tape, states| {
                let mut inputs = VolumeSectionalParameterizationInputs::new();
                inputs.add_sectional_translation(2, tape.concat(&[states["s"], states["s"], states["s"]])?);
                Ok(BTreeMap::from([(
                    "lattice".to_string(),
                    sectional.evaluate_traced(tape, &inputs)?,
                )]))
            },
            &SolverOptions::default(),
        )
        .expect_err("over-determined solve must fail");
    assert!(matches!(err, SolverError::NoUniqueSolution { .. }));
}
