use splinegeo::{EnclosureOptions, ProjectionOptions, RefitOptions, SolverOptions};

#[test]
fn partial_documents_fall_back_to_defaults() {
    let projection: ProjectionOptions =
        serde_json::from_str(r#"{"grid_search_density": 8}"#).expect("projection options");
    assert_eq!(projection.grid_search_density, 8);
    assert_eq!(projection.max_iterations, ProjectionOptions::default().max_iterations);

    let solver: SolverOptions =
        serde_json::from_str(r#"{"residual_tolerance": 1e-6}"#).expect("solver options");
    assert_eq!(solver.residual_tolerance, 1e-6);
    assert_eq!(solver.max_iterations, SolverOptions::default().max_iterations);

    let refit: RefitOptions = serde_json::from_str("{}").expect("refit options");
    assert_eq!(refit, RefitOptions::default());

    let enclosure: EnclosureOptions =
        serde_json::from_str(r#"{"padding": 0.25}"#).expect("enclosure options");
    assert_eq!(enclosure.padding, 0.25);
    assert_eq!(enclosure.minimum_thickness, EnclosureOptions::default().minimum_thickness);
}

#[test]
fn options_survive_a_json_round_trip() {
    let options = SolverOptions {
        max_iterations: 12,
        max_backtracking_steps: 3,
        ..SolverOptions::default()
    };
    let json = serde_json::to_string(&options).expect("serialize");
    let back: SolverOptions = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, options);
}
