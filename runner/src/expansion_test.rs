use crate::{
    config::{OrderedMap, PathCount, VariableSpec},
    expansion::{expand, linspace, BoundValue, ExpansionError},
    expression::{ExpressionError, Scalar},
};
use std::collections::BTreeMap;

fn scans(variables: Vec<(&str, VariableSpec)>) -> OrderedMap<VariableSpec> {
    OrderedMap(
        variables
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect(),
    )
}

fn ints(values: &[i64]) -> Vec<Scalar> {
    values.iter().copied().map(Scalar::Int).collect()
}

fn labels(bindings: &[crate::expansion::Binding]) -> Vec<Vec<String>> {
    bindings
        .iter()
        .map(|binding| {
            binding
                .iter()
                .map(|bound| format!("{}={}", bound.name, bound.label))
                .collect()
        })
        .collect()
}

#[test]
pub fn cartesian_product_in_declaration_order() {
    let declaration = scans(vec![
        ("x", VariableSpec::list(ints(&[1, 2]))),
        (
            "y",
            VariableSpec::list(vec![
                Scalar::Text("a".into()),
                Scalar::Text("b".into()),
                Scalar::Text("c".into()),
            ]),
        ),
    ]);

    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();

    assert_eq!(bindings.len(), 6);
    assert_eq!(
        labels(&bindings)[..3],
        [
            vec!["x=1".to_string(), "y=a".to_string()],
            vec!["x=1".to_string(), "y=b".to_string()],
            vec!["x=1".to_string(), "y=c".to_string()],
        ]
    );
    assert_eq!(
        labels(&bindings)[5],
        vec!["x=2".to_string(), "y=c".to_string()]
    );
}

#[test]
pub fn concomitant_variables_are_zipped() {
    let declaration = scans(vec![
        ("x", VariableSpec::list(ints(&[1, 2]))),
        (
            "y",
            VariableSpec::list(ints(&[10, 20])).with_concomitant(&["x"]),
        ),
    ]);

    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();

    assert_eq!(
        labels(&bindings),
        vec![
            vec!["x=1".to_string(), "y=10".to_string()],
            vec!["x=2".to_string(), "y=20".to_string()],
        ]
    );
}

#[test]
pub fn concomitant_links_are_transitive() {
    let declaration = scans(vec![
        ("a", VariableSpec::list(ints(&[1, 2, 3]))),
        ("b", VariableSpec::list(ints(&[4, 5, 6])).with_concomitant(&["a"])),
        ("z", VariableSpec::list(ints(&[0, 1]))),
        ("c", VariableSpec::list(ints(&[7, 8, 9])).with_concomitant(&["b"])),
    ]);

    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();

    // one zipped group of three times z
    assert_eq!(bindings.len(), 6);
    assert_eq!(
        labels(&bindings)[1],
        vec![
            "a=1".to_string(),
            "b=4".to_string(),
            "z=1".to_string(),
            "c=7".to_string()
        ]
    );
}

#[test]
pub fn concomitant_length_mismatch() {
    let declaration = scans(vec![
        ("x", VariableSpec::list(ints(&[1, 2]))),
        (
            "y",
            VariableSpec::list(ints(&[10, 20, 30])).with_concomitant(&["x"]),
        ),
    ]);

    assert_eq!(
        expand("generation_1", &declaration, &BTreeMap::new()),
        Err(ExpansionError::LengthMismatch {
            generation: "generation_1".to_string(),
            lengths: vec![("x".to_string(), 2), ("y".to_string(), 3)],
        })
    );
}

#[test]
pub fn ranges_are_rounded() {
    assert_eq!(linspace(0.0, 1.0, 1), vec![0.0]);
    assert!(linspace(0.0, 1.0, 0).is_empty());

    let declaration = scans(vec![
        ("tune", VariableSpec::linspace(0.0, 1.0, 4)),
        (
            "intensity",
            VariableSpec {
                logspace: Some((0.0, 2.0, 3)),
                ..VariableSpec::default()
            }
            .with_concomitant(&["tune"])
            .with_condition("intensity > 0"),
        ),
    ]);

    // logspace spans 3 values, linspace 4
    assert!(matches!(
        expand("generation_1", &declaration, &BTreeMap::new()),
        Err(ExpansionError::LengthMismatch { .. })
    ));

    let declaration = scans(vec![("tune", VariableSpec::linspace(0.0, 1.0, 4))]);
    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();
    assert_eq!(
        labels(&bindings),
        vec![
            vec!["tune=0.0".to_string()],
            vec!["tune=0.33333".to_string()],
            vec!["tune=0.66667".to_string()],
            vec!["tune=1.0".to_string()],
        ]
    );

    let declaration = scans(vec![(
        "intensity",
        VariableSpec {
            logspace: Some((0.0, 2.0, 3)),
            ..VariableSpec::default()
        },
    )]);
    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();
    assert_eq!(
        bindings
            .iter()
            .map(|binding| binding.get("intensity").unwrap().scalar().clone())
            .collect::<Vec<_>>(),
        vec![Scalar::Float(1.0), Scalar::Float(10.0), Scalar::Float(100.0)]
    );
}

#[test]
pub fn derived_values_and_conditions() {
    let declaration = scans(vec![
        (
            "qx",
            VariableSpec::list(vec![Scalar::Float(62.31), Scalar::Float(62.32)]),
        ),
        (
            "qy",
            VariableSpec::list(vec![Scalar::Float(60.30), Scalar::Float(60.33)])
                .with_condition("qy >= qx - 2"),
        ),
        ("dq", VariableSpec::derived("qx - qy")),
    ]);

    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();

    assert_eq!(
        labels(&bindings),
        vec![
            vec![
                "qx=62.31".to_string(),
                "qy=60.33".to_string(),
                "dq=1.98".to_string()
            ],
            vec![
                "qx=62.32".to_string(),
                "qy=60.33".to_string(),
                "dq=1.99".to_string()
            ],
        ]
    );
}

#[test]
pub fn derived_values_see_inherited_context() {
    let declaration = scans(vec![
        ("seed", VariableSpec::list(ints(&[1, 2]))),
        // declared before its dependency on purpose
        ("scaled", VariableSpec::derived("offset * 2")),
        ("offset", VariableSpec::derived("seed + base")),
    ]);
    let inherited = BTreeMap::from([("base".to_string(), Scalar::Int(100))]);

    let bindings = expand("generation_2", &declaration, &inherited).unwrap();

    assert_eq!(
        bindings[1].get("scaled"),
        Some(&BoundValue::Scalar(Scalar::Int(204)))
    );
}

#[test]
pub fn cyclic_derived_values() {
    let declaration = scans(vec![
        ("a", VariableSpec::derived("b + 1")),
        ("b", VariableSpec::derived("a + 1")),
    ]);

    assert!(matches!(
        expand("generation_1", &declaration, &BTreeMap::new()),
        Err(ExpansionError::CyclicExpression { cycle, .. }) if cycle == vec!["a".to_string(), "b".to_string()]
    ));
}

#[test]
pub fn unresolved_reference_in_condition() {
    let declaration = scans(vec![(
        "x",
        VariableSpec::list(ints(&[1])).with_condition("x > threshold"),
    )]);

    assert!(matches!(
        expand("generation_1", &declaration, &BTreeMap::new()),
        Err(ExpansionError::Expression {
            source: ExpressionError::UnresolvedReference(name),
            ..
        }) if name == "threshold"
    ));
}

#[test]
pub fn conditions_can_filter_everything() {
    let declaration = scans(vec![(
        "x",
        VariableSpec::list(ints(&[1, 2])).with_condition("x > 5"),
    )]);

    assert!(expand("generation_1", &declaration, &BTreeMap::new())
        .unwrap()
        .is_empty());
}

#[test]
pub fn no_variables_yield_a_single_binding() {
    let bindings = expand("generation_1", &OrderedMap::new(), &BTreeMap::new()).unwrap();

    assert_eq!(bindings.len(), 1);
    assert!(bindings[0].is_empty());
}

#[test]
pub fn path_lists_use_common_parameters() {
    let declaration = scans(vec![(
        "input",
        VariableSpec {
            path_list: Some((
                "data/part____.parquet".to_string(),
                PathCount::Parameter("n_split".to_string()),
            )),
            ..VariableSpec::default()
        },
    )]);
    let inherited = BTreeMap::from([("n_split".to_string(), Scalar::Int(3))]);

    let bindings = expand("generation_1", &declaration, &inherited).unwrap();

    assert_eq!(
        labels(&bindings),
        vec![
            vec!["input=00".to_string()],
            vec!["input=01".to_string()],
            vec!["input=02".to_string()],
        ]
    );
    assert_eq!(
        bindings[2].get("input"),
        Some(&BoundValue::Scalar(Scalar::Text(
            "data/part02.parquet".to_string()
        )))
    );
}

#[test]
pub fn subvariables_share_the_value() {
    let declaration = scans(vec![(
        "knob",
        VariableSpec::list(ints(&[5])).with_subvariables(&["lhcb1", "lhcb2"]),
    )]);

    let bindings = expand("generation_1", &declaration, &BTreeMap::new()).unwrap();

    assert_eq!(
        bindings[0].get("knob"),
        Some(&BoundValue::PerSubvariable {
            keys: vec!["lhcb1".to_string(), "lhcb2".to_string()],
            value: Scalar::Int(5),
        })
    );
    assert_eq!(
        serde_yaml::to_string(&bindings[0].to_mapping()).unwrap(),
        "knob:\n  lhcb1: 5\n  lhcb2: 5\n"
    );
}

#[test]
pub fn expansion_is_deterministic() {
    let declaration = scans(vec![
        ("x", VariableSpec::linspace(0.1, 0.9, 5)),
        ("y", VariableSpec::list(ints(&[3, 1, 2]))),
        ("z", VariableSpec::derived("x * y")),
    ]);

    assert_eq!(
        expand("generation_1", &declaration, &BTreeMap::new()).unwrap(),
        expand("generation_1", &declaration, &BTreeMap::new()).unwrap()
    );
}

#[test]
pub fn concomitant_with_unknown_variable() {
    let declaration = scans(vec![(
        "x",
        VariableSpec::list(ints(&[1])).with_concomitant(&["ghost"]),
    )]);

    assert!(matches!(
        expand("generation_1", &declaration, &BTreeMap::new()),
        Err(ExpansionError::InvalidVariable { variable, .. }) if variable == "x"
    ));
}

#[test]
pub fn path_count_can_be_literal() {
    let declaration = scans(vec![(
        "input",
        VariableSpec {
            path_list: Some(("chunk____".to_string(), PathCount::Count(2))),
            ..VariableSpec::default()
        },
    )]);

    assert_eq!(
        expand("generation_1", &declaration, &BTreeMap::new())
            .unwrap()
            .len(),
        2
    );
}
