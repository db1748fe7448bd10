use crate::{
    config::{OrderedMap, VariableSpec},
    expansion::expand,
    expression::Scalar,
    naming::{fragment, label, name_for, segment_for, validate_segment, NamingError},
};
use std::collections::BTreeMap;

#[test]
pub fn labels_are_canonical() {
    assert_eq!(label(&Scalar::Int(3)), "3");
    assert_eq!(label(&Scalar::Float(2.0)), "2.0");
    assert_eq!(label(&Scalar::Float(0.31)), "0.31");
    assert_eq!(label(&Scalar::Bool(true)), "true");
    assert_eq!(label(&Scalar::Text("b1".into())), "b1");
}

#[test]
pub fn common_parameters_never_name_nodes() {
    assert_eq!(name_for("n_split", &Scalar::Int(5), true), Ok(None));
    assert_eq!(
        name_for("seed", &Scalar::Int(5), false),
        Ok(Some("seed_5".to_string()))
    );
}

#[test]
pub fn unsafe_labels_are_rejected() {
    assert!(matches!(
        fragment("beam", "b1/../b2"),
        Err(NamingError::InvalidName { variable, .. }) if variable == "beam"
    ));
    assert!(fragment("beam", "").is_err());
    assert!(fragment("beam", "with space").is_err());
    assert!(validate_segment(".hidden").is_err());
    assert!(validate_segment("..").is_err());
    assert!(validate_segment("study-2.1+x").is_ok());
}

#[test]
pub fn segment_joins_fragments_in_declaration_order() {
    let scans = OrderedMap(vec![
        (
            "qx".to_string(),
            VariableSpec::list(vec![Scalar::Float(62.31)]),
        ),
        ("seed".to_string(), VariableSpec::list(vec![Scalar::Int(4)])),
    ]);
    let bindings = expand("generation_1", &scans, &BTreeMap::new()).unwrap();

    assert_eq!(
        segment_for("generation_1", &bindings[0]),
        Ok("qx_62.31_seed_4".to_string())
    );
}

#[test]
pub fn unscanned_generation_uses_its_name() {
    let bindings = expand("collect", &OrderedMap::new(), &BTreeMap::new()).unwrap();

    assert_eq!(
        segment_for("collect", &bindings[0]),
        Ok("collect".to_string())
    );
}
