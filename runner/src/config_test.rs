use crate::{
    config::{
        BackendConfig, CopyBack, OneOrMany, OrderedMap, PathCount, ScanSpec, SubmitConfig,
        VariableKind, VariableSpec,
    },
    executors::{Context, HtcFlavor, SubmissionType},
    expression::Scalar,
};
use std::{collections::BTreeMap, fs, path::Path};

const SCAN: &str = r#"
name: tune_scan
dependencies:
  main_configuration: base.yaml
  optics: optics.json
structure:
  generation_1:
    executable: gen_1.sh
    common_parameters:
      n_split: 2
    scans:
      qy:
        list: [60.30, 60.31]
      qx:
        expression: qy + 2
  generation_2:
    executable: gen_2.py
    scans:
      part:
        path_list: ["part____.parquet", n_split]
      amplitude:
        linspace: [0, 8, 2]
        concomitant: part
"#;

fn write_scan(dir: &Path) {
    fs::write(dir.join("scan.yaml"), SCAN).unwrap();
    for file in ["base.yaml", "optics.json", "gen_1.sh", "gen_2.py"] {
        fs::write(dir.join(file), "").unwrap();
    }
}

#[test]
pub fn scan_keeps_declaration_order() {
    let dir = tempfile::tempdir().unwrap();
    write_scan(dir.path());

    let scan = ScanSpec::load(&dir.path().join("scan.yaml")).unwrap();

    assert_eq!(scan.name, "tune_scan");
    assert_eq!(
        scan.structure.keys().collect::<Vec<_>>(),
        vec!["generation_1", "generation_2"]
    );
    let generation_1 = scan.structure.get("generation_1").unwrap();
    assert_eq!(
        generation_1.scans.keys().collect::<Vec<_>>(),
        vec!["qy", "qx"]
    );
    assert_eq!(
        scan.main_configuration(),
        Some(&Path::new("base.yaml").to_path_buf())
    );

    let generation_2 = scan.structure.get("generation_2").unwrap();
    let part = generation_2.scans.get("part").unwrap();
    assert_eq!(
        part.path_list,
        Some((
            "part____.parquet".to_string(),
            PathCount::Parameter("n_split".to_string())
        ))
    );
    assert_eq!(
        generation_2.scans.get("amplitude").unwrap().concomitant,
        Some(OneOrMany::One("part".to_string()))
    );

    assert!(!scan.preflight_checks(dir.path()));
    assert_eq!(scan.plans().unwrap().len(), 2);
}

#[test]
pub fn duplicated_keys_are_rejected() {
    let source = "name: x\nstructure:\n  a:\n    executable: a.sh\n  a:\n    executable: b.sh\n";

    let error = serde_yaml::from_str::<ScanSpec>(source).unwrap_err();
    assert!(error.to_string().contains("duplicate"), "{error}");
}

#[test]
pub fn unknown_fields_are_rejected() {
    let source = "name: x\nstructure:\n  a:\n    executable: a.sh\n    scan: {}\n";

    assert!(serde_yaml::from_str::<ScanSpec>(source).is_err());
}

#[test]
pub fn empty_blocks_are_empty_maps() {
    let source = "name: x\ndependencies:\nstructure:\n  a:\n    executable: a.sh\n    scans:\n";

    let scan = serde_yaml::from_str::<ScanSpec>(source).unwrap();
    assert!(scan.dependencies.is_empty());
    assert!(scan.structure.get("a").unwrap().scans.is_empty());
}

#[test]
pub fn variable_needs_exactly_one_source() {
    assert!(VariableSpec::default().kind().is_err());

    let both = VariableSpec {
        linspace: Some((0.0, 1.0, 2)),
        ..VariableSpec::list(vec![Scalar::Int(1)])
    };
    assert!(both.kind().unwrap_err().contains("2 found"));

    assert_eq!(
        VariableSpec::linspace(0.0, 1.0, 3).kind(),
        Ok(VariableKind::Linspace {
            start: 0.0,
            stop: 1.0,
            count: 3
        })
    );
    assert!(VariableSpec::derived("qx -").kind().is_err());
}

#[test]
pub fn preflight_reports_missing_files_and_bad_names() {
    let dir = tempfile::tempdir().unwrap();
    write_scan(dir.path());
    fs::remove_file(dir.path().join("gen_2.py")).unwrap();

    let scan = ScanSpec::load(&dir.path().join("scan.yaml")).unwrap();
    assert!(scan.preflight_checks(dir.path()));

    let mut scan = ScanSpec::load(&dir.path().join("scan.yaml")).unwrap();
    fs::write(dir.path().join("gen_2.py"), "").unwrap();
    scan.structure.insert(
        "status",
        scan.structure.get("generation_1").unwrap().clone(),
    );
    assert!(scan.preflight_checks(dir.path()));
}

#[test]
pub fn preflight_reports_structural_errors() {
    let dir = tempfile::tempdir().unwrap();
    write_scan(dir.path());

    let mut scan = ScanSpec::load(&dir.path().join("scan.yaml")).unwrap();
    let overrides = BTreeMap::from([(
        "generation_1".to_string(),
        OrderedMap(vec![
            ("a".to_string(), VariableSpec::derived("b * 2")),
            ("b".to_string(), VariableSpec::derived("a / 2")),
        ]),
    )]);
    scan.apply_overrides(&overrides).unwrap();

    assert!(scan.preflight_checks(dir.path()));
}

#[test]
pub fn overrides_replace_whole_generations() {
    let dir = tempfile::tempdir().unwrap();
    write_scan(dir.path());
    let mut scan = ScanSpec::load(&dir.path().join("scan.yaml")).unwrap();

    let overrides = BTreeMap::from([(
        "generation_1".to_string(),
        OrderedMap(vec![(
            "seed".to_string(),
            VariableSpec::list(vec![Scalar::Int(1), Scalar::Int(2)]),
        )]),
    )]);
    scan.apply_overrides(&overrides).unwrap();
    assert_eq!(
        scan.structure
            .get("generation_1")
            .unwrap()
            .scans
            .keys()
            .collect::<Vec<_>>(),
        vec!["seed"]
    );

    let unknown = BTreeMap::from([("generation_9".to_string(), OrderedMap::new())]);
    assert!(scan.apply_overrides(&unknown).is_err());
}

#[test]
pub fn submit_config_defaults() {
    let config = serde_yaml::from_str::<SubmitConfig>("{}").unwrap();

    assert_eq!(config, SubmitConfig::default());
    assert_eq!(config.name_config, None);
    assert_eq!(
        config.generation("generation_1").copy_back.patterns(),
        vec!["*.parquet", "*.yaml", "*.txt"]
    );
    assert!(!config.preflight_checks());
}

#[test]
pub fn backends_by_generation_then_file_name() {
    let source = r#"
container_image: /cvmfs/images/study
backends:
  generation_1:
    submission_type: local
  gen_2.py:
    submission_type: htc_docker
    context: cupy
    htc_flavor: workday
generations:
  generation_2:
    cleanup_command: rm -f big.parquet
    copy_back:
      json: true
"#;
    let config = serde_yaml::from_str::<SubmitConfig>(source).unwrap();

    assert_eq!(
        config.backend_for("generation_1", "gen_1.sh"),
        Some(&BackendConfig::new(SubmissionType::Local))
    );
    assert_eq!(
        config.backend_for("generation_2", "gen_2.py"),
        Some(&BackendConfig {
            submission_type: SubmissionType::HtcDocker,
            context: Context::Cupy,
            htc_flavor: Some(HtcFlavor::Workday),
            interpreter: None,
        })
    );
    assert_eq!(config.backend_for("generation_3", "gen_3.sh"), None);

    let generation_2 = config.generation("generation_2");
    assert_eq!(
        generation_2.cleanup_command.as_deref(),
        Some("rm -f big.parquet")
    );
    assert_eq!(
        generation_2.copy_back,
        CopyBack {
            json: true,
            ..CopyBack::default()
        }
    );
    assert!(!config.preflight_checks());
}

#[test]
pub fn containers_need_an_image() {
    let mut config = SubmitConfig::default();
    config.backends.insert(
        "generation_1".to_string(),
        BackendConfig::new(SubmissionType::SlurmDocker),
    );
    assert!(config.preflight_checks());

    config.container_image = Some("/images/study.sif".into());
    assert!(!config.preflight_checks());

    config.threads = Some(0);
    assert!(config.preflight_checks());
}

#[test]
pub fn submission_type_names() {
    for submission_type in SubmissionType::ALL {
        assert_eq!(
            submission_type.to_string().parse::<SubmissionType>(),
            Ok(submission_type)
        );
    }
    assert!("condor".parse::<SubmissionType>().is_err());
}
