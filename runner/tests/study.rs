use genscan::{
    builder::{create_study, BuildError, BuildOptions},
    config::{BackendConfig, SubmitConfig},
    coordinator::{ConfiguredBackends, Coordinator, SubmitPolicy},
    executors::SubmissionType,
    sync::locking::{LockError, ManifestLock},
    tree::{NodeStatus, StudyStatus, Tree, MANIFEST_NAME},
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::{Duration, SystemTime},
};

const GENERATION_1: &str = "#!/bin/bash\necho 'parameters = {{ parameters }}' > generation_1.txt\n";
const GENERATION_2: &str = "#!/bin/bash\ncat {{ main_configuration }} > seen.yaml\necho {{ x }} > result.txt\n";

fn scan(xs: &str) -> String {
    format!(
        r#"
name: demo
dependencies:
  main_configuration: base.yaml
structure:
  generation_1:
    executable: gen_1.sh
  generation_2:
    executable: gen_2.sh
    scans:
      x:
        list: {xs}
"#
    )
}

struct Study {
    dir: tempfile::TempDir,
}

impl Study {
    fn new(scan_source: &str, generation_1: &str, generation_2: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("scan.yaml"), scan_source).unwrap();
        fs::write(dir.path().join("base.yaml"), "x: 0\nbeam: lhcb1\n").unwrap();
        fs::write(dir.path().join("gen_1.sh"), generation_1).unwrap();
        fs::write(dir.path().join("gen_2.sh"), generation_2).unwrap();
        Self { dir }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn manifest(&self) -> PathBuf {
        self.path("demo").join(MANIFEST_NAME)
    }

    fn create(&self) -> Result<Tree, BuildError> {
        create_study(&self.path("scan.yaml"), &BuildOptions::default(), false, None)
    }

    fn rewrite_scan(&self, source: &str) {
        fs::write(self.path("scan.yaml"), source).unwrap();
    }

    fn coordinator(&self, config: SubmitConfig) -> Coordinator<ConfiguredBackends> {
        let resolver = ConfiguredBackends::new(&config);
        let policy = SubmitPolicy {
            wait: Duration::ZERO,
            ..SubmitPolicy::default()
        };
        Coordinator::new(&self.manifest(), config, resolver, policy)
    }

    fn status_of(&self, path: &str) -> NodeStatus {
        Tree::load(&self.manifest())
            .unwrap()
            .find(Path::new(path))
            .unwrap()
            .status
    }
}

// every file of a folder with its content and modification time
fn snapshot(root: &Path) -> BTreeMap<PathBuf, (Vec<u8>, SystemTime)> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(directory) = pending.pop() {
        for entry in fs::read_dir(&directory).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let modified = fs::metadata(&path).unwrap().modified().unwrap();
                files.insert(
                    path.strip_prefix(root).unwrap().to_path_buf(),
                    (fs::read(&path).unwrap(), modified),
                );
            }
        }
    }
    files
}

fn local_config() -> SubmitConfig {
    let mut config = SubmitConfig::default();
    for generation in ["generation_1", "generation_2"] {
        config.backends.insert(
            generation.to_string(),
            BackendConfig::new(SubmissionType::Local),
        );
    }
    config.threads = Some(2);
    config
}

#[test]
fn build_produces_the_expected_tree() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);

    let tree = study.create().unwrap();

    let paths = tree
        .nodes()
        .iter()
        .map(|entry| entry.node.path.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("demo/generation_1"),
            PathBuf::from("demo/generation_1/x_1"),
            PathBuf::from("demo/generation_1/x_2"),
        ]
    );
    assert!(study.path("demo/base.yaml").is_file());
    assert!(study.manifest().is_file());

    // configuration mutated, script rendered with the node values
    assert_eq!(
        fs::read_to_string(study.path("demo/generation_1/x_2/config.yaml")).unwrap(),
        "x: 2\nbeam: lhcb1\n"
    );
    assert_eq!(
        fs::read_to_string(study.path("demo/generation_1/x_2/generation_2.sh")).unwrap(),
        "#!/bin/bash\ncat config.yaml > seen.yaml\necho 2 > result.txt\n"
    );
    assert_eq!(
        fs::read_to_string(study.path("demo/generation_1/generation_1.sh")).unwrap(),
        "#!/bin/bash\necho 'parameters = {}' > generation_1.txt\n"
    );

    let reloaded = Tree::load(&study.manifest()).unwrap();
    assert_eq!(reloaded, tree);
    assert!(reloaded
        .nodes()
        .iter()
        .all(|entry| entry.node.status == NodeStatus::NotSubmitted));
}

#[test]
fn local_study_finishes_in_two_cycles() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    let mut coordinator = study.coordinator(local_config());

    let first = coordinator.cycle().unwrap();
    assert_eq!(first.generation(1).unwrap().finished, 1);
    assert_eq!(first.generation(1).unwrap().submitted_now, 1);
    assert_eq!(first.generation(2).unwrap().waiting, 2);
    assert_eq!(first.status, StudyStatus::ToFinish);

    let second = coordinator.cycle().unwrap();
    assert_eq!(second.generation(2).unwrap().finished, 2);
    assert_eq!(second.generation(2).unwrap().submitted_now, 2);
    assert!(second.failed.is_empty());
    assert!(second.blocked.is_empty());
    assert_eq!(second.status, StudyStatus::Finished);

    assert_eq!(
        fs::read_to_string(study.path("demo/generation_1/x_1/result.txt")).unwrap(),
        "1\n"
    );
    assert_eq!(
        fs::read_to_string(study.path("demo/generation_1/x_1/seen.yaml")).unwrap(),
        "x: 1\nbeam: lhcb1\n"
    );
    assert!(study.path("demo/generation_1/x_1/.finished").is_file());
    assert!(study.path("demo/generation_1/x_1/run.sh").is_file());

    let tree = Tree::load(&study.manifest()).unwrap();
    assert!(tree.metadata.configured);
    assert_eq!(tree.metadata.status, StudyStatus::Finished);
    let node = tree.find(Path::new("demo/generation_1/x_2")).unwrap();
    assert_eq!(node.submission.submission_type, Some(SubmissionType::Local));
    assert_eq!(
        node.submission.path_run,
        Some(study.path("demo/generation_1/x_2/run.sh"))
    );

    // a finished study is left alone
    let third = coordinator.cycle().unwrap();
    assert_eq!(third.generation(2).unwrap().submitted_now, 0);
}

#[test]
fn submit_keeps_cycling_until_done() {
    let study = Study::new(&scan("[1, 2, 3]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    let config = local_config();
    let resolver = ConfiguredBackends::new(&config);
    let policy = SubmitPolicy {
        keep_submit_until_done: true,
        wait: Duration::ZERO,
        max_cycles: Some(5),
        ..SubmitPolicy::default()
    };

    let summary = Coordinator::new(&study.manifest(), config, resolver, policy)
        .submit()
        .unwrap();

    assert_eq!(summary.status, StudyStatus::Finished);
    assert_eq!(summary.generation(2).unwrap().finished, 3);
    // the lock is released once done
    assert!(!study.path("demo/tree.yaml.lock").exists());
}

#[test]
fn failures_block_descendants_only() {
    let source = r#"
name: demo
structure:
  generation_1:
    executable: gen_1.sh
    scans:
      seed:
        list: [1, 2]
  generation_2:
    executable: gen_2.sh
"#;
    let study = Study::new(
        source,
        "#!/bin/bash\nexit $(( {{ seed }} - 1 ))\n",
        "#!/bin/bash\ntouch done\n",
    );
    study.create().unwrap();
    let mut coordinator = study.coordinator(local_config());

    let first = coordinator.cycle().unwrap();
    assert_eq!(first.failed, vec![PathBuf::from("demo/seed_2")]);
    assert_eq!(
        first.blocked,
        vec![PathBuf::from("demo/seed_2/generation_2")]
    );

    let second = coordinator.cycle().unwrap();
    assert_eq!(second.status, StudyStatus::FinishedWithIssues);
    assert_eq!(
        study.status_of("demo/seed_1/generation_2"),
        NodeStatus::Finished
    );
    assert_eq!(
        study.status_of("demo/seed_2/generation_2"),
        NodeStatus::OnHoldBlocked
    );
    assert!(!study.path("demo/seed_2/generation_2/done").exists());
}

#[test]
fn children_wait_for_their_parent() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();

    // only the first generation has a backend, the study can't be configured
    let mut config = SubmitConfig::default();
    config.backends.insert(
        "generation_1".to_string(),
        BackendConfig::new(SubmissionType::Local),
    );
    assert!(study.coordinator(config).cycle().is_err());
    assert_eq!(
        study.status_of("demo/generation_1"),
        NodeStatus::NotSubmitted
    );

    // the parent never finishes, its children are never dispatched
    let study = Study::new(&scan("[1, 2]"), "#!/bin/bash\nexit 1\n", GENERATION_2);
    study.create().unwrap();
    let mut coordinator = study.coordinator(local_config());
    coordinator.cycle().unwrap();
    let summary = coordinator.cycle().unwrap();

    assert_eq!(summary.generation(2).unwrap().on_hold_blocked, 2);
    assert!(!study.path("demo/generation_1/x_1/run.sh").exists());
}

#[test]
fn timed_out_jobs_fail() {
    let study = Study::new(&scan("[1]"), "#!/bin/bash\nsleep 30\n", GENERATION_2);
    study.create().unwrap();
    let mut config = local_config();
    config.local_timeout = Some(1);

    let summary = study.coordinator(config).cycle().unwrap();

    assert_eq!(summary.failed, vec![PathBuf::from("demo/generation_1")]);
    assert!(study.path("demo/generation_1/.failed").is_file());
}

#[test]
fn rebuild_is_idempotent_and_keeps_statuses() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    study.coordinator(local_config()).cycle().unwrap();
    let before = Tree::load(&study.manifest()).unwrap();
    let files = snapshot(&study.path("demo/generation_1"));
    assert!(files.contains_key(Path::new("x_1/generation_2.sh")));
    assert!(files.contains_key(Path::new("x_1/config.yaml")));

    let rebuilt = study.create().unwrap();

    assert_eq!(rebuilt, before);
    assert_eq!(
        study.status_of("demo/generation_1"),
        NodeStatus::Finished
    );
    // materialized files are left untouched, content and mtime alike
    assert_eq!(snapshot(&study.path("demo/generation_1")), files);

    // manifest aside, two builds of the same scan write identical nodes
    let other = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    other.create().unwrap();
    let fresh = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    fresh.create().unwrap();
    let contents = |study: &Study| {
        snapshot(&study.path("demo"))
            .into_iter()
            .filter(|(path, _)| path != Path::new(MANIFEST_NAME))
            .map(|(path, (content, _))| (path, content))
            .collect::<BTreeMap<_, _>>()
    };
    assert_eq!(contents(&other), contents(&fresh));
}

#[test]
fn extended_scan_adds_missing_nodes() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    study.coordinator(local_config()).cycle().unwrap();

    study.rewrite_scan(&scan("[1, 2, 3]"));
    let tree = study.create().unwrap();

    assert_eq!(tree.nodes().len(), 4);
    assert!(study.path("demo/generation_1/x_3/generation_2.sh").is_file());
    assert_eq!(
        study.status_of("demo/generation_1"),
        NodeStatus::Finished
    );
    assert_eq!(
        study.status_of("demo/generation_1/x_3"),
        NodeStatus::NotSubmitted
    );
}

#[test]
fn shrunk_scan_is_a_stale_tree() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();

    study.rewrite_scan(&scan("[1]"));
    match study.create() {
        Err(BuildError::StaleTree { paths }) => {
            assert_eq!(paths, vec![PathBuf::from("demo/generation_1/x_2")]);
        }
        other => panic!("expected a stale tree, got {other:?}"),
    }
    // nothing was touched
    assert!(study.path("demo/generation_1/x_2").is_dir());

    let options = BuildOptions {
        force_overwrite: true,
        ..BuildOptions::default()
    };
    let tree = create_study(&study.path("scan.yaml"), &options, false, None).unwrap();
    assert_eq!(tree.nodes().len(), 2);
    assert!(!study.path("demo/generation_1/x_2").exists());
}

#[test]
fn lost_manifest_adopts_existing_nodes() {
    let study = Study::new(&scan("[1, 2, 3]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    study.coordinator(local_config()).cycle().unwrap();
    fs::write(study.path("demo/generation_1/x_1/.failed"), "").unwrap();
    fs::remove_file(study.manifest()).unwrap();
    fs::remove_dir_all(study.path("demo/generation_1/x_2")).unwrap();

    let tree = study.create().unwrap();

    assert_eq!(tree.nodes().len(), 4);
    assert!(study.path("demo/generation_1/x_2/config.yaml").is_file());
    // sentinels left by earlier runs are trusted
    assert_eq!(
        study.status_of("demo/generation_1"),
        NodeStatus::Finished
    );
    assert_eq!(
        study.status_of("demo/generation_1/x_1"),
        NodeStatus::Failed
    );
    assert_eq!(
        study.status_of("demo/generation_1/x_2"),
        NodeStatus::NotSubmitted
    );
    assert_eq!(
        study.status_of("demo/generation_1/x_3"),
        NodeStatus::NotSubmitted
    );
}

#[test]
fn build_waits_for_the_manifest_lock() {
    let study = Study::new(&scan("[1]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    let manifest = fs::read_to_string(study.manifest()).unwrap();
    let lock = ManifestLock::acquire(&study.manifest()).unwrap();

    study.rewrite_scan(&scan("[1, 2]"));
    assert!(matches!(
        study.create(),
        Err(BuildError::Lock(LockError::Held { .. }))
    ));
    assert_eq!(fs::read_to_string(study.manifest()).unwrap(), manifest);
    assert!(!study.path("demo/generation_1/x_2").exists());

    drop(lock);
    assert_eq!(study.create().unwrap().nodes().len(), 3);
    assert!(!study.path("demo/tree.yaml.lock").exists());
}

#[test]
fn force_overwrite_keeps_the_lock_of_the_build() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    fs::write(study.path("demo/generation_1/stray.txt"), "").unwrap();

    let options = BuildOptions {
        force_overwrite: true,
        ..BuildOptions::default()
    };
    create_study(&study.path("scan.yaml"), &options, false, None).unwrap();

    assert!(!study.path("demo/generation_1/stray.txt").exists());
    assert!(study.manifest().is_file());
    assert!(!study.path("demo/tree.yaml.lock").exists());
}

#[test]
fn colliding_dependencies_are_rejected() {
    let source = r#"
name: demo
dependencies:
  main_configuration: base.yaml
  optics: optics/base.yaml
structure:
  generation_1:
    executable: gen_1.sh
"#;
    let study = Study::new(source, GENERATION_1, GENERATION_2);
    fs::create_dir(study.path("optics")).unwrap();
    fs::write(study.path("optics/base.yaml"), "k1: 0.1\n").unwrap();

    match study.create() {
        Err(BuildError::DependencyCollision { file_name, keys }) => {
            assert_eq!(file_name, "base.yaml");
            assert_eq!(keys, vec!["main_configuration", "optics"]);
        }
        other => panic!("expected a dependency collision, got {other:?}"),
    }
    assert!(!study.path("demo").exists());
}

#[test]
fn configuration_name_is_recorded() {
    let study = Study::new(&scan("[1]"), GENERATION_1, GENERATION_2);
    let options = BuildOptions {
        name_config: "job.yaml".to_string(),
        ..BuildOptions::default()
    };

    let tree = create_study(&study.path("scan.yaml"), &options, false, None).unwrap();

    assert_eq!(tree.metadata.name_config.as_deref(), Some("job.yaml"));
    assert!(study.path("demo/generation_1/x_1/job.yaml").is_file());
    assert_eq!(
        Tree::load(&study.manifest()).unwrap().metadata.name_config.as_deref(),
        Some("job.yaml")
    );
}

#[test]
fn untrackable_cluster_job_is_submitted_again() {
    let study = Study::new(&scan("[1]"), GENERATION_1, GENERATION_2);
    let mut tree = study.create().unwrap();
    {
        let node = tree.find_mut(Path::new("demo/generation_1")).unwrap();
        node.status = NodeStatus::QueuedOrRunning;
        node.submission.submission_type = Some(SubmissionType::Slurm);
        node.submission.job_id = None;
    }
    tree.save().unwrap();

    let summary = study.coordinator(local_config()).status().unwrap();

    assert_eq!(summary.generation(1).unwrap().waiting, 1);
    assert_eq!(
        study.status_of("demo/generation_1"),
        NodeStatus::NotSubmitted
    );
}

#[test]
fn logs_stay_out_of_the_summary() {
    let study = Study::new(&scan("[1]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_genscan"))
        .arg("status")
        .arg(study.manifest())
        .env("RUST_LOG", "debug")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("generation"), "{stdout}");
    assert!(!stdout.contains("Loaded manifest"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Loaded manifest"));
}

#[test]
fn single_study_rejects_scans() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);

    assert!(matches!(
        create_study(&study.path("scan.yaml"), &BuildOptions::default(), true, None),
        Err(BuildError::NotSingle(name)) if name == "generation_2"
    ));
}

#[test]
fn overrides_replace_scans() {
    let study = Study::new(&scan("[1, 2]"), GENERATION_1, GENERATION_2);
    fs::write(
        study.path("overrides.yaml"),
        "generation_2:\n  x:\n    list: [7]\n",
    )
    .unwrap();
    let output = study.path("out");

    let tree = create_study(
        &study.path("scan.yaml"),
        &BuildOptions {
            output_dir: Some(output.clone()),
            ..BuildOptions::default()
        },
        false,
        Some(&study.path("overrides.yaml")),
    )
    .unwrap();

    assert_eq!(tree.metadata.absolute_path, output);
    assert!(output.join("demo/generation_1/x_7/config.yaml").is_file());
    assert!(!study.path("demo").exists());
}

#[test]
fn invalid_scan_builds_nothing() {
    let study = Study::new(
        "name: demo\nstructure:\n  generation_1:\n    executable: gen_1.sh\n    scans:\n      x:\n        list: [1]\n        linspace: [0, 1, 2]\n",
        GENERATION_1,
        GENERATION_2,
    );

    assert!(study.create().is_err());
    assert!(!study.path("demo").exists());
}

#[test]
fn manifest_lock_is_exclusive() {
    let study = Study::new(&scan("[1]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();

    let lock = ManifestLock::acquire(&study.manifest()).unwrap();
    assert!(matches!(
        ManifestLock::acquire(&study.manifest()),
        Err(LockError::Held { .. })
    ));
    let config = local_config();
    let resolver = ConfiguredBackends::new(&config);
    assert!(Coordinator::new(&study.manifest(), config, resolver, SubmitPolicy::default())
        .submit()
        .is_err());

    // status still reports the persisted state
    let config = local_config();
    let resolver = ConfiguredBackends::new(&config);
    let summary = Coordinator::new(&study.manifest(), config, resolver, SubmitPolicy::default())
        .status()
        .unwrap();
    assert_eq!(summary.generation(1).unwrap().waiting, 1);

    drop(lock);
    assert!(ManifestLock::acquire(&study.manifest()).is_ok());
}

#[test]
fn stale_lock_is_reclaimed() {
    let study = Study::new(&scan("[1]"), GENERATION_1, GENERATION_2);
    study.create().unwrap();
    let hostname = nix::unistd::gethostname().unwrap();
    // pid far above any default pid_max
    fs::write(
        study.path("demo/tree.yaml.lock"),
        format!("{}:2147483646", hostname.to_string_lossy()),
    )
    .unwrap();

    let lock = ManifestLock::acquire(&study.manifest()).unwrap();
    assert_eq!(lock.path(), study.path("demo/tree.yaml.lock"));
}
