use crate::{
    executors::{Context, HtcFlavor, SubmissionType},
    expansion::{ExpansionError, GenerationPlan},
    expression::{Expression, Scalar},
    naming::{self, NamingError},
    tree::RESERVED_KEYS,
};
use itertools::Itertools;
use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

/// key of the dependency holding the main configuration of the study
pub const MAIN_CONFIGURATION: &str = "main_configuration";
pub const DEFAULT_NAME_CONFIG: &str = "config.yaml";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Invalid configuration {0}, see the problems reported above")]
    InvalidSpec(PathBuf),
    #[error("Variable '{variable}' of generation '{generation}': {message}")]
    InvalidVariable {
        generation: String,
        variable: String,
        message: String,
    },
    #[error("Override targets unknown generation '{0}'")]
    UnknownGeneration(String),
    #[error(transparent)]
    Expansion(#[from] ExpansionError),
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error("No backend configured for generation '{0}' and no interactive prompt is attached")]
    UnresolvedBackend(String),
}

/// Mapping that keeps the declaration order of the yaml source.
///
/// Generation and variable order is significant (dependency chain, grouping and
/// naming), which a `BTreeMap` would lose.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedMap<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: T) {
        let key = key.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.0.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> FromIterator<(String, T)> for OrderedMap<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        let mut map = Self::new();
        iter.into_iter()
            .for_each(|(key, value)| map.insert(key, value));
        map
    }
}

impl<T: Serialize> Serialize for OrderedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct OrderedMapVisitor<T>(PhantomData<T>);

impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
    type Value = OrderedMap<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a mapping")
    }

    // `null` (an empty yaml block) is treated as an empty mapping
    fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
        Ok(OrderedMap::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, T)> = Vec::new();
        while let Some((key, value)) = access.next_entry::<String, T>()? {
            if entries.iter().any(|(existing, _)| *existing == key) {
                return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
            }
            entries.push((key, value));
        }
        Ok(OrderedMap(entries))
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}

/// Declarative description of a whole study
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScanSpec {
    // name of the study, also the name of the study folder
    pub name: String,
    // files staged at the study root, relative to the scan file
    #[serde(default)]
    pub dependencies: OrderedMap<PathBuf>,
    // generations in dependency order
    pub structure: OrderedMap<GenerationSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GenerationSpec {
    // template of the generation script, relative to the scan file
    pub executable: PathBuf,
    #[serde(default)]
    pub common_parameters: OrderedMap<serde_yaml::Value>,
    #[serde(default)]
    pub scans: OrderedMap<VariableSpec>,
}

impl GenerationSpec {
    /// Common parameters that can be used by expressions (scalars only)
    pub fn scalar_common_parameters(&self) -> impl Iterator<Item = (&String, Scalar)> {
        self.common_parameters
            .iter()
            .filter_map(|(key, value)| Scalar::from_yaml(value).map(|scalar| (key, scalar)))
    }
}

/// Count of a `path_list`, either given directly or read from a common parameter
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PathCount {
    Count(usize),
    Parameter(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

/// A scanned or derived variable, exactly one of the value sources must be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VariableSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<Scalar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linspace: Option<(f64, f64, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logspace: Option<(f64, f64, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_list: Option<(String, PathCount)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subvariables: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concomitant: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Resolved value source of a [`VariableSpec`]
#[derive(Clone, Debug, PartialEq)]
pub enum VariableKind {
    List(Vec<Scalar>),
    Linspace { start: f64, stop: f64, count: usize },
    Logspace { start: f64, stop: f64, count: usize },
    PathPattern { pattern: String, count: PathCount },
    Derived(Expression),
}

impl VariableSpec {
    pub fn list(values: Vec<Scalar>) -> Self {
        Self {
            list: Some(values),
            ..Self::default()
        }
    }

    pub fn linspace(start: f64, stop: f64, count: usize) -> Self {
        Self {
            linspace: Some((start, stop, count)),
            ..Self::default()
        }
    }

    pub fn derived(expression: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            ..Self::default()
        }
    }

    pub fn with_concomitant(mut self, others: &[&str]) -> Self {
        self.concomitant = Some(OneOrMany::Many(
            others.iter().map(|other| other.to_string()).collect(),
        ));
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_subvariables(mut self, keys: &[&str]) -> Self {
        self.subvariables = Some(keys.iter().map(|key| key.to_string()).collect());
        self
    }

    pub fn concomitant_with(&self) -> Vec<String> {
        self.concomitant
            .as_ref()
            .map(OneOrMany::to_vec)
            .unwrap_or_default()
    }

    pub fn kind(&self) -> Result<VariableKind, String> {
        let declared = [
            self.list.is_some(),
            self.linspace.is_some(),
            self.logspace.is_some(),
            self.path_list.is_some(),
            self.expression.is_some(),
        ]
        .into_iter()
        .filter(|declared| *declared)
        .count();

        if declared != 1 {
            return Err(format!(
                "exactly one of list, linspace, logspace, path_list or expression must be set ({declared} found)"
            ));
        }

        if let Some(values) = &self.list {
            Ok(VariableKind::List(values.clone()))
        } else if let Some((start, stop, count)) = self.linspace {
            Ok(VariableKind::Linspace { start, stop, count })
        } else if let Some((start, stop, count)) = self.logspace {
            Ok(VariableKind::Logspace { start, stop, count })
        } else if let Some((pattern, count)) = &self.path_list {
            Ok(VariableKind::PathPattern {
                pattern: pattern.clone(),
                count: count.clone(),
            })
        } else {
            let source = self.expression.as_deref().unwrap_or_default();
            Expression::parse(source)
                .map(VariableKind::Derived)
                .map_err(|error| error.to_string())
        }
    }
}

impl ScanSpec {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigErrors::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Replace the scans of whole generations, e.g. with programmatically built lists
    pub fn apply_overrides(
        &mut self,
        overrides: &BTreeMap<String, OrderedMap<VariableSpec>>,
    ) -> Result<(), ConfigErrors> {
        for (generation, scans) in overrides {
            match self
                .structure
                .0
                .iter_mut()
                .find(|(name, _)| name == generation)
            {
                Some((_, spec)) => spec.scans = scans.clone(),
                None => return Err(ConfigErrors::UnknownGeneration(generation.clone())),
            }
        }

        Ok(())
    }

    /// Path of the main configuration, if the study declares one
    pub fn main_configuration(&self) -> Option<&PathBuf> {
        self.dependencies.get(MAIN_CONFIGURATION)
    }

    /// Compile the expansion plans of every generation, in order
    pub fn plans(&self) -> Result<Vec<GenerationPlan>, ConfigErrors> {
        self.structure
            .iter()
            .map(|(name, generation)| {
                GenerationPlan::compile(name, &generation.scans).map_err(ConfigErrors::from)
            })
            .collect()
    }

    /// Validate the whole scan declaration, returns `true` if it contains errors
    ///
    /// Every problem is reported through tracing before returning so all of them
    /// can be fixed at once.
    pub fn preflight_checks(&self, base_dir: &Path) -> bool {
        let mut contains_error = false;

        if let Err(error) = naming::validate_segment(&self.name) {
            error!("name '{}' can't be used as a study folder: {error}", self.name);
            contains_error = true;
        }

        if self.structure.is_empty() {
            error!("structure contains no generation, unable to build a tree");
            contains_error = true;
        }

        for (name, path) in self.dependencies.iter() {
            if !base_dir.join(path).is_file() {
                error!(
                    "dependencies.{name} was not found at {}",
                    base_dir.join(path).to_string_lossy()
                );
                contains_error = true;
            }
        }

        for (generation, spec) in self.structure.iter() {
            if let Err(error) = naming::validate_segment(generation) {
                error!("generation name '{generation}' is not usable as a folder: {error}");
                contains_error = true;
            }
            if RESERVED_KEYS.contains(&generation.as_str()) {
                error!("generation name '{generation}' is reserved by the tree manifest");
                contains_error = true;
            }

            let executable = base_dir.join(&spec.executable);
            if !executable.is_file() {
                error!(
                    "Failed to find structure.{generation}.executable. Either not a file or not found at {}",
                    executable.to_string_lossy()
                );
                contains_error = true;
            }

            if spec
                .common_parameters
                .keys()
                .any(|key| spec.scans.contains_key(key))
            {
                warn!("structure.{generation} declares the same key in common_parameters and scans, the scanned value wins");
            }

            for (variable, declaration) in spec.scans.iter() {
                if let Err(error) = naming::validate_variable_name(variable) {
                    error!("structure.{generation}.scans.{variable}: {error}");
                    contains_error = true;
                }

                if let Err(message) = declaration.kind() {
                    error!("structure.{generation}.scans.{variable}: {message}");
                    contains_error = true;
                }

                if let Some(condition) = &declaration.condition {
                    if let Err(error) = Expression::parse(condition) {
                        error!("structure.{generation}.scans.{variable}.condition: {error}");
                        contains_error = true;
                    }
                }

                if let Some(keys) = &declaration.subvariables {
                    if keys.is_empty() || keys.iter().duplicates().next().is_some() {
                        error!("structure.{generation}.scans.{variable}.subvariables must be a non-empty list of distinct keys");
                        contains_error = true;
                    }
                }

                match (declaration.linspace, declaration.logspace) {
                    (Some((_, _, 0)), _) | (_, Some((_, _, 0))) => {
                        warn!("structure.{generation}.scans.{variable} spans zero values, no job will be generated below it");
                    }
                    _ => {}
                }
            }
        }

        // structural errors (unknown concomitant variables, cycles) are only worth
        // checking once every declaration parses
        if !contains_error {
            if let Err(error) = self.plans() {
                error!("{error}");
                contains_error = true;
            }
        }

        contains_error
    }
}

/// How a job of a generation is submitted
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub submission_type: SubmissionType,
    #[serde(default)]
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub htc_flavor: Option<HtcFlavor>,
    // command used to run the generation script, inferred from its extension otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl BackendConfig {
    pub fn new(submission_type: SubmissionType) -> Self {
        Self {
            submission_type,
            context: Context::default(),
            htc_flavor: submission_type.is_htc().then(HtcFlavor::default),
            interpreter: None,
        }
    }
}

/// Files copied back from the scratch directory of HTCondor jobs
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CopyBack {
    pub parquet: bool,
    pub yaml: bool,
    pub txt: bool,
    pub json: bool,
    pub zip: bool,
    pub all: bool,
}

impl Default for CopyBack {
    fn default() -> Self {
        Self {
            parquet: true,
            yaml: true,
            txt: true,
            json: false,
            zip: false,
            all: false,
        }
    }
}

impl CopyBack {
    pub fn patterns(&self) -> Vec<&'static str> {
        [
            (self.parquet, "*.parquet"),
            (self.yaml, "*.yaml"),
            (self.txt, "*.txt"),
            (self.json, "*.json"),
            (self.zip, "*.zip"),
            (self.all, "*"),
        ]
        .into_iter()
        .filter_map(|(enabled, pattern)| enabled.then_some(pattern))
        .collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenerationSubmitConfig {
    // appended to the run file, executed after the job on the worker
    #[serde(default)]
    pub additional_command: Option<String>,
    // configuration keys holding relative paths, made absolute for HTCondor jobs
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub copy_back: CopyBack,
    // executed by the coordinator in the job folder once the job is seen finished
    #[serde(default)]
    pub cleanup_command: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubmitConfig {
    #[serde(default)]
    pub python_environment: Option<PathBuf>,
    #[serde(default)]
    pub python_environment_container: Option<PathBuf>,
    #[serde(default)]
    pub container_image: Option<PathBuf>,
    // defaults to the name recorded in the manifest at build time
    #[serde(default)]
    pub name_config: Option<String>,
    // size of the local worker pool, defaults to the number of cpus
    #[serde(default)]
    pub threads: Option<usize>,
    // seconds before a local job is killed
    #[serde(default)]
    pub local_timeout: Option<u64>,
    // keyed by generation name or executable file name
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub generations: BTreeMap<String, GenerationSubmitConfig>,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            python_environment: None,
            python_environment_container: None,
            container_image: None,
            name_config: None,
            threads: None,
            local_timeout: None,
            backends: BTreeMap::new(),
            generations: BTreeMap::new(),
        }
    }
}

impl SubmitConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigErrors::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&content).map_err(|source| ConfigErrors::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn backend_for(&self, generation: &str, executable: &str) -> Option<&BackendConfig> {
        self.backends
            .get(generation)
            .or_else(|| self.backends.get(executable))
    }

    pub fn generation(&self, generation: &str) -> GenerationSubmitConfig {
        self.generations
            .get(generation)
            .cloned()
            .unwrap_or_default()
    }

    /// Check the submission settings, returns `true` if it contains errors
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        let containerized = self
            .backends
            .iter()
            .filter(|(_, backend)| backend.submission_type.is_containerized())
            .map(|(name, _)| name)
            .collect::<BTreeSet<_>>();

        if !containerized.is_empty() && self.container_image.is_none() {
            error!(
                "backends {} use a container but container_image is not set",
                containerized.iter().join(", ")
            );
            contains_error = true;
        }

        for (name, backend) in self.backends.iter() {
            if backend.htc_flavor.is_some() && !backend.submission_type.is_htc() {
                warn!("backends.{name}.htc_flavor is ignored for {} jobs", backend.submission_type);
            }
        }

        if self.threads == Some(0) {
            error!("threads must be at least 1");
            contains_error = true;
        }

        if let Some(name_config) = &self.name_config {
            if let Err(error) = naming::validate_segment(name_config) {
                error!("name_config '{}' must be a plain file name: {error}", name_config);
                contains_error = true;
            }
        }

        contains_error
    }
}
