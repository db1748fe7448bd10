use minijinja::{Environment, UndefinedBehavior};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Placeholder receiving the literal mapping of all parameters of a node
pub const PARAMETERS_PLACEHOLDER: &str = "parameters";
/// Placeholder receiving the path of the node configuration
pub const CONFIGURATION_PLACEHOLDER: &str = "main_configuration";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to render template {name}: {source}")]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

/// Generation script with `{{ placeholder }}` substitutions
#[derive(Debug, Clone)]
pub struct ScriptTemplate {
    name: String,
    source: String,
}

/// Render a value as an inline literal, e.g. `{'qx': 62.31, 'beam': 'lhcb1'}`
pub fn literal(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => "None".to_string(),
        serde_yaml::Value::Bool(true) => "True".to_string(),
        serde_yaml::Value::Bool(false) => "False".to_string(),
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::String(text) => {
            format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
        }
        serde_yaml::Value::Sequence(sequence) => format!(
            "[{}]",
            sequence.iter().map(literal).collect::<Vec<_>>().join(", ")
        ),
        serde_yaml::Value::Mapping(mapping) => format!(
            "{{{}}}",
            mapping
                .iter()
                .map(|(key, value)| format!("{}: {}", literal(key), literal(value)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        serde_yaml::Value::Tagged(tagged) => literal(&tagged.value),
    }
}

impl ScriptTemplate {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            name: path.to_string_lossy().into_owned(),
            source,
        })
    }

    pub fn from_source(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Extension of the template file, reused for the rendered generation scripts
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.name)
            .extension()
            .and_then(|extension| extension.to_str())
    }

    /// Substitute the placeholders, any unknown placeholder is an error.
    ///
    /// Each parameter is available under its own name, dependencies under their
    /// dependency key (as a path relative to the node folder).
    pub fn render(
        &self,
        parameters: &serde_yaml::Mapping,
        main_configuration: Option<&str>,
        dependencies: &BTreeMap<String, String>,
    ) -> Result<String, TemplateError> {
        let mut context: BTreeMap<String, minijinja::Value> = BTreeMap::new();

        for (key, value) in parameters {
            if let Some(key) = key.as_str() {
                context.insert(key.to_string(), minijinja::Value::from_serialize(value));
            }
        }
        for (key, path) in dependencies {
            context.insert(key.clone(), minijinja::Value::from(path.as_str()));
        }
        context.insert(
            PARAMETERS_PLACEHOLDER.to_string(),
            minijinja::Value::from_safe_string(literal(&serde_yaml::Value::Mapping(
                parameters.clone(),
            ))),
        );
        if let Some(path) = main_configuration {
            context.insert(
                CONFIGURATION_PLACEHOLDER.to_string(),
                minijinja::Value::from(path),
            );
        }

        let mut environment = Environment::new();
        environment.set_undefined_behavior(UndefinedBehavior::Strict);
        environment.set_keep_trailing_newline(true);

        environment
            .render_str(&self.source, context)
            .map_err(|source| TemplateError::Render {
                name: self.name.clone(),
                source,
            })
    }
}
