//! Deterministic folder names for job nodes.
//!
//! A node folder is named after the variables scanned at its generation, one
//! `<variable>_<value>` fragment per variable joined with `_`. Values are rendered
//! with the canonical [`Scalar`] formatting so a rebuild always yields the same
//! names.
use crate::expansion::Binding;
use crate::expression::Scalar;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NamingError {
    #[error("Value '{value}' of '{variable}' can't be part of a folder name: {reason}")]
    InvalidName {
        variable: String,
        value: String,
        reason: &'static str,
    },
    #[error("Two nodes would share the folder {0}")]
    Collision(String),
}

fn allowed(character: char) -> bool {
    character.is_ascii_alphanumeric() || matches!(character, '_' | '-' | '.' | '+')
}

fn check(variable: &str, value: &str) -> Result<(), NamingError> {
    let invalid = |reason| NamingError::InvalidName {
        variable: variable.to_string(),
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        Err(invalid("empty"))
    } else if value == "." || value == ".." {
        Err(invalid("relative path component"))
    } else if value.starts_with('.') {
        Err(invalid("hidden folder"))
    } else if !value.chars().all(allowed) {
        Err(invalid("only ascii letters, digits and _ - . + are allowed"))
    } else {
        Ok(())
    }
}

/// Check that a value can be used verbatim as a single path segment
pub fn validate_segment(segment: &str) -> Result<(), NamingError> {
    check(segment, segment)
}

pub fn validate_variable_name(variable: &str) -> Result<(), NamingError> {
    check(variable, variable)
}

/// Render the naming label of a value
pub fn label(value: &Scalar) -> String {
    value.to_string()
}

/// Folder fragment of one variable, `None` for common parameters which never
/// split the tree.
pub fn name_for(
    variable: &str,
    value: &Scalar,
    is_common_parameter: bool,
) -> Result<Option<String>, NamingError> {
    if is_common_parameter {
        return Ok(None);
    }
    fragment(variable, &label(value)).map(Some)
}

/// Folder fragment of one variable given its already rendered label
pub fn fragment(variable: &str, label: &str) -> Result<String, NamingError> {
    check(variable, variable)?;
    check(variable, label)?;
    Ok(format!("{variable}_{label}"))
}

/// Folder name of a node, generations without scanned variables are named after
/// the generation itself.
pub fn segment_for(generation: &str, binding: &Binding) -> Result<String, NamingError> {
    if binding.is_empty() {
        validate_segment(generation)?;
        return Ok(generation.to_string());
    }

    let fragments = binding
        .iter()
        .map(|bound| fragment(&bound.name, &bound.label))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(fragments.join("_"))
}
