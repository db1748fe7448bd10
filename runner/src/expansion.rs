//! Turn the scan declaration of a generation into its ordered list of bindings.
//!
//! Variables linked through `concomitant` form a group and are zipped together,
//! groups are then combined with a cartesian product in declaration order. Derived
//! variables are evaluated on every combination, conditions filter the result.
use crate::{
    config::{OrderedMap, PathCount, VariableKind, VariableSpec},
    expression::{round_to, Expression, ExpressionError, Scalar},
    naming,
};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Decimals kept for linspace and logspace values
pub const RANGE_DECIMALS: i32 = 5;
/// Decimals kept for derived values
pub const DERIVED_DECIMALS: i32 = 8;
/// Placeholder replaced by the index in `path_list` patterns
pub const PATH_PLACEHOLDER: &str = "____";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpansionError {
    #[error("Generation '{generation}': concomitant variables have different lengths ({})", lengths.iter().map(|(name, len)| format!("{name}={len}")).join(", "))]
    LengthMismatch {
        generation: String,
        lengths: Vec<(String, usize)>,
    },
    #[error("Generation '{generation}': variable '{variable}' {message}")]
    InvalidVariable {
        generation: String,
        variable: String,
        message: String,
    },
    #[error("Generation '{generation}': derived variables depend on each other ({})", cycle.join(", "))]
    CyclicExpression {
        generation: String,
        cycle: Vec<String>,
    },
    #[error("Generation '{generation}': failed to evaluate '{variable}': {source}")]
    Expression {
        generation: String,
        variable: String,
        #[source]
        source: ExpressionError,
    },
}

/// Value bound to a variable for one node
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Scalar(Scalar),
    // the same value applied to several configuration sub-keys
    PerSubvariable { keys: Vec<String>, value: Scalar },
}

impl BoundValue {
    pub fn scalar(&self) -> &Scalar {
        match self {
            Self::Scalar(value) | Self::PerSubvariable { value, .. } => value,
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Self::Scalar(value) => value.to_yaml(),
            Self::PerSubvariable { keys, value } => serde_yaml::Value::Mapping(
                keys.iter()
                    .map(|key| (serde_yaml::Value::from(key.as_str()), value.to_yaml()))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundVariable {
    pub name: String,
    pub value: BoundValue,
    // rendering of the value used for the node folder name
    pub label: String,
}

/// Ordered assignment of the variables of one generation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Binding(Vec<BoundVariable>);

impl Binding {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoundVariable> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&BoundValue> {
        self.0
            .iter()
            .find(|bound| bound.name == name)
            .map(|bound| &bound.value)
    }

    /// Scalar view used as evaluation context of deeper generations
    pub fn scalars(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.0.iter().map(|bound| (&bound.name, bound.value.scalar()))
    }

    pub fn to_mapping(&self) -> serde_yaml::Mapping {
        self.0
            .iter()
            .map(|bound| (serde_yaml::Value::from(bound.name.as_str()), bound.value.to_yaml()))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Declared {
    name: String,
    kind: VariableKind,
    subvariables: Option<Vec<String>>,
    condition: Option<Expression>,
}

/// Validated expansion recipe of one generation
#[derive(Debug, Clone)]
pub struct GenerationPlan {
    generation: String,
    variables: Vec<Declared>,
    // indices of scanned variables, zipped within a group
    groups: Vec<Vec<usize>>,
    // indices of derived variables in evaluation order
    derived: Vec<usize>,
}

fn find(parents: &mut [usize], index: usize) -> usize {
    let mut root = index;
    while parents[root] != root {
        root = parents[root];
    }
    // path compression
    let mut current = index;
    while parents[current] != root {
        let next = parents[current];
        parents[current] = root;
        current = next;
    }
    root
}

impl GenerationPlan {
    pub fn compile(
        generation: &str,
        scans: &OrderedMap<VariableSpec>,
    ) -> Result<Self, ExpansionError> {
        let invalid = |variable: &str, message: String| ExpansionError::InvalidVariable {
            generation: generation.to_string(),
            variable: variable.to_string(),
            message,
        };

        let mut variables = Vec::with_capacity(scans.len());
        for (name, spec) in scans.iter() {
            let kind = spec.kind().map_err(|message| invalid(name, message))?;
            let condition = spec
                .condition
                .as_deref()
                .map(Expression::parse)
                .transpose()
                .map_err(|error| invalid(name, format!("has an invalid condition: {error}")))?;
            variables.push(Declared {
                name: name.clone(),
                kind,
                subvariables: spec.subvariables.clone(),
                condition,
            });
        }

        let index_of = |name: &str| variables.iter().position(|declared| declared.name == name);
        let is_derived = |index: usize| matches!(variables[index].kind, VariableKind::Derived(_));

        // union-find over concomitant links
        let mut parents = (0..variables.len()).collect::<Vec<_>>();
        for (index, (name, spec)) in scans.iter().enumerate() {
            let linked = spec.concomitant_with();
            if !linked.is_empty() && is_derived(index) {
                return Err(invalid(name, "is derived and can't be concomitant".into()));
            }
            for other in linked {
                let other_index = index_of(&other).ok_or_else(|| {
                    invalid(name, format!("is concomitant with unknown variable '{other}'"))
                })?;
                if other_index == index {
                    return Err(invalid(name, "is concomitant with itself".into()));
                }
                if is_derived(other_index) {
                    return Err(invalid(
                        name,
                        format!("is concomitant with derived variable '{other}'"),
                    ));
                }
                let (left, right) = (find(&mut parents, index), find(&mut parents, other_index));
                // keep the earliest declaration as representative
                parents[left.max(right)] = left.min(right);
            }
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut representatives: Vec<usize> = Vec::new();
        for index in (0..variables.len()).filter(|index| !is_derived(*index)) {
            let root = find(&mut parents, index);
            match representatives.iter().position(|existing| *existing == root) {
                Some(group) => groups[group].push(index),
                None => {
                    representatives.push(root);
                    groups.push(vec![index]);
                }
            }
        }

        let derived = Self::evaluation_order(generation, &variables)?;

        Ok(Self {
            generation: generation.to_string(),
            variables,
            groups,
            derived,
        })
    }

    // topological order of derived variables, stable with declaration order
    fn evaluation_order(
        generation: &str,
        variables: &[Declared],
    ) -> Result<Vec<usize>, ExpansionError> {
        let derived = variables
            .iter()
            .enumerate()
            .filter_map(|(index, declared)| match &declared.kind {
                VariableKind::Derived(expression) => Some((index, expression)),
                _ => None,
            })
            .collect::<Vec<_>>();

        // a self reference counts as a dependency and is reported as a cycle
        let dependencies = derived
            .iter()
            .map(|(index, expression)| {
                let references = expression.references();
                let depends_on = derived
                    .iter()
                    .filter(|(other, _)| references.contains(&variables[*other].name))
                    .map(|(other, _)| *other)
                    .collect::<BTreeSet<_>>();
                (*index, depends_on)
            })
            .collect::<BTreeMap<_, _>>();

        let mut order = Vec::with_capacity(derived.len());
        let mut remaining = derived.iter().map(|(index, _)| *index).collect::<Vec<_>>();
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|index| {
                dependencies[index]
                    .iter()
                    .all(|dependency| order.contains(dependency))
            });
            match ready {
                Some(position) => order.push(remaining.remove(position)),
                None => {
                    return Err(ExpansionError::CyclicExpression {
                        generation: generation.to_string(),
                        cycle: remaining
                            .iter()
                            .map(|index| variables[*index].name.clone())
                            .collect(),
                    })
                }
            }
        }

        Ok(order)
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Names of the variables of the generation, in declaration order
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|declared| declared.name.as_str())
    }

    fn values(
        &self,
        declared: &Declared,
        inherited: &BTreeMap<String, Scalar>,
    ) -> Result<Vec<(Scalar, String)>, ExpansionError> {
        let values = match &declared.kind {
            VariableKind::List(values) => values
                .iter()
                .map(|value| (value.clone(), naming::label(value)))
                .collect(),
            VariableKind::Linspace { start, stop, count } => linspace(*start, *stop, *count)
                .into_iter()
                .map(|value| Scalar::Float(round_to(value, RANGE_DECIMALS)))
                .map(|value| {
                    let label = naming::label(&value);
                    (value, label)
                })
                .collect(),
            VariableKind::Logspace { start, stop, count } => linspace(*start, *stop, *count)
                .into_iter()
                .map(|exponent| Scalar::Float(round_to(10f64.powf(exponent), RANGE_DECIMALS)))
                .map(|value| {
                    let label = naming::label(&value);
                    (value, label)
                })
                .collect(),
            VariableKind::PathPattern { pattern, count } => {
                let count = match count {
                    PathCount::Count(count) => *count,
                    PathCount::Parameter(parameter) => match inherited.get(parameter) {
                        Some(Scalar::Int(count)) if *count >= 0 => *count as usize,
                        Some(other) => {
                            return Err(ExpansionError::InvalidVariable {
                                generation: self.generation.clone(),
                                variable: declared.name.clone(),
                                message: format!(
                                    "needs a non-negative integer count, '{parameter}' is {other}"
                                ),
                            })
                        }
                        None => {
                            return Err(ExpansionError::Expression {
                                generation: self.generation.clone(),
                                variable: declared.name.clone(),
                                source: ExpressionError::UnresolvedReference(parameter.clone()),
                            })
                        }
                    },
                };
                (0..count)
                    .map(|index| {
                        let label = format!("{index:02}");
                        (
                            Scalar::Text(pattern.replace(PATH_PLACEHOLDER, &label)),
                            label,
                        )
                    })
                    .collect()
            }
            VariableKind::Derived(_) => Vec::new(),
        };

        Ok(values)
    }

    /// Produce the ordered bindings of the generation.
    ///
    /// `inherited` holds the values visible from the ancestors (their bindings and
    /// common parameters) plus the common parameters of this generation.
    #[instrument(skip_all, fields(generation = %self.generation))]
    pub fn expand(
        &self,
        inherited: &BTreeMap<String, Scalar>,
    ) -> Result<Vec<Binding>, ExpansionError> {
        let mut zipped: Vec<Vec<Vec<(Scalar, String)>>> = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            let columns = group
                .iter()
                .map(|index| self.values(&self.variables[*index], inherited))
                .collect::<Result<Vec<_>, _>>()?;

            if !columns.iter().map(Vec::len).all_equal() {
                return Err(ExpansionError::LengthMismatch {
                    generation: self.generation.clone(),
                    lengths: group
                        .iter()
                        .zip(&columns)
                        .map(|(index, column)| (self.variables[*index].name.clone(), column.len()))
                        .collect(),
                });
            }

            let rows = columns.first().map(Vec::len).unwrap_or_default();
            zipped.push(
                (0..rows)
                    .map(|row| columns.iter().map(|column| column[row].clone()).collect())
                    .collect(),
            );
        }

        let combinations: Vec<Vec<usize>> = if zipped.is_empty() {
            vec![Vec::new()]
        } else {
            zipped
                .iter()
                .map(|rows| 0..rows.len())
                .multi_cartesian_product()
                .collect()
        };

        let mut bindings = Vec::with_capacity(combinations.len());
        for combination in combinations {
            let mut values: Vec<Option<(Scalar, String)>> = vec![None; self.variables.len()];
            for (group, row) in combination.iter().enumerate() {
                for (member, index) in self.groups[group].iter().enumerate() {
                    values[*index] = Some(zipped[group][*row][member].clone());
                }
            }

            let mut context = inherited.clone();
            context.extend(values.iter().enumerate().filter_map(|(index, value)| {
                value
                    .as_ref()
                    .map(|(scalar, _)| (self.variables[index].name.clone(), scalar.clone()))
            }));

            for index in &self.derived {
                let declared = &self.variables[*index];
                if let VariableKind::Derived(expression) = &declared.kind {
                    let value = expression
                        .evaluate(&context)
                        .map_err(|source| ExpansionError::Expression {
                            generation: self.generation.clone(),
                            variable: declared.name.clone(),
                            source,
                        })?
                        .rounded(DERIVED_DECIMALS);
                    context.insert(declared.name.clone(), value.clone());
                    let label = naming::label(&value);
                    values[*index] = Some((value, label));
                }
            }

            let mut kept = true;
            for declared in &self.variables {
                if let Some(condition) = &declared.condition {
                    let satisfied = condition.evaluate_predicate(&context).map_err(|source| {
                        ExpansionError::Expression {
                            generation: self.generation.clone(),
                            variable: declared.name.clone(),
                            source,
                        }
                    })?;
                    if !satisfied {
                        kept = false;
                        break;
                    }
                }
            }
            if !kept {
                continue;
            }

            bindings.push(Binding(
                self.variables
                    .iter()
                    .zip(values)
                    .filter_map(|(declared, value)| {
                        value.map(|(scalar, label)| BoundVariable {
                            name: declared.name.clone(),
                            value: match &declared.subvariables {
                                Some(keys) => BoundValue::PerSubvariable {
                                    keys: keys.clone(),
                                    value: scalar,
                                },
                                None => BoundValue::Scalar(scalar),
                            },
                            label,
                        })
                    })
                    .collect(),
            ));
        }

        if bindings.is_empty() {
            warn!("no binding left after filtering, nothing will be generated below this point");
        } else {
            debug!(count = bindings.len(), "expanded");
        }

        Ok(bindings)
    }
}

/// `count` evenly spaced values from `start` to `stop` inclusive
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count)
                .map(|index| {
                    if index == count - 1 {
                        stop
                    } else {
                        start + step * index as f64
                    }
                })
                .collect()
        }
    }
}

/// Expand a generation declaration in one go
pub fn expand(
    generation: &str,
    scans: &OrderedMap<VariableSpec>,
    inherited: &BTreeMap<String, Scalar>,
) -> Result<Vec<Binding>, ExpansionError> {
    GenerationPlan::compile(generation, scans)?.expand(inherited)
}
