//! Per-record field transforms.
//!
//! A transform reads values from one of three areas (the raw input record, a
//! scratch area for intermediate values, or the output record) and writes its
//! results to scratch or output.

use crate::config::types::{ConditionOperator, TransformConfig};
use regex::Regex;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("transform '{transform}' expects {expected} {what} but {actual} were configured")]
    Arity {
        transform: String,
        what: &'static str,
        expected: String,
        actual: usize,
    },

    #[error("transform '{transform}': invalid regex '{pattern}': {source}")]
    InvalidRegex {
        transform: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("transform '{transform}': {message}")]
    InvalidCondition { transform: String, message: String },

    #[error("circular dependency between transforms: {0}")]
    Cycle(String),

    #[error("field '{0}' is produced by more than one transform")]
    DuplicateOutput(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformType {
    Concat,
    Uppercase,
    Lowercase,
    Trim,
    Extract,
    Split,
    Exclude,
}

impl FromStr for TransformType {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "concat" => Ok(TransformType::Concat),
            "uppercase" => Ok(TransformType::Uppercase),
            "lowercase" => Ok(TransformType::Lowercase),
            "trim" => Ok(TransformType::Trim),
            "extract" => Ok(TransformType::Extract),
            "split" => Ok(TransformType::Split),
            "exclude" => Ok(TransformType::Exclude),
            _ => Err(TransformError::UnknownTransform(s.to_string())),
        }
    }
}

impl TransformType {
    fn name(self) -> &'static str {
        match self {
            TransformType::Concat => "concat",
            TransformType::Uppercase => "uppercase",
            TransformType::Lowercase => "lowercase",
            TransformType::Trim => "trim",
            TransformType::Extract => "extract",
            TransformType::Split => "split",
            TransformType::Exclude => "exclude",
        }
    }

    /// Output names used when none are configured.
    fn default_outputs(self) -> Vec<String> {
        match self {
            TransformType::Concat
            | TransformType::Uppercase
            | TransformType::Lowercase
            | TransformType::Trim => vec![self.name().to_string()],
            TransformType::Extract | TransformType::Split | TransformType::Exclude => Vec::new(),
        }
    }
}

/// A transform configuration with defaults applied and arguments checked.
#[derive(Debug, Clone)]
pub struct TransformSpec {
    pub transform_type: TransformType,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    kind: TransformKind,
}

impl TransformSpec {
    pub fn from_config(config: &TransformConfig) -> Result<Self, TransformError> {
        let transform_type: TransformType = config.transform.parse()?;
        let name = transform_type.name();

        let outputs = if config.outputs.is_empty() {
            transform_type.default_outputs()
        } else {
            config.outputs.clone()
        };

        let arity = |what: &'static str, expected: &str, actual: usize| TransformError::Arity {
            transform: name.to_string(),
            what,
            expected: expected.to_string(),
            actual,
        };

        let inputs = config.inputs.len();
        match transform_type {
            TransformType::Concat if inputs == 0 => {
                return Err(arity("inputs", "at least 1", inputs))
            }
            TransformType::Concat if outputs.len() != 1 => {
                return Err(arity("outputs", "1", outputs.len()))
            }
            TransformType::Concat if config.arguments.len() > 1 => {
                return Err(arity("arguments", "at most 1", config.arguments.len()))
            }
            TransformType::Uppercase | TransformType::Lowercase | TransformType::Trim => {
                if inputs != 1 {
                    return Err(arity("inputs", "1", inputs));
                }
                if outputs.len() != 1 {
                    return Err(arity("outputs", "1", outputs.len()));
                }
            }
            TransformType::Extract | TransformType::Split => {
                if inputs != 1 {
                    return Err(arity("inputs", "1", inputs));
                }
                if outputs.is_empty() {
                    return Err(arity("outputs", "at least 1", 0));
                }
                if config.arguments.len() != 1 {
                    return Err(arity("arguments", "1", config.arguments.len()));
                }
            }
            TransformType::Exclude => {
                if inputs != 1 {
                    return Err(arity("inputs", "1", inputs));
                }
                if !outputs.is_empty() {
                    return Err(arity("outputs", "0", outputs.len()));
                }
            }
            TransformType::Concat => {}
        }

        let kind = build_kind(transform_type, config)?;

        Ok(Self {
            transform_type,
            inputs: config.inputs.clone(),
            outputs,
            kind,
        })
    }

    pub(crate) fn kind(&self) -> &TransformKind {
        &self.kind
    }
}

fn build_kind(
    transform_type: TransformType,
    config: &TransformConfig,
) -> Result<TransformKind, TransformError> {
    let name = transform_type.name();
    let compile = |pattern: &str| {
        Regex::new(pattern).map_err(|source| TransformError::InvalidRegex {
            transform: name.to_string(),
            pattern: pattern.to_string(),
            source,
        })
    };

    let kind = match transform_type {
        TransformType::Concat => TransformKind::Concat {
            delimiter: config.arguments.first().cloned().unwrap_or_default(),
        },
        TransformType::Uppercase => TransformKind::Uppercase,
        TransformType::Lowercase => TransformKind::Lowercase,
        TransformType::Trim => TransformKind::Trim,
        TransformType::Extract => TransformKind::Extract {
            regex: compile(&config.arguments[0])?,
        },
        TransformType::Split => TransformKind::Split {
            regex: compile(&config.arguments[0])?,
        },
        TransformType::Exclude => {
            let condition = config
                .condition
                .as_ref()
                .ok_or_else(|| TransformError::InvalidCondition {
                    transform: name.to_string(),
                    message: "a condition is required".to_string(),
                })?;
            let condition = match condition.operator {
                ConditionOperator::Match => {
                    Condition::Matches(compile(&format!("^(?:{})$", condition.value))?)
                }
                op => {
                    let value: f64 = condition.value.trim().parse().map_err(|_| {
                        TransformError::InvalidCondition {
                            transform: name.to_string(),
                            message: format!("'{}' is not a number", condition.value),
                        }
                    })?;
                    Condition::Compare(op, value)
                }
            };
            TransformKind::Exclude { condition }
        }
    };

    Ok(kind)
}

#[derive(Debug, Clone)]
pub(crate) enum TransformKind {
    Concat { delimiter: String },
    Uppercase,
    Lowercase,
    Trim,
    Extract { regex: Regex },
    Split { regex: Regex },
    Exclude { condition: Condition },
}

#[derive(Debug, Clone)]
pub(crate) enum Condition {
    Matches(Regex),
    Compare(ConditionOperator, f64),
}

impl Condition {
    fn holds(&self, value: &str) -> bool {
        match self {
            Condition::Matches(regex) => regex.is_match(value),
            Condition::Compare(op, threshold) => {
                let Ok(value) = value.trim().parse::<f64>() else {
                    return false;
                };
                match op {
                    ConditionOperator::Eq => value == *threshold,
                    ConditionOperator::Gt => value > *threshold,
                    ConditionOperator::Gte => value >= *threshold,
                    ConditionOperator::Lt => value < *threshold,
                    ConditionOperator::Lte => value <= *threshold,
                    ConditionOperator::Match => false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Input,
    Scratch,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransformIndex {
    pub area: Area,
    pub index: usize,
}

impl TransformIndex {
    pub fn new(area: Area, index: usize) -> Self {
        Self { area, index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformResult {
    Ok,
    Fail,
    Exclude,
}

/// The three areas a transform can read from.
pub struct Areas<'a> {
    pub input: &'a [String],
    pub scratch: &'a mut [String],
    pub output: &'a mut [String],
}

impl Areas<'_> {
    pub fn get(&self, at: TransformIndex) -> &str {
        let slot = match at.area {
            Area::Input => self.input.get(at.index),
            Area::Scratch => self.scratch.get(at.index),
            Area::Output => self.output.get(at.index),
        };
        slot.map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, at: TransformIndex, value: String) {
        let slot = match at.area {
            // input is never written
            Area::Input => None,
            Area::Scratch => self.scratch.get_mut(at.index),
            Area::Output => self.output.get_mut(at.index),
        };
        if let Some(slot) = slot {
            *slot = value;
        }
    }
}

/// A transform bound to concrete read and write slots.
#[derive(Debug, Clone)]
pub struct Transform {
    name: &'static str,
    kind: TransformKind,
    inputs: Vec<TransformIndex>,
    outputs: Vec<TransformIndex>,
}

impl Transform {
    pub fn new(
        spec: &TransformSpec,
        inputs: Vec<TransformIndex>,
        outputs: Vec<TransformIndex>,
    ) -> Self {
        Self {
            name: spec.transform_type.name(),
            kind: spec.kind().clone(),
            inputs,
            outputs,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, areas: &mut Areas<'_>) -> TransformResult {
        match &self.kind {
            TransformKind::Concat { delimiter } => {
                let joined = self
                    .inputs
                    .iter()
                    .map(|&i| areas.get(i))
                    .collect::<Vec<_>>()
                    .join(delimiter);
                self.write_first(areas, joined)
            }
            TransformKind::Uppercase => {
                let value = areas.get(self.inputs[0]).to_uppercase();
                self.write_first(areas, value)
            }
            TransformKind::Lowercase => {
                let value = areas.get(self.inputs[0]).to_lowercase();
                self.write_first(areas, value)
            }
            TransformKind::Trim => {
                let value = areas.get(self.inputs[0]).trim().to_string();
                self.write_first(areas, value)
            }
            TransformKind::Extract { regex } => {
                let source = areas.get(self.inputs[0]).to_string();
                let Some(captures) = regex.captures(&source) else {
                    return TransformResult::Fail;
                };
                for (n, &out) in self.outputs.iter().enumerate() {
                    let value = captures.get(n + 1).map(|m| m.as_str()).unwrap_or("");
                    areas.set(out, value.to_string());
                }
                TransformResult::Ok
            }
            TransformKind::Split { regex } => {
                let source = areas.get(self.inputs[0]).to_string();
                for (&out, part) in self.outputs.iter().zip(regex.split(&source)) {
                    areas.set(out, part.to_string());
                }
                TransformResult::Ok
            }
            TransformKind::Exclude { condition } => {
                if condition.holds(areas.get(self.inputs[0])) {
                    TransformResult::Exclude
                } else {
                    TransformResult::Ok
                }
            }
        }
    }

    fn write_first(&self, areas: &mut Areas<'_>, value: String) -> TransformResult {
        match self.outputs.first() {
            Some(&out) => {
                areas.set(out, value);
                TransformResult::Ok
            }
            None => TransformResult::Fail,
        }
    }
}
