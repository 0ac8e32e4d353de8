//! Configuration schema: a tagged tree of `key -> (type, requiredness)`.
//!
//! Every key a run may carry is declared here. Resolution walks the raw
//! document against this tree, so a key that is not declared can never reach
//! a resolved config.

use super::ConfigValue;
use std::collections::BTreeMap;

/// Expected type of a configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Bool,
    Int,
    /// Integer that must be `>= 0`.
    UInt,
    /// Floating point; integers are widened.
    Float,
    Str,
    /// String restricted to a fixed set of values.
    OneOf(Vec<String>),
    List(Box<ValueType>),
    /// Nested mapping with its own schema.
    Section(ConfigSchema),
}

impl ValueType {
    pub fn one_of(choices: &[&str]) -> Self {
        Self::OneOf(choices.iter().map(|c| (*c).to_string()).collect())
    }

    /// Human-readable name used in validation errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Bool => "bool".to_string(),
            Self::Int => "integer".to_string(),
            Self::UInt => "non-negative integer".to_string(),
            Self::Float => "float".to_string(),
            Self::Str => "string".to_string(),
            Self::OneOf(choices) => format!("one of [{}]", choices.join(", ")),
            Self::List(inner) => format!("list of {}", inner.describe()),
            Self::Section(_) => "mapping".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    Required,
    /// Applied when the key is absent or null.
    Optional(ConfigValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeySpec {
    pub ty: ValueType,
    pub requirement: Requirement,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigSchema {
    keys: BTreeMap<String, KeySpec>,
}

impl ConfigSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn required(mut self, key: &str, ty: ValueType) -> Self {
        self.keys.insert(key.to_string(), KeySpec { ty, requirement: Requirement::Required });
        self
    }

    #[must_use]
    pub fn optional(mut self, key: &str, ty: ValueType, default: impl Into<ConfigValue>) -> Self {
        self.keys
            .insert(key.to_string(), KeySpec { ty, requirement: Requirement::Optional(default.into()) });
        self
    }

    /// A nested section. Absent sections resolve from an empty mapping, so
    /// their defaults apply and their required keys are still enforced.
    #[must_use]
    pub fn section(mut self, key: &str, schema: ConfigSchema) -> Self {
        self.keys.insert(
            key.to_string(),
            KeySpec {
                ty: ValueType::Section(schema),
                requirement: Requirement::Optional(ConfigValue::Map(BTreeMap::new())),
            },
        );
        self
    }

    pub fn get(&self, key: &str) -> Option<&KeySpec> {
        self.keys.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &KeySpec)> {
        self.keys.iter()
    }

    /// Look up a dotted key path such as `run.experiment_name`.
    pub fn lookup(&self, dotted: &str) -> Option<&KeySpec> {
        let mut schema = self;
        let mut parts = dotted.split('.').peekable();
        while let Some(part) = parts.next() {
            let spec = schema.get(part)?;
            if parts.peek().is_none() {
                return Some(spec);
            }
            match &spec.ty {
                ValueType::Section(inner) => schema = inner,
                _ => return None,
            }
        }
        None
    }
}

/// Schema for the keys every diffusion-core run understands.
pub fn application_schema() -> ConfigSchema {
    ConfigSchema::new()
        .optional("seed", ValueType::UInt, 0_i64)
        .section(
            "run",
            ConfigSchema::new()
                .optional("experiment_name", ValueType::Str, "smoke")
                .optional("run_root", ValueType::Str, "runs"),
        )
        .section("trainer", ConfigSchema::new().optional("max_steps", ValueType::UInt, 10_i64))
        .section("checkpoint", ConfigSchema::new().optional("every_steps", ValueType::UInt, 5_i64))
        .section(
            "metrics",
            ConfigSchema::new().optional(
                "time_basis",
                ValueType::one_of(&["run_relative", "unix"]),
                "run_relative",
            ),
        )
        .section(
            "determinism",
            ConfigSchema::new().optional("strict", ValueType::Bool, false),
        )
}
