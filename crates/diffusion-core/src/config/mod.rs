//! Strict configuration resolution.
//!
//! A raw YAML document is merged with overrides and then walked against a
//! [`ConfigSchema`]. The result is an immutable [`ResolvedConfig`] with every
//! default applied. Unknown keys fail here, before anything touches disk.

mod schema;

pub use schema::{application_schema, ConfigSchema, KeySpec, Requirement, ValueType};

use crate::error::RunResult;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Path used in errors that concern the whole document rather than a key.
pub const DOCUMENT_PATH: &str = "<document>";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{path}`: {kind}")]
pub struct ConfigValidationError {
    /// Dotted key path, e.g. `trainer.max_steps`.
    pub path: String,
    pub kind: ConfigErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigErrorKind {
    #[error("unknown key")]
    UnknownKey,

    #[error("required key is missing")]
    MissingKey,

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("expected one of [{}], found `{found}`", .allowed.join(", "))]
    InvalidChoice { allowed: Vec<String>, found: String },

    #[error("mapping keys must be strings")]
    NonStringKey,

    #[error("malformed override: {0}")]
    MalformedOverride(String),

    #[error("cannot parse document: {0}")]
    Parse(String),
}

impl ConfigValidationError {
    fn new(path: impl Into<String>, kind: ConfigErrorKind) -> Self {
        Self { path: path.into(), kind }
    }

    fn mismatch(path: &str, expected: &ValueType, found: &Value) -> Self {
        Self::new(
            path,
            ConfigErrorKind::TypeMismatch { expected: expected.describe(), found: describe_value(found) },
        )
    }
}

type ConfigResult<T> = std::result::Result<T, ConfigValidationError>;

/// A typed, fully resolved configuration value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// A single `key.path=value` override. The value is parsed as YAML, so
/// `trainer.max_steps=3` yields an integer and `run.experiment_name=x` a string.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub path: Vec<String>,
    pub value: Value,
}

impl Override {
    pub fn parse(spec: &str) -> ConfigResult<Self> {
        let Some((key, raw)) = spec.split_once('=') else {
            return Err(ConfigValidationError::new(
                spec,
                ConfigErrorKind::MalformedOverride("expected `key.path=value`".to_string()),
            ));
        };
        let key = key.trim();
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(ConfigValidationError::new(
                key,
                ConfigErrorKind::MalformedOverride("empty key segment".to_string()),
            ));
        }
        let value: Value = serde_yaml::from_str(raw.trim())
            .map_err(|e| ConfigValidationError::new(key, ConfigErrorKind::MalformedOverride(e.to_string())))?;
        Ok(Self { path: key.split('.').map(str::to_string).collect(), value })
    }

    pub fn set(path: &str, value: impl Into<ConfigValue>) -> ConfigResult<Self> {
        let value = serde_yaml::to_value(value.into())
            .map_err(|e| ConfigValidationError::new(path, ConfigErrorKind::MalformedOverride(e.to_string())))?;
        Ok(Self { path: path.split('.').map(str::to_string).collect(), value })
    }

    pub fn dotted(&self) -> String {
        self.path.join(".")
    }

    fn apply(&self, root: &mut Value) -> ConfigResult<()> {
        insert_at(root, &self.path, 0, &self.value)
    }
}

fn insert_at(node: &mut Value, path: &[String], depth: usize, value: &Value) -> ConfigResult<()> {
    if node.is_null() {
        *node = Value::Mapping(Mapping::new());
    }
    match node {
        Value::Mapping(map) => {
            let key = Value::String(path[depth].clone());
            if depth + 1 == path.len() {
                map.insert(key, value.clone());
                return Ok(());
            }
            let child = map.entry(key).or_insert(Value::Null);
            insert_at(child, path, depth + 1, value)
        }
        other => {
            let parent = path[..depth].join(".");
            Err(ConfigValidationError::new(
                if parent.is_empty() { DOCUMENT_PATH.to_string() } else { parent },
                ConfigErrorKind::TypeMismatch { expected: "mapping".to_string(), found: describe_value(other) },
            ))
        }
    }
}

/// The final, defaults-applied configuration a run executes with.
///
/// Cheap to clone; the tree is shared and never mutated. Overrides produce a
/// new value.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    root: Arc<BTreeMap<String, ConfigValue>>,
    schema: Arc<ConfigSchema>,
}

impl PartialEq for ResolvedConfig {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl ResolvedConfig {
    pub fn as_map(&self) -> &BTreeMap<String, ConfigValue> {
        &self.root
    }

    pub fn get(&self, dotted: &str) -> Option<&ConfigValue> {
        let mut parts = dotted.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            match current {
                ConfigValue::Map(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn get_str(&self, dotted: &str) -> ConfigResult<&str> {
        self.get(dotted)
            .and_then(ConfigValue::as_str)
            .ok_or_else(|| ConfigValidationError::new(dotted, ConfigErrorKind::MissingKey))
    }

    pub fn get_u64(&self, dotted: &str) -> ConfigResult<u64> {
        let value = self
            .get(dotted)
            .and_then(ConfigValue::as_i64)
            .ok_or_else(|| ConfigValidationError::new(dotted, ConfigErrorKind::MissingKey))?;
        u64::try_from(value).map_err(|_| {
            ConfigValidationError::new(
                dotted,
                ConfigErrorKind::TypeMismatch {
                    expected: ValueType::UInt.describe(),
                    found: value.to_string(),
                },
            )
        })
    }

    pub fn get_bool(&self, dotted: &str) -> ConfigResult<bool> {
        self.get(dotted)
            .and_then(ConfigValue::as_bool)
            .ok_or_else(|| ConfigValidationError::new(dotted, ConfigErrorKind::MissingKey))
    }

    /// Return a new config with one key replaced. `self` is left untouched.
    pub fn with_override(&self, dotted: &str, value: impl Into<ConfigValue>) -> ConfigResult<Self> {
        let over = Override::set(dotted, value)?;
        let raw = serde_yaml::to_value(&*self.root)
            .map_err(|e| ConfigValidationError::new(DOCUMENT_PATH, ConfigErrorKind::Parse(e.to_string())))?;
        ConfigResolver { schema: Arc::clone(&self.schema) }.resolve_with_overrides(&raw, &[over])
    }

    /// YAML snapshot with sorted keys, as written to `config.resolved.yaml`.
    pub fn to_yaml(&self) -> RunResult<String> {
        Ok(serde_yaml::to_string(&*self.root)?)
    }

    /// SHA-256 of the YAML snapshot.
    pub fn content_hash(&self) -> RunResult<String> {
        Ok(hex::encode(Sha256::digest(self.to_yaml()?.as_bytes())))
    }
}

/// Resolves raw documents against a schema.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    schema: Arc<ConfigSchema>,
}

impl ConfigResolver {
    #[must_use]
    pub fn new(schema: ConfigSchema) -> Self {
        Self { schema: Arc::new(schema) }
    }

    /// Resolver for [`application_schema`].
    #[must_use]
    pub fn application() -> Self {
        Self::new(application_schema())
    }

    pub fn schema(&self) -> &ConfigSchema {
        &self.schema
    }

    pub fn resolve(&self, raw: &Value) -> ConfigResult<ResolvedConfig> {
        self.resolve_with_overrides(raw, &[])
    }

    pub fn resolve_with_overrides(&self, raw: &Value, overrides: &[Override]) -> ConfigResult<ResolvedConfig> {
        let mut merged = raw.clone();
        for over in overrides {
            over.apply(&mut merged)?;
        }
        let empty = Mapping::new();
        let mapping = match &merged {
            Value::Null => &empty,
            Value::Mapping(map) => map,
            other => {
                return Err(ConfigValidationError::new(
                    DOCUMENT_PATH,
                    ConfigErrorKind::TypeMismatch { expected: "mapping".to_string(), found: describe_value(other) },
                ));
            }
        };
        let root = resolve_section(&self.schema, mapping, "")?;
        Ok(ResolvedConfig { root: Arc::new(root), schema: Arc::clone(&self.schema) })
    }

    pub fn resolve_str(&self, text: &str, overrides: &[Override]) -> ConfigResult<ResolvedConfig> {
        let raw: Value = serde_yaml::from_str(text)
            .map_err(|e| ConfigValidationError::new(DOCUMENT_PATH, ConfigErrorKind::Parse(e.to_string())))?;
        self.resolve_with_overrides(&raw, overrides)
    }

    /// Read a YAML file and resolve it. An empty file resolves to all defaults.
    pub fn load(&self, path: &Path, overrides: &[Override]) -> RunResult<ResolvedConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| std::io::Error::new(e.kind(), format!("cannot read config {}: {e}", path.display())))?;
        Ok(self.resolve_str(&text, overrides)?)
    }
}

/// `resolve(raw, schema)` without building a resolver first.
pub fn resolve(raw: &Value, schema: &ConfigSchema) -> ConfigResult<ResolvedConfig> {
    ConfigResolver::new(schema.clone()).resolve(raw)
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) if n.is_f64() => "float".to_string(),
        Value::Number(_) => "integer".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Sequence(_) => "sequence".to_string(),
        Value::Mapping(_) => "mapping".to_string(),
        Value::Tagged(_) => "tagged value".to_string(),
    }
}

fn key_repr(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => describe_value(other),
    }
}

fn resolve_section(
    schema: &ConfigSchema,
    raw: &Mapping,
    prefix: &str,
) -> ConfigResult<BTreeMap<String, ConfigValue>> {
    let mut present: BTreeMap<String, &Value> = BTreeMap::new();
    for (key, value) in raw {
        let Value::String(name) = key else {
            return Err(ConfigValidationError::new(join(prefix, &key_repr(key)), ConfigErrorKind::NonStringKey));
        };
        present.insert(name.clone(), value);
    }

    if let Some(unknown) = present.keys().find(|k| schema.get(k).is_none()) {
        return Err(ConfigValidationError::new(join(prefix, unknown), ConfigErrorKind::UnknownKey));
    }

    let mut out = BTreeMap::new();
    for (key, spec) in schema.iter() {
        let path = join(prefix, key);
        let value = present.get(key).copied().filter(|v| !v.is_null());
        let resolved = match (value, &spec.requirement) {
            (Some(v), _) => convert(&spec.ty, v, &path)?,
            (None, Requirement::Required) => {
                return Err(ConfigValidationError::new(path, ConfigErrorKind::MissingKey));
            }
            (None, Requirement::Optional(default)) => match &spec.ty {
                ValueType::Section(inner) => ConfigValue::Map(resolve_section(inner, &Mapping::new(), &path)?),
                _ => default.clone(),
            },
        };
        out.insert(key.clone(), resolved);
    }
    Ok(out)
}

fn convert(ty: &ValueType, value: &Value, path: &str) -> ConfigResult<ConfigValue> {
    match (ty, value) {
        (ValueType::Bool, Value::Bool(b)) => Ok(ConfigValue::Bool(*b)),
        (ValueType::Int, Value::Number(n)) if n.as_i64().is_some() => Ok(ConfigValue::Int(n.as_i64().unwrap_or_default())),
        (ValueType::UInt, Value::Number(n)) => match n.as_i64() {
            Some(v) if v >= 0 => Ok(ConfigValue::Int(v)),
            Some(v) => Err(ConfigValidationError::new(
                path,
                ConfigErrorKind::TypeMismatch { expected: ty.describe(), found: v.to_string() },
            )),
            None => Err(ConfigValidationError::mismatch(path, ty, value)),
        },
        (ValueType::Float, Value::Number(n)) => n
            .as_f64()
            .map(ConfigValue::Float)
            .ok_or_else(|| ConfigValidationError::mismatch(path, ty, value)),
        (ValueType::Str, Value::String(s)) => Ok(ConfigValue::Str(s.clone())),
        (ValueType::OneOf(allowed), Value::String(s)) => {
            if allowed.iter().any(|a| a == s) {
                Ok(ConfigValue::Str(s.clone()))
            } else {
                Err(ConfigValidationError::new(
                    path,
                    ConfigErrorKind::InvalidChoice { allowed: allowed.clone(), found: s.clone() },
                ))
            }
        }
        (ValueType::List(inner), Value::Sequence(items)) => items
            .iter()
            .enumerate()
            .map(|(idx, item)| convert(inner, item, &format!("{path}[{idx}]")))
            .collect::<ConfigResult<Vec<_>>>()
            .map(ConfigValue::List),
        (ValueType::Section(inner), Value::Mapping(map)) => resolve_section(inner, map, path).map(ConfigValue::Map),
        _ => Err(ConfigValidationError::mismatch(path, ty, value)),
    }
}

/// Typed view over the keys of [`application_schema`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub seed: u64,
    pub experiment_name: String,
    pub run_root: String,
    pub max_steps: u64,
    pub checkpoint_every: u64,
    pub time_basis: String,
    pub strict_determinism: bool,
}

impl RunSettings {
    pub fn from_config(config: &ResolvedConfig) -> ConfigResult<Self> {
        Ok(Self {
            seed: config.get_u64("seed")?,
            experiment_name: config.get_str("run.experiment_name")?.to_string(),
            run_root: config.get_str("run.run_root")?.to_string(),
            max_steps: config.get_u64("trainer.max_steps")?,
            checkpoint_every: config.get_u64("checkpoint.every_steps")?,
            time_basis: config.get_str("metrics.time_basis")?.to_string(),
            strict_determinism: config.get_bool("determinism.strict")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_app(text: &str) -> ConfigResult<ResolvedConfig> {
        ConfigResolver::application().resolve_str(text, &[])
    }

    #[test]
    fn test_empty_document_resolves_to_defaults() {
        let cfg = resolve_app("").unwrap();
        assert_eq!(cfg.get_u64("seed").unwrap(), 0);
        assert_eq!(cfg.get_str("run.experiment_name").unwrap(), "smoke");
        assert_eq!(cfg.get_str("run.run_root").unwrap(), "runs");
        assert_eq!(cfg.get_u64("trainer.max_steps").unwrap(), 10);
    }

    #[test]
    fn test_unknown_top_key_names_path() {
        let err = resolve_app("seed: 0\nBAD_KEY: 123\n").unwrap_err();
        assert_eq!(err.path, "BAD_KEY");
        assert_eq!(err.kind, ConfigErrorKind::UnknownKey);
    }

    #[test]
    fn test_unknown_nested_key_names_dotted_path() {
        let err = resolve_app("trainer:\n  unknowntyppo: 1\n").unwrap_err();
        assert_eq!(err.path, "trainer.unknowntyppo");
        assert!(err.to_string().contains("trainer.unknowntyppo"));
    }

    #[test]
    fn test_type_mismatch_reports_expected_and_found() {
        let err = resolve_app("seed: abc\n").unwrap_err();
        assert_eq!(err.path, "seed");
        assert_eq!(
            err.kind,
            ConfigErrorKind::TypeMismatch { expected: "non-negative integer".to_string(), found: "string".to_string() }
        );
    }

    #[test]
    fn test_negative_uint_rejected() {
        let err = resolve_app("trainer:\n  max_steps: -1\n").unwrap_err();
        assert_eq!(err.path, "trainer.max_steps");
    }

    #[test]
    fn test_invalid_choice() {
        let err = resolve_app("metrics:\n  time_basis: wallclock\n").unwrap_err();
        assert_eq!(err.path, "metrics.time_basis");
        assert!(matches!(err.kind, ConfigErrorKind::InvalidChoice { .. }));
    }

    #[test]
    fn test_required_key_missing() {
        let schema = ConfigSchema::new()
            .section("model", ConfigSchema::new().required("channels", ValueType::UInt));
        let err = ConfigResolver::new(schema).resolve_str("model: {}\n", &[]).unwrap_err();
        assert_eq!(err.path, "model.channels");
        assert_eq!(err.kind, ConfigErrorKind::MissingKey);
    }

    #[test]
    fn test_float_accepts_integer() {
        let schema = ConfigSchema::new().optional("lr", ValueType::Float, 0.1);
        let cfg = ConfigResolver::new(schema).resolve_str("lr: 1\n", &[]).unwrap();
        assert_eq!(cfg.get("lr"), Some(&ConfigValue::Float(1.0)));
    }

    #[test]
    fn test_list_element_path() {
        let schema = ConfigSchema::new().optional("dims", ValueType::List(Box::new(ValueType::UInt)), ConfigValue::List(vec![]));
        let err = ConfigResolver::new(schema).resolve_str("dims: [1, 2, x]\n", &[]).unwrap_err();
        assert_eq!(err.path, "dims[2]");
    }

    #[test]
    fn test_override_applies_before_validation() {
        let resolver = ConfigResolver::application();
        let over = Override::parse("trainer.max_steps=3").unwrap();
        let cfg = resolver.resolve_str("seed: 1\n", &[over]).unwrap();
        assert_eq!(cfg.get_u64("trainer.max_steps").unwrap(), 3);

        let bad = Override::parse("trainer.typo=3").unwrap();
        let err = resolver.resolve_str("", &[bad]).unwrap_err();
        assert_eq!(err.path, "trainer.typo");
    }

    #[test]
    fn test_malformed_override() {
        assert!(Override::parse("no_equals_sign").is_err());
        assert!(Override::parse("a..b=1").is_err());
    }

    #[test]
    fn test_with_override_does_not_mutate() {
        let cfg0 = resolve_app("seed: 1\n").unwrap();
        let cfg1 = cfg0.with_override("run.run_root", "/tmp/elsewhere").unwrap();
        assert_eq!(cfg0.get_str("run.run_root").unwrap(), "runs");
        assert_eq!(cfg1.get_str("run.run_root").unwrap(), "/tmp/elsewhere");
        assert_ne!(cfg0, cfg1);
    }

    #[test]
    fn test_yaml_snapshot_roundtrip_and_hash_stable() {
        let cfg = resolve_app("seed: 7\nrun:\n  experiment_name: smoke\n").unwrap();
        let yaml = cfg.to_yaml().unwrap();
        assert!(!yaml.trim().is_empty());
        let back = ConfigResolver::application().resolve_str(&yaml, &[]).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.content_hash().unwrap(), cfg.content_hash().unwrap());
    }

    #[test]
    fn test_run_settings_view() {
        let cfg = resolve_app("seed: 9\ndeterminism:\n  strict: true\n").unwrap();
        let settings = RunSettings::from_config(&cfg).unwrap();
        assert_eq!(settings.seed, 9);
        assert!(settings.strict_determinism);
        assert_eq!(settings.time_basis, "run_relative");
    }
}
