//! Rotation templates: declarative descriptions of how to rotate one kind of credential.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;

// ── Template shape ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationTemplate {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema (object) the user inputs must satisfy.
    pub inputs: Value,
    /// Output keys a policy may map onto secrets.
    pub outputs: Vec<String>,
    pub functions: TemplateFunctions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateFunctions {
    pub set: ProviderFunction,
    pub test: ProviderFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<ProviderFunction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderFunction {
    Http(HttpFunction),
    Database(DatabaseFunction),
}

impl ProviderFunction {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderFunction::Http(_) => "http",
            ProviderFunction::Database(_) => "database",
        }
    }

    pub fn setter(&self) -> &BTreeMap<String, Assignment> {
        match self {
            ProviderFunction::Http(f) => &f.setter,
            ProviderFunction::Database(f) => &f.setter,
        }
    }

    pub fn pre(&self) -> &BTreeMap<String, Value> {
        match self {
            ProviderFunction::Http(f) => &f.pre,
            ProviderFunction::Database(f) => &f.pre,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpFunction {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub setter: BTreeMap<String, Assignment>,
    #[serde(default)]
    pub pre: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbClient {
    Postgres,
    Mysql,
}

impl DbClient {
    pub fn as_str(self) -> &'static str {
        match self {
            DbClient::Postgres => "postgres",
            DbClient::Mysql => "mysql",
        }
    }
}

/// Connection fields, each a templated value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConnectionTemplate {
    pub host: Value,
    pub port: Value,
    pub database: Value,
    pub username: Value,
    pub password: Value,
    #[serde(default)]
    pub ca: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseFunction {
    pub client: DbClient,
    pub connection: DbConnectionTemplate,
    pub query: String,
    /// Positional bind values.
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub setter: BTreeMap<String, Assignment>,
    #[serde(default)]
    pub pre: BTreeMap<String, Value>,
}

/// How a setter entry obtains its value after a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "assign", rename_all = "lowercase")]
pub enum Assignment {
    /// A templated literal, resolved against the run context.
    Direct { value: Value },
    /// A dotted path into the call result.
    Path { path: String },
}

// ── Inputs ─────────────────────────────────────────────────────────

impl RotationTemplate {
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn declares_output(&self, key: &str) -> bool {
        self.outputs.iter().any(|o| o == key)
    }

    fn property_type(&self, key: &str) -> Option<&str> {
        self.inputs
            .get("properties")
            .and_then(|p| p.get(key))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }

    /// Coerce string inputs to the primitive kind the schema declares.
    ///
    /// `string` passes through, `integer` is parsed base-10, anything else is
    /// parsed as JSON. A string that fails to coerce is kept as-is so the
    /// schema check reports it.
    pub fn coerce_inputs(&self, raw: &Map<String, Value>) -> Map<String, Value> {
        raw.iter()
            .map(|(key, value)| {
                let coerced = match (value, self.property_type(key)) {
                    (Value::String(s), Some("string")) => Value::String(s.clone()),
                    (Value::String(s), Some("integer")) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::from)
                        .unwrap_or_else(|_| value.clone()),
                    (Value::String(s), Some(_)) => {
                        serde_json::from_str(s).unwrap_or_else(|_| value.clone())
                    }
                    _ => value.clone(),
                };
                (key.clone(), coerced)
            })
            .collect()
    }

    /// Validate against the input schema, surfacing the first violation.
    pub fn validate_inputs(&self, inputs: &Map<String, Value>) -> Result<(), AppError> {
        let validator = jsonschema::validator_for(&self.inputs).map_err(|e| {
            AppError::Internal(format!("Template '{}' has an invalid schema: {e}", self.name))
        })?;
        let instance = Value::Object(inputs.clone());
        if let Some(err) = validator.iter_errors(&instance).next() {
            let at = err.instance_path.to_string();
            let location = if at.is_empty() { String::new() } else { format!(" at {at}") };
            return Err(AppError::Validation(format!(
                "Invalid inputs for '{}'{location}: {err}",
                self.name
            )));
        }
        Ok(())
    }

    /// Coerce then validate.
    pub fn prepare_inputs(&self, raw: &Map<String, Value>) -> Result<Map<String, Value>, AppError> {
        let inputs = self.coerce_inputs(raw);
        self.validate_inputs(&inputs)?;
        Ok(inputs)
    }
}

// ── Registry ───────────────────────────────────────────────────────

static BUILTIN: OnceLock<Arc<TemplateRegistry>> = OnceLock::new();

const BUILTIN_SOURCES: &[(&str, &str)] = &[
    ("postgres", include_str!("templates/postgres.json")),
    ("mysql", include_str!("templates/mysql.json")),
    ("sendgrid", include_str!("templates/sendgrid.json")),
];

/// Immutable name → template lookup.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<RotationTemplate>>,
}

impl TemplateRegistry {
    /// Process-wide registry of the templates compiled into the binary.
    pub fn builtin() -> Arc<TemplateRegistry> {
        BUILTIN
            .get_or_init(|| {
                let templates = BUILTIN_SOURCES
                    .iter()
                    .filter_map(|(name, raw)| match RotationTemplate::from_json(raw) {
                        Ok(t) => Some(t),
                        Err(e) => {
                            tracing::error!(template = %name, error = %e, "Failed to load built-in rotation template");
                            None
                        }
                    })
                    .collect();
                Arc::new(TemplateRegistry::from_templates(templates))
            })
            .clone()
    }

    pub fn from_templates(templates: Vec<RotationTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.name.clone(), Arc::new(t)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<RotationTemplate>, AppError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Rotation template '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
