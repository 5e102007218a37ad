//! Template variable substitution for test specs.
//!
//! Request URLs, header values, and bodies may contain `{{placeholder}}`
//! tokens that are resolved at request-build time. Resolution checks, in
//! order: prefixed lookups (`{{env:NAME}}`, `{{target:NAME}}`), call-site
//! extra variables, the spec's variable map, and finally the built-ins
//! (`uuid`, `timestamp`, `timestamp_unix`, `request_number`, `random_int`).
//! Unresolved placeholders are left in place verbatim.

use std::collections::HashMap;
use std::env;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use regex::{Captures, Regex};
use serde_json::Value;
use uuid::Uuid;

lazy_static::lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{([A-Za-z0-9_]+(?::[A-Za-z0-9_]+)?)\}\}").expect("valid placeholder pattern");
}

/// Resolves `{{...}}` placeholders against layered variable sources.
///
/// One engine is built per run, seeded with the spec's user variables.
/// Substitution is pure apart from the built-ins that read the clock or
/// the thread-local RNG.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    variables: HashMap<String, String>,
}

impl TemplateEngine {
    /// Create an engine seeded with the spec's variable map.
    pub fn new(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Substitute placeholders in a template string.
    pub fn substitute(&self, template: &str, request_number: u64) -> String {
        self.substitute_with(template, request_number, None)
    }

    /// Substitute placeholders, with call-site variables layered on top of
    /// the engine's base map.
    pub fn substitute_with(
        &self,
        template: &str,
        request_number: u64,
        extra_vars: Option<&HashMap<String, String>>,
    ) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                let key = &caps[1];
                self.resolve(key, request_number, extra_vars)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Recursively substitute placeholders in every string leaf of a JSON
    /// value. Non-string leaves are copied unchanged.
    pub fn substitute_value(&self, value: &Value, request_number: u64) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute(s, request_number)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.substitute_value(item, request_number))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_value(v, request_number)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve(
        &self,
        key: &str,
        request_number: u64,
        extra_vars: Option<&HashMap<String, String>>,
    ) -> Option<String> {
        if let Some((prefix, name)) = key.split_once(':') {
            return match prefix {
                "env" => env::var(name).ok(),
                "target" => env::var(format!("TARGET_{}", name.to_uppercase())).ok(),
                _ => None,
            };
        }

        if let Some(extra) = extra_vars {
            if let Some(value) = extra.get(key) {
                return Some(value.clone());
            }
        }

        if let Some(value) = self.variables.get(key) {
            return Some(value.clone());
        }

        builtin_value(key, request_number)
    }
}

fn builtin_value(name: &str, request_number: u64) -> Option<String> {
    match name {
        "uuid" => Some(Uuid::new_v4().to_string()),
        "timestamp" => Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        "timestamp_unix" => Some(Utc::now().timestamp().to_string()),
        "request_number" => Some(request_number.to_string()),
        "random_int" => Some(rand::thread_rng().gen_range(0..1_000_000).to_string()),
        _ => None,
    }
}
