//! Variable interpolation for stack definitions and bootstrap plans.
//!
//! Supports variables like:
//! - `${config.KEY}` - Stack configuration value
//! - `${secret.KEY}` - Secret stack configuration value
//! - `${env.VAR_NAME}` - Environment variable
//! - `${fact.NAME}` - Host fact gathered during bootstrap
//! - `${stack.name}` / `${stack.namespace}` - The stack being declared
//! - `${stack.OTHER.KEY}` - Output of another stack (resolved at apply time)
//! - `${resource.NAME.PATH}` - Output of a resource (resolved at apply time)
//!
//! Unknown variables are left in place.

use keel_core::secret::{Secret, SecretMasker};
use keel_core::value::{PropertyMap, PropertyValue, Reference, TemplatePart};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

/// Variable context containing all values available for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Name of the stack being declared
    pub stack: String,
    /// Namespace of the stack being declared
    pub namespace: Option<String>,
    /// Plain configuration values
    pub config: HashMap<String, String>,
    /// Secret configuration values (masked in logs)
    pub secrets: HashMap<String, Secret>,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Host facts gathered while bootstrapping
    pub facts: HashMap<String, String>,
}

/// One resolved `${...}` expression.
#[derive(Debug, Clone)]
enum Resolved {
    Plain(String),
    Secret(Secret),
    Deferred(Reference),
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_-]*(?:\.[a-zA-Z0-9_\-/]+)*)\}").unwrap()
});

impl VariableContext {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ..Default::default()
        }
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    fn resolve(&self, var_name: &str) -> ConfigResult<Option<Resolved>> {
        let parts: Vec<&str> = var_name.splitn(2, '.').collect();

        let resolved = match parts.as_slice() {
            ["config", key] => match self.config.get(*key) {
                Some(v) => Some(Resolved::Plain(v.clone())),
                None if self.secrets.contains_key(*key) => {
                    return Err(ConfigError::InvalidReference(format!(
                        "${{config.{key}}} names a secret; use ${{secret.{key}}}"
                    )));
                }
                None => return Err(ConfigError::MissingConfig((*key).to_string())),
            },
            ["secret", key] => match self.secrets.get(*key) {
                Some(s) => Some(Resolved::Secret(s.clone())),
                None if self.config.contains_key(*key) => {
                    return Err(ConfigError::NotSecret((*key).to_string()));
                }
                None => return Err(ConfigError::MissingConfig((*key).to_string())),
            },
            ["env", name] => self.env.get(*name).cloned().map(Resolved::Plain),
            ["fact", name] => self.facts.get(*name).cloned().map(Resolved::Plain),
            ["stack", "name"] => Some(Resolved::Plain(self.stack.clone())),
            ["stack", "namespace"] => self.namespace.clone().map(Resolved::Plain),
            ["stack", _] | ["resource", _] => match Reference::parse(var_name) {
                Some(r) => Some(Resolved::Deferred(r)),
                None => return Err(ConfigError::InvalidReference(var_name.to_string())),
            },
            _ => None,
        };
        Ok(resolved)
    }

    /// Interpolate a string into a plain string. Deferred references and
    /// unknown variables are left in place; secrets are substituted.
    pub fn interpolate(&self, input: &str) -> ConfigResult<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in VAR_REGEX.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&input[last..whole.start()]);
            match self.resolve(&caps[1])? {
                Some(Resolved::Plain(v)) => out.push_str(&v),
                Some(Resolved::Secret(s)) => out.push_str(s.expose()),
                Some(Resolved::Deferred(_)) | None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Interpolate a string into a property value.
    ///
    /// A string consisting of a single variable becomes that value itself
    /// (a secret or a reference). Mixed strings become a template when they
    /// embed references, and are wrapped as secret when any part is secret.
    pub fn interpolate_value(&self, input: &str) -> ConfigResult<PropertyValue> {
        let mut parts: Vec<TemplatePart> = Vec::new();
        let mut literal = String::new();
        let mut has_secret = false;
        let mut has_ref = false;
        let mut last = 0;

        for caps in VAR_REGEX.captures_iter(input) {
            let Some(whole) = caps.get(0) else { continue };
            literal.push_str(&input[last..whole.start()]);
            last = whole.end();

            match self.resolve(&caps[1])? {
                Some(Resolved::Plain(v)) => literal.push_str(&v),
                Some(Resolved::Secret(s)) => {
                    if whole.as_str() == input {
                        return Ok(PropertyValue::secret(PropertyValue::string(s.expose())));
                    }
                    has_secret = true;
                    literal.push_str(s.expose());
                }
                Some(Resolved::Deferred(r)) => {
                    if whole.as_str() == input {
                        return Ok(PropertyValue::Ref(r));
                    }
                    has_ref = true;
                    if !literal.is_empty() {
                        parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                    }
                    parts.push(TemplatePart::Ref(r));
                }
                None => literal.push_str(whole.as_str()),
            }
        }
        literal.push_str(&input[last..]);

        let value = if has_ref {
            if !literal.is_empty() {
                parts.push(TemplatePart::Literal(literal));
            }
            PropertyValue::Template(parts)
        } else {
            PropertyValue::String(literal)
        };

        Ok(if has_secret {
            PropertyValue::secret(value)
        } else {
            value
        })
    }

    /// Interpolate every string in a value tree.
    pub fn interpolate_tree(&self, value: &PropertyValue) -> ConfigResult<PropertyValue> {
        Ok(match value {
            PropertyValue::String(s) => self.interpolate_value(s)?,
            PropertyValue::List(items) => PropertyValue::List(
                items
                    .iter()
                    .map(|i| self.interpolate_tree(i))
                    .collect::<ConfigResult<_>>()?,
            ),
            PropertyValue::Map(map) => PropertyValue::Map(self.interpolate_map(map)?),
            PropertyValue::Secret(inner) => PropertyValue::secret(self.interpolate_tree(inner)?),
            other => other.clone(),
        })
    }

    pub fn interpolate_map(&self, map: &PropertyMap) -> ConfigResult<PropertyMap> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.interpolate_tree(v)?)))
            .collect()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> ConfigResult<Vec<String>> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Names of the `${secret.*}` and `${env.*}` variables used in a string.
    pub fn find_variables_in_string(input: &str, scope: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .filter_map(|caps| {
                caps[1]
                    .strip_prefix(scope)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(str::to_string)
            })
            .collect()
    }

    /// A masker covering every secret value in the context.
    pub fn secret_masker(&self) -> SecretMasker {
        let mut masker = SecretMasker::new();
        for secret in self.secrets.values() {
            masker.add(secret.expose());
        }
        masker
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            ctx: VariableContext::new(stack),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.ctx.namespace = Some(namespace.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.config.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), Secret::new(value));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> VariableContext {
        VariableContextBuilder::new("app")
            .with_namespace("app")
            .with_config("db_name", "appdb")
            .with_secret("api_key", "sk-live-123")
            .with_env("HOME", "/home/ops")
            .build()
    }

    #[test]
    fn test_basic_interpolation() {
        let result = ctx()
            .interpolate("db ${config.db_name} in ${stack.namespace} for ${env.HOME}")
            .unwrap();
        assert_eq!(result, "db appdb in app for /home/ops");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let result = ctx().interpolate("Unknown: ${unknown.var}").unwrap();
        assert_eq!(result, "Unknown: ${unknown.var}");
    }

    #[test]
    fn test_missing_config_is_an_error() {
        let err = ctx().interpolate("${config.nope}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingConfig(k) if k == "nope"));
    }

    #[test]
    fn test_plain_key_through_secret_scope_rejected() {
        let err = ctx().interpolate_value("${secret.db_name}").unwrap_err();
        assert!(matches!(err, ConfigError::NotSecret(_)));
    }

    #[test]
    fn test_whole_string_secret_becomes_secret_value() {
        let value = ctx().interpolate_value("${secret.api_key}").unwrap();
        assert!(value.is_secret());
        assert!(!format!("{value:?}").contains("sk-live-123"));
    }

    #[test]
    fn test_embedded_secret_taints_string() {
        let value = ctx().interpolate_value("Bearer ${secret.api_key}").unwrap();
        assert!(value.is_secret());
        assert_eq!(
            value.to_plain_json().unwrap(),
            serde_json::json!("Bearer sk-live-123")
        );
    }

    #[test]
    fn test_references_stay_symbolic() {
        let value = ctx().interpolate_value("${stack.database.host}").unwrap();
        assert_eq!(
            value,
            PropertyValue::Ref(Reference::Stack {
                stack: "database".into(),
                output: "host".into()
            })
        );

        let value = ctx()
            .interpolate_value("postgres://${resource.db.status.host}:5432/${config.db_name}")
            .unwrap();
        match value {
            PropertyValue::Template(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], TemplatePart::Literal("postgres://".into()));
                assert_eq!(parts[2], TemplatePart::Literal(":5432/appdb".into()));
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_find_variables() {
        let found =
            VariableContext::find_variables_in_string("a ${env.TOKEN} b ${env.OTHER} ${x}", "env");
        assert_eq!(found, vec!["TOKEN", "OTHER"]);
    }

    #[test]
    fn test_masker_covers_secrets() {
        let masker = ctx().secret_masker();
        assert_eq!(masker.mask("key=sk-live-123"), "key=[secret]");
    }
}
