use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::types::ProviderDefinition;

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Replaces `${NAME}` occurrences with the process environment variable of
/// the same name. An unset variable is left as the literal placeholder and
/// logged at warn — this is applied only to `env` string values (§4.5 step 2).
fn resolve_env_vars(value: &str) -> String {
    env_var_pattern()
        .replace_all(value, |caps: &regex::Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(resolved) => resolved,
                Err(_) => {
                    tracing::warn!(variable = name, "environment placeholder unset; left literal");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn resolve_env_map(env: HashMap<String, String>) -> HashMap<String, String> {
    env.into_iter()
        .map(|(k, v)| (k, resolve_env_vars(&v)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawMcpEntry {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigPushParams {
    mcps: HashMap<String, RawMcpEntry>,
}

/// Handles `config/push` requests: resolves transport selection and
/// environment placeholders, validates, and hands the resolved provider set
/// to the supervisor as a full replacement.
pub struct ConfigIntake {
    supervisor: Arc<crate::supervisor::ToolProviderSupervisor>,
}

impl ConfigIntake {
    pub fn new(supervisor: Arc<crate::supervisor::ToolProviderSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Implements §4.5 end to end, returning the JSON-RPC `result` object to
    /// send back to the Control Plane.
    pub async fn handle_push(&self, params: Value) -> Value {
        let parsed: ConfigPushParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "config/push payload did not parse");
                return serde_json::json!({"status": "error", "message": e.to_string()});
            }
        };

        let mut accepted = HashMap::new();
        for (name, entry) in parsed.mcps {
            match Self::resolve_entry(&name, entry) {
                Ok(definition) => {
                    accepted.insert(name, definition);
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "skipping invalid provider entry");
                }
            }
        }

        let count = accepted.len();
        self.supervisor.initialize(accepted).await;

        serde_json::json!({"status": "ok", "mcps_received": count})
    }

    fn resolve_entry(name: &str, entry: RawMcpEntry) -> Result<ProviderDefinition, String> {
        match (entry.url, entry.command) {
            (Some(_), Some(_)) => Err(format!("provider '{name}' specifies both url and command")),
            (Some(url), None) => {
                if url.is_empty() {
                    return Err(format!("provider '{name}' has an empty url"));
                }
                Ok(ProviderDefinition::Http { url })
            }
            (None, Some(command)) => {
                if command.trim().is_empty() {
                    return Err(format!("provider '{name}' has an empty command"));
                }
                Ok(ProviderDefinition::Stdio {
                    command,
                    args: entry.args,
                    env: resolve_env_map(entry.env),
                })
            }
            (None, None) => Err(format!("provider '{name}' specifies neither url nor command")),
        }
    }
}

#[async_trait::async_trait]
impl crate::engine::ConfigSink for ConfigIntake {
    async fn push(&self, params: Value) -> Value {
        self.handle_push(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_set_variable() {
        std::env::set_var("EDGE_RUNNER_TEST_VAR", "resolved");
        assert_eq!(resolve_env_vars("${EDGE_RUNNER_TEST_VAR}"), "resolved");
        std::env::remove_var("EDGE_RUNNER_TEST_VAR");
    }

    #[test]
    fn leaves_unset_variable_literal() {
        std::env::remove_var("EDGE_RUNNER_DEFINITELY_UNSET");
        assert_eq!(
            resolve_env_vars("${EDGE_RUNNER_DEFINITELY_UNSET}"),
            "${EDGE_RUNNER_DEFINITELY_UNSET}"
        );
    }

    #[test]
    fn leaves_invalid_name_literal() {
        assert_eq!(resolve_env_vars("${}"), "${}");
    }

    #[test]
    fn resolve_entry_rejects_both_url_and_command() {
        let entry = RawMcpEntry {
            command: Some("bin".into()),
            args: vec![],
            env: HashMap::new(),
            url: Some("http://x".into()),
        };
        assert!(ConfigIntake::resolve_entry("dup", entry).is_err());
    }

    #[test]
    fn resolve_entry_builds_stdio_definition() {
        let mut env = HashMap::new();
        env.insert("H".to_string(), "${HOME_X}".to_string());
        std::env::set_var("HOME_X", "/h");
        let entry = RawMcpEntry {
            command: Some("bin".into()),
            args: vec!["-q".into()],
            env,
            url: None,
        };
        let definition = ConfigIntake::resolve_entry("fs", entry).unwrap();
        match definition {
            ProviderDefinition::Stdio { command, args, env } => {
                assert_eq!(command, "bin");
                assert_eq!(args, vec!["-q".to_string()]);
                assert_eq!(env.get("H").unwrap(), "/h");
            }
            other => panic!("expected stdio definition, got {other:?}"),
        }
        std::env::remove_var("HOME_X");
    }
}
