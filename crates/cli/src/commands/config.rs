use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::AppConfig;
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::{load_config, CommandResult};

/// Renders the effective configuration, one `key = value (source: ...)` line per setting.
/// Secrets are never printed.
pub fn run() -> CommandResult {
    match load_config("config") {
        Ok(config) => CommandResult::success("config", render(&config)),
        Err(failure) => failure,
    }
}

pub fn render(config: &AppConfig) -> String {
    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let api_key = config.llm.api_key.as_ref().map(|key| redact_secret(key.expose_secret()));
    let entries: Vec<(&str, &str, String)> = vec![
        ("database.url", "CONCIERGE_DATABASE_URL", config.database.url.clone()),
        (
            "database.max_connections",
            "CONCIERGE_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        (
            "database.timeout_secs",
            "CONCIERGE_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        ("reporting.url", "CONCIERGE_REPORTING_URL", config.reporting.url.clone()),
        (
            "reporting.timeout_secs",
            "CONCIERGE_REPORTING_TIMEOUT_SECS",
            config.reporting.timeout_secs.to_string(),
        ),
        ("llm.provider", "CONCIERGE_LLM_PROVIDER", format!("{:?}", config.llm.provider)),
        ("llm.model", "CONCIERGE_LLM_MODEL", config.llm.model.clone()),
        (
            "llm.base_url",
            "CONCIERGE_LLM_BASE_URL",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        ("llm.api_key", "CONCIERGE_LLM_API_KEY", api_key.unwrap_or_else(|| "<unset>".to_string())),
        ("llm.timeout_secs", "CONCIERGE_LLM_TIMEOUT_SECS", config.llm.timeout_secs.to_string()),
        ("llm.max_retries", "CONCIERGE_LLM_MAX_RETRIES", config.llm.max_retries.to_string()),
        ("server.bind_address", "CONCIERGE_SERVER_BIND_ADDRESS", config.server.bind_address.clone()),
        ("server.port", "CONCIERGE_SERVER_PORT", config.server.port.to_string()),
        (
            "server.graceful_shutdown_secs",
            "CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs.to_string(),
        ),
        (
            "server.rate_limit_gc_interval_secs",
            "CONCIERGE_SERVER_RATE_LIMIT_GC_INTERVAL_SECS",
            config.server.rate_limit_gc_interval_secs.to_string(),
        ),
        (
            "chat.history_window",
            "CONCIERGE_CHAT_HISTORY_WINDOW",
            config.chat.history_window.to_string(),
        ),
        ("logging.level", "CONCIERGE_LOGGING_LEVEL", config.logging.level.clone()),
        ("logging.format", "CONCIERGE_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        entries
            .into_iter()
            .map(|(key, env_key, value)| render_line(key, &value, source(key, env_key))),
    );
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a short vendor prefix such as `sk-ant` so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.rsplit_once('-') {
        Some((prefix, _)) if prefix.len() <= 8 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}
