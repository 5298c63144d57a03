//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tgforward/config.json`) and environment.
//! Everything the forwarder needs at runtime is resolved once into [`ForwarderSettings`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::client::{AppIdentity, ChatRef};

const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_SESSION_NAME: &str = "session";
const DEFAULT_LOG_FILE: &str = "forwarder.log";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Application identity (api id + hash).
    #[serde(default)]
    pub app: AppConfig,

    /// Source and target chats.
    #[serde(default)]
    pub forward: ForwardConfig,

    /// Session store location.
    #[serde(default)]
    pub session: SessionConfig,

    /// Activity log location.
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Application identity pair. Overridden by TGFORWARD_API_ID / TGFORWARD_API_HASH env.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub api_id: Option<i64>,
    pub api_hash: Option<String>,
}

/// Which chat to listen on and where to forward. Either a numeric id (e.g. "-1002524727804") or "@username".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardConfig {
    pub source: Option<String>,
    pub target: Option<String>,
}

/// Session store: `name` resolves to `<config dir>/<name>.session` unless `path` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub name: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Activity log file. Relative paths are resolved against the config file's parent.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot API base URL (default https://api.telegram.org). Overridden by TELEGRAM_API_BASE env.
    pub api_base: Option<String>,
}

/// Fully resolved runtime settings for the forwarder service.
#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub identity: AppIdentity,
    pub source: ChatRef,
    pub target: ChatRef,
    pub session_path: PathBuf,
    pub log_file: PathBuf,
    pub api_base: String,
}

/// Read an env var, treating empty or whitespace-only values as unset.
fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_relative(config_path: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_parent(config_path).join(p)
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TGFORWARD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".tgforward").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, the default path, or TGFORWARD_CONFIG_PATH. Missing file => default config.
/// Returns the config and the path that was used (for resolving relative paths).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Resolve the activity log path: env TGFORWARD_LOG_FILE overrides config; default `<config dir>/forwarder.log`.
/// Resolved separately from the rest so the log exists before anything else can fail.
pub fn resolve_log_file(config: &Config, config_path: &Path) -> PathBuf {
    if let Some(p) = env_nonempty("TGFORWARD_LOG_FILE") {
        return PathBuf::from(p);
    }
    match &config.log.file {
        Some(p) if !p.as_os_str().is_empty() => resolve_relative(config_path, p),
        _ => config_parent(config_path).join(DEFAULT_LOG_FILE),
    }
}

/// Resolve the session store path: explicit `session.path`, else `<config dir>/<session.name>.session`.
pub fn resolve_session_path(config: &Config, config_path: &Path) -> PathBuf {
    if let Some(p) = config
        .session
        .path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        return resolve_relative(config_path, p);
    }
    let name = config
        .session
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSION_NAME);
    config_parent(config_path).join(format!("{}.session", name))
}

/// Resolve the Bot API base: env TELEGRAM_API_BASE overrides config.
pub fn resolve_api_base(config: &Config) -> String {
    env_nonempty("TELEGRAM_API_BASE")
        .or_else(|| {
            config
                .telegram
                .api_base
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the application identity: env TGFORWARD_API_ID / TGFORWARD_API_HASH override config.
pub fn resolve_identity(config: &Config) -> Result<AppIdentity> {
    let api_id = match env_nonempty("TGFORWARD_API_ID") {
        Some(s) => s
            .parse::<i64>()
            .with_context(|| format!("TGFORWARD_API_ID is not an integer: {}", s))?,
        None => config
            .app
            .api_id
            .context("app.apiId is not configured (set it in config or TGFORWARD_API_ID)")?,
    };
    let api_hash = env_nonempty("TGFORWARD_API_HASH")
        .or_else(|| {
            config
                .app
                .api_hash
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .context("app.apiHash is not configured (set it in config or TGFORWARD_API_HASH)")?;
    Ok(AppIdentity { api_id, api_hash })
}

fn resolve_chat(env_key: &str, value: Option<&String>, field: &str) -> Result<ChatRef> {
    let raw = env_nonempty(env_key)
        .or_else(|| value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        .with_context(|| format!("{} is not configured (set it in config or {})", field, env_key))?;
    raw.parse::<ChatRef>()
        .with_context(|| format!("invalid {}: {}", field, raw))
}

/// Resolve everything the forwarder needs. Fails when identity or chats are missing or invalid.
pub fn resolve_settings(config: &Config, config_path: &Path) -> Result<ForwarderSettings> {
    let identity = resolve_identity(config)?;
    let source = resolve_chat("TGFORWARD_SOURCE", config.forward.source.as_ref(), "forward.source")?;
    let target = resolve_chat("TGFORWARD_TARGET", config.forward.target.as_ref(), "forward.target")?;
    Ok(ForwarderSettings {
        identity,
        source,
        target,
        session_path: resolve_session_path(config, config_path),
        log_file: resolve_log_file(config, config_path),
        api_base: resolve_api_base(config),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        serde_json::from_str(
            r#"{
                "app": { "apiId": 12345, "apiHash": "abc" },
                "forward": { "source": "-1002524727804", "target": "@signalcheck" }
            }"#,
        )
        .expect("parse sample config")
    }

    #[test]
    fn session_path_defaults_to_named_store_next_to_config() {
        let config = Config::default();
        let path = Path::new("/home/user/.tgforward/config.json");
        assert_eq!(
            resolve_session_path(&config, path),
            PathBuf::from("/home/user/.tgforward/session.session")
        );
    }

    #[test]
    fn session_path_uses_custom_name() {
        let mut config = Config::default();
        config.session.name = Some("relay".to_string());
        let path = Path::new("/srv/fwd/config.json");
        assert_eq!(
            resolve_session_path(&config, path),
            PathBuf::from("/srv/fwd/relay.session")
        );
    }

    #[test]
    fn session_path_override_relative() {
        let mut config = Config::default();
        config.session.path = Some(PathBuf::from("state/bot.session"));
        let path = Path::new("/srv/fwd/config.json");
        assert_eq!(
            resolve_session_path(&config, path),
            PathBuf::from("/srv/fwd/state/bot.session")
        );
    }

    #[test]
    fn log_file_override_absolute() {
        let mut config = Config::default();
        config.log.file = Some(PathBuf::from("/var/log/fwd.log"));
        let path = Path::new("/srv/fwd/config.json");
        assert_eq!(
            resolve_log_file(&config, path),
            PathBuf::from("/var/log/fwd.log")
        );
    }

    #[test]
    fn settings_from_config_file() {
        let config = sample();
        let path = Path::new("/srv/fwd/config.json");
        let settings = resolve_settings(&config, path).expect("settings");
        assert_eq!(settings.identity.api_id, 12345);
        assert_eq!(settings.identity.api_hash, "abc");
        assert_eq!(settings.source, ChatRef::Id(-1002524727804));
        assert_eq!(settings.target, ChatRef::Username("signalcheck".to_string()));
        assert_eq!(settings.log_file, PathBuf::from("/srv/fwd/forwarder.log"));
    }

    #[test]
    fn settings_reject_invalid_source() {
        let mut config = sample();
        config.forward.source = Some("not-a-chat".to_string());
        let err = resolve_settings(&config, Path::new("config.json")).unwrap_err();
        assert!(err.to_string().contains("forward.source"));
    }

    #[test]
    fn settings_require_target() {
        let mut config = sample();
        config.forward.target = None;
        assert!(resolve_settings(&config, Path::new("config.json")).is_err());
    }
}
