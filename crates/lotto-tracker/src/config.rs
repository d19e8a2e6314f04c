use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::identity;

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_STATE_DIR: &str = "./data";
const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 15_000;
const DEFAULT_COMPLETION_GRACE_MS: u64 = 5000;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub reconcile_interval: Duration,
    /// How long a finished download stays listed before it is dropped.
    pub completion_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reconcile_interval: Duration::from_millis(DEFAULT_RECONCILE_INTERVAL_MS),
            completion_grace: Duration::from_millis(DEFAULT_COMPLETION_GRACE_MS),
        }
    }
}

impl TrackerConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_millis(
                env_u64("LOTTO_POLL_INTERVAL_MS")
                    .map(|v| v.clamp(250, 60_000))
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            reconcile_interval: Duration::from_millis(
                env_u64("LOTTO_RECONCILE_INTERVAL_MS")
                    .map(|v| v.clamp(1000, 10 * 60 * 1000))
                    .unwrap_or(DEFAULT_RECONCILE_INTERVAL_MS),
            ),
            completion_grace: Duration::from_millis(
                env_u64("LOTTO_COMPLETION_GRACE_MS")
                    .map(|v| v.clamp(0, 60_000))
                    .unwrap_or(DEFAULT_COMPLETION_GRACE_MS),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend_url: String,
    pub state_dir: PathBuf,
    pub known_items_path: Option<PathBuf>,
    pub tracker: TrackerConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            backend_url: env_string("LOTTO_BACKEND_URL")
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            state_dir: env_string("LOTTO_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            known_items_path: env_string("LOTTO_KNOWN_ITEMS_PATH").map(PathBuf::from),
            tracker: TrackerConfig::from_env(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct KnownItem {
    #[serde(alias = "kinopoisk_id", alias = "primary_id")]
    id: serde_json::Value,
    #[serde(default)]
    name: String,
}

/// Movies currently shown in the gallery, keyed by movie id.
pub fn load_known_items(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read known items {}", path.display()))?;
    parse_known_items(&raw).with_context(|| format!("parse known items {}", path.display()))
}

/// Accepts `{"<id>": "<title>", ...}` or `[{"id": .., "name": ..}, ...]`.
pub fn parse_known_items(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let mut out = HashMap::new();

    match value {
        serde_json::Value::Object(map) => {
            for (id, title) in map {
                let Some(id) = identity::normalize(Some(&id)) else {
                    continue;
                };
                let title = title.as_str().unwrap_or_default().trim().to_string();
                out.insert(id, title);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                let item: KnownItem = serde_json::from_value(item)?;
                let id = match item.id {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Number(n) => n.to_string(),
                    other => anyhow::bail!("unsupported item id: {other}"),
                };
                let Some(id) = identity::normalize(Some(&id)) else {
                    continue;
                };
                out.insert(id, item.name.trim().to_string());
            }
        }
        _ => anyhow::bail!("expected an object or an array"),
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(3));
        assert_eq!(cfg.reconcile_interval, Duration::from_secs(15));
        assert_eq!(cfg.completion_grace, Duration::from_secs(5));
    }

    #[test]
    fn known_items_from_object() {
        let items = parse_known_items(r#"{"7": "Solaris", " 8 ": " Stalker ", "": "x"}"#).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items["7"], "Solaris");
        assert_eq!(items["8"], "Stalker");
    }

    #[test]
    fn known_items_from_array() {
        let items = parse_known_items(
            r#"[{"kinopoisk_id": 7, "name": "Solaris"}, {"id": "8"}]"#,
        )
        .unwrap();
        assert_eq!(items["7"], "Solaris");
        assert_eq!(items["8"], "");
    }

    #[test]
    fn known_items_reject_garbage() {
        assert!(parse_known_items("42").is_err());
        assert!(parse_known_items("[{\"id\": [1]}]").is_err());
        assert!(parse_known_items("{").is_err());
    }
}
