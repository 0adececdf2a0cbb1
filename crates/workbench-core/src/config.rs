use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use workbench_types::Mode;

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Engine configuration resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub workspaces_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub model_fast: String,
    pub model_pro: String,

    pub require_approval_shell: bool,
    pub require_approval_fs_write: bool,
    pub require_approval_fs_delete: bool,
    pub require_approval_browser_click: bool,

    pub scheduler_enabled: bool,
    pub scheduler_tick_seconds: u64,

    pub shell_allow: bool,
    pub shell_container_image: Option<String>,

    pub browser_enabled: bool,
    pub browser_headless: bool,
    pub browser_timeout_ms: u64,

    pub ui_admin_token: Option<String>,
    pub log_retention_days: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_str(
            "DATA_DIR",
            &std::env::current_dir()
                .map(|d| d.join("data").display().to_string())
                .unwrap_or_else(|_| "data".to_string()),
        ));
        let db_path = env_opt("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("workbench.db"));
        let workspaces_dir = env_opt("WORKSPACES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("workspaces"));
        let artifacts_dir = env_opt("ARTIFACTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("artifacts"));
        let logs_dir = env_opt("LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs"));

        Self {
            data_dir,
            db_path,
            workspaces_dir,
            artifacts_dir,
            logs_dir,
            llm_base_url: env_str("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            llm_api_key: env_str("OPENAI_API_KEY", "CHANGE_ME"),
            model_fast: env_str("OPENAI_MODEL_FAST", "gpt-4o-mini"),
            model_pro: env_str("OPENAI_MODEL_PRO", "gpt-4o"),
            require_approval_shell: env_bool("REQUIRE_APPROVAL_SHELL", true),
            require_approval_fs_write: env_bool("REQUIRE_APPROVAL_FS_WRITE", true),
            require_approval_fs_delete: env_bool("REQUIRE_APPROVAL_FS_DELETE", true),
            require_approval_browser_click: env_bool("REQUIRE_APPROVAL_BROWSER_CLICK", true),
            scheduler_enabled: env_bool("SCHEDULER_ENABLED", true),
            scheduler_tick_seconds: env_u64("SCHEDULER_TICK_SECONDS", 5),
            shell_allow: env_bool("SHELL_ALLOW", true),
            shell_container_image: if env_bool("SHELL_DOCKER_BACKEND", false) {
                Some(env_str("SHELL_DOCKER_IMAGE", "python:3.11-slim"))
            } else {
                None
            },
            browser_enabled: env_bool("BROWSER_ENABLED", true),
            browser_headless: env_bool("BROWSER_HEADLESS", true),
            browser_timeout_ms: env_u64("BROWSER_TIMEOUT_MS", 45_000),
            ui_admin_token: env_opt("UI_ADMIN_TOKEN"),
            log_retention_days: env_u64("LOG_RETENTION_DAYS", 14),
        }
    }

    /// Model id for a run mode, honoring live env overrides so settings
    /// updates apply without a restart.
    pub fn model_for(&self, mode: Mode) -> String {
        match mode {
            Mode::Fast => env_opt("OPENAI_MODEL_FAST").unwrap_or_else(|| self.model_fast.clone()),
            Mode::Pro => env_opt("OPENAI_MODEL_PRO").unwrap_or_else(|| self.model_pro.clone()),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.data_dir,
            &self.workspaces_dir,
            &self.artifacts_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn task_artifacts_dir(&self, task_id: &str) -> PathBuf {
        self.artifacts_dir.join(task_id)
    }
}

/// Keys the settings endpoint may persist and apply. Everything else is
/// ignored rather than rejected, so stale clients can't poison the process
/// environment.
pub const RUNTIME_ENV_ALLOWED_KEYS: &[&str] = &[
    "OPENAI_BASE_URL",
    "OPENAI_API_KEY",
    "OPENAI_MODEL_FAST",
    "OPENAI_MODEL_PRO",
    "OPENAI_MODEL_VISION",
    "OPENAI_MODEL_EMBEDDINGS",
    "OPENAI_MODEL_IMAGE",
    "OPENAI_MODEL_AUDIO_TRANSCRIBE",
    "OPENAI_MODEL_AUDIO_SPEECH",
    "OPENAI_MODEL_VIDEO",
    "SCHEDULER_ENABLED",
    "SCHEDULER_TICK_SECONDS",
    "REQUIRE_APPROVAL_SHELL",
    "REQUIRE_APPROVAL_FS_WRITE",
    "REQUIRE_APPROVAL_FS_DELETE",
    "REQUIRE_APPROVAL_BROWSER_CLICK",
    "SHELL_ALLOW",
    "SHELL_DOCKER_BACKEND",
    "SHELL_DOCKER_IMAGE",
    "BROWSER_ENABLED",
    "BROWSER_HEADLESS",
    "BROWSER_TIMEOUT_MS",
    "WORKBENCH_CITATIONS_MODE",
];

fn runtime_env_path(data_dir: &Path) -> PathBuf {
    data_dir.join("runtime_env.json")
}

/// Load persisted overrides, dropping keys outside the allowlist.
pub fn load_runtime_env(data_dir: &Path) -> HashMap<String, String> {
    let path = runtime_env_path(data_dir);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return HashMap::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&raw) else {
        return HashMap::new();
    };
    let Some(map) = value.as_object() else {
        return HashMap::new();
    };
    map.iter()
        .filter(|(k, _)| RUNTIME_ENV_ALLOWED_KEYS.contains(&k.as_str()))
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

/// Apply persisted overrides to the process environment at startup.
pub fn apply_runtime_env(data_dir: &Path) -> HashMap<String, String> {
    let applied = load_runtime_env(data_dir);
    for (key, value) in &applied {
        if !value.is_empty() {
            std::env::set_var(key, value);
        }
    }
    applied
}

/// Merge updates into the override file and apply non-empty values to the
/// process environment. Returns the full persisted map.
pub fn update_runtime_env(
    data_dir: &Path,
    updates: &HashMap<String, String>,
) -> std::io::Result<HashMap<String, String>> {
    let mut current = load_runtime_env(data_dir);
    for (key, value) in updates {
        if !RUNTIME_ENV_ALLOWED_KEYS.contains(&key.as_str()) {
            continue;
        }
        current.insert(key.clone(), value.clone());
        if !value.is_empty() {
            std::env::set_var(key, value);
        }
    }
    let path = runtime_env_path(data_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(&current).unwrap_or_else(|_| "{}".to_string());
    std::fs::write(&path, payload)?;
    Ok(current)
}
