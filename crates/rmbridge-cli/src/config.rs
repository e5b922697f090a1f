//! Configuration file – reads/writes `~/.rmbridge/config.toml`.
//!
//! The file holds a serialised [`ClientConfig`]; missing fields take their
//! defaults.

use std::fs;
use std::path::{Path, PathBuf};

use rmbridge_runtime::ClientConfig;

/// Return the path to `~/.rmbridge/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".rmbridge").join("config.toml")
}

/// Load the config from disk with environment overrides applied. Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<ClientConfig>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<ClientConfig>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `RMBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `RMBRIDGE_APP_ID` | `app_id` |
/// | `RMBRIDGE_LIBRARY_PATH` | `library_path` |
/// | `RMBRIDGE_DISCOVERY_TIMEOUT_SECS` | `discovery_timeout_secs` |
/// | `RMBRIDGE_REQUEST_TIMEOUT_MS` | `request_timeout_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut ClientConfig) {
    if let Some(id) = parsed_var("RMBRIDGE_APP_ID") {
        cfg.app_id = id;
    }
    if let Ok(v) = std::env::var("RMBRIDGE_LIBRARY_PATH")
        && !v.is_empty()
    {
        cfg.library_path = Some(PathBuf::from(v));
    }
    if let Some(secs) = parsed_var("RMBRIDGE_DISCOVERY_TIMEOUT_SECS") {
        cfg.discovery_timeout_secs = secs;
    }
    if let Some(ms) = parsed_var("RMBRIDGE_REQUEST_TIMEOUT_MS") {
        cfg.request_timeout_ms = ms;
    }
}

/// Default config with environment overrides applied, for when no usable
/// file exists.
pub fn defaults() -> ClientConfig {
    let mut cfg = ClientConfig::default();
    apply_env_overrides(&mut cfg);
    cfg
}

fn parsed_var(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.rmbridge/` if necessary.
pub fn save(cfg: &ClientConfig) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &ClientConfig, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
