use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the shell configuration inside [`config_dir`].
pub const SHELL_CONFIG_FILE: &str = "shell.json";

/// Get the config directory using platform-appropriate location.
///
/// - macOS: `~/Library/Application Support/extshell/`
/// - Linux: `~/.config/extshell/` (or `$XDG_CONFIG_HOME`)
/// - Windows: `%APPDATA%/extshell/`
///
/// Falls back to `~/.extshell/` if the platform dir is unavailable.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("extshell"))
        .unwrap_or_else(fallback_dotdir)
}

fn fallback_dotdir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".extshell")
}

/// Load a JSON config file from `dir`, returning Default if missing or corrupt.
/// Corrupt or unreadable files are logged so a silent reset is visible.
pub fn load_json_config<T: DeserializeOwned + Default>(dir: &Path, filename: &str) -> T {
    let path = dir.join(filename);
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read config");
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Corrupt config, using defaults");
            T::default()
        }
    }
}

/// Save a JSON config file atomically (temp file + rename).
/// Sets 0600 permissions on Unix.
pub fn save_json_config<T: Serialize>(dir: &Path, filename: &str, value: &T) -> anyhow::Result<()> {
    use anyhow::Context;

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

    let json = serde_json::to_string_pretty(value).context("Failed to serialize config")?;

    let target = dir.join(filename);
    let temp = dir.join(format!("{}.tmp.{}", filename, std::process::id()));

    std::fs::write(&temp, &json).context("Failed to write temp config")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp, perms).context("Failed to set config permissions")?;
    }

    // Either the old file or the new one exists, never a partial write
    if let Err(e) = std::fs::rename(&temp, &target) {
        let _ = std::fs::remove_file(&temp);
        return Err(e).context("Failed to commit config");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// ShellConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellConfig {
    /// User-installed extensions. Defaults to `{config_dir}/extensions`.
    #[serde(default)]
    pub extensions_dir: Option<PathBuf>,
    /// Extensions shipped with the application.
    #[serde(default)]
    pub bundled_extensions_dir: Option<PathBuf>,
    /// Delay used to coalesce directory sync broadcasts
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,
    /// Upper bound on how long startup waits for bundled extensions to enable
    #[serde(default = "default_bundled_wait_timeout_secs")]
    pub bundled_wait_timeout_secs: u64,
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_log_ring_capacity")]
    pub log_ring_capacity: usize,
    /// Re-scan the user extensions dir when it changes on disk
    #[serde(default = "default_true")]
    pub watch_extensions: bool,
}

fn default_sync_debounce_ms() -> u64 {
    50
}

fn default_bundled_wait_timeout_secs() -> u64 {
    10
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_ring_capacity() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            extensions_dir: None,
            bundled_extensions_dir: None,
            sync_debounce_ms: default_sync_debounce_ms(),
            bundled_wait_timeout_secs: default_bundled_wait_timeout_secs(),
            log_filter: default_log_filter(),
            log_ring_capacity: default_log_ring_capacity(),
            watch_extensions: true,
        }
    }
}

impl ShellConfig {
    /// Directory scanned for user extensions.
    pub fn user_extensions_dir(&self) -> PathBuf {
        self.extensions_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("extensions"))
    }

    pub fn sync_debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sync_debounce_ms)
    }

    pub fn bundled_wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.bundled_wait_timeout_secs)
    }
}

pub fn load_shell_config() -> ShellConfig {
    load_json_config(&config_dir(), SHELL_CONFIG_FILE)
}

pub fn save_shell_config(config: &ShellConfig) -> anyhow::Result<()> {
    save_json_config(&config_dir(), SHELL_CONFIG_FILE, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn shell_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let cfg = ShellConfig {
            extensions_dir: Some(PathBuf::from("/opt/ext")),
            bundled_extensions_dir: Some(PathBuf::from("/usr/share/extshell/bundled")),
            sync_debounce_ms: 120,
            bundled_wait_timeout_secs: 3,
            log_filter: "extshell_lib=debug".to_string(),
            log_ring_capacity: 64,
            watch_extensions: false,
        };
        save_json_config(dir.path(), SHELL_CONFIG_FILE, &cfg).unwrap();
        let loaded: ShellConfig = load_json_config(dir.path(), SHELL_CONFIG_FILE);
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SHELL_CONFIG_FILE), r#"{"syncDebounceMs":5}"#).unwrap();
        let loaded: ShellConfig = load_json_config(dir.path(), SHELL_CONFIG_FILE);
        assert_eq!(loaded.sync_debounce_ms, 5);
        assert_eq!(loaded.bundled_wait_timeout_secs, 10);
        assert_eq!(loaded.log_filter, "info");
        assert!(loaded.watch_extensions);
    }

    #[test]
    fn corrupt_file_returns_default() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SHELL_CONFIG_FILE), "{not json").unwrap();
        let loaded: ShellConfig = load_json_config(dir.path(), SHELL_CONFIG_FILE);
        assert_eq!(loaded, ShellConfig::default());
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let loaded: ShellConfig = load_json_config(dir.path(), "nope.json");
        assert_eq!(loaded, ShellConfig::default());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        save_json_config(dir.path(), "x.json", &ShellConfig::default()).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["x.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        save_json_config(dir.path(), "x.json", &ShellConfig::default()).unwrap();
        let mode = fs::metadata(dir.path().join("x.json")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn user_extensions_dir_prefers_explicit_path() {
        let cfg = ShellConfig {
            extensions_dir: Some(PathBuf::from("/tmp/my-ext")),
            ..ShellConfig::default()
        };
        assert_eq!(cfg.user_extensions_dir(), PathBuf::from("/tmp/my-ext"));
        assert!(ShellConfig::default().user_extensions_dir().ends_with("extensions"));
    }
}
