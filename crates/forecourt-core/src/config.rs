// Configuration loading and parsing (forecourt.toml, credentials.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Assembled Config
// ---------------------------------------------------------------------------

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_SETTLE: Duration = Duration::from_millis(800);

#[derive(Debug, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    /// SQLite file backing the session store.
    pub storage_path: PathBuf,
    pub health_settle: Duration,
    /// Whether "remember me" also keeps the secret.
    pub remember_secret: bool,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub request_timeout: Duration,
    pub heartbeat: Duration,
}

impl Config {
    /// Defaults for everything but the remote URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            remote: RemoteConfig {
                url: url.into(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                heartbeat: DEFAULT_HEARTBEAT,
            },
            storage_path: default_storage_path(),
            health_settle: DEFAULT_HEALTH_SETTLE,
            remember_secret: false,
            credentials: CredentialsConfig::default(),
        }
    }
}

/// `forecourt.db` under the platform data directory, or the working
/// directory if none can be determined.
pub fn default_storage_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "forecourt")
        .map(|dirs| dirs.data_dir().join("forecourt.db"))
        .unwrap_or_else(|| PathBuf::from("forecourt.db"))
}

// ---------------------------------------------------------------------------
// forecourt.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ForecourtFile {
    remote: RemoteSection,
    #[serde(default)]
    storage: StorageSection,
    #[serde(default)]
    health: HealthSection,
    #[serde(default)]
    session: SessionSection,
}

#[derive(Debug, Deserialize)]
struct RemoteSection {
    url: String,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct StorageSection {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct HealthSection {
    #[serde(default = "default_settle_ms")]
    settle_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionSection {
    #[serde(default)]
    remember_secret: bool,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT.as_secs()
}

fn default_settle_ms() -> u64 {
    DEFAULT_HEALTH_SETTLE.as_millis() as u64
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub anon_key: Option<String>,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("anon_key", &self.anon_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/forecourt.toml` and (optionally)
/// `config/credentials.toml` relative to `base_dir`. Does not copy
/// defaults; see [`load_config`].
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let main_path = config_dir.join("forecourt.toml");
    let text = read_file(&main_path)?;
    let file: ForecourtFile = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let text = read_file(&credentials_path)?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    validate_file(&file)?;

    Ok(Config {
        remote: RemoteConfig {
            url: file.remote.url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(file.remote.request_timeout_secs),
            heartbeat: Duration::from_secs(file.remote.heartbeat_secs),
        },
        storage_path: file.storage.path.unwrap_or_else(default_storage_path),
        health_settle: Duration::from_millis(file.health.settle_ms),
        remember_secret: file.session.remember_secret,
        credentials,
    })
}

/// Copy every missing config file from `defaults/` into `config/`, never
/// overwriting. `.example` templates are skipped. Returns the files copied.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| ConfigError::DefaultsCopyError {
                message: format!("failed to read defaults entry: {e}"),
            })?
            .path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }

        let target = config_dir.join(file_name);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Load config relative to the working directory, copying defaults first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn validate_file(file: &ForecourtFile) -> Result<(), ConfigError> {
    let url = file.remote.url.trim();
    if url.is_empty() {
        return Err(ConfigError::ValidationError {
            field: "remote.url".into(),
            message: "must not be empty".into(),
        });
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ConfigError::ValidationError {
            field: "remote.url".into(),
            message: format!("must be an http(s) URL, got {url}"),
        });
    }

    for (field, value) in [
        ("remote.request_timeout_secs", file.remote.request_timeout_secs),
        ("remote.heartbeat_secs", file.remote.heartbeat_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::ValidationError {
                field: field.into(),
                message: "must be > 0".into(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project_root() -> PathBuf {
        let cwd = std::env::current_dir().unwrap();
        cwd.ancestors()
            .find(|dir| dir.join("defaults/forecourt.toml").exists())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| panic!("Cannot locate defaults/ directory from CWD {cwd:?}"))
    }

    /// Fresh `<tmp>/<name>/config` containing `forecourt.toml`.
    fn temp_config(name: &str, forecourt_toml: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config/forecourt.toml"), forecourt_toml).unwrap();
        tmp
    }

    #[test]
    fn shipped_defaults_load() {
        let tmp = std::env::temp_dir().join("forecourt_config_defaults");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::copy(
            project_root().join("defaults/forecourt.toml"),
            tmp.join("config/forecourt.toml"),
        )
        .unwrap();

        let config = load_config_from(&tmp).expect("defaults should be valid");
        assert_eq!(config.remote.request_timeout, Duration::from_secs(10));
        assert_eq!(config.remote.heartbeat, Duration::from_secs(30));
        assert_eq!(config.health_settle, Duration::from_millis(800));
        assert!(!config.remember_secret);
        assert!(config.credentials.anon_key.is_none());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let tmp = temp_config(
            "forecourt_config_minimal",
            "[remote]\nurl = \"https://abc.supabase.co/\"\n",
        );
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.remote.url, "https://abc.supabase.co");
        assert_eq!(config.storage_path, default_storage_path());
        assert_eq!(config.health_settle, DEFAULT_HEALTH_SETTLE);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn explicit_values_and_credentials() {
        let tmp = temp_config(
            "forecourt_config_explicit",
            "[remote]\nurl = \"http://localhost:54321\"\nrequest_timeout_secs = 3\n\n\
             [storage]\npath = \"state.db\"\n\n[health]\nsettle_ms = 0\n\n\
             [session]\nremember_secret = true\n",
        );
        fs::write(tmp.join("config/credentials.toml"), "anon_key = \"eyJ-test\"\n").unwrap();

        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.remote.request_timeout, Duration::from_secs(3));
        assert_eq!(config.storage_path, PathBuf::from("state.db"));
        assert_eq!(config.health_settle, Duration::ZERO);
        assert!(config.remember_secret);
        assert_eq!(config.credentials.anon_key.as_deref(), Some("eyJ-test"));
        assert!(!format!("{:?}", config.credentials).contains("eyJ-test"));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_non_http_url() {
        let tmp = temp_config("forecourt_config_bad_url", "[remote]\nurl = \"ftp://x\"\n");
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "remote.url"),
            other => panic!("expected ValidationError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_timeout() {
        let tmp = temp_config(
            "forecourt_config_zero_timeout",
            "[remote]\nurl = \"https://x.supabase.co\"\nrequest_timeout_secs = 0\n",
        );
        match load_config_from(&tmp).unwrap_err() {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "remote.request_timeout_secs")
            }
            other => panic!("expected ValidationError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_file_and_parse_error() {
        let tmp = std::env::temp_dir().join("forecourt_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        assert!(matches!(
            load_config_from(&tmp),
            Err(ConfigError::FileNotFound { .. })
        ));
        let _ = fs::remove_dir_all(&tmp);

        let tmp = temp_config("forecourt_config_parse_error", "[remote\nurl = ");
        assert!(matches!(
            load_config_from(&tmp),
            Err(ConfigError::ParseError { .. })
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_copies_missing_and_skips_existing() {
        let tmp = std::env::temp_dir().join("forecourt_config_ensure");
        let _ = fs::remove_dir_all(&tmp);
        let defaults_dir = tmp.join("defaults");
        fs::create_dir_all(&defaults_dir).unwrap();
        fs::copy(
            project_root().join("defaults/forecourt.toml"),
            defaults_dir.join("forecourt.toml"),
        )
        .unwrap();
        fs::write(defaults_dir.join("credentials.toml.example"), "anon_key = \"...\"\n").unwrap();

        let copied = ensure_config_files(&tmp).unwrap();
        assert_eq!(copied.len(), 1);
        assert!(tmp.join("config/forecourt.toml").exists());
        assert!(!tmp.join("config/credentials.toml.example").exists());

        fs::write(tmp.join("config/forecourt.toml"), "# custom\n").unwrap();
        assert!(ensure_config_files(&tmp).unwrap().is_empty());
        assert_eq!(
            fs::read_to_string(tmp.join("config/forecourt.toml")).unwrap(),
            "# custom\n"
        );
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_errors_when_both_dirs_missing() {
        let tmp = std::env::temp_dir().join("forecourt_config_both_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        match ensure_config_files(&tmp).unwrap_err() {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("neither defaults/ nor config/"))
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }
        let _ = fs::remove_dir_all(&tmp);
    }
}
