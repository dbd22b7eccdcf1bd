//! Configuration for mesorah.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MESORAH_HOME, MESORAH_DB)
//! 2. Config file (.mesorah/config.yaml)
//! 3. Defaults (~/.mesorah)
//!
//! Config file discovery:
//! - Searches current directory and parents for .mesorah/config.yaml
//! - `paths.home` is relative to the .mesorah/ directory, other paths to
//!   the project root (the directory holding .mesorah/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{PipelinePolicies, RetryPolicy, StopRule, WorkersConfig};
use crate::reconcile::{CascadeThresholds, RemapPolicy, SplitPolicy};
use crate::store::StoreConfig;
use crate::taam::TaamPolicy;
use crate::telemetry::TelemetryConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub version: Option<String>,
    pub paths: PathsConfig,
    pub ocr: OcrConfig,
    pub cropper: CropperConfig,
    pub baseline: BaselineConfig,
    pub cascade: CascadeThresholds,
    pub remap: RemapPolicy,
    pub split: SplitPolicy,
    pub stop_rule: StopRule,
    pub workers: WorkersConfig,
    pub telemetry: TelemetryConfig,
    pub taam: TaamPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .mesorah/)
    pub home: Option<String>,
    /// SQLite database (relative to the project root)
    pub database: Option<String>,
    pub patch_log: Option<String>,
    pub crop_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_binary")]
    pub binary: String,

    #[serde(default = "default_ocr_language")]
    pub language: String,

    #[serde(default = "default_ocr_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_ocr_binary() -> String {
    "tesseract".to_string()
}

fn default_ocr_language() -> String {
    "heb".to_string()
}

fn default_ocr_timeout() -> u64 {
    120
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            binary: default_ocr_binary(),
            language: default_ocr_language(),
            timeout_seconds: default_ocr_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl OcrConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropperConfig {
    #[serde(default = "default_cropper_binary")]
    pub binary: String,

    #[serde(default = "default_cropper_timeout")]
    pub timeout_seconds: u64,
}

fn default_cropper_binary() -> String {
    "magick".to_string()
}

fn default_cropper_timeout() -> u64 {
    60
}

impl Default for CropperConfig {
    fn default() -> Self {
        Self {
            binary: default_cropper_binary(),
            timeout_seconds: default_cropper_timeout(),
        }
    }
}

impl CropperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// URL with `{verse}` (or `{book}`/`{chapter}`/`{number}`) placeholders
    #[serde(default)]
    pub url_template: Option<String>,

    /// Dotted path to the text in a JSON response; empty means plain text
    #[serde(default)]
    pub text_field: String,

    #[serde(default = "default_baseline_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_baseline_timeout() -> u64 {
    30
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            url_template: None,
            text_field: String::new(),
            timeout_seconds: default_baseline_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl BaselineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub home: Option<PathBuf>,
    pub database: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var("MESORAH_HOME").ok().map(PathBuf::from),
            database: std::env::var("MESORAH_DB").ok().map(PathBuf::from),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    pub database: PathBuf,
    pub patch_log: PathBuf,
    pub crop_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub settings: ConfigFile,
}

impl ResolvedConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.database)
    }

    /// Stage policies assembled from the config sections
    pub fn policies(&self) -> PipelinePolicies {
        PipelinePolicies {
            cascade: self.settings.cascade.clone(),
            split: self.settings.split.clone(),
            remap: self.settings.remap.clone(),
            stop_rule: self.settings.stop_rule.clone(),
            taam: self.settings.taam.clone(),
            ocr_retry: self.settings.ocr.retry.clone(),
            workers: self.settings.workers.clone(),
            crop_dir: self.crop_dir.clone(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".mesorah").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine a parsed config file (if any) with env overrides and defaults
pub fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env: &EnvOverrides,
    default_home: PathBuf,
) -> ResolvedConfig {
    let (config_path, settings) = match config_file {
        Some((path, settings)) => (Some(path), settings),
        None => (None, ConfigFile::default()),
    };

    // .mesorah/ and the project root around it
    let dot_dir = config_path.as_deref().and_then(Path::parent);
    let base_dir = dot_dir.and_then(Path::parent);

    let home = match (&env.home, dot_dir, &settings.paths.home) {
        (Some(home), _, _) => home.clone(),
        (None, Some(dot_dir), Some(home)) => resolve_path(dot_dir, home),
        _ => default_home,
    };

    let relative = |configured: &Option<String>, fallback: PathBuf| match (base_dir, configured) {
        (Some(base), Some(path)) => resolve_path(base, path),
        (None, Some(path)) => PathBuf::from(path),
        (_, None) => fallback,
    };

    let database = match &env.database {
        Some(db) => db.clone(),
        None => relative(&settings.paths.database, home.join("mesorah.db")),
    };
    let patch_log = relative(&settings.paths.patch_log, home.join("patches.jsonl"));
    let crop_dir = relative(&settings.paths.crop_dir, home.join("crops"));

    ResolvedConfig {
        home,
        database,
        patch_log,
        crop_dir,
        config_file: config_path,
        settings,
    }
}

/// Load configuration from all sources; `explicit` skips discovery
pub fn load_config_from(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".mesorah");

    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };
    let config_file = match path {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    Ok(resolve(config_file, &EnvOverrides::from_env(), default_home))
}

fn load_config() -> Result<ResolvedConfig> {
    load_config_from(None)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the mesorah home directory (engine state).
pub fn mesorah_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the SQLite database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
