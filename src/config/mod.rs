//! Configuration for cellpipe
//!
//! Two kinds of configuration live here:
//! - **Preferences**: user defaults persisted across sessions (output folder,
//!   error policy)
//! - **Run configuration**: a TOML file describing how a headless run behaves,
//!   which command-line flags override
//!
//! # App Data Location
//!
//! Preferences are stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/org.cellpipe.cellpipe/`
//! - **macOS**: `~/Library/Application Support/org.cellpipe.cellpipe/`
//! - **Windows**: `%APPDATA%\org.cellpipe.cellpipe\`
//!
//! # Example
//!
//! ```ignore
//! use cellpipe::config::{Preferences, RunConfig};
//!
//! let mut prefs = Preferences::load_or_default();
//! prefs.default_output_dir = Some("/data/results".into());
//! prefs.save()?;
//!
//! let run = RunConfig::load("cluster.toml")?;
//! let mapper = run.path_mapper();
//! let output = run.output_path("analysis.cppipe");
//! ```

use crate::batch::{PathMapper, PathMapping};
use crate::error::{CellPipeError, Result};
use crate::pipeline::ErrorPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "org.cellpipe.cellpipe";

/// Preferences filename
pub const PREFERENCES_FILE: &str = "preferences.json";

/// Filter used when neither `RUST_LOG` nor a log level is given
pub const DEFAULT_LOG_FILTER: &str = "info,cellpipe=debug";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        CellPipeError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            CellPipeError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the preferences file
pub fn preferences_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(PREFERENCES_FILE))
}

// ==================== Preferences ====================

/// Persistent user preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    /// Version for future migration support
    #[serde(default = "default_preferences_version")]
    pub version: u32,

    /// Where `run` writes measurements when no output is named
    #[serde(default)]
    pub default_output_dir: Option<PathBuf>,

    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

fn default_preferences_version() -> u32 {
    1
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            version: 1,
            default_output_dir: None,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl Preferences {
    /// Load preferences from the default location
    pub fn load() -> Result<Self> {
        let path = preferences_path().ok_or_else(|| {
            CellPipeError::Config("Could not determine preferences path".to_string())
        })?;
        Self::load_from(path)
    }

    /// Load preferences from `path`; a missing file yields defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CellPipeError::Config(format!("Failed to read preferences: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| CellPipeError::Config(format!("Failed to parse preferences: {}", e)))
    }

    /// Load preferences, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load preferences, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save preferences to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(PREFERENCES_FILE))
    }

    /// Run configuration seeded with these defaults
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            error_policy: self.error_policy,
            output_dir: self.default_output_dir.clone(),
            ..RunConfig::default()
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| CellPipeError::Config(format!("Failed to serialize preferences: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| CellPipeError::Config(format!("Failed to write preferences: {}", e)))
    }
}

// ==================== Run Configuration ====================

/// How a headless run behaves
///
/// ```toml
/// error_policy = "skip"
/// show_displays = false
/// done_file = "/scratch/done.txt"
/// output_dir = "/scratch/results"
/// log_level = "info"
///
/// [[path_mappings]]
/// local = "/Volumes/imaging"
/// remote = "/mnt/imaging"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub error_policy: ErrorPolicy,

    pub show_displays: bool,

    /// Applied when creating a batch file
    pub path_mappings: Vec<PathMapping>,

    /// Sentinel written with the exit status when the run ends
    pub done_file: Option<PathBuf>,

    /// Directory for `<pipeline>_out.json` when no output file is named
    pub output_dir: Option<PathBuf>,

    /// `EnvFilter` directive, e.g. `warn,cellpipe=info`
    pub log_level: Option<String>,

    pub log_file: Option<PathBuf>,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CellPipeError::Config(format!("Failed to read run config {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CellPipeError::Config(format!("Failed to parse run config: {}", e)))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CellPipeError::Serialization(e.to_string()))
    }

    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::from_mappings(
            self.path_mappings
                .iter()
                .map(|m| PathMapping::new(m.local.as_str(), m.remote.as_str())),
        )
    }

    /// `<output_dir>/<pipeline stem>_out.json`, if an output directory is set
    pub fn output_path(&self, pipeline: impl AsRef<Path>) -> Option<PathBuf> {
        let dir = self.output_dir.as_ref()?;
        let stem = pipeline
            .as_ref()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline".to_string());
        Some(dir.join(format!("{}_out.json", stem)))
    }

    /// The filter to log with: `log_level`, else the default
    pub fn log_filter(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_preferences_default() {
        let prefs = Preferences::default();
        assert!(prefs.default_output_dir.is_none());
        assert_eq!(prefs.version, 1);
        assert_eq!(prefs.error_policy, ErrorPolicy::Abort);
    }

    #[test]
    fn test_preferences_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PREFERENCES_FILE);

        let mut prefs = Preferences::default();
        prefs.error_policy = ErrorPolicy::Skip;
        prefs.default_output_dir = Some(dir.path().to_path_buf());
        prefs.save_to(&path).unwrap();

        let loaded = Preferences::load_from(&path).unwrap();
        assert_eq!(loaded.error_policy, ErrorPolicy::Skip);
        assert_eq!(loaded.default_output_dir, prefs.default_output_dir);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let prefs: Preferences = serde_json::from_str("{}").unwrap();
        assert_eq!(prefs.version, 1);
        assert!(prefs.default_output_dir.is_none());
    }

    #[test]
    fn test_preferences_seed_run_config() {
        let prefs = Preferences {
            error_policy: ErrorPolicy::Skip,
            default_output_dir: Some(PathBuf::from("/results")),
            ..Preferences::default()
        };
        let config = prefs.run_config();
        assert_eq!(config.error_policy, ErrorPolicy::Skip);
        assert_eq!(
            config.output_path("/pipelines/plate1.cppipe"),
            Some(PathBuf::from("/results/plate1_out.json"))
        );
        assert_eq!(Preferences::default().run_config().output_path("a.cppipe"), None);
    }

    #[test]
    fn test_run_config_from_toml() {
        let config = RunConfig::from_toml(
            r#"
error_policy = "skip"
done_file = "/scratch/done.txt"

[[path_mappings]]
local = "/Volumes/imaging/"
remote = "/mnt/imaging"
"#,
        )
        .unwrap();
        assert_eq!(config.error_policy, ErrorPolicy::Skip);
        assert!(!config.show_displays);
        assert_eq!(config.done_file, Some(PathBuf::from("/scratch/done.txt")));
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
        assert_eq!(
            config.path_mapper().map("/Volumes/imaging/plate1/a.png"),
            "/mnt/imaging/plate1/a.png"
        );
    }

    #[test]
    fn test_run_config_rejects_unknown_policy() {
        assert!(RunConfig::from_toml("error_policy = \"retry\"").is_err());
    }

    #[test]
    fn test_run_config_toml_round_trip() {
        let config = RunConfig {
            error_policy: ErrorPolicy::Skip,
            log_level: Some("warn".into()),
            path_mappings: vec![PathMapping::new("/a", "/b")],
            ..RunConfig::default()
        };
        let text = config.to_toml().unwrap();
        let parsed = RunConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.error_policy, ErrorPolicy::Skip);
        assert_eq!(parsed.log_filter(), "warn");
        assert_eq!(parsed.path_mappings, config.path_mappings);
    }
}
