use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default config file looked up inside the plugin directory.
pub const CONFIG_FILE_NAME: &str = "hot.reload.json";

/// Debounce window used when neither the file nor the CLI sets one.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Build configuration for one hot-reload run.
///
/// Known fields are typed; anything else found in the config file is kept in
/// `extensions` and only ever displayed, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotReloadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_entry: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<u64>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl HotReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce.unwrap_or(DEFAULT_DEBOUNCE_MS))
    }

    /// Apply command-line overrides on top of this config. Only fields the
    /// user actually passed replace file values.
    pub fn merge(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(entry) = overrides.main_entry {
            self.main_entry = Some(entry);
        }
        if let Some(files) = overrides.extra_files {
            self.extra_files = files;
        }
        if let Some(ms) = overrides.debounce {
            self.debounce = Some(ms);
        }
        self
    }

    /// Rows for a status display: the three known settings first, then every
    /// extension field rendered as JSON.
    pub fn display_rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            (
                "Main Entry".to_string(),
                self.main_entry
                    .clone()
                    .unwrap_or_else(|| "main.ts/js/tsx".to_string()),
            ),
            (
                "Extra Files".to_string(),
                if self.extra_files.is_empty() {
                    "none".to_string()
                } else {
                    self.extra_files.join(", ")
                },
            ),
            ("Debounce".to_string(), format!("{}ms", self.debounce().as_millis())),
        ];
        rows.extend(
            self.extensions
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string())),
        );
        rows
    }
}

/// Values supplied on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub main_entry: Option<String>,
    pub extra_files: Option<Vec<String>>,
    pub debounce: Option<u64>,
}

/// Resolve which config file to read: an explicit path (relative to `cwd`)
/// wins over `<plugin_dir>/hot.reload.json`.
pub fn config_file_path(plugin_dir: &Path, explicit: Option<&Path>, cwd: &Path) -> PathBuf {
    match explicit {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => cwd.join(path),
        None => plugin_dir.join(CONFIG_FILE_NAME),
    }
}

/// Read and parse one config file. A missing file is not an error and yields
/// the defaults; unreadable or malformed files are.
pub fn read_config_file(path: &Path) -> Result<HotReloadConfig> {
    if !path.exists() {
        return Ok(HotReloadConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Configuration(format!("could not read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Configuration(format!("corrupt config {}: {e}", path.display())))
}

/// Load the effective config: defaults < config file < CLI overrides.
///
/// A broken config file is reported and replaced by the defaults so the run
/// can continue.
pub fn load_config(path: &Path, overrides: ConfigOverrides) -> HotReloadConfig {
    let file_config = match read_config_file(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("{e}. Using defaults.");
            HotReloadConfig::default()
        }
    };
    file_config.merge(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_one_second_debounce() {
        let config = HotReloadConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(1000));
        assert!(config.main_entry.is_none());
        assert!(config.extra_files.is_empty());
    }

    #[test]
    fn parses_known_fields_and_keeps_extensions() {
        let config: HotReloadConfig = serde_json::from_str(
            r#"{"mainEntry":"src/index.ts","extraFiles":["LICENSE"],"debounce":250,"theme":"dark"}"#,
        )
        .expect("valid config");
        assert_eq!(config.main_entry.as_deref(), Some("src/index.ts"));
        assert_eq!(config.extra_files, vec!["LICENSE".to_string()]);
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.extensions.get("theme"), Some(&Value::from("dark")));
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let file: HotReloadConfig =
            serde_json::from_str(r#"{"mainEntry":"a.ts","debounce":500}"#).unwrap();
        let merged = file.merge(ConfigOverrides {
            main_entry: Some("b.ts".into()),
            extra_files: None,
            debounce: None,
        });
        assert_eq!(merged.main_entry.as_deref(), Some("b.ts"));
        assert_eq!(merged.debounce, Some(500));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = read_config_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config, HotReloadConfig::default());
    }

    #[test]
    fn malformed_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(read_config_file(&path), Err(Error::Configuration(_))));
    }

    #[test]
    fn load_falls_back_to_defaults_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[1, 2").unwrap();
        let config = load_config(
            &path,
            ConfigOverrides {
                debounce: Some(42),
                ..Default::default()
            },
        );
        assert_eq!(config.debounce, Some(42));
        assert!(config.main_entry.is_none());
    }

    #[test]
    fn explicit_path_is_resolved_against_cwd() {
        let resolved = config_file_path(
            Path::new("/plugins/demo"),
            Some(Path::new("conf/hot.json")),
            Path::new("/work"),
        );
        assert_eq!(resolved, PathBuf::from("/work/conf/hot.json"));
        let default = config_file_path(Path::new("/plugins/demo"), None, Path::new("/work"));
        assert_eq!(default, PathBuf::from("/plugins/demo/hot.reload.json"));
    }

    #[test]
    fn display_rows_list_extensions_after_known_fields() {
        let config: HotReloadConfig = serde_json::from_str(r#"{"port":3000}"#).unwrap();
        let rows = config.display_rows();
        assert_eq!(rows[0], ("Main Entry".into(), "main.ts/js/tsx".into()));
        assert_eq!(rows[1], ("Extra Files".into(), "none".into()));
        assert_eq!(rows[2], ("Debounce".into(), "1000ms".into()));
        assert_eq!(rows[3], ("port".into(), "3000".into()));
    }
}
