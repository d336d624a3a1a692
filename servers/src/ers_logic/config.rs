use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Process settings for `server_ers`. Every field is optional so that
/// defaults, the settings file, and CLI/env values can be layered.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[clap(about = "Event reader service", version)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[clap(long, env = "ERS_SETTINGS_PATH", help = "Path to the JSON settings file for this process.")]
    pub settings_path: Option<PathBuf>,

    #[clap(long, env = "ERS_CONFIG_PATH", help = "Path to the JSON reader configuration (reloaded on SIGHUP).")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ERS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ERS_LOG_LEVEL", help = "Log filter used when RUST_LOG is unset (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ERS_LOG_JSON", help = "Write console logs as JSON.")]
    pub log_json: Option<bool>,
}

impl Settings {
    /// Merges two settings, where `other` overrides `self` for `Some` values.
    pub fn merge(self, other: Settings) -> Settings {
        Settings {
            settings_path: other.settings_path.or(self.settings_path),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
        }
    }

    pub fn defaults() -> Settings {
        Settings {
            settings_path: None,
            config_path: Some(PathBuf::from("ers.json")),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            log_json: Some(false),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(|| PathBuf::from("ers.json"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}

/// Reads a settings file. Problems are collected as messages because the
/// logger is not installed yet when settings are loaded.
fn read_settings_file(path: &Path, notes: &mut Vec<String>) -> Option<Settings> {
    if !path.exists() {
        notes.push(format!("settings file not found at {}, using defaults and environment/CLI values", path.display()));
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Settings>(&text) {
            Ok(settings) => Some(settings),
            Err(e) => {
                notes.push(format!("failed to parse settings file {}: {e}", path.display()));
                None
            }
        },
        Err(e) => {
            notes.push(format!("failed to read settings file {}: {e}", path.display()));
            None
        }
    }
}

/// Layers defaults, the settings file and CLI/env arguments, in that order.
/// Returns the settings and any notes to log once logging is up.
pub fn load_settings_from(cli: Settings) -> (Settings, Vec<String>) {
    let mut notes = Vec::new();
    let path = cli
        .settings_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_ers.conf"));

    let mut current = Settings::defaults();
    if let Some(file) = read_settings_file(&path, &mut notes) {
        current = current.merge(file);
    }
    (current.merge(cli), notes)
}

pub fn load_settings() -> (Settings, Vec<String>) {
    load_settings_from(Settings::parse())
}

/// Logs the notes gathered while loading settings.
pub fn log_notes(notes: &[String]) {
    for note in notes {
        warn!("{note}");
    }
}
