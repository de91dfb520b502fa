//! Configuration file management for farecard.
//!
//! Reads/writes `~/.farecard/config.yaml` with output format, date-shift
//! privacy setting, and log level. Command-line flags take precedence.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub output: OutputConfig,
    pub privacy: PrivacyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrivacyConfig {
    /// Days added to every decoded date. 0 disables shifting.
    pub shift_days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            output: OutputConfig {
                format: OutputFormat::Table,
            },
            privacy: PrivacyConfig { shift_days: 0 },
            logging: LoggingConfig {
                level: "warn".into(),
            },
        }
    }
}

/// Get the config directory path (`~/.farecard/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".farecard")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `path`. Missing or unreadable files yield defaults.
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(_) => Config::default(),
    }
}

/// Write `config` to `path`, creating parent directories.
pub fn save_config_to(config: &Config, path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serialize_config(config))
}

/// Parse simple YAML-like config text. Unknown keys are ignored.
fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = val.is_empty().then(|| key.to_string());
            continue;
        }
        let Some(section) = current_section.as_deref() else {
            continue;
        };
        match (section, key) {
            ("output", "format") => match parse_string_value(val).as_deref() {
                Some("json") => config.output.format = OutputFormat::Json,
                Some("table") => config.output.format = OutputFormat::Table,
                _ => {}
            },
            ("privacy", "shift_days") => {
                if let Ok(v) = val.parse::<i64>() {
                    config.privacy.shift_days = v;
                }
            }
            ("logging", "level") => {
                if let Some(v) = parse_string_value(val) {
                    config.logging.level = v;
                }
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

/// Serialize config to YAML-like text.
fn serialize_config(config: &Config) -> String {
    let lines = [
        "# farecard configuration".to_string(),
        String::new(),
        "output:".into(),
        format!("  format: {}", config.output.format),
        String::new(),
        "privacy:".into(),
        format!("  shift_days: {}", config.privacy.shift_days),
        String::new(),
        "logging:".into(),
        format!("  level: \"{}\"", config.logging.level),
    ];
    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.output.format, OutputFormat::Table);
        assert_eq!(config.privacy.shift_days, 0);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_parse_config() {
        let text = r#"
output:
  format: json

privacy:
  shift_days: -42

logging:
  level: "farecard_core=debug"
"#;
        let config = parse_config(text);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.privacy.shift_days, -42);
        assert_eq!(config.logging.level, "farecard_core=debug");
    }

    #[test]
    fn test_parse_config_bad_values_keep_defaults() {
        let text = r#"
output:
  format: xml
privacy:
  shift_days: soon
logging:
  level: null
stray: value
  format: json
"#;
        assert_eq!(parse_config(text), Config::default());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let config = Config {
            output: OutputConfig {
                format: OutputFormat::Json,
            },
            privacy: PrivacyConfig { shift_days: 30 },
            logging: LoggingConfig {
                level: "info".into(),
            },
        };
        save_config_to(&config, &path).unwrap();
        assert_eq!(load_config_from(&path), config);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_config_from(&dir.path().join("absent.yaml")),
            Config::default()
        );
    }
}
