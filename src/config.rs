use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level config for pias, loaded from `~/.pias/pias.toml` and overlaid
/// with `PIAS_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String, // error|warn|info|debug|trace
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DefaultsConfig {
    pub shell: Option<String>,
    pub terminal: Option<String>,
}

impl Config {
    /// Load config from a TOML file, then overlay with env variables.
    ///
    /// File-then-env, never the reverse: an explicit override always wins
    /// over whatever is on disk.
    pub fn load(path: Option<&str>) -> Self {
        let mut cfg = if let Some(p) = path {
            Self::from_file(p).unwrap_or_default()
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            let default_path = format!("{}/.pias/pias.toml", home);
            Self::from_file(&default_path).unwrap_or_default()
        };

        if let Ok(level) = std::env::var("PIAS_LOG_LEVEL") {
            cfg.logging.level = level;
        }
        if let Ok(shell) = std::env::var("PIAS_OPT_SHELL") {
            cfg.defaults.shell = Some(shell);
        }
        if let Ok(terminal) = std::env::var("PIAS_OPT_TERMINAL") {
            cfg.defaults.terminal = Some(terminal);
        }

        cfg
    }

    fn from_file(path: &str) -> Option<Self> {
        let p = Path::new(path);
        if !p.exists() {
            return None;
        }
        let text = fs::read_to_string(p).ok()?;
        toml::from_str(&text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_level_is_info() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.level, "info");
    }

    #[test]
    fn missing_file_yields_default_config() {
        let cfg = Config::from_file("/nonexistent/pias.toml");
        assert!(cfg.is_none());
    }

    #[test]
    fn env_overlay_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pias.toml");
        fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

        // SAFETY: test is single-threaded w.r.t. this env var and restores it.
        unsafe {
            std::env::set_var("PIAS_LOG_LEVEL", "trace");
        }
        let cfg = Config::load(Some(path.to_str().unwrap()));
        unsafe {
            std::env::remove_var("PIAS_LOG_LEVEL");
        }

        assert_eq!(cfg.logging.level, "trace");
    }
}
