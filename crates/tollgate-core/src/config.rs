use crate::error::Result;
use crate::job::parse_scoped_test;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// GateConfig
// ---------------------------------------------------------------------------

/// Gate execution settings, read from `agents/status/gates/gate_config.yaml`.
/// Every field is optional; a missing file means all defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Build tool invoked for every step.
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_check_args")]
    pub check_args: Vec<String>,
    /// Full test invocation used by MERGE-mode jobs.
    #[serde(default = "default_test_args")]
    pub test_args: Vec<String>,
    #[serde(default = "default_fmt_args")]
    pub fmt_args: Vec<String>,
    /// Leading tokens stripped from a scoped test command before the `test` verb.
    #[serde(default = "default_scoped_test_wrappers")]
    pub scoped_test_wrappers: Vec<String>,
    #[serde(default = "default_scoped_test")]
    pub default_scoped_test: String,
    /// Seconds between SIGTERM and SIGKILL when a step is interrupted.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_loop_sleep_secs")]
    pub loop_sleep_secs: f64,
}

fn default_program() -> String {
    "cargo".to_string()
}

fn default_check_args() -> Vec<String> {
    vec!["check".to_string()]
}

fn default_test_args() -> Vec<String> {
    vec!["test".to_string()]
}

fn default_fmt_args() -> Vec<String> {
    ["fmt", "--", "--check"].iter().map(|s| s.to_string()).collect()
}

fn default_scoped_test_wrappers() -> Vec<String> {
    vec!["cargo-safe".to_string(), "cargo".to_string()]
}

fn default_scoped_test() -> String {
    "cargo-safe test --lib".to_string()
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_loop_sleep_secs() -> f64 {
    2.0
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            check_args: default_check_args(),
            test_args: default_test_args(),
            fmt_args: default_fmt_args(),
            scoped_test_wrappers: default_scoped_test_wrappers(),
            default_scoped_test: default_scoped_test(),
            grace_period_secs: default_grace_period_secs(),
            loop_sleep_secs: default_loop_sleep_secs(),
        }
    }
}

impl GateConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::gate_config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: GateConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn loop_sleep(&self) -> Duration {
        Duration::try_from_secs_f64(self.loop_sleep_secs.max(0.0))
            .unwrap_or_else(|_| Duration::from_secs_f64(default_loop_sleep_secs()))
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.program.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "program is empty; no gate step can run".to_string(),
            });
        }

        for (name, args) in [
            ("check_args", &self.check_args),
            ("test_args", &self.test_args),
            ("fmt_args", &self.fmt_args),
        ] {
            if args.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("{name} is empty; the step will run '{}' bare", self.program),
                });
            }
        }

        if self.grace_period_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "grace_period_secs=0 kills interrupted steps without a graceful stop"
                    .to_string(),
            });
        }

        if !self.loop_sleep_secs.is_finite() || self.loop_sleep_secs < 0.0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("loop_sleep_secs={} must be a non-negative number", self.loop_sleep_secs),
            });
        }

        if let Err(e) = parse_scoped_test(&self.default_scoped_test, &self.scoped_test_wrappers) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!("default_scoped_test: {e}"),
            });
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = GateConfig::load(dir.path()).unwrap();
        assert_eq!(cfg, GateConfig::default());
        assert_eq!(cfg.fmt_args, vec!["fmt", "--", "--check"]);
        assert_eq!(cfg.grace_period(), Duration::from_secs(10));
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = paths::gate_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "program: /usr/bin/fake-cargo\ngrace_period_secs: 3\n").unwrap();

        let cfg = GateConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.program, "/usr/bin/fake-cargo");
        assert_eq!(cfg.grace_period_secs, 3);
        assert_eq!(cfg.test_args, vec!["test"]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: std::result::Result<GateConfig, _> = serde_yaml::from_str("programme: cargo\n");
        assert!(result.is_err());
    }

    #[test]
    fn serialized_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let cfg = GateConfig {
            loop_sleep_secs: 0.5,
            ..GateConfig::default()
        };
        let path = paths::gate_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_yaml::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(GateConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn validate_flags_bad_values() {
        let cfg = GateConfig {
            program: " ".to_string(),
            grace_period_secs: 0,
            default_scoped_test: "cargo build".to_string(),
            ..GateConfig::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 3);
        assert_eq!(
            warnings.iter().filter(|w| w.level == WarnLevel::Error).count(),
            2
        );
    }
}
