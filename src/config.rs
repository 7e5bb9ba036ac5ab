use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::executor::{ExecutorKind, InputMethod};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "VOCA_CONFIG";

const DEFAULT_PATH: &str = "voca.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Plugins declared in the config file
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

// ============================================================================
// Manager Config
// ============================================================================

/// What happens to a worker after it finishes a job
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PoolPolicy {
    /// Kill the worker and spawn a fresh one (default)
    #[default]
    Replace,
    /// Return the worker to the idle set
    Reuse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Pool size
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default)]
    pub policy: PoolPolicy,
    /// How long in-flight jobs may run after the input closes
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Initial mode
    #[serde(default = "default_start_strict")]
    pub start_strict: bool,
    /// Plugins loaded when none are named on the command line
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,
    /// Plugins loaded after a restart-safe request
    #[serde(default = "default_safe_plugins")]
    pub safe_plugins: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            policy: PoolPolicy::default(),
            shutdown_grace_ms: default_shutdown_grace(),
            start_strict: default_start_strict(),
            plugins: default_plugins(),
            safe_plugins: default_safe_plugins(),
        }
    }
}

fn default_num_workers() -> usize {
    5
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_start_strict() -> bool {
    true
}

fn default_plugins() -> Vec<String> {
    vec!["basic".into(), "math".into(), "control".into()]
}

fn default_safe_plugins() -> Vec<String> {
    vec!["control".into()]
}

// ============================================================================
// Worker Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound on each context check
    #[serde(default = "default_context_timeout")]
    pub context_timeout_ms: u64,
    #[serde(default)]
    pub executor: ExecutorKind,
    #[serde(default)]
    pub input_method: InputMethod,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            context_timeout_ms: default_context_timeout(),
            executor: ExecutorKind::default(),
            input_method: InputMethod::default(),
        }
    }
}

fn default_context_timeout() -> u64 {
    500
}

// ============================================================================
// Plugin Config
// ============================================================================

/// A plugin written as data: patterns mapped to action strings
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Only active while the focused window title contains this
    #[serde(default)]
    pub window_title: Option<String>,
    /// Named fragments
    #[serde(default)]
    pub define: BTreeMap<String, String>,
    /// Pattern to action, e.g. `"save file" = "key:control+s"`
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

impl Config {
    /// Read and parse one config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `explicit`, then `$VOCA_CONFIG`, then `voca.toml`.
    ///
    /// A missing default file means defaults. A file that cannot be read or
    /// parsed is reported and replaced by defaults.
    pub fn load(explicit: Option<&Path>) -> Self {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => path,
            None => {
                let path = PathBuf::from(DEFAULT_PATH);
                if !path.exists() {
                    return Config::default();
                }
                path
            }
        };

        match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "using default configuration");
                Config::default()
            }
        }
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.manager.num_workers, 5);
        assert_eq!(config.manager.policy, PoolPolicy::Replace);
        assert!(config.manager.start_strict);
        assert_eq!(config.manager.plugins, vec!["basic", "math", "control"]);
        assert_eq!(config.manager.safe_plugins, vec!["control"]);
        assert_eq!(config.worker.context_timeout_ms, 500);
        assert_eq!(config.worker.executor, ExecutorKind::Log);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [manager]
            num_workers = 2
            policy = "reuse"

            [worker]
            input_method = "clipboard"
            "#,
        )
        .unwrap();
        assert_eq!(config.manager.num_workers, 2);
        assert_eq!(config.manager.policy, PoolPolicy::Reuse);
        assert_eq!(config.manager.shutdown_grace_ms, 5000);
        assert_eq!(config.worker.input_method, InputMethod::Clipboard);
    }

    #[test]
    fn test_plugin_tables() {
        let config: Config = toml::from_str(
            r#"
            [[plugins]]
            name = "editor"
            window_title = "vim"
            [plugins.define]
            direction = "(up|down)"
            [plugins.commands]
            "save file" = "key:control+s"
            "go <direction>" = "type:moved"
            "#,
        )
        .unwrap();
        let editor = config.plugin("editor").unwrap();
        assert_eq!(editor.window_title.as_deref(), Some("vim"));
        assert_eq!(editor.define["direction"], "(up|down)");
        assert_eq!(editor.commands["save file"], "key:control+s");
        assert!(config.plugin("missing").is_none());
    }

    #[test]
    fn test_load_explicit_file_and_bad_file() {
        let dir = std::env::temp_dir().join(format!("voca-config-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.toml");
        let mut file = fs::File::create(&good).unwrap();
        writeln!(file, "[manager]\nnum_workers = 1").unwrap();
        assert_eq!(Config::load(Some(&good)).manager.num_workers, 1);

        let bad = dir.join("bad.toml");
        fs::write(&bad, "[manager\nnum_workers = ").unwrap();
        assert!(matches!(Config::from_file(&bad), Err(ConfigError::Parse { .. })));
        assert_eq!(Config::load(Some(&bad)).manager.num_workers, 5);

        assert!(matches!(
            Config::from_file(&dir.join("absent.toml")),
            Err(ConfigError::Read { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }
}
