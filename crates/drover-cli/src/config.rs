//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use drover_core::agent::CommandAgentConfig;
use drover_core::classifier::DEFAULT_AGENT;
use drover_core::discovery::{CommandSource, FileSource, SourceAdapter};
use drover_core::health::{AdaptationConfig, HealthConfig};
use drover_core::inference::InferenceConfig;
use drover_core::orchestrator::OrchestratorConfig;
use drover_core::scheduler::PoolConfig;
use drover_core::scheduler::resources::ResourceOverrides;
use drover_db::config::{DATABASE_URL_ENV, DbConfig};
use drover_db::models::SourceKind;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "DROVER_CONFIG";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub orchestrator: OrchestratorConfig,
    pub classifier: ClassifierSection,
    pub health: HealthConfig,
    pub adaptation: AdaptationConfig,
    pub resources: ResourceOverrides,
    pub pool: PoolConfig,
    pub sources: Vec<SourceConfig>,
    pub agents: Vec<CommandAgentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    /// Agent used when no classification stage produces a match.
    pub default_agent: String,
    /// Local inference service for the structured and free-form stages.
    /// Without it only the pattern stage runs.
    pub inference: Option<InferenceConfig>,
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            default_agent: DEFAULT_AGENT.to_string(),
            inference: None,
        }
    }
}

fn default_source_kind() -> SourceKind {
    SourceKind::Manual
}

fn default_source_timeout_secs() -> u64 {
    30
}

/// One `[[sources]]` entry. Exactly one of `path` (a TOML inbox file) or
/// `command` (prints JSON items) must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
}

impl SourceConfig {
    pub fn build(&self) -> Result<Arc<dyn SourceAdapter>> {
        match (&self.path, &self.command) {
            (Some(path), None) => Ok(Arc::new(FileSource::new(&self.name, self.kind, path))),
            (None, Some(command)) => Ok(Arc::new(CommandSource::new(
                &self.name,
                self.kind,
                command,
                self.args.clone(),
                Duration::from_secs(self.timeout_secs),
            ))),
            (Some(_), Some(_)) => {
                bail!("source {}: set either path or command, not both", self.name)
            }
            (None, None) => bail!("source {}: needs a path or a command", self.name),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the default path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// The config file to use: `--config` > `DROVER_CONFIG` > default path.
/// The flag says whether the path was named explicitly.
pub fn select_config_path(cli_config: Option<&Path>) -> (PathBuf, bool) {
    if let Some(path) = cli_config {
        return (path.to_path_buf(), true);
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) if !path.is_empty() => (PathBuf::from(path), true),
        _ => (config_path(), false),
    }
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(contents).context("failed to parse config file")?;
    for source in &config.sources {
        source.build()?;
    }
    Ok(config)
}

/// Write config text, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn write_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct DroverConfig {
    pub db_config: DbConfig,
    pub file: ConfigFile,
    /// The config file that was read, if any.
    pub source: Option<PathBuf>,
}

impl DroverConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Config file: `cli_config` > `DROVER_CONFIG` env > `config_path()`. An
    ///   explicitly named file must exist; a missing default file means
    ///   built-in defaults.
    /// - DB URL: `cli_db_url` > `DROVER_DATABASE_URL` env > `database.url` >
    ///   [`DbConfig::default_url`]
    pub fn resolve(cli_config: Option<&Path>, cli_db_url: Option<&str>) -> Result<Self> {
        let (path, explicit) = select_config_path(cli_config);
        let (file, source) = if explicit || path.exists() {
            (load_config(&path)?, Some(path))
        } else {
            (ConfigFile::default(), None)
        };

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            url
        } else if let Some(url) = &file.database.url {
            url.clone()
        } else {
            DbConfig::default_url()
        };

        Ok(Self {
            db_config: DbConfig::new(db_url),
            file,
            source,
        })
    }
}

// -----------------------------------------------------------------------
// Starter config
// -----------------------------------------------------------------------

/// The config `drover init` writes: an inbox source plus one command agent
/// per built-in routing target.
pub fn starter_config(db_url: &str, inbox: &Path) -> String {
    let mut out = String::new();
    out.push_str("# drover configuration\n\n");
    out.push_str("[database]\n");
    out.push_str(&format!("url = {}\n\n", toml_string(db_url)));
    out.push_str(
        "[orchestrator]\n\
         poll_interval_secs = 30\n\
         max_in_progress = 5\n\
         max_attempts = 3\n\
         stale_after_secs = 14400\n\
         workspace_root = \".\"\n\n\
         [classifier]\n\
         default_agent = \"code-generator\"\n\
         # [classifier.inference]\n\
         # url = \"http://localhost:11434\"\n\
         # model = \"llama3.1\"\n\n\
         [pool]\n\
         light = 4\n\
         standard = 2\n\
         gpu_light = 2\n\
         gpu_heavy = 1\n\
         gpu_max = 0\n\n",
    );
    out.push_str("[[sources]]\nname = \"inbox\"\nkind = \"manual\"\n");
    out.push_str(&format!(
        "path = {}\n",
        toml_string(&inbox.display().to_string())
    ));

    for (name, capability, profile) in STARTER_AGENTS {
        out.push_str(&format!(
            "\n[[agents]]\n\
             name = \"{name}\"\n\
             capability = \"{capability}\"\n\
             profile = \"{profile}\"\n\
             command = \"cat\"\n"
        ));
    }
    out
}

const STARTER_AGENTS: &[(&str, &str, &str)] = &[
    ("bug-fixer", "code-generation", "light"),
    ("test-writer", "code-generation", "light"),
    ("diagnostician", "analysis", "light"),
    ("integrator", "integration", "standard"),
    ("code-generator", "code-generation", "light"),
    ("coordinator", "orchestration", "light"),
    ("doc-writer", "code-generation", "light"),
];

fn toml_string(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
