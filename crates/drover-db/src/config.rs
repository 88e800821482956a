use std::env;
use std::path::PathBuf;

/// Environment variable that overrides the database location.
pub const DATABASE_URL_ENV: &str = "DROVER_DATABASE_URL";

/// Database configuration.
///
/// Reads from the `DROVER_DATABASE_URL` environment variable, falling back
/// to a SQLite file under the user's data directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL (`sqlite://path/to/drover.db`).
    pub database_url: String,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `DROVER_DATABASE_URL` env var, then [`Self::default_url`].
    pub fn from_env() -> Self {
        let database_url = env::var(DATABASE_URL_ENV).unwrap_or_else(|_| Self::default_url());
        Self { database_url }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Build a config pointing at a database file.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        Self::new(format!("sqlite://{}", path.display()))
    }

    /// `$XDG_DATA_HOME/drover/drover.db` (or the platform equivalent).
    pub fn default_url() -> String {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("drover");
        format!("sqlite://{}", dir.join("drover.db").display())
    }

    /// The filesystem path of the database file, if the URL names one.
    ///
    /// Returns `None` for in-memory databases.
    pub fn database_path(&self) -> Option<PathBuf> {
        let rest = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().unwrap_or(rest);
        if path.is_empty() || path == ":memory:" {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
