use anyhow::{Context, Result};
use expenseflow_match::MatchConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "expenseflow.toml";

/// Contents of `expenseflow.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// SQLite file; defaults to `expenseflow.db` in the platform data directory.
    pub database: Option<PathBuf>,
    /// Frankfurter-compatible rate endpoint. Without one the built-in
    /// fallback table is used.
    pub rate_url: Option<String>,
    pub tenant: Option<String>,
    /// Currency assumed for imported rows that leave it blank.
    pub default_currency: Option<String>,
    pub matching: MatchConfig,
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "expenseflow", "ExpenseFlow")
        .context("could not determine the platform data directory")
}

impl AppConfig {
    /// Reads `path`, or the platform config file when none is given. A
    /// missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (project_dirs()?.config_dir().join(CONFIG_FILE), false),
        };

        if !explicit && !path.exists() {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.matching.validate()?;
        Ok(config)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let data_dir = project_dirs()?.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating {}", data_dir.display()))?;
        Ok(data_dir.join("expenseflow.db"))
    }

    pub fn tenant(&self, flag: Option<&str>) -> String {
        flag.or(self.tenant.as_deref())
            .unwrap_or("default")
            .to_string()
    }

    pub fn default_currency(&self) -> String {
        self.default_currency
            .clone()
            .unwrap_or_else(|| self.matching.reporting_currency.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expenseflow_match::AssignmentMode;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.matching, MatchConfig::default());
        assert_eq!(config.tenant(None), "default");
        assert_eq!(config.default_currency(), "PLN");
    }

    #[test]
    fn matching_table_overrides_defaults() {
        let config = AppConfig::parse(
            r#"
            database = "/tmp/books.db"
            tenant = "acme"

            [matching]
            min_match_threshold = 0.5
            assignment = "optimal"
            "#,
        )
        .unwrap();
        assert_eq!(config.database, Some(PathBuf::from("/tmp/books.db")));
        assert_eq!(config.matching.min_match_threshold, 0.5);
        assert_eq!(config.matching.assignment, AssignmentMode::Optimal);
        assert_eq!(config.tenant(Some("globex")), "globex");
        assert_eq!(config.tenant(None), "acme");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(AppConfig::parse("colour = \"blue\"").is_err());
        assert!(AppConfig::parse("[matching]\nnope = 1").is_err());
    }

    #[test]
    fn invalid_matching_values_are_rejected() {
        assert!(AppConfig::parse("[matching]\nmin_match_threshold = 1.5").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn loads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "rate_url = \"https://rates.example\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.rate_url.as_deref(), Some("https://rates.example"));
    }
}
