use anyhow::{bail, Context, Result};

/// Database connection configuration.
///
/// The orchestrator requires an explicit URL; there is no implicit default.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Split the URL into its server part and the trailing database name.
    ///
    /// `postgresql://host:5432` has no database path: the split would land
    /// inside the scheme's `//`, which the guard below rejects.
    fn split_url(&self) -> Option<(&str, &str)> {
        let (server, name) = self.database_url.rsplit_once('/')?;
        if name.is_empty() || server.ends_with('/') {
            return None;
        }
        Some((server, name))
    }

    /// The database the URL points at, if it names one.
    pub fn database_name(&self) -> Option<&str> {
        self.split_url().map(|(_, name)| name)
    }

    /// The database name, checked to be a plain identifier.
    ///
    /// `CREATE DATABASE` cannot take a bind parameter, so callers
    /// interpolate this value into SQL; anything beyond `[A-Za-z0-9_]` is
    /// refused here.
    pub fn checked_database_name(&self) -> Result<&str> {
        let name = self
            .database_name()
            .context("database URL does not name a database")?;
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            bail!("database name {name:?} is not a plain identifier");
        }
        Ok(name)
    }

    /// URL of the `postgres` maintenance database on the same server.
    ///
    /// Used for statements that must run while the target database may not
    /// exist yet.
    pub fn maintenance_url(&self) -> String {
        match self.split_url() {
            Some((server, _)) => format!("{server}/postgres"),
            None => format!("{}/postgres", self.database_url.trim_end_matches('/')),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_extraction() {
        let cfg = DbConfig::new("postgresql://localhost:5432/conductor");
        assert_eq!(cfg.database_name(), Some("conductor"));
    }

    #[test]
    fn url_without_database_has_no_name() {
        let cfg = DbConfig::new("postgresql://localhost:5432");
        assert_eq!(cfg.database_name(), None);

        let cfg = DbConfig::new("postgresql://localhost:5432/");
        assert_eq!(cfg.database_name(), None);
    }

    #[test]
    fn checked_name_accepts_identifiers() {
        let cfg = DbConfig::new("postgresql://localhost:5432/conductor_test_1");
        assert_eq!(cfg.checked_database_name().unwrap(), "conductor_test_1");
    }

    #[test]
    fn checked_name_rejects_injection_attempts() {
        let cfg = DbConfig::new("postgresql://localhost:5432/x; DROP TABLE users");
        assert!(cfg.checked_database_name().is_err());

        let cfg = DbConfig::new("postgresql://localhost:5432");
        assert!(cfg.checked_database_name().is_err());
    }

    #[test]
    fn maintenance_url_swaps_the_database() {
        let cfg = DbConfig::new("postgresql://localhost:5432/conductor");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://localhost:5432/postgres"
        );
    }

    #[test]
    fn maintenance_url_appends_when_no_database_named() {
        let cfg = DbConfig::new("postgresql://remotehost:5433");
        assert_eq!(
            cfg.maintenance_url(),
            "postgresql://remotehost:5433/postgres"
        );
    }

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("postgresql://remotehost:5433/other");
        assert_eq!(cfg.database_url, "postgresql://remotehost:5433/other");
        assert_eq!(cfg.database_name(), Some("other"));
    }
}
