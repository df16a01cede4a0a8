use std::{env, path::PathBuf, time::Duration};

const API_URL_VAR: &str = "PR_DASHBOARD_API_URL";
const HOME_VAR: &str = "PR_DASHBOARD_HOME";
const DEFAULT_API_URL: &str = "https://api.github.com";
const STORAGE_DIR_NAME: &str = ".pr-dashboard";

/// Delay between a credential change and the catalog fetch it triggers.
pub const CATALOG_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api: ApiConfig,
    /// `None` when no home directory can be resolved; preferences then live
    /// in memory only.
    pub storage_dir: Option<PathBuf>,
    pub settle_delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    base_url: String,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn graphql_url(&self) -> String {
        format!("{}/graphql", self.base_url)
    }

    /// Root resource, used for the credential scope check.
    pub fn root_url(&self) -> String {
        format!("{}/", self.base_url)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api = lookup(API_URL_VAR)
            .filter(|value| !value.trim().is_empty())
            .map(|value| ApiConfig::new(value.trim()))
            .unwrap_or_default();

        let storage_dir = lookup(HOME_VAR)
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(STORAGE_DIR_NAME)));

        Self {
            api,
            storage_dir,
            settle_delay: CATALOG_SETTLE_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_public_github() {
        let config = config_with(&[("HOME", "/home/dev")]);
        assert_eq!(config.api.graphql_url(), "https://api.github.com/graphql");
        assert_eq!(config.api.root_url(), "https://api.github.com/");
        assert_eq!(
            config.storage_dir,
            Some(PathBuf::from("/home/dev/.pr-dashboard"))
        );
        assert_eq!(config.settle_delay, Duration::from_secs(1));
    }

    #[test]
    fn explicit_overrides_win() {
        let config = config_with(&[
            ("HOME", "/home/dev"),
            (API_URL_VAR, "https://ghe.example.com/api/"),
            (HOME_VAR, "/var/lib/dashboard"),
        ]);
        assert_eq!(
            config.api.graphql_url(),
            "https://ghe.example.com/api/graphql"
        );
        assert_eq!(
            config.storage_dir,
            Some(PathBuf::from("/var/lib/dashboard"))
        );
    }

    #[test]
    fn missing_home_means_no_storage_dir() {
        let config = config_with(&[]);
        assert!(config.storage_dir.is_none());
    }
}
