//! Client configuration
//!
//! Loaded from a YAML file or from environment variables:
//!   OBJECT_PAGE_BASE_URL      service root, e.g. `https://host/AccountManagerService7` (required)
//!   OBJECT_PAGE_TIMEOUT_SECS  request timeout (default: 30)
//!   OBJECT_PAGE_TOKEN         bearer token (optional)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

pub const BASE_URL_VAR: &str = "OBJECT_PAGE_BASE_URL";
pub const TIMEOUT_VAR: &str = "OBJECT_PAGE_TIMEOUT_SECS";
pub const TOKEN_VAR: &str = "OBJECT_PAGE_TOKEN";

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            bearer_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let base_url = var(BASE_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ClientError::Config(format!("{BASE_URL_VAR} not set")))?;
        let timeout_secs = match var(TIMEOUT_VAR) {
            Some(raw) => raw.trim().parse().map_err(|_| {
                ClientError::Config(format!("{TIMEOUT_VAR} is not a number: {raw}"))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        Ok(Self {
            base_url,
            timeout_secs,
            bearer_token: var(TOKEN_VAR).filter(|t| !t.is_empty()),
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ClientError> {
        serde_yaml::from_str(yaml).map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    /// `{base_url}/rest/{path}` with exactly one slash at the join.
    pub fn rest_url(&self, path: &str) -> String {
        format!(
            "{}/rest/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = ClientConfig::from_vars(vars(&[(BASE_URL_VAR, "http://svc/")])).unwrap();
        assert_eq!(config.base_url, "http://svc/");
        assert_eq!(config.timeout_secs, 30);
        assert!(config.bearer_token.is_none());
        assert_eq!(config.rest_url("/model/search"), "http://svc/rest/model/search");
    }

    #[test]
    fn test_from_vars_reads_all() {
        let config = ClientConfig::from_vars(vars(&[
            (BASE_URL_VAR, "http://svc"),
            (TIMEOUT_VAR, "5"),
            (TOKEN_VAR, "abc"),
        ]))
        .unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.bearer_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_from_vars_errors() {
        assert!(ClientConfig::from_vars(vars(&[])).is_err());
        let err = ClientConfig::from_vars(vars(&[(BASE_URL_VAR, "http://svc"), (TIMEOUT_VAR, "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains(TIMEOUT_VAR));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_url: http://svc\nbearer_token: t0k").unwrap();
        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config, ClientConfig::new("http://svc").with_token("t0k"));
    }
}
