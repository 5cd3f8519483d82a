//! Application configuration.
//!
//! Configuration is read once from the process environment at startup and is
//! immutable afterwards. All six connection variables are required; the rest
//! have defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::models::{AuthType, InstanceUri, IpType};

pub const ENV_PROJECT_ID: &str = "PROJECT_ID";
pub const ENV_REGION: &str = "DB_REGION";
pub const ENV_CLUSTER_NAME: &str = "DB_CLUSTER_NAME";
pub const ENV_INSTANCE_NAME: &str = "DB_INSTANCE_NAME";
pub const ENV_DB_USER: &str = "DB_USER";
pub const ENV_DB_NAME: &str = "DB_NAME";

/// Required variables, in the order they are validated.
pub const REQUIRED_ENV_VARS: [&str; 6] = [
    ENV_PROJECT_ID,
    ENV_REGION,
    ENV_CLUSTER_NAME,
    ENV_INSTANCE_NAME,
    ENV_DB_USER,
    ENV_DB_NAME,
];

const ENV_IP_TYPE: &str = "DB_IP_TYPE";
const ENV_AUTH_TYPE: &str = "DB_AUTH_TYPE";
const ENV_CONNECT_TIMEOUT: &str = "DB_CONNECT_TIMEOUT_SECS";
const ENV_MAX_CONNECTIONS: &str = "DB_MAX_CONNECTIONS";
const ENV_ADMIN_ENDPOINT: &str = "ALLOYDB_ADMIN_ENDPOINT";
const ENV_ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

pub const DEFAULT_ADMIN_ENDPOINT: &str = "https://alloydb.googleapis.com";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub project_id: String,
    pub region: String,
    pub cluster_name: String,
    pub instance_name: String,
    pub db_user: String,
    pub db_name: String,
    pub ip_type: IpType,
    pub auth_type: AuthType,
    pub connect_timeout_secs: u64,
    pub max_connections: u32,
    pub admin_endpoint: String,
    /// Static access token; when absent the ambient identity is used.
    pub access_token: Option<String>,
}

impl AppConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns `AppError::MissingEnv` naming the first required variable that
    /// is unset or blank, or `AppError::InvalidEnv` for an unparsable
    /// optional value.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> AppResult<String> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(AppError::MissingEnv(name))
        };

        let project_id = required(ENV_PROJECT_ID)?;
        let region = required(ENV_REGION)?;
        let cluster_name = required(ENV_CLUSTER_NAME)?;
        let instance_name = required(ENV_INSTANCE_NAME)?;
        let db_user = required(ENV_DB_USER)?;
        let db_name = required(ENV_DB_NAME)?;

        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            project_id,
            region,
            cluster_name,
            instance_name,
            db_user,
            db_name,
            ip_type: parse_optional::<IpType>(ENV_IP_TYPE, optional(ENV_IP_TYPE))?.unwrap_or_default(),
            auth_type: parse_optional::<AuthType>(ENV_AUTH_TYPE, optional(ENV_AUTH_TYPE))?
                .unwrap_or_default(),
            connect_timeout_secs: parse_optional::<u64>(ENV_CONNECT_TIMEOUT, optional(ENV_CONNECT_TIMEOUT))?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_connections: parse_optional::<u32>(ENV_MAX_CONNECTIONS, optional(ENV_MAX_CONNECTIONS))?
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            admin_endpoint: optional(ENV_ADMIN_ENDPOINT)
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_ADMIN_ENDPOINT.to_string()),
            access_token: optional(ENV_ACCESS_TOKEN),
        };

        if config.max_connections == 0 {
            return Err(AppError::InvalidEnv {
                name: ENV_MAX_CONNECTIONS,
                reason: "must be at least 1".into(),
            });
        }

        tracing::debug!(
            ip_type = %config.ip_type,
            auth_type = %config.auth_type,
            timeout_secs = config.connect_timeout_secs,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Composes the instance resource identifier.
    pub fn instance_uri(&self) -> InstanceUri {
        InstanceUri::new(
            &self.project_id,
            &self.region,
            &self.cluster_name,
            &self.instance_name,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn parse_optional<T>(name: &'static str, value: Option<String>) -> AppResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| AppError::InvalidEnv {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn full_env() -> HashMap<&'static str, String> {
        HashMap::from([
            (ENV_PROJECT_ID, "proj1".to_string()),
            (ENV_REGION, "us-central1".to_string()),
            (ENV_CLUSTER_NAME, "mycluster".to_string()),
            (ENV_INSTANCE_NAME, "myinstance".to_string()),
            (ENV_DB_USER, "svc@proj1.iam".to_string()),
            (ENV_DB_NAME, "postgres".to_string()),
        ])
    }

    fn load(env: &HashMap<&'static str, String>) -> AppResult<AppConfig> {
        AppConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn test_loads_with_defaults() {
        let config = load(&full_env()).unwrap();
        assert_eq!(config.db_user, "svc@proj1.iam");
        assert_eq!(config.ip_type, IpType::Private);
        assert_eq!(config.auth_type, AuthType::Iam);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.admin_endpoint, DEFAULT_ADMIN_ENDPOINT);
        assert!(config.access_token.is_none());
    }

    #[test]
    fn test_each_missing_variable_is_named() {
        for name in REQUIRED_ENV_VARS {
            let mut env = full_env();
            env.remove(name);
            match load(&env) {
                Err(AppError::MissingEnv(missing)) => assert_eq!(missing, name),
                other => panic!("expected MissingEnv({name}), got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_variable_counts_as_missing() {
        for name in REQUIRED_ENV_VARS {
            let mut env = full_env();
            env.insert(name, "  ".to_string());
            assert!(matches!(load(&env), Err(AppError::MissingEnv(n)) if n == name));
        }
    }

    #[test]
    fn test_first_missing_variable_wins() {
        let mut env = full_env();
        env.remove(ENV_DB_NAME);
        env.remove(ENV_REGION);
        assert!(matches!(load(&env), Err(AppError::MissingEnv(ENV_REGION))));
    }

    #[test]
    fn test_instance_uri() {
        let config = load(&full_env()).unwrap();
        assert_eq!(
            config.instance_uri().to_string(),
            "projects/proj1/locations/us-central1/clusters/mycluster/instances/myinstance"
        );
    }

    #[test]
    fn test_optional_overrides() {
        let mut env = full_env();
        env.insert(ENV_IP_TYPE, "public".to_string());
        env.insert(ENV_AUTH_TYPE, "NATIVE".to_string());
        env.insert(ENV_CONNECT_TIMEOUT, "5".to_string());
        env.insert(ENV_ADMIN_ENDPOINT, "http://localhost:9000/".to_string());
        env.insert(ENV_ACCESS_TOKEN, "ya29.token".to_string());
        let config = load(&env).unwrap();
        assert_eq!(config.ip_type, IpType::Public);
        assert_eq!(config.auth_type, AuthType::Native);
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.admin_endpoint, "http://localhost:9000");
        assert_eq!(config.access_token.as_deref(), Some("ya29.token"));
    }

    #[test]
    fn test_invalid_optional_value_is_named() {
        let mut env = full_env();
        env.insert(ENV_CONNECT_TIMEOUT, "soon".to_string());
        assert!(matches!(
            load(&env),
            Err(AppError::InvalidEnv { name: ENV_CONNECT_TIMEOUT, .. })
        ));

        let mut env = full_env();
        env.insert(ENV_MAX_CONNECTIONS, "0".to_string());
        assert!(matches!(
            load(&env),
            Err(AppError::InvalidEnv { name: ENV_MAX_CONNECTIONS, .. })
        ));
    }
}
