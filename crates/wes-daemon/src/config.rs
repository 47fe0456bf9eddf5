// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for wes-daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use wes_core::WorkflowType;

/// Which executor backend the daemon dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// In-process stub that simulates download, process and upload steps.
    Local,
    /// AWS HealthOmics.
    Omics,
    /// Arvados container requests.
    Arvados,
    /// Seven Bridges / Velsera platform tasks.
    SevenBridges,
}

impl ExecutorKind {
    /// Configuration name of the executor.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Local => "local",
            ExecutorKind::Omics => "omics",
            ExecutorKind::Arvados => "arvados",
            ExecutorKind::SevenBridges => "sevenbridges",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutorKind::Local),
            "omics" | "healthomics" => Ok(ExecutorKind::Omics),
            "arvados" => Ok(ExecutorKind::Arvados),
            "sevenbridges" | "velsera" => Ok(ExecutorKind::SevenBridges),
            other => Err(ConfigError::UnknownExecutor(other.to_string())),
        }
    }
}

/// AWS HealthOmics settings.
#[derive(Debug, Clone)]
pub struct OmicsConfig {
    /// Region hosting the Omics workflows.
    pub region: String,
    /// IAM role Omics assumes for runs.
    pub role_arn: String,
    /// Base S3 location for run outputs, e.g. `s3://my-bucket`.
    pub output_bucket: String,
    /// Overrides the Omics API endpoint (tests, VPC endpoints).
    pub endpoint: Option<String>,
    /// Overrides the S3 endpoint used for manifest downloads.
    pub s3_endpoint: Option<String>,
    /// SigV4 credentials.
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// Arvados settings.
#[derive(Debug, Clone)]
pub struct ArvadosConfig {
    /// API host, e.g. `zzzzz.arvadosapi.com`, or a full base URL.
    pub api_host: String,
    pub api_token: String,
    /// Project owning the container requests.
    pub project_uuid: String,
}

/// Seven Bridges settings.
#[derive(Debug, Clone)]
pub struct SevenBridgesConfig {
    pub api_token: String,
    /// API base URL. Default: `https://api.sbgenomics.com/v2`
    pub endpoint: String,
    /// Project (`owner/project`) tasks are created in.
    pub project: String,
}

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Run store URL (`postgres://...` or `sqlite:...`).
    pub database_url: String,
    /// Maximum database connections in the pool.
    pub database_max_connections: u32,
    /// Selected executor backend.
    pub executor: ExecutorKind,
    /// Sleep between monitor iterations.
    pub poll_interval: Duration,
    /// Maximum number of runs holding a backend slot at once.
    pub max_concurrent_runs: usize,
    /// Accepted versions per workflow language.
    pub workflow_type_versions: BTreeMap<WorkflowType, Vec<String>>,
    pub omics: Option<OmicsConfig>,
    pub arvados: Option<ArvadosConfig>,
    pub sevenbridges: Option<SevenBridgesConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("WES_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .ok_or(ConfigError::MissingEnvVar(
                "WES_DATABASE_URL or DATABASE_URL",
            ))?;

        let database_max_connections =
            parse_number(&lookup, "WES_DATABASE_MAX_CONNECTIONS", 10u32)?;

        let executor = match lookup("WES_WORKFLOW_EXECUTOR") {
            Some(value) => value.parse()?,
            None => ExecutorKind::Local,
        };

        let poll_interval =
            Duration::from_secs(parse_number(&lookup, "WES_DAEMON_POLL_INTERVAL", 5u64)?);
        let max_concurrent_runs = parse_number(&lookup, "WES_DAEMON_MAX_CONCURRENT_RUNS", 10usize)?;
        if max_concurrent_runs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WES_DAEMON_MAX_CONCURRENT_RUNS",
                value: "0".to_string(),
            });
        }

        let mut workflow_type_versions = BTreeMap::new();
        workflow_type_versions.insert(
            WorkflowType::Cwl,
            parse_list(lookup("WES_CWL_VERSIONS"), &["v1.0", "v1.1", "v1.2"]),
        );
        workflow_type_versions.insert(
            WorkflowType::Wdl,
            parse_list(lookup("WES_WDL_VERSIONS"), &["1.0", "draft-2"]),
        );

        let omics = match executor {
            ExecutorKind::Omics => Some(OmicsConfig {
                region: lookup("OMICS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                role_arn: required(&lookup, "OMICS_ROLE_ARN")?,
                output_bucket: required(&lookup, "OMICS_OUTPUT_BUCKET")?,
                endpoint: lookup("OMICS_ENDPOINT_URL"),
                s3_endpoint: lookup("OMICS_S3_ENDPOINT_URL"),
                access_key_id: required(&lookup, "AWS_ACCESS_KEY_ID")?,
                secret_access_key: required(&lookup, "AWS_SECRET_ACCESS_KEY")?,
                session_token: lookup("AWS_SESSION_TOKEN").filter(|token| !token.is_empty()),
            }),
            _ => None,
        };

        let arvados = match executor {
            ExecutorKind::Arvados => Some(ArvadosConfig {
                api_host: required(&lookup, "ARVADOS_API_HOST")?,
                api_token: required(&lookup, "ARVADOS_API_TOKEN")?,
                project_uuid: required(&lookup, "ARVADOS_PROJECT_UUID")?,
            }),
            _ => None,
        };

        let sevenbridges = match executor {
            ExecutorKind::SevenBridges => Some(SevenBridgesConfig {
                api_token: required(&lookup, "SEVENBRIDGES_API_TOKEN")?,
                endpoint: lookup("SEVENBRIDGES_API_ENDPOINT")
                    .unwrap_or_else(|| "https://api.sbgenomics.com/v2".to_string()),
                project: required(&lookup, "SEVENBRIDGES_PROJECT")?,
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            database_max_connections,
            executor,
            poll_interval,
            max_concurrent_runs,
            workflow_type_versions,
            omics,
            arvados,
            sevenbridges,
        })
    }
}

fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::MissingEnvVar(key))
}

fn parse_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn parse_list(value: Option<String>, default: &[&str]) -> Vec<String> {
    match value {
        Some(value) => value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        None => default.iter().map(|item| item.to_string()).collect(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    /// The executor name is not recognised.
    #[error("Unknown workflow executor: {0} (expected local, omics, arvados or sevenbridges)")]
    UnknownExecutor(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup(&[("WES_DATABASE_URL", "sqlite::memory:")])).unwrap();
        assert_eq!(config.executor, ExecutorKind::Local);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_runs, 10);
        assert_eq!(
            config.workflow_type_versions[&WorkflowType::Cwl],
            vec!["v1.0", "v1.1", "v1.2"]
        );
        assert_eq!(
            config.workflow_type_versions[&WorkflowType::Wdl],
            vec!["1.0", "draft-2"]
        );
        assert!(config.omics.is_none());
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn test_omics_requires_role_and_bucket() {
        let err = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_WORKFLOW_EXECUTOR", "omics"),
            ("OMICS_ROLE_ARN", "arn:aws:iam::123:role/omics"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("OMICS_OUTPUT_BUCKET")));

        let err = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_WORKFLOW_EXECUTOR", "omics"),
            ("OMICS_ROLE_ARN", "arn:aws:iam::123:role/omics"),
            ("OMICS_OUTPUT_BUCKET", "s3://outputs"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("AWS_ACCESS_KEY_ID")));

        let config = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_WORKFLOW_EXECUTOR", "omics"),
            ("OMICS_ROLE_ARN", "arn:aws:iam::123:role/omics"),
            ("OMICS_OUTPUT_BUCKET", "s3://outputs"),
            ("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]))
        .unwrap();
        let omics = config.omics.unwrap();
        assert_eq!(omics.region, "us-east-1");
        assert_eq!(omics.output_bucket, "s3://outputs");
        assert!(omics.session_token.is_none());
    }

    #[test]
    fn test_invalid_numbers_and_executor() {
        let err = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_DAEMON_POLL_INTERVAL", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_WORKFLOW_EXECUTOR", "slurm"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownExecutor(_)));

        let err = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_DAEMON_MAX_CONCURRENT_RUNS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_version_lists() {
        let config = Config::from_lookup(lookup(&[
            ("WES_DATABASE_URL", "sqlite::memory:"),
            ("WES_CWL_VERSIONS", "v1.2, v1.3 ,"),
        ]))
        .unwrap();
        assert_eq!(
            config.workflow_type_versions[&WorkflowType::Cwl],
            vec!["v1.2", "v1.3"]
        );
    }
}
