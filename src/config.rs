// src/config.rs

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    convert::Infallible,
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info};

pub const DATAGOUV_PROD_URL: &str = "https://www.data.gouv.fr";
pub const DATAGOUV_DEMO_URL: &str = "https://demo.data.gouv.fr";

/// Deployment environment. Drives catalog URLs, table names and the
/// object-store prefix. Anything other than `prod` is a non-production
/// environment whose name is used as is.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Environment {
    Prod,
    #[default]
    Dev,
    Other(String),
}

impl Environment {
    pub fn as_str(&self) -> &str {
        match self {
            Environment::Prod => "prod",
            Environment::Dev => "dev",
            Environment::Other(name) => name,
        }
    }

    pub fn is_prod(&self) -> bool {
        *self == Environment::Prod
    }
}

impl FromStr for Environment {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "prod" => Environment::Prod,
            "dev" | "" => Environment::Dev,
            other => Environment::Other(other.to_string()),
        })
    }
}

impl From<String> for Environment {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(env) => env,
            Err(never) => match never {},
        }
    }
}

impl From<Environment> for String {
    fn from(env: Environment) -> Self {
        env.as_str().to_string()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named relational connection, the moral equivalent of a scheduler
/// "connection" entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    /// Database name.
    pub schema: String,
    pub login: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatagouvSettings {
    /// Catalog the pipelines publish to. Derived from the environment when unset.
    pub url: Option<String>,
    /// Catalog read-only sources are fetched from (harvest sources, discussions,
    /// exports). Production data regardless of environment.
    pub source_url: String,
    pub api_key: String,
}

impl Default for DatagouvSettings {
    fn default() -> Self {
        Self {
            url: None,
            source_url: DATAGOUV_PROD_URL.to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinioSettings {
    pub endpoint: String,
    pub bucket: String,
    pub user: String,
    pub password: String,
    pub region: String,
    /// Retries of a failed request before giving up.
    pub max_retries: usize,
    /// Public base under which uploaded objects are reachable.
    pub public_url: String,
}

impl Default for MinioSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://object.files.data.gouv.fr".to_string(),
            bucket: "data-pipeline-open".to_string(),
            user: String::new(),
            password: String::new(),
            region: "us-east-1".to_string(),
            max_retries: 10,
            public_url: "https://object.files.data.gouv.fr".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MattermostSettings {
    /// Team channel webhook used by the processing pipelines.
    pub webhook: String,
    /// Harvester channel webhook.
    pub harvester_webhook: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionsSettings {
    pub index_urls: Vec<String>,
    pub extensions: Vec<String>,
    pub max_depth: usize,
}

impl Default for ElectionsSettings {
    fn default() -> Self {
        Self {
            index_urls: vec![
                "https://www.resultats-elections.interieur.gouv.fr/telechargements/".to_string(),
            ],
            extensions: ["csv", "txt", "xlsx", "zip"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_depth: 2,
        }
    }
}

/// Process-wide settings, loaded once at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub environment: Environment,
    pub tmp_root: PathBuf,
    pub sql_dir: PathBuf,
    pub datagouv: DatagouvSettings,
    pub minio: MinioSettings,
    pub mattermost: MattermostSettings,
    pub elections: ElectionsSettings,
    pub connections: BTreeMap<String, ConnectionInfo>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            tmp_root: env::temp_dir().join("pipelines"),
            sql_dir: PathBuf::from("sql"),
            datagouv: DatagouvSettings::default(),
            minio: MinioSettings::default(),
            mattermost: MattermostSettings::default(),
            elections: ElectionsSettings::default(),
            connections: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file, then apply environment overrides.
    /// A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Self::from_yaml(&raw).with_context(|| format!("parsing config {}", path.display()))?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        settings.apply_env(|key| env::var(key).ok());
        info!(
            environment = settings.environment.as_str(),
            catalog = %settings.datagouv_url(),
            "settings loaded"
        );
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Override secrets and the environment from variables resolved by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("AIRFLOW_ENV") {
            self.environment = Environment::from(raw);
        }
        let overrides: [(&str, &mut String); 5] = [
            ("DATAGOUV_SECRET_API_KEY", &mut self.datagouv.api_key),
            ("SECRET_MINIO_DATA_PIPELINE_USER", &mut self.minio.user),
            ("SECRET_MINIO_DATA_PIPELINE_PASSWORD", &mut self.minio.password),
            ("MATTERMOST_DATAGOUV_DATAEQUIPE", &mut self.mattermost.webhook),
            (
                "MATTERMOST_DATAGOUV_MOISSONNAGE",
                &mut self.mattermost.harvester_webhook,
            ),
        ];
        for (key, slot) in overrides {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        }
    }

    /// Catalog the pipelines publish to.
    pub fn datagouv_url(&self) -> String {
        match &self.datagouv.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None if self.environment.is_prod() => DATAGOUV_PROD_URL.to_string(),
            None => DATAGOUV_DEMO_URL.to_string(),
        }
    }

    pub fn source_url(&self) -> &str {
        self.datagouv.source_url.trim_end_matches('/')
    }

    /// Name of the relational connection used in this environment.
    pub fn postgres_connection_name(&self) -> &'static str {
        if self.environment.is_prod() {
            "POSTGRES_DEV"
        } else {
            "postgres_localhost"
        }
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionInfo> {
        self.connections
            .get(name)
            .ok_or_else(|| anyhow!("no connection named `{}` in settings", name))
    }

    /// Scratch directory root of a pipeline: `<tmp_root>/<pipeline>`.
    pub fn pipeline_dir(&self, pipeline: &str) -> PathBuf {
        self.tmp_root.join(pipeline)
    }

    /// Public URL of an object uploaded to the open bucket.
    pub fn public_object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.minio.public_url.trim_end_matches('/'),
            self.minio.bucket,
            key.trim_start_matches('/')
        )
    }
}
