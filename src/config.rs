use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "agroclim.json";
pub const DEFAULT_CHIRPS_URL: &str = "https://data.chc.ucsb.edu/products/CHIRPS-2.0/global_daily/tifs/p05/{year}/chirps-v2.0.{year}.{month}.{day}.tif.gz";
pub const DEFAULT_BUNDLE_ENDPOINT: &str = "https://cds.climate.copernicus.eu/api";
pub const DEFAULT_BUNDLE_DATASET: &str = "sis-agrometeorological-indicators";
pub const DEFAULT_BUNDLE_VERSION: &str = "1_1";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_BUNDLE_MAX_WAIT_SECS: u64 = 6 * 60 * 60;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub chirps_url_template: Option<String>,
    #[serde(default)]
    pub bundle_endpoint: Option<String>,
    #[serde(default)]
    pub bundle_dataset: Option<String>,
    #[serde(default)]
    pub bundle_version: Option<String>,
    #[serde(default)]
    pub bundle_max_wait_secs: Option<u64>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub keep_intermediates: Option<bool>,
    #[serde(default)]
    pub boundaries_dir: Option<PathBuf>,
    #[serde(default)]
    pub min_artifact_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub chirps_url_template: String,
    pub bundle_endpoint: String,
    pub bundle_dataset: String,
    pub bundle_version: String,
    pub bundle_api_key: Option<String>,
    pub bundle_max_wait: Duration,
    pub catalog_url: Option<String>,
    pub catalog_credentials: Option<(String, String)>,
    pub concurrency: usize,
    pub keep_intermediates: bool,
    pub boundaries_dir: PathBuf,
    pub min_artifact_bytes: u64,
}

impl ResolvedConfig {
    pub fn chirps_url(&self, date: NaiveDate) -> String {
        self.chirps_url_template
            .replace("{year}", &date.format("%Y").to_string())
            .replace("{month}", &date.format("%m").to_string())
            .replace("{day}", &date.format("%d").to_string())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `agroclim.json` when present. No file means defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let config = if path.is_none() && !config_path.exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| PipelineError::Config(err.to_string()))?
        };

        Self::resolve_with_env(config, |name| std::env::var(name).ok())
    }

    /// Fills defaults and picks up credentials through `env`. Blank values count as unset.
    pub fn resolve_with_env<F>(config: Config, env: F) -> Result<ResolvedConfig, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        let chirps_url_template = config
            .chirps_url_template
            .unwrap_or_else(|| DEFAULT_CHIRPS_URL.to_string());
        for placeholder in ["{year}", "{month}", "{day}"] {
            if !chirps_url_template.contains(placeholder) {
                return Err(PipelineError::Config(format!(
                    "chirps_url_template lacks {placeholder}"
                )));
            }
        }

        let concurrency = config.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(PipelineError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let catalog_credentials = match (env("GEO_USER"), env("GEO_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };

        Ok(ResolvedConfig {
            chirps_url_template,
            bundle_endpoint: config
                .bundle_endpoint
                .unwrap_or_else(|| DEFAULT_BUNDLE_ENDPOINT.to_string()),
            bundle_dataset: config
                .bundle_dataset
                .unwrap_or_else(|| DEFAULT_BUNDLE_DATASET.to_string()),
            bundle_version: config
                .bundle_version
                .unwrap_or_else(|| DEFAULT_BUNDLE_VERSION.to_string()),
            bundle_api_key: env("CDS_API_KEY"),
            bundle_max_wait: Duration::from_secs(
                config
                    .bundle_max_wait_secs
                    .unwrap_or(DEFAULT_BUNDLE_MAX_WAIT_SECS),
            ),
            catalog_url: env("GEO_URL").or(config.catalog_url),
            catalog_credentials,
            concurrency,
            keep_intermediates: config.keep_intermediates.unwrap_or(false),
            boundaries_dir: config
                .boundaries_dir
                .unwrap_or_else(|| PathBuf::from("boundaries")),
            min_artifact_bytes: config.min_artifact_bytes.unwrap_or(1),
        })
    }
}
