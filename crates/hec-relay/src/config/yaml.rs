// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! YAML file shape, deserialised as-is before validation.
//!
//! ```yaml
//! log_level: info
//! splunk:
//!   hec_url: https://splunk.example.com:8088/services/collector/raw
//!   hec_token: 11111111-2222-3333-4444-555555555555
//!   gzip: true
//! health_check_enabled: true
//! health_check_addr: ":9099"
//! listeners:
//!   - name: user-activity
//!     listen_addr: ":20001"
//!     log_type: user-activity
//!     output_dir: /var/log/relay
//!     file_prefix: zpa-user-activity
//!     allowed_cidrs: "10.0.0.0/8, 192.168.0.0/16"
//!     splunk:
//!       source_type: zpa:user-activity
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer};

use crate::errors::ConfigError;

/// Top-level scalars that may also come from `RELAY_*` environment variables.
const ENV_OVERRIDABLE: [&str; 3] = ["log_level", "health_check_enabled", "health_check_addr"];

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RawConfig {
    pub log_level: Option<String>,
    pub splunk: RawSplunk,
    pub health_check_enabled: bool,
    pub health_check_addr: Option<String>,
    pub health_check_interval_secs: Option<u64>,
    pub listeners: Vec<RawListener>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RawSplunk {
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub hec_url: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub hec_token: Option<String>,
    pub gzip: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub source_type: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RawTls {
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub cert_file: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub key_file: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RawListener {
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub name: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub listen_addr: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub log_type: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub output_dir: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_trimmed")]
    pub file_prefix: Option<String>,
    pub tls: Option<RawTls>,
    #[serde(deserialize_with = "deserialize_cidr_list")]
    pub allowed_cidrs: Vec<String>,
    pub max_line_bytes: Option<usize>,
    pub splunk: RawSplunk,
    pub forward_queue_depth: Option<usize>,
}

/// Reads the YAML file at `path`, then applies `RELAY_*` environment overrides.
pub fn load_file(path: &Path) -> Result<RawConfig, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Load(format!(
            "configuration file {} does not exist",
            path.display()
        )));
    }
    extract(Figment::new().merge(Yaml::file(path)))
}

/// Same as [`load_file`] for YAML held in memory.
pub fn load_str(yaml: &str) -> Result<RawConfig, ConfigError> {
    extract(Figment::new().merge(Yaml::string(yaml)))
}

fn extract(figment: Figment) -> Result<RawConfig, ConfigError> {
    figment
        .merge(Env::prefixed("RELAY_").only(&ENV_OVERRIDABLE))
        .extract::<RawConfig>()
        .map_err(|e| ConfigError::Load(e.to_string()))
}

fn deserialize_optional_trimmed<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

/// `allowed_cidrs` is either `"10.0.0.0/8, 172.16.0.0/12"` or a YAML list.
fn deserialize_cidr_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<StringOrList> = Option::deserialize(deserializer)?;
    let items = match raw {
        None => Vec::new(),
        Some(StringOrList::One(s)) => s.split(',').map(str::to_string).collect(),
        Some(StringOrList::Many(list)) => list
            .iter()
            .flat_map(|entry| entry.split(','))
            .map(str::to_string)
            .collect(),
    };
    Ok(items
        .into_iter()
        .map(|cidr| cidr.trim().to_string())
        .filter(|cidr| !cidr.is_empty())
        .collect())
}
