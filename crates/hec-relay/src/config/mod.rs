// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay configuration.
//!
//! The YAML file is deserialised into the loose [`yaml::RawConfig`] shape and then validated
//! into the immutable types below. Validation stops at the first problem; nothing binds until
//! the whole file is valid.

pub mod log_type;
pub mod template;
pub mod yaml;

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::acl::Acl;
use crate::errors::ConfigError;
use log_type::LogType;
use yaml::{RawConfig, RawListener, RawSplunk};

pub const DEFAULT_MAX_LINE_BYTES: usize = 1_048_576;
pub const DEFAULT_HEALTH_CHECK_ADDR: &str = ":9099";
pub const DEFAULT_HEC_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Validated configuration for the whole process.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub health: Option<HealthConfig>,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub addr: SocketAddr,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Resolved HTTP event collector settings for one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HecConfig {
    pub url: Url,
    pub token: String,
    pub gzip: bool,
    pub source_type: Option<String>,
    pub timeout: Duration,
}

impl HecConfig {
    #[must_use]
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        HecConfig {
            url,
            token: token.into(),
            gzip: false,
            source_type: None,
            timeout: DEFAULT_HEC_TIMEOUT,
        }
    }
}

/// One listening socket and everything its connections share.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    pub log_type: Option<LogType>,
    pub tls: Option<TlsConfig>,
    pub acl: Acl,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub max_line_bytes: usize,
    pub hec: Option<HecConfig>,
    /// 0 forwards inline on the connection task; otherwise the depth of the listener's
    /// forward queue.
    pub forward_queue_depth: usize,
}

impl ListenerConfig {
    /// Plain TCP listener with defaults for everything optional.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        listen_addr: SocketAddr,
        output_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
    ) -> Self {
        ListenerConfig {
            name: name.into(),
            listen_addr,
            log_type: None,
            tls: None,
            acl: Acl::allow_all(),
            output_dir: output_dir.into(),
            file_prefix: file_prefix.into(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            hec: None,
            forward_queue_depth: 0,
        }
    }
}

impl Config {
    /// Loads and validates the YAML file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        Config::from_raw(yaml::load_file(path)?)
    }

    /// Loads and validates YAML held in memory.
    pub fn from_yaml_str(yaml: &str) -> Result<Config, ConfigError> {
        Config::from_raw(yaml::load_str(yaml)?)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Config, ConfigError> {
        if raw.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut listeners = Vec::with_capacity(raw.listeners.len());
        for (index, raw_listener) in raw.listeners.iter().enumerate() {
            listeners.push(validate_listener(index, raw_listener, &raw.splunk)?);
        }
        check_uniqueness(&listeners)?;

        let health = if raw.health_check_enabled {
            let addr_str = raw
                .health_check_addr
                .as_deref()
                .unwrap_or(DEFAULT_HEALTH_CHECK_ADDR);
            let addr = parse_listen_addr(addr_str)
                .ok_or_else(|| ConfigError::InvalidHealthAddr(addr_str.to_string()))?;
            let interval = raw
                .health_check_interval_secs
                .map_or(MIN_HEALTH_CHECK_INTERVAL, Duration::from_secs)
                .max(MIN_HEALTH_CHECK_INTERVAL);
            Some(HealthConfig { addr, interval })
        } else {
            None
        };

        Ok(Config {
            log_level: raw
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            health,
            listeners,
        })
    }
}

/// Accepts `host:port`, `[v6]:port` and the Go-style `:port` (all IPv4 interfaces).
#[must_use]
pub fn parse_listen_addr(addr: &str) -> Option<SocketAddr> {
    let addr = addr.trim();
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    if let Ok(parsed) = normalized.parse::<SocketAddr>() {
        return Some(parsed);
    }
    normalized.to_socket_addrs().ok()?.next()
}

fn validate_listener(
    index: usize,
    raw: &RawListener,
    global: &RawSplunk,
) -> Result<ListenerConfig, ConfigError> {
    let name = required(index, "name", raw.name.as_ref())?;
    let listen_addr_str = required(index, "listen_addr", raw.listen_addr.as_ref())?;
    let output_dir = required(index, "output_dir", raw.output_dir.as_ref())?;
    let file_prefix = required(index, "file_prefix", raw.file_prefix.as_ref())?;

    let listen_addr =
        parse_listen_addr(&listen_addr_str).ok_or_else(|| ConfigError::InvalidValue {
            listener: name.clone(),
            field: "listen_addr",
            value: listen_addr_str.clone(),
            reason: "expected host:port or :port".to_string(),
        })?;

    if file_prefix.contains(['/', '\\']) {
        return Err(ConfigError::InvalidValue {
            listener: name,
            field: "file_prefix",
            value: file_prefix,
            reason: "must not contain path separators".to_string(),
        });
    }

    let log_type = raw
        .log_type
        .as_deref()
        .map(|value| {
            value
                .parse::<LogType>()
                .map_err(|_| ConfigError::UnknownLogType {
                    listener: name.clone(),
                    value: value.to_string(),
                })
        })
        .transpose()?;

    let max_line_bytes = raw.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES);
    if max_line_bytes == 0 {
        return Err(ConfigError::InvalidValue {
            listener: name,
            field: "max_line_bytes",
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }

    let tls = match &raw.tls {
        None => None,
        Some(tls) => match (&tls.cert_file, &tls.key_file) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_file: PathBuf::from(cert),
                key_file: PathBuf::from(key),
            }),
            _ => return Err(ConfigError::HalfSpecifiedTls { listener: name }),
        },
    };

    let acl = Acl::new(&raw.allowed_cidrs)?;
    let hec = resolve_hec(&name, &raw.splunk, global)?;

    Ok(ListenerConfig {
        name,
        listen_addr,
        log_type,
        tls,
        acl,
        output_dir: PathBuf::from(output_dir),
        file_prefix,
        max_line_bytes,
        hec,
        forward_queue_depth: raw.forward_queue_depth.unwrap_or(0),
    })
}

/// Per-listener `splunk` fields win over the global block, field by field.
fn resolve_hec(
    listener: &str,
    local: &RawSplunk,
    global: &RawSplunk,
) -> Result<Option<HecConfig>, ConfigError> {
    let url = local.hec_url.as_ref().or(global.hec_url.as_ref());
    let token = local.hec_token.as_ref().or(global.hec_token.as_ref());

    let (url, token) = match (url, token) {
        (None, None) => return Ok(None),
        (Some(url), Some(token)) => (url, token),
        _ => {
            return Err(ConfigError::HalfSpecifiedHec {
                listener: listener.to_string(),
            })
        }
    };

    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidValue {
        listener: listener.to_string(),
        field: "splunk.hec_url",
        value: url.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigError::InvalidValue {
            listener: listener.to_string(),
            field: "splunk.hec_url",
            value: url.clone(),
            reason: "expected an http:// or https:// URL".to_string(),
        });
    }

    let Some(source_type) = local.source_type.clone() else {
        return Err(ConfigError::MissingSourceType {
            listener: listener.to_string(),
        });
    };

    let timeout = local
        .timeout_secs
        .or(global.timeout_secs)
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_HEC_TIMEOUT, Duration::from_secs);

    Ok(Some(HecConfig {
        url: parsed,
        token: token.clone(),
        gzip: local.gzip.or(global.gzip).unwrap_or(false),
        source_type: Some(source_type),
        timeout,
    }))
}

fn check_uniqueness(listeners: &[ListenerConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for listener in listeners {
        if !names.insert(listener.name.as_str()) {
            return Err(ConfigError::DuplicateName(listener.name.clone()));
        }
    }
    for (i, first) in listeners.iter().enumerate() {
        for second in &listeners[i + 1..] {
            if first.output_dir == second.output_dir && first.file_prefix == second.file_prefix {
                return Err(ConfigError::DuplicateOutput {
                    first: first.name.clone(),
                    second: second.name.clone(),
                    dir: first.output_dir.clone(),
                    prefix: first.file_prefix.clone(),
                });
            }
        }
    }
    Ok(())
}

fn required(index: usize, field: &'static str, value: Option<&String>) -> Result<String, ConfigError> {
    value
        .cloned()
        .ok_or(ConfigError::MissingField { index, field })
}
