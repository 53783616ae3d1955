use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::resource::ResourceFormat;

const MIN_HANDSHAKE_TIMEOUT_MS: u64 = 1_000;
const MAX_HANDSHAKE_TIMEOUT_MS: u64 = 60_000;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Proxy-pool compositor",
    long_about = "proxy-compose accepts HTTP, HTTPS (CONNECT) and SOCKS5 clients on a range of ports\nand relays them through rotating upstream proxy ip pools loaded from one or more suppliers.\n\nSessions stick to one upstream ip per listening port while the ip stays usable;\nfailed upstreams are retried with parallel attempts.\n"
)]
pub struct Cli {
    /// Path of the TOML configuration file
    #[arg(short, long, default_value = "config.toml", value_name = "FILE")]
    pub config: PathBuf,

    /// IP address to bind every mapped port on (overrides global.listen_ip)
    #[arg(long)]
    pub listen_ip: Option<IpAddr>,

    /// Port space to listen on, e.g. "36000-36010:37000" (overrides global.mapping_space)
    #[arg(short, long, value_name = "SPACE")]
    pub ports: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "proxy_compose=info")]
    pub log_level: String,
}

/// The `[global]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub mapping_space: String,
    pub listen_ip: IpAddr,
    /// Every request gets a fresh session hash; disables ip affinity.
    pub random_turning: bool,
    pub enable_float_ratio: bool,
    pub max_failover_count: usize,
    pub handshake_timeout_ms: u64,
    pub relay_idle_timeout_secs: u64,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub auth_white_ips: Vec<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            mapping_space: "36000-36010".to_string(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            random_turning: false,
            enable_float_ratio: true,
            max_failover_count: 3,
            handshake_timeout_ms: 5_000,
            relay_idle_timeout_secs: 540,
            auth_username: None,
            auth_password: None,
            auth_white_ips: Vec::new(),
        }
    }
}

impl GlobalSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(
            self.handshake_timeout_ms
                .clamp(MIN_HANDSHAKE_TIMEOUT_MS, MAX_HANDSHAKE_TIMEOUT_MS),
        )
    }

    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_idle_timeout_secs)
    }

    pub fn max_failover(&self) -> usize {
        self.max_failover_count.max(1)
    }

    pub fn ports(&self) -> Result<Vec<u16>, ConfigError> {
        parse_port_space(&self.mapping_space)
    }
}

/// One `[[source]]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub enable: bool,
    /// http(s) URL, file path or inline resource text
    pub load_url: String,
    pub resource_format: ResourceFormat,
    pub upstream_auth_user: String,
    pub upstream_auth_password: String,
    pub pool_size: usize,
    pub ratio: u32,
    pub support_protocol: String,
    pub reload_interval_secs: u64,
    pub max_alive_secs: u64,
    pub conn_idle_secs: u64,
    /// 0 disables background warm connections
    pub make_conn_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enable: false,
            load_url: String::new(),
            resource_format: ResourceFormat::Plain,
            upstream_auth_user: String::new(),
            upstream_auth_password: String::new(),
            pool_size: 0,
            ratio: 1,
            support_protocol: "socks5".to_string(),
            reload_interval_secs: 60,
            max_alive_secs: 1200,
            conn_idle_secs: 5,
            make_conn_interval_ms: 500,
        }
    }
}

impl SourceConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalSettings,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Command line values win over the file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(ip) = cli.listen_ip {
            self.global.listen_ip = ip;
        }
        if let Some(ports) = &cli.ports {
            self.global.mapping_space = ports.clone();
        }
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enable)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.global.ports()?;
        crate::auth::AuthRules::from_settings(&self.global)?;

        let mut names = HashSet::new();
        for source in self.enabled_sources() {
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
            if source.pool_size == 0 {
                return Err(ConfigError::PoolSize(source.name.clone()));
            }
            crate::handshake::parse_support_protocols(&source.support_protocol)?;
            crate::loader::LoadSource::detect(&source.load_url).map_err(|source_err| {
                ConfigError::LoadUrl {
                    name: source.name.clone(),
                    source: source_err,
                }
            })?;
        }
        if names.is_empty() {
            return Err(ConfigError::NoSources);
        }
        Ok(())
    }
}

/// Parses a port space such as `36000-36010:37000` or `8080,8081-8082` into
/// sorted distinct ports.
pub fn parse_port_space(space: &str) -> Result<Vec<u16>, ConfigError> {
    let invalid = || ConfigError::PortSpace(space.to_string());
    let parse_port = |s: &str| -> Result<u16, ConfigError> {
        match s.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(invalid()),
            Ok(port) => Ok(port),
        }
    };

    let mut ports = BTreeSet::new();
    for item in space.split([':', ',']).map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_port(start)?, parse_port(end)?);
                if start > end {
                    return Err(invalid());
                }
                ports.extend(start..=end);
            }
            None => {
                ports.insert(parse_port(item)?);
            }
        }
    }
    if ports.is_empty() {
        return Err(invalid());
    }
    Ok(ports.into_iter().collect())
}
