use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// One upstream proxy endpoint as delivered by a supplier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyIp {
    #[serde(alias = "host", alias = "proxy_host")]
    pub proxy_host: String,
    #[serde(alias = "port", alias = "proxy_port")]
    pub proxy_port: u16,
    #[serde(alias = "user_name", alias = "username")]
    pub user_name: Option<String>,
    pub password: Option<String>,
    /// Absolute expiry in unix milliseconds.
    #[serde(alias = "expire_time")]
    pub expire_time: Option<u64>,
    #[serde(alias = "out_ip")]
    pub out_ip: Option<String>,
    #[serde(alias = "resource_id")]
    pub resource_id: Option<String>,
}

impl ProxyIp {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_host: host.into(),
            proxy_port: port,
            ..Default::default()
        }
    }

    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    /// Fills the resource id with `host:port` when the supplier left it blank.
    pub fn resolve_id(mut self) -> Self {
        if self.resource_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            self.resource_id = Some(self.ip_port());
        }
        self
    }

    pub fn id(&self) -> String {
        match self.resource_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => self.ip_port(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.proxy_host.trim().is_empty() && self.proxy_port > 0 && self.proxy_port < 65535
    }

    /// Both user name and password, when neither is blank.
    pub fn user_pass(&self) -> Option<(&str, &str)> {
        let user = self.user_name.as_deref().filter(|u| !u.trim().is_empty())?;
        let pass = self.password.as_deref().filter(|p| !p.trim().is_empty())?;
        Some((user, pass))
    }

    /// `Basic ...` header value for HTTP proxies, when credentials are present.
    pub fn basic_authorization(&self) -> Option<String> {
        let (user, pass) = self.user_pass()?;
        let token =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        Some(format!("Basic {}", token))
    }
}

impl fmt::Display for ProxyIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.proxy_host, self.proxy_port)
    }
}

/// Why an ip left its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ServerUnavailable,
    QualityBad,
    IdlePoolOverflow,
    AliveTimeReached,
    ResourceClose,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DropReason::ServerUnavailable => "server unavailable",
            DropReason::QualityBad => "quality bad",
            DropReason::IdlePoolOverflow => "idle pool overflow",
            DropReason::AliveTimeReached => "alive time reached",
            DropReason::ResourceClose => "resource close",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for ResourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("json") {
            Ok(ResourceFormat::Json)
        } else if s.eq_ignore_ascii_case("plain") || s.trim().is_empty() {
            Ok(ResourceFormat::Plain)
        } else {
            Err(format!("unknown resource format {:?}", s))
        }
    }
}

impl ResourceFormat {
    pub fn parse(self, text: &str) -> Result<Vec<ProxyIp>, ResourceError> {
        match self {
            ResourceFormat::Plain => Ok(parse_plain(text)),
            ResourceFormat::Json => parse_json(text),
        }
    }
}

/// Parses `host:port`, `host:start-end` and `user:pass@host:port` items
/// separated by commas or newlines. Output is sorted by host then port, with
/// duplicates removed; malformed items are skipped.
pub fn parse_plain(text: &str) -> Vec<ProxyIp> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    for item in text.split(['\n', ',']).map(str::trim).filter(|s| !s.is_empty()) {
        let (auth, addr) = match item.rsplit_once('@') {
            Some((auth, addr)) => (Some(auth), addr),
            None => (None, item),
        };
        let Some((host, ports)) = addr.rsplit_once(':') else {
            continue;
        };
        let host = host.trim();
        if host.is_empty() {
            continue;
        }
        let Some((start, end)) = parse_port_span(ports.trim()) else {
            continue;
        };

        for port in start..=end {
            if !seen.insert((host.to_string(), port)) {
                continue;
            }
            let mut ip = ProxyIp::new(host, port);
            if let Some(auth) = auth {
                let (user, pass) = auth.split_once(':').unwrap_or((auth, ""));
                ip.user_name = Some(user.to_string());
                ip.password = Some(pass.to_string());
            }
            out.push(ip);
        }
    }

    out.sort_by(|a, b| {
        a.proxy_host
            .cmp(&b.proxy_host)
            .then(a.proxy_port.cmp(&b.proxy_port))
    });
    out
}

fn parse_port_span(s: &str) -> Option<(u16, u16)> {
    match s.split_once('-') {
        Some((a, b)) => {
            let start: u16 = a.trim().parse().ok()?;
            let end: u16 = b.trim().parse().ok()?;
            (start <= end).then_some((start, end))
        }
        None => {
            let port: u16 = s.parse().ok()?;
            Some((port, port))
        }
    }
}

/// Accepts either a JSON array of resources or a single resource object.
pub fn parse_json(text: &str) -> Result<Vec<ProxyIp>, ResourceError> {
    let text = text.trim();
    if text.starts_with('[') {
        Ok(serde_json::from_str(text)?)
    } else if text.starts_with('{') {
        Ok(vec![serde_json::from_str(text)?])
    } else {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_id_defaults_to_ip_port() {
        let ip = ProxyIp::new("1.2.3.4", 8080).resolve_id();
        assert_eq!(ip.resource_id.as_deref(), Some("1.2.3.4:8080"));

        let mut named = ProxyIp::new("1.2.3.4", 8080);
        named.resource_id = Some("vendor-17".into());
        assert_eq!(named.resolve_id().id(), "vendor-17");
    }

    #[test]
    fn validity_checks_host_and_port() {
        assert!(ProxyIp::new("1.2.3.4", 1).is_valid());
        assert!(!ProxyIp::new("", 80).is_valid());
        assert!(!ProxyIp::new("1.2.3.4", 0).is_valid());
        assert!(!ProxyIp::new("1.2.3.4", 65535).is_valid());
    }

    #[test]
    fn basic_authorization_encodes_credentials() {
        let mut ip = ProxyIp::new("1.2.3.4", 80);
        assert_eq!(ip.basic_authorization(), None);
        ip.user_name = Some("user".into());
        assert_eq!(ip.basic_authorization(), None);
        ip.password = Some("pass".into());
        assert_eq!(
            ip.basic_authorization().as_deref(),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[test]
    fn plain_parser_handles_lines_and_ranges() {
        let parsed = parse_plain(
            "182.244.169.248:57114\n113.128.31.3:57114\r\n\
             proxy.example.com:20000-20002, bad-line ,:80",
        );
        let rendered: Vec<String> = parsed.iter().map(ProxyIp::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "113.128.31.3:57114",
                "182.244.169.248:57114",
                "proxy.example.com:20000",
                "proxy.example.com:20001",
                "proxy.example.com:20002",
            ]
        );
    }

    #[test]
    fn plain_parser_dedupes_and_reads_credentials() {
        let parsed = parse_plain("u:p@10.0.0.1:1080,10.0.0.1:1080");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].user_name.as_deref(), Some("u"));
        assert_eq!(parsed[0].password.as_deref(), Some("p"));
    }

    #[test]
    fn json_parser_accepts_array_and_object() {
        let list = parse_json(
            r#"[{"proxyHost":"1.1.1.1","proxyPort":8000,"expireTime":1700000000000},
                {"proxyHost":"2.2.2.2","proxyPort":8001,"userName":"a","password":"b"}]"#,
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].expire_time, Some(1_700_000_000_000));
        assert_eq!(list[1].user_name.as_deref(), Some("a"));

        let single = parse_json(r#"{"proxyHost":"3.3.3.3","proxyPort":9000}"#).unwrap();
        assert_eq!(single[0].ip_port(), "3.3.3.3:9000");

        assert!(parse_json("not json").unwrap().is_empty());
        assert!(parse_json("[{").is_err());
    }

    #[test]
    fn format_from_str() {
        assert_eq!("JSON".parse::<ResourceFormat>(), Ok(ResourceFormat::Json));
        assert_eq!("plain".parse::<ResourceFormat>(), Ok(ResourceFormat::Plain));
        assert!("xml".parse::<ResourceFormat>().is_err());
    }
}
