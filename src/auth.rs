use std::net::IpAddr;

use base64::Engine;
use ipnet::IpNet;

use crate::config::GlobalSettings;
use crate::error::ConfigError;

/// Username/password pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Decodes a `Proxy-Authorization: Basic ...` header value.
    pub fn from_basic_header(value: &str) -> Option<Self> {
        let (scheme, token) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some(Self::new(user.to_string(), pass.to_string()))
    }
}

/// Who may use the inbound ports.
#[derive(Debug, Clone, Default)]
pub struct AuthRules {
    credentials: Option<Auth>,
    white_list: Vec<IpNet>,
}

impl AuthRules {
    pub fn from_settings(global: &GlobalSettings) -> Result<Self, ConfigError> {
        let credentials = match (&global.auth_username, &global.auth_password) {
            (Some(user), pass) if !user.is_empty() => {
                Some(Auth::new(user.clone(), pass.clone().unwrap_or_default()))
            }
            _ => None,
        };

        let mut white_list = Vec::with_capacity(global.auth_white_ips.len());
        for entry in global.auth_white_ips.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            white_list.push(parse_white_entry(entry)?);
        }
        Ok(Self {
            credentials,
            white_list,
        })
    }

    /// Open access, or the client address is white-listed.
    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.credentials.is_none() || self.white_list.iter().any(|net| net.contains(&ip))
    }

    pub fn check_credentials(&self, username: &str, password: &str) -> bool {
        match &self.credentials {
            Some(auth) => auth.username == username && auth.password == password,
            None => true,
        }
    }

    /// Checks a `Proxy-Authorization` header value.
    pub fn check_basic(&self, header: Option<&str>) -> bool {
        match &self.credentials {
            None => true,
            Some(_) => header
                .and_then(Auth::from_basic_header)
                .is_some_and(|auth| self.check_credentials(&auth.username, &auth.password)),
        }
    }
}

fn parse_white_entry(entry: &str) -> Result<IpNet, ConfigError> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ConfigError::WhiteIp(entry.to_string()))
}
