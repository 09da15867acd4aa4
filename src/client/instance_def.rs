//! Instance definitions.
//!
//! An instance is addressed either with a URI string
//! `[scheme://][user[:pass]@]host[:port][/schema][?opts]` or with a dictionary
//! carrying `scheme`, `user`/`dbUser`, `password`/`dbPassword`, `host`, `port`,
//! `socket`, `schema` and `sslMode`.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::types::ParseError;

/// Default MySQL classic protocol port.
pub const DEFAULT_PORT: u16 = 3306;

/// Connection parameters for one server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceDef {
    pub scheme: Option<String>,
    pub user: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub socket: Option<String>,
    pub schema: Option<String>,
    pub ssl_mode: Option<String>,
    /// Remaining `?key=value` options.
    pub options: BTreeMap<String, String>,
}

impl InstanceDef {
    /// Build a definition from host and port only.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` used to identify the instance in metadata and reports.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Copy user and password from another definition when missing here.
    ///
    /// Cluster operations reach other members with the anchor's credentials.
    pub fn with_credentials_from(mut self, other: &InstanceDef) -> Self {
        if self.user.is_none() {
            self.user = other.user.clone();
        }
        if self.password.is_none() {
            self.password = other.password.clone();
        }
        self
    }

    /// Override the password, used by the `password` option of cluster operations.
    pub fn with_password(mut self, password: Option<&str>) -> Self {
        if let Some(password) = password {
            self.password = Some(password.to_string());
        }
        self
    }

    /// `mysql://user@host:port`, the form used in status reports.
    pub fn display_uri(&self) -> String {
        match &self.user {
            Some(user) => format!("mysql://{}@{}", user, self.endpoint()),
            None => format!("mysql://{}", self.endpoint()),
        }
    }

    /// Parse the dictionary form.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, ParseError> {
        const KNOWN: &[&str] = &[
            "scheme",
            "user",
            "dbUser",
            "password",
            "dbPassword",
            "host",
            "port",
            "socket",
            "schema",
            "sslMode",
        ];

        let host = map.get("host").cloned().unwrap_or_default();
        if host.is_empty() && !map.contains_key("socket") {
            return Err(ParseError::InvalidInstanceDef(
                "Missing required value for 'host'".to_string(),
            ));
        }
        if map.contains_key("user") && map.contains_key("dbUser") {
            return Err(ParseError::InvalidInstanceDef(
                "The connection option 'user' is already defined as 'dbUser'".to_string(),
            ));
        }
        if map.contains_key("password") && map.contains_key("dbPassword") {
            return Err(ParseError::InvalidInstanceDef(
                "The connection option 'password' is already defined as 'dbPassword'"
                    .to_string(),
            ));
        }
        let port = match map.get("port") {
            Some(p) => parse_port(p)?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            scheme: map.get("scheme").cloned(),
            user: map.get("user").or_else(|| map.get("dbUser")).cloned(),
            password: map.get("password").or_else(|| map.get("dbPassword")).cloned(),
            host,
            port,
            socket: map.get("socket").cloned(),
            schema: map.get("schema").cloned(),
            ssl_mode: map.get("sslMode").cloned(),
            options: map
                .iter()
                .filter(|(k, _)| !KNOWN.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

fn parse_port(value: &str) -> Result<u16, ParseError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ParseError::InvalidInstanceDef(format!("Invalid port: '{value}'")))
}

impl FromStr for InstanceDef {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim();
        if rest.is_empty() {
            return Err(ParseError::InvalidInstanceDef(
                "Invalid URI: empty string".to_string(),
            ));
        }

        let mut def = InstanceDef {
            port: DEFAULT_PORT,
            ..Default::default()
        };

        if let Some((scheme, tail)) = rest.split_once("://") {
            if scheme != "mysql" && scheme != "mysqlx" {
                return Err(ParseError::InvalidInstanceDef(format!(
                    "Invalid scheme [{scheme}], supported schemes include: mysql, mysqlx"
                )));
            }
            def.scheme = Some(scheme.to_string());
            rest = tail;
        }

        if let Some((head, opts)) = rest.split_once('?') {
            for pair in opts.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                if k == "ssl-mode" || k == "sslMode" {
                    def.ssl_mode = Some(v.to_string());
                } else {
                    def.options.insert(k.to_string(), v.to_string());
                }
            }
            rest = head;
        }

        if let Some((userinfo, tail)) = rest.rsplit_once('@') {
            match userinfo.split_once(':') {
                Some((user, pass)) => {
                    def.user = Some(user.to_string());
                    def.password = Some(pass.to_string());
                }
                None => def.user = Some(userinfo.to_string()),
            }
            rest = tail;
        }

        if let Some((hostport, schema)) = rest.split_once('/') {
            if !schema.is_empty() {
                def.schema = Some(schema.to_string());
            }
            rest = hostport;
        }

        if let Some(v6) = rest.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(|| {
                ParseError::InvalidInstanceDef(format!("Invalid IPv6 address in '{s}'"))
            })?;
            def.host = host.to_string();
            if let Some(port) = tail.strip_prefix(':') {
                def.port = parse_port(port)?;
            }
        } else if let Some((host, port)) = rest.rsplit_once(':') {
            def.host = host.to_string();
            def.port = parse_port(port)?;
        } else {
            def.host = rest.to_string();
        }

        if def.host.is_empty() {
            return Err(ParseError::InvalidInstanceDef(format!(
                "Invalid URI: missing host in '{s}'"
            )));
        }
        Ok(def)
    }
}

impl std::fmt::Display for InstanceDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
