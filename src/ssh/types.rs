//! Forwarding service and tunnel request types.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::error::{Result, TunnelError};

/// SSH port used when a service host does not carry one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How long a single attempt waits for the URL before giving up on the service
pub const DEFAULT_URL_TIMEOUT: Duration = Duration::from_secs(30);

/// Regex recognizing the public URL a service prints once the forward is up.
///
/// Two patterns are equal when their sources are equal.
#[derive(Debug, Clone)]
pub struct UrlPattern(Regex);

impl UrlPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self)
            .map_err(|source| TunnelError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Leftmost match in `haystack`, if any.
    pub fn find<'h>(&self, haystack: &'h str) -> Option<&'h str> {
        self.0.find(haystack).map(|m| m.as_str())
    }
}

impl PartialEq for UrlPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for UrlPattern {}

impl Serialize for UrlPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for UrlPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        UrlPattern::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// Connection parameters of one public forwarding provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// SSH host, optionally with an explicit port (`host:port`)
    pub host: String,
    /// Remote port the provider binds for us
    pub port: u16,
    /// Login name, if the provider expects one
    #[serde(default)]
    pub user: Option<String>,
    /// Pattern of the URL printed on stdout
    pub url_pattern: UrlPattern,
    /// ssh options placed before the destination
    #[serde(default)]
    pub extra_options: Vec<String>,
    /// Arguments placed after the destination (remote command)
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Service {
    pub fn new(host: impl Into<String>, port: u16, url_pattern: UrlPattern) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            url_pattern,
            extra_options: Vec::new(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_extra_options(mut self, options: Vec<String>) -> Self {
        self.extra_options = options;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Host part of `host`, without any `:port` suffix
    pub fn ssh_host(&self) -> &str {
        self.split_host().0
    }

    /// Port part of `host`, or 22
    pub fn ssh_port(&self) -> u16 {
        self.split_host().1
    }

    fn split_host(&self) -> (&str, u16) {
        match self.host.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host, port),
                Err(_) => (self.host.as_str(), DEFAULT_SSH_PORT),
            },
            None => (self.host.as_str(), DEFAULT_SSH_PORT),
        }
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_url(&self) -> String {
        match &self.user {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.ssh_host()),
            _ => self.ssh_host().to_string(),
        }
    }

    /// Remote forward spec: remote_port:localhost:local_port
    pub fn forward_spec(&self, local_port: u16) -> String {
        format!("{}:localhost:{}", self.port, local_port)
    }

    /// Full argument list for the ssh client.
    pub fn ssh_args(&self, local_port: u16) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.ssh_port().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-R".to_string(),
            self.forward_spec(local_port),
        ];
        args.extend(self.extra_options.iter().cloned());
        args.push(self.ssh_url());
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ssh_url())
    }
}

/// A service given either by its registry name or spelled out in full
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRef {
    ByName(String),
    ByValue(Service),
}

impl From<&str> for ServiceRef {
    fn from(name: &str) -> Self {
        ServiceRef::ByName(name.to_string())
    }
}

impl From<String> for ServiceRef {
    fn from(name: String) -> Self {
        ServiceRef::ByName(name)
    }
}

impl From<Service> for ServiceRef {
    fn from(service: Service) -> Self {
        ServiceRef::ByValue(service)
    }
}

/// Caller-facing options for opening a tunnel
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// The local port to expose
    pub local_port: u16,
    /// Pinned service. Disables retrying with other services and makes
    /// `exclude` irrelevant.
    pub service: Option<ServiceRef>,
    /// Services left out of the random selection
    pub exclude: Vec<ServiceRef>,
    /// Per-attempt deadline for the URL to show up (None waits forever)
    pub url_timeout: Option<Duration>,
}

impl TunnelOptions {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            service: None,
            exclude: Vec::new(),
            url_timeout: Some(DEFAULT_URL_TIMEOUT),
        }
    }

    pub fn with_service(mut self, service: impl Into<ServiceRef>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn excluding(mut self, service: impl Into<ServiceRef>) -> Self {
        self.exclude.push(service.into());
        self
    }

    pub fn with_url_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.url_timeout = timeout;
        self
    }
}

/// One step of an `open` call chain, with every reference already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub local_port: u16,
    pub service: Option<Service>,
    pub exclude: Vec<Service>,
}

impl TunnelRequest {
    /// The request for the next attempt, with `failed` added to the exclusions.
    pub fn excluding(&self, failed: &Service) -> TunnelRequest {
        let mut exclude = self.exclude.clone();
        if !exclude.contains(failed) {
            exclude.push(failed.clone());
        }
        TunnelRequest {
            local_port: self.local_port,
            service: self.service.clone(),
            exclude,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.service.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lhr() -> Service {
        Service::new(
            "localhost.run",
            80,
            UrlPattern::new(r"https://[a-z0-9-]+\.lhr\.life").unwrap(),
        )
        .with_user("nokey")
    }

    #[test]
    fn test_ssh_args_with_user() {
        let args = lhr().ssh_args(8000);
        assert_eq!(
            args,
            vec![
                "-p",
                "22",
                "-o",
                "StrictHostKeyChecking=no",
                "-R",
                "80:localhost:8000",
                "nokey@localhost.run",
            ]
        );
    }

    #[test]
    fn test_ssh_args_host_port_and_extras() {
        let service = Service::new(
            "a.pinggy.io:443",
            0,
            UrlPattern::new(r"https://[a-z0-9-]+\.a\.free\.pinggy\.link").unwrap(),
        )
        .with_extra_options(vec!["-o".into(), "ServerAliveInterval=30".into()])
        .with_extra_args(vec!["x:https".into()]);

        assert_eq!(service.ssh_host(), "a.pinggy.io");
        assert_eq!(service.ssh_port(), 443);

        let args = service.ssh_args(3000);
        assert_eq!(&args[..2], &["-p", "443"]);
        assert_eq!(&args[4..6], &["-R", "0:localhost:3000"]);
        // Options come before the destination, args after it
        assert_eq!(&args[6..], &["-o", "ServerAliveInterval=30", "a.pinggy.io", "x:https"]);
    }

    #[test]
    fn test_unparsable_port_keeps_host() {
        let service = Service::new("weird:host", 80, UrlPattern::new("x").unwrap());
        assert_eq!(service.ssh_host(), "weird:host");
        assert_eq!(service.ssh_port(), DEFAULT_SSH_PORT);
    }

    #[test]
    fn test_empty_user_is_no_user() {
        let service = lhr().with_user("");
        assert_eq!(service.ssh_url(), "localhost.run");
    }

    #[test]
    fn test_service_equality_is_structural() {
        assert_eq!(lhr(), lhr());
        assert_ne!(lhr(), lhr().with_user("other"));

        let mut other_pattern = lhr();
        other_pattern.url_pattern = UrlPattern::new(r"https://[a-f0-9]+\.lhr\.life").unwrap();
        assert_ne!(lhr(), other_pattern);
    }

    #[test]
    fn test_invalid_pattern() {
        let err = UrlPattern::new("https://[").unwrap_err();
        assert!(matches!(err, TunnelError::InvalidPattern { .. }));
    }

    #[test]
    fn test_service_deserialize_defaults() {
        let json = r#"{"host": "serveo.net", "port": 80, "url_pattern": "https://[a-z0-9-]+\\.serveo\\.net"}"#;
        let service: Service = serde_json::from_str(json).unwrap();
        assert_eq!(service.user, None);
        assert!(service.extra_options.is_empty());
        assert!(service.extra_args.is_empty());
        assert_eq!(
            service.url_pattern.find("go to https://ab12.serveo.net now"),
            Some("https://ab12.serveo.net")
        );
    }

    #[test]
    fn test_request_excluding_builds_new_value() {
        let request = TunnelRequest {
            local_port: 8000,
            service: None,
            exclude: Vec::new(),
        };
        let next = request.excluding(&lhr());
        assert!(request.exclude.is_empty());
        assert_eq!(next.exclude, vec![lhr()]);

        // Excluding the same service twice does not duplicate it
        let again = next.excluding(&lhr());
        assert_eq!(again.exclude.len(), 1);
        assert!(!again.is_pinned());
    }

    #[test]
    fn test_options_builder() {
        let options = TunnelOptions::new(8080)
            .with_service("serveo.net")
            .excluding(lhr())
            .with_url_timeout(None);
        assert_eq!(options.local_port, 8080);
        assert_eq!(options.service, Some(ServiceRef::ByName("serveo.net".into())));
        assert_eq!(options.exclude, vec![ServiceRef::ByValue(lhr())]);
        assert_eq!(options.url_timeout, None);
        assert_eq!(TunnelOptions::new(1).url_timeout, Some(DEFAULT_URL_TIMEOUT));
    }
}
