//! Table of known forwarding services and random selection among them.
//!
//! The built-in table can be extended or overridden by a JSON file:
//!
//! ```json
//! {
//!   "services": {
//!     "my.relay": {
//!       "host": "relay.example.com:2222",
//!       "port": 80,
//!       "user": "tunnel",
//!       "url_pattern": "https://[a-z0-9-]+\\.relay\\.example\\.com"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::error::{Result, TunnelError};
use super::types::{Service, ServiceRef, UrlPattern};

/// Directory name under the platform config dir
const CONFIG_DIR_NAME: &str = "sshtunnel";
const SERVICES_FILE_NAME: &str = "services.json";

/// On-disk shape of a service table
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServiceTable {
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
}

/// Read-only mapping from service name to connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Service>,
}

impl ServiceRegistry {
    /// An empty registry. Mostly useful for building custom tables.
    pub fn empty() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    /// The services known out of the box.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (name, service) in builtin_services() {
            registry.insert(name, service);
        }
        registry
    }

    pub fn with_service(mut self, name: impl Into<String>, service: Service) -> Self {
        self.insert(name, service);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, service: Service) {
        self.services.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Name under which a structurally equal service is registered
    pub fn name_of(&self, service: &Service) -> Option<&str> {
        self.services
            .iter()
            .find(|(_, s)| *s == service)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Service)> {
        self.services.iter().map(|(name, s)| (name.as_str(), s))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Resolve a name or pass a full service through unchanged.
    pub fn resolve(&self, service: &ServiceRef) -> Result<Service> {
        match service {
            ServiceRef::ByName(name) => self
                .get(name)
                .cloned()
                .ok_or_else(|| TunnelError::UnknownService(name.clone())),
            ServiceRef::ByValue(service) => Ok(service.clone()),
        }
    }

    /// Every registered service not structurally equal to one in `exclude`.
    pub fn candidates<'a>(&'a self, exclude: &[Service]) -> Vec<&'a Service> {
        self.services
            .values()
            .filter(|service| !exclude.contains(service))
            .collect()
    }

    /// Pick a service uniformly at random, skipping `exclude`.
    pub fn choose(&self, exclude: &[Service]) -> Result<&Service> {
        self.candidates(exclude)
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(TunnelError::NoServiceAvailable)
    }

    /// Merge a table over this registry; same-named entries are replaced.
    pub fn merge(&mut self, table: ServiceTable) {
        self.services.extend(table.services);
    }

    /// Parse a JSON service table.
    pub fn table_from_json(path: &Path, content: &str) -> Result<ServiceTable> {
        if content.trim().is_empty() {
            return Ok(ServiceTable::default());
        }
        serde_json::from_str(content).map_err(|source| TunnelError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Built-ins overridden by the table at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = async_fs::read_to_string(path)
            .await
            .map_err(|source| TunnelError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
        let table = Self::table_from_json(path, &content)?;
        let mut registry = Self::builtin();
        registry.merge(table);
        tracing::debug!(
            "Loaded service table from {} ({} services)",
            path.display(),
            registry.len()
        );
        Ok(registry)
    }

    /// Built-ins plus the user's table, if there is one at the default location.
    pub async fn load_default() -> Result<Self> {
        match default_services_path() {
            Some(path) if path.exists() => Self::load(&path).await,
            _ => Ok(Self::builtin()),
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Get the default service table path (<config dir>/sshtunnel/services.json)
pub fn default_services_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(SERVICES_FILE_NAME))
}

fn builtin_services() -> Vec<(&'static str, Service)> {
    let pattern = |p: &str| UrlPattern::new(p).expect("built-in URL pattern is valid");
    vec![
        (
            "localhost.run",
            Service::new("localhost.run", 80, pattern(r"https://[a-z0-9-]+\.lhr\.life"))
                .with_user("nokey"),
        ),
        (
            "serveo.net",
            Service::new("serveo.net", 80, pattern(r"https://[a-z0-9-]+\.serveo\.net")),
        ),
        (
            "pinggy.io",
            Service::new(
                "a.pinggy.io:443",
                0,
                pattern(r"https://[a-z0-9-]+\.a\.free\.pinggy\.link"),
            )
            .with_extra_options(vec!["-o".into(), "ServerAliveInterval=30".into()]),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_services() {
        let registry = ServiceRegistry::builtin();
        assert_eq!(registry.len(), 3);

        let lhr = registry.get("localhost.run").unwrap();
        assert_eq!(lhr.user.as_deref(), Some("nokey"));
        assert_eq!(
            lhr.url_pattern.find("abc https://x1.lhr.life more"),
            Some("https://x1.lhr.life")
        );

        let pinggy = registry.get("pinggy.io").unwrap();
        assert_eq!(pinggy.ssh_port(), 443);
        assert!(registry.get("ngrok").is_none());
    }

    #[test]
    fn test_resolve() {
        let registry = ServiceRegistry::builtin();
        let by_name = registry.resolve(&"serveo.net".into()).unwrap();
        assert_eq!(&by_name, registry.get("serveo.net").unwrap());

        let custom = Service::new("relay.example.com", 80, UrlPattern::new("x").unwrap());
        assert_eq!(registry.resolve(&custom.clone().into()).unwrap(), custom);

        match registry.resolve(&"teleport".into()) {
            Err(TunnelError::UnknownService(name)) => assert_eq!(name, "teleport"),
            other => panic!("expected unknown service, got {:?}", other),
        }
    }

    #[test]
    fn test_choose_skips_excluded() {
        let registry = ServiceRegistry::builtin();
        let excluded = vec![registry.get("localhost.run").unwrap().clone()];
        let candidates = registry.candidates(&excluded);
        assert_eq!(candidates.len(), 2);

        for _ in 0..50 {
            let chosen = registry.choose(&excluded).unwrap();
            assert!(!excluded.contains(chosen));
            assert!(candidates.contains(&chosen));
        }
    }

    #[test]
    fn test_choose_all_excluded() {
        let registry = ServiceRegistry::builtin();
        let all: Vec<Service> = registry.iter().map(|(_, s)| s.clone()).collect();
        assert!(matches!(
            registry.choose(&all),
            Err(TunnelError::NoServiceAvailable)
        ));
        assert!(matches!(
            ServiceRegistry::empty().choose(&[]),
            Err(TunnelError::NoServiceAvailable)
        ));
    }

    #[test]
    fn test_name_of() {
        let registry = ServiceRegistry::builtin();
        let serveo = registry.get("serveo.net").unwrap().clone();
        assert_eq!(registry.name_of(&serveo), Some("serveo.net"));
        assert_eq!(registry.name_of(&serveo.with_user("someone")), None);
    }

    #[test]
    fn test_load_merges_over_builtins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "services": {{
                    "serveo.net": {{
                        "host": "serveo.net",
                        "port": 8080,
                        "url_pattern": "https://[a-z]+\\.serveo\\.net"
                    }},
                    "relay": {{
                        "host": "relay.example.com:2222",
                        "port": 80,
                        "user": "tunnel",
                        "url_pattern": "https://[a-z0-9-]+\\.relay\\.example\\.com",
                        "extra_args": ["http"]
                    }}
                }}
            }}"#
        )
        .unwrap();

        let registry = smol::block_on(ServiceRegistry::load(file.path())).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get("serveo.net").unwrap().port, 8080);

        let relay = registry.get("relay").unwrap();
        assert_eq!(relay.ssh_url(), "tunnel@relay.example.com");
        assert_eq!(relay.ssh_port(), 2222);
        assert_eq!(relay.extra_args, vec!["http".to_string()]);
    }

    #[test]
    fn test_load_empty_file_is_builtin() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let registry = smol::block_on(ServiceRegistry::load(file.path())).unwrap();
        assert_eq!(registry, ServiceRegistry::builtin());
    }

    #[test]
    fn test_load_errors() {
        let missing = Path::new("/nonexistent/sshtunnel/services.json");
        let err = smol::block_on(ServiceRegistry::load(missing)).unwrap_err();
        assert!(matches!(err, TunnelError::ConfigRead { .. }));

        let err = ServiceRegistry::table_from_json(missing, "{ not json").unwrap_err();
        assert!(matches!(err, TunnelError::ConfigParse { .. }));

        let err = ServiceRegistry::table_from_json(
            missing,
            r#"{"services": {"bad": {"host": "h", "port": 1, "url_pattern": "(["}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid URL pattern"), "got: {}", err);
    }
}
