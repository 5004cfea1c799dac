use crate::config::ConfigError;
use arc_swap::ArcSwap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HostDescriptor {
    pub name: String,
    #[serde(alias = "api_url")]
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RegistryView {
    pub generation: u64,
    pub hosts: Arc<[HostDescriptor]>,
}

pub struct HostRegistry {
    current: ArcSwap<RegistryView>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<HostDescriptor>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistryView {
                generation: 1,
                hosts: hosts.into(),
            }),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::new(load_hosts_file(path)?))
    }

    pub fn current(&self) -> Arc<RegistryView> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    pub fn replace(&self, hosts: Vec<HostDescriptor>) -> u64 {
        let hosts: Arc<[HostDescriptor]> = hosts.into();
        let next = self.current.rcu(|prev| RegistryView {
            generation: prev.generation + 1,
            hosts: hosts.clone(),
        });
        next.generation + 1
    }
}

pub fn load_hosts_file(path: impl AsRef<Path>) -> Result<Vec<HostDescriptor>, ConfigError> {
    let path_ref = path.as_ref();
    let path_display = path_ref.display().to_string();
    let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_display.clone(),
        source,
    })?;

    let is_yaml = path_ref
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    if !is_yaml {
        return parse_hosts(&text, &path_display);
    }
    let hosts: Vec<HostDescriptor> =
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;
    validate_hosts(&hosts)?;
    Ok(hosts)
}

pub fn parse_hosts(json: &str, origin: &str) -> Result<Vec<HostDescriptor>, ConfigError> {
    let hosts: Vec<HostDescriptor> =
        serde_json::from_str(json).map_err(|source| ConfigError::HostsParse {
            path: origin.to_string(),
            source,
        })?;
    validate_hosts(&hosts)?;
    Ok(hosts)
}

pub fn validate_hosts(hosts: &[HostDescriptor]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for host in hosts {
        if host.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*].name не должен быть пустым".to_string(),
            ));
        }
        if !names.insert(host.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "имя хоста '{}' должно быть уникальным",
                host.name
            )));
        }
        if host.url.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "хост '{}': url не должен быть пустым",
                host.name
            )));
        }
        match Url::parse(&host.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::Validation(format!(
                    "хост '{}': неподдерживаемая схема '{}'",
                    host.name,
                    url.scheme()
                )));
            }
            Err(err) => {
                return Err(ConfigError::Validation(format!(
                    "хост '{}': некорректный url: {err}",
                    host.name
                )));
            }
        }
    }
    Ok(())
}
