//! Traefik file-provider document.
//!
//! Only the `http.routers` and `http.services` maps are interpreted; every
//! other key (middlewares, tcp, tls options) is carried through untouched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Router entry as Traefik expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    pub rule: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub load_balancer: LoadBalancerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub servers: Vec<ServerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub url: String,
}

/// A route published for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    /// Router and service name.
    pub name: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Upstream URL, e.g. `http://127.0.0.1:49153`.
    pub target: String,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

impl RouteEntry {
    /// Traefik rule matching this entry.
    pub fn rule(&self) -> String {
        match self.path_prefix.as_deref() {
            Some(prefix) if prefix != "/" => {
                format!("Host(`{}`) && PathPrefix(`{}`)", self.host, prefix)
            }
            _ => format!("Host(`{}`)", self.host),
        }
    }

    fn router(&self) -> RouterSpec {
        RouterSpec {
            rule: self.rule(),
            service: self.name.clone(),
            entry_points: self.entry_points.clone(),
            tls: self.cert_resolver.as_ref().map(|resolver| TlsSpec {
                cert_resolver: Some(resolver.clone()),
            }),
        }
    }

    fn service(&self) -> ServiceSpec {
        ServiceSpec {
            load_balancer: LoadBalancerSpec {
                servers: vec![ServerSpec {
                    url: self.target.clone(),
                }],
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, serde_yaml::Value>,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

/// The whole dynamic configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingDocument {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_yaml::Value>,
}

impl RoutingDocument {
    /// Read the document; a missing or empty file is an empty document.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading routing document {}", path.display()));
            }
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("parsing routing document {}", path.display()))
    }

    /// Write through a temp file in the same directory, then rename.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating routing directory {}", dir.display()))?;

        let yaml = serde_yaml::to_string(self).context("serializing routing document")?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "routes.yml".to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        std::fs::write(&tmp, yaml)
            .with_context(|| format!("writing temp routing document {}", tmp.display()))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("replacing routing document {}", path.display()));
        }
        Ok(())
    }

    /// Insert or replace a route. Returns whether the document changed.
    pub fn upsert(&mut self, entry: &RouteEntry) -> Result<bool> {
        let router = serde_yaml::to_value(entry.router()).context("serializing router")?;
        let service = serde_yaml::to_value(entry.service()).context("serializing service")?;

        let router_changed = self.http.routers.get(&entry.name) != Some(&router);
        let service_changed = self.http.services.get(&entry.name) != Some(&service);
        if router_changed {
            self.http.routers.insert(entry.name.clone(), router);
        }
        if service_changed {
            self.http.services.insert(entry.name.clone(), service);
        }
        Ok(router_changed || service_changed)
    }

    /// Remove a route. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let router = self.http.routers.remove(name).is_some();
        let service = self.http.services.remove(name).is_some();
        router || service
    }

    /// Managed routes, keyed by name, with their upstream targets.
    pub fn managed(&self, prefix: &str) -> BTreeMap<String, Option<String>> {
        self.http
            .routers
            .keys()
            .filter(|name| name.starts_with(prefix))
            .map(|name| {
                let target = self
                    .http
                    .services
                    .get(name)
                    .and_then(|v| serde_yaml::from_value::<ServiceSpec>(v.clone()).ok())
                    .and_then(|s| s.load_balancer.servers.into_iter().next())
                    .map(|s| s.url);
                (name.clone(), target)
            })
            .collect()
    }
}
