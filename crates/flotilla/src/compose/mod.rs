pub mod render;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::FleetError;

/// Instance configuration: a compose document with the fields flotilla
/// rewrites typed, and everything else carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One entry of a service's `ports` list, in either compose syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortMapping {
    Bare(u16),
    Short(String),
    Long(LongPort),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongPort {
    pub target: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `[host_ip:]host_port:container_port[/protocol]`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ShortParts<'a> {
    host_ip: Option<&'a str>,
    published: Option<&'a str>,
    container: &'a str,
    protocol: Option<&'a str>,
}

fn split_short(raw: &str) -> ShortParts<'_> {
    let (spec, protocol) = match raw.rsplit_once('/') {
        Some((spec, proto)) => (spec, Some(proto)),
        None => (raw, None),
    };
    let Some((head, container)) = spec.rsplit_once(':') else {
        return ShortParts {
            host_ip: None,
            published: None,
            container: spec,
            protocol,
        };
    };
    let (host_ip, published) = match head.rsplit_once(':') {
        Some((ip, published)) => (Some(ip), Some(published)),
        None => (None, Some(head)),
    };
    ShortParts {
        host_ip,
        published: published.filter(|p| !p.is_empty()),
        container,
        protocol,
    }
}

impl PortMapping {
    pub fn container_port(&self) -> Option<u16> {
        match self {
            Self::Bare(port) => Some(*port),
            Self::Short(raw) => split_short(raw).container.parse().ok(),
            Self::Long(long) => Some(long.target),
        }
    }

    /// Host-side port, when one is fixed (ranges and ephemeral ports are `None`).
    pub fn published_port(&self) -> Option<u16> {
        match self {
            Self::Bare(_) => None,
            Self::Short(raw) => split_short(raw).published.and_then(|p| p.parse().ok()),
            Self::Long(long) => match &long.published {
                Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
                Some(Value::String(s)) => s.parse().ok(),
                _ => None,
            },
        }
    }

    /// Same mapping, published on `port`. Host IP and protocol are kept.
    pub fn with_published(&self, port: u16) -> Self {
        match self {
            Self::Bare(container) => Self::Short(format!("{port}:{container}")),
            Self::Short(raw) => {
                let parts = split_short(raw);
                let mut out = String::new();
                if let Some(ip) = parts.host_ip {
                    out.push_str(ip);
                    out.push(':');
                }
                out.push_str(&format!("{port}:{}", parts.container));
                if let Some(proto) = parts.protocol {
                    out.push('/');
                    out.push_str(proto);
                }
                Self::Short(out)
            }
            Self::Long(long) => Self::Long(LongPort {
                target: long.target,
                published: Some(Value::Number(u64::from(port).into())),
                extra: long.extra.clone(),
            }),
        }
    }
}

/// `environment:` in map form or `KEY=VALUE` list form; written back in the
/// form it was read in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, Value>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl Environment {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Map(map) => map.is_empty(),
            Self::List(list) => list.is_empty(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::Map(map) => map.get(key).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }),
            Self::List(list) => list.iter().find_map(|entry| {
                entry
                    .split_once('=')
                    .filter(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            }),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self {
            Self::Map(map) => {
                map.insert(key.to_string(), Value::String(value.to_string()));
            }
            Self::List(list) => {
                let entry = format!("{key}={value}");
                let prefix = format!("{key}=");
                match list.iter_mut().find(|e| e.starts_with(&prefix) || e.as_str() == key) {
                    Some(existing) => *existing = entry,
                    None => list.push(entry),
                }
            }
        }
    }
}

/// Split `repo/name:tag` into name and tag. Digests are left in the name.
pub fn split_image(reference: &str) -> (&str, Option<&str>) {
    if reference.contains('@') {
        return (reference, None);
    }
    let last_slash = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[last_slash..].rfind(':') {
        Some(i) => {
            let at = last_slash + i;
            (&reference[..at], Some(&reference[at + 1..]))
        }
        None => (reference, None),
    }
}

impl Service {
    /// Replace the image name and/or tag, keeping whichever part is not given.
    pub fn set_image(&mut self, image: Option<&str>, tag: Option<&str>) -> anyhow::Result<()> {
        if image.is_none() && tag.is_none() {
            return Ok(());
        }
        let (current_name, current_tag) = match self.image.as_deref() {
            Some(reference) => {
                let (name, tag) = split_image(reference);
                (Some(name.to_string()), tag.map(str::to_string))
            }
            None => (None, None),
        };
        let Some(name) = image.map(str::to_string).or(current_name) else {
            return Err(FleetError::malformed("service has no image to retag").into());
        };
        let tag = tag.map(str::to_string).or(current_tag);
        self.image = Some(match tag {
            Some(tag) => format!("{name}:{tag}"),
            None => name,
        });
        Ok(())
    }
}

impl ComposeFile {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| FleetError::configuration(format!("malformed config: {e}")).into())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("failed to serialize config")
    }

    /// Write through a sibling temporary file so readers never see a partial file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = self.to_yaml()?;
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, raw).with_context(|| format!("failed writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    /// Every fixed host port published by any service.
    pub fn published_ports(&self) -> Vec<u16> {
        self.services
            .values()
            .flat_map(|svc| svc.ports.iter().filter_map(PortMapping::published_port))
            .collect()
    }

    /// Host port routed to the proxy service's port 80.
    pub fn local_port(&self, proxy_service: &str) -> Option<u16> {
        self.service(proxy_service)?
            .ports
            .iter()
            .find(|p| p.container_port() == Some(80))
            .and_then(PortMapping::published_port)
    }

    pub fn image_of(&self, service: &str) -> Option<&str> {
        self.service(service)?.image.as_deref()
    }

    /// Services still carrying a `build:` context (pre-registry config shape).
    pub fn legacy_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, svc)| svc.build.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Named volumes declared at top level.
    pub fn declared_volumes(&self) -> Vec<String> {
        match self.extra.get("volumes") {
            Some(Value::Mapping(map)) => map
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: "3.8"
services:
  app:
    image: registry.example.org/fleet/app:16.0
    depends_on: [db]
    environment:
      DB_HOST: db
      WORKERS: 4
  proxy:
    image: registry.example.org/fleet/proxy:1.25
    ports:
      - "80:80"
      - "443:443"
      - target: 8080
        published: 8080
  db:
    image: postgres:15
    ports:
      - 5432
  smtp:
    image: registry.example.org/fleet/smtp:latest
    environment:
      - RELAYHOST=localhost
volumes:
  db-data: {}
  filestore: {}
"#;

    #[test]
    fn parses_and_keeps_unknown_keys() {
        let doc = ComposeFile::parse(SAMPLE).expect("parse");
        assert_eq!(doc.services.len(), 4);
        assert!(doc.extra.contains_key("version"));
        assert!(doc.services["app"].extra.contains_key("depends_on"));
        let again = ComposeFile::parse(&doc.to_yaml().expect("yaml")).expect("reparse");
        assert_eq!(doc, again);
    }

    #[test]
    fn collects_published_ports() {
        let doc = ComposeFile::parse(SAMPLE).expect("parse");
        let mut ports = doc.published_ports();
        ports.sort_unstable();
        assert_eq!(ports, vec![80, 443, 8080]);
        assert_eq!(doc.local_port("proxy"), Some(80));
        assert_eq!(doc.local_port("app"), None);
    }

    #[test]
    fn short_port_syntax_variants() {
        let p = PortMapping::Short("127.0.0.1:8069:80/tcp".into());
        assert_eq!(p.container_port(), Some(80));
        assert_eq!(p.published_port(), Some(8069));
        assert_eq!(
            p.with_published(61007),
            PortMapping::Short("127.0.0.1:61007:80/tcp".into())
        );

        let p = PortMapping::Short("80".into());
        assert_eq!(p.container_port(), Some(80));
        assert_eq!(p.published_port(), None);
        assert_eq!(p.with_published(61002), PortMapping::Short("61002:80".into()));

        let p = PortMapping::Short("8000-8010:80".into());
        assert_eq!(p.published_port(), None);
    }

    #[test]
    fn long_port_syntax_rewrites_published() {
        let p = PortMapping::Long(LongPort {
            target: 80,
            published: Some(Value::String("8080".into())),
            extra: BTreeMap::new(),
        });
        assert_eq!(p.published_port(), Some(8080));
        assert_eq!(p.with_published(61003).published_port(), Some(61003));
    }

    #[test]
    fn environment_set_preserves_form() {
        let doc = ComposeFile::parse(SAMPLE).expect("parse");
        let mut list = doc.services["smtp"].environment.clone();
        assert_eq!(list.get("RELAYHOST").as_deref(), Some("localhost"));
        list.set("RELAYHOST", "mail.example.org");
        assert_eq!(
            list,
            Environment::List(vec!["RELAYHOST=mail.example.org".to_string()])
        );

        let mut map = doc.services["app"].environment.clone();
        assert_eq!(map.get("WORKERS").as_deref(), Some("4"));
        map.set("PROXY_MODE", "true");
        assert_eq!(map.get("PROXY_MODE").as_deref(), Some("true"));
    }

    #[test]
    fn split_image_handles_registry_ports() {
        assert_eq!(split_image("foo/bar:v2"), ("foo/bar", Some("v2")));
        assert_eq!(split_image("registry:5000/foo/bar"), ("registry:5000/foo/bar", None));
        assert_eq!(
            split_image("registry:5000/foo/bar:1"),
            ("registry:5000/foo/bar", Some("1"))
        );
        assert_eq!(split_image("foo@sha256:abc"), ("foo@sha256:abc", None));
    }

    #[test]
    fn set_image_keeps_missing_parts() {
        let mut svc = Service {
            image: Some("registry.example.org/fleet/app:16.0".into()),
            ..Service::default()
        };
        svc.set_image(None, Some("17.0")).expect("retag");
        assert_eq!(svc.image.as_deref(), Some("registry.example.org/fleet/app:17.0"));
        svc.set_image(Some("foo/bar"), None).expect("rename");
        assert_eq!(svc.image.as_deref(), Some("foo/bar:17.0"));

        let mut bare = Service::default();
        assert!(bare.set_image(None, Some("1")).is_err());
    }

    #[test]
    fn legacy_build_services_are_reported() {
        let doc = ComposeFile::parse(
            "services:\n  app:\n    build: ./app\n  proxy:\n    image: nginx\n",
        )
        .expect("parse");
        assert_eq!(doc.legacy_services(), vec!["app"]);
    }

    #[test]
    fn declared_volumes_are_listed() {
        let doc = ComposeFile::parse(SAMPLE).expect("parse");
        assert_eq!(doc.declared_volumes(), vec!["db-data", "filestore"]);
    }

    #[test]
    fn garbage_is_configuration_error() {
        let err = ComposeFile::parse("services: [1, 2").expect_err("must fail");
        assert!(matches!(
            crate::error::classify(&err),
            Some(FleetError::Configuration(_))
        ));
    }
}
