use std::fs;
use std::path::Path;

use anyhow::Context;
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::compose::ComposeFile;
use crate::domain::{Instance, InstanceName, Status};
use crate::error::FleetError;
use crate::metadata;
use crate::probe::Prober;

/// Every instance directory under `fleet_root`, sorted by name.
pub fn discover(fleet_root: &Path, config_file_name: &str) -> anyhow::Result<Vec<Instance>> {
    let entries = fs::read_dir(fleet_root)
        .with_context(|| format!("failed reading fleet root {}", fleet_root.display()))?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        let name = match InstanceName::parse(&file_name) {
            Ok(name) if name.as_str() == file_name => name,
            Ok(_) | Err(_) => {
                debug!(dir = %file_name, "not an instance directory name, skipping");
                continue;
            }
        };
        let instance = Instance::new(fleet_root, name, config_file_name);
        if !instance.config_path().is_file() {
            debug!(instance = %instance.name, "no config file, skipping");
            continue;
        }
        found.push(instance);
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// Look up one instance by name; it must exist under the fleet root.
pub fn find(fleet_root: &Path, config_file_name: &str, raw: &str) -> anyhow::Result<Instance> {
    let name = InstanceName::parse(raw)
        .map_err(|e| FleetError::configuration(format!("{raw}: {e}")))?;
    let instance = Instance::new(fleet_root, name, config_file_name);
    if !instance.exists() {
        return Err(FleetError::not_found(format!("no instance named {}", instance.name)).into());
    }
    Ok(instance)
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub pattern: Option<Regex>,
    /// `Some(true)` keeps up/degraded, `Some(false)` keeps down.
    pub online: Option<bool>,
}

impl Filter {
    pub fn new(pattern: Option<&str>, online: Option<bool>) -> anyhow::Result<Self> {
        let pattern = pattern
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| FleetError::configuration(format!("invalid pattern {p:?}: {e}")))
            })
            .transpose()?;
        Ok(Self { pattern, online })
    }

    pub fn matches_text(&self, name: &InstanceName, metadata: &[String]) -> bool {
        match &self.pattern {
            None => true,
            Some(re) => re.is_match(name.as_str()) || metadata.iter().any(|l| re.is_match(l)),
        }
    }

    pub fn matches_status(&self, status: Status) -> bool {
        match self.online {
            None => true,
            Some(online) => status.is_online() == online,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Listing {
    pub instance: Instance,
    pub port: Option<u16>,
    pub image: Option<String>,
    pub status: Status,
    pub version: Option<String>,
    pub metadata: Vec<String>,
}

struct Services<'a> {
    app: &'a str,
    proxy: &'a str,
}

fn inspect(instance: &Instance, services: &Services<'_>) -> (Option<u16>, Option<String>) {
    match ComposeFile::load(&instance.config_path()) {
        Ok(doc) => (
            doc.local_port(services.proxy),
            doc.image_of(services.app).map(str::to_string),
        ),
        Err(e) => {
            warn!(instance = %instance.name, error = %e, "unreadable config");
            (None, None)
        }
    }
}

async fn describe(
    instance: Instance,
    port: Option<u16>,
    image: Option<String>,
    metadata: Vec<String>,
    prober: Prober,
) -> Listing {
    let (status, version) = match port {
        Some(port) => prober.check(port).await,
        None => (Status::Down, None),
    };
    Listing {
        instance,
        port,
        image,
        status,
        version,
        metadata,
    }
}

/// Probe the matching instances; output keeps the input order.
pub async fn list(
    instances: Vec<Instance>,
    app_service: &str,
    proxy_service: &str,
    filter: &Filter,
    prober: &Prober,
    parallel: bool,
) -> Vec<Listing> {
    let services = Services {
        app: app_service,
        proxy: proxy_service,
    };
    let candidates: Vec<_> = instances
        .into_iter()
        .filter_map(|instance| {
            let metadata = metadata::read(&instance.metadata_path());
            if !filter.matches_text(&instance.name, &metadata) {
                return None;
            }
            let (port, image) = inspect(&instance, &services);
            Some((instance, port, image, metadata))
        })
        .collect();

    let mut listings = Vec::with_capacity(candidates.len());
    if parallel {
        let handles: Vec<_> = candidates
            .into_iter()
            .map(|(instance, port, image, metadata)| {
                let name = instance.name.clone();
                let handle =
                    tokio::spawn(describe(instance, port, image, metadata, prober.clone()));
                (name, handle)
            })
            .collect();
        for (name, handle) in handles {
            match handle.await {
                Ok(listing) => listings.push(listing),
                Err(e) => warn!(instance = %name, error = %e, "probe task failed"),
            }
        }
    } else {
        for (instance, port, image, metadata) in candidates {
            listings.push(describe(instance, port, image, metadata, prober.clone()).await);
        }
    }

    listings.retain(|l| filter.matches_status(l.status));
    listings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::domain::DeploymentMode;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flotilla-test-scanner-{label}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn add_instance(root: &Path, name: &str, port: u16, note: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("docker-compose.yml"),
            format!(
                "services:\n  app:\n    image: app:1\n  proxy:\n    image: p\n    ports: [\"{port}:80\"]\n"
            ),
        )
        .unwrap();
        metadata::append(&dir.join("metadata.log"), note).unwrap();
    }

    #[test]
    fn discover_sorts_and_skips_non_instances() {
        let root = temp_dir("discover");
        add_instance(&root, "zeta.example.org", 61003, "z");
        add_instance(&root, "alpha.example.org", 61001, "a");
        fs::create_dir_all(root.join("not_a_domain")).unwrap();
        fs::create_dir_all(root.join("empty.example.org")).unwrap();
        fs::write(root.join("stray.example.org"), "file").unwrap();

        let names: Vec<String> = discover(&root, "docker-compose.yml")
            .unwrap()
            .into_iter()
            .map(|i| i.name.to_string())
            .collect();
        assert_eq!(names, vec!["alpha.example.org", "zeta.example.org"]);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn pattern_matches_name_or_metadata() {
        let filter = Filter::new(Some("CUSTOMER-42"), None).unwrap();
        let name = InstanceName::parse("demo.example.org").unwrap();
        assert!(!filter.matches_text(&name, &["created".into()]));
        assert!(filter.matches_text(&name, &["2024-01-01T00:00:00Z for customer-42".into()]));
        let by_name = Filter::new(Some("^demo\\."), None).unwrap();
        assert!(by_name.matches_text(&name, &[]));
        assert!(Filter::new(Some("("), None).is_err());
    }

    #[test]
    fn online_filter_treats_degraded_as_online() {
        let online = Filter::new(None, Some(true)).unwrap();
        let offline = Filter::new(None, Some(false)).unwrap();
        assert!(online.matches_status(Status::Degraded));
        assert!(!online.matches_status(Status::Down));
        assert!(offline.matches_status(Status::Down));
        assert!(Filter::default().matches_status(Status::Down));
    }

    #[tokio::test]
    async fn list_preserves_order_and_filters_status() {
        let root = temp_dir("list");
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = live.local_addr().unwrap().port();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        add_instance(&root, "b.example.org", live_port, "second");
        add_instance(&root, "a.example.org", dead_port, "first");
        add_instance(&root, "c.example.org", live_port, "third");

        let cfg = FleetConfig::with_mode(DeploymentMode::Compose);
        let prober = Prober::new(&cfg, true).unwrap();
        let instances = discover(&root, "docker-compose.yml").unwrap();

        let all = list(instances.clone(), "app", "proxy", &Filter::default(), &prober, true).await;
        let names: Vec<_> = all.iter().map(|l| l.instance.name.to_string()).collect();
        assert_eq!(names, vec!["a.example.org", "b.example.org", "c.example.org"]);
        assert_eq!(all[0].status, Status::Down);
        assert_eq!(all[1].status, Status::Up);
        assert_eq!(all[1].image.as_deref(), Some("app:1"));
        assert_eq!(all[1].port, Some(live_port));

        let online = Filter::new(None, Some(true)).unwrap();
        let up = list(instances, "app", "proxy", &online, &prober, false).await;
        let names: Vec<_> = up.iter().map(|l| l.instance.name.to_string()).collect();
        assert_eq!(names, vec!["b.example.org", "c.example.org"]);
        drop(live);
        fs::remove_dir_all(&root).ok();
    }

    /// Answers the version endpoint after `delay`, one task per connection.
    async fn serve_version(version: &'static str, delay: Duration) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let body = format!(r#"{{"server_version":"{version}"}}"#);
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn parallel_list_keeps_discovery_order_when_probes_finish_out_of_order() {
        let root = temp_dir("list-slow");
        let slow = serve_version("16.0-slow", Duration::from_millis(500)).await;
        let slower = serve_version("16.0-slower", Duration::from_millis(500)).await;
        let fast = serve_version("16.0-fast", Duration::ZERO).await;
        add_instance(&root, "a.example.org", slow, "first");
        add_instance(&root, "b.example.org", slower, "second");
        add_instance(&root, "c.example.org", fast, "third");

        let mut cfg = FleetConfig::with_mode(DeploymentMode::Compose);
        cfg.probe_http_timeout = Duration::from_secs(3);
        let prober = Prober::new(&cfg, false).unwrap();
        let instances = discover(&root, "docker-compose.yml").unwrap();

        let started = std::time::Instant::now();
        let all = list(instances, "app", "proxy", &Filter::default(), &prober, true).await;
        let elapsed = started.elapsed();

        let versions: Vec<_> = all
            .iter()
            .map(|l| (l.instance.name.to_string(), l.version.clone()))
            .collect();
        assert_eq!(
            versions,
            vec![
                ("a.example.org".to_string(), Some("16.0-slow".to_string())),
                ("b.example.org".to_string(), Some("16.0-slower".to_string())),
                ("c.example.org".to_string(), Some("16.0-fast".to_string())),
            ]
        );
        assert!(all.iter().all(|l| l.status == Status::Up));
        assert!(elapsed < Duration::from_millis(950), "probes ran one after another: {elapsed:?}");
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn find_reports_missing_instance() {
        let root = temp_dir("find");
        let err = find(&root, "docker-compose.yml", "ghost.example.org").expect_err("missing");
        assert!(matches!(
            crate::error::classify(&err),
            Some(FleetError::NotFound(_))
        ));
        let err = find(&root, "docker-compose.yml", "ghost").expect_err("bad name");
        assert!(matches!(
            crate::error::classify(&err),
            Some(FleetError::Configuration(_))
        ));
        fs::remove_dir_all(&root).ok();
    }
}
