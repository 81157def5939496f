mod clone;

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::certs::CertManager;
use crate::compose::render::{render, validate_image_name, RenderContext};
use crate::compose::ComposeFile;
use crate::config::FleetConfig;
use crate::container::ContainerRuntime;
use crate::domain::{Instance, InstanceName, MARKER_FILE, METADATA_FILE, SECRETS_DIR};
use crate::error::FleetError;
use crate::metadata;
use crate::ports::{self, PortAllocator, PortProbe, SocketProbe};
use crate::probe::Prober;
use crate::proxy::{ProxyRegistrar, RegistrationOutcome};
use crate::runtime;
use crate::scanner;
use crate::secrets;

/// Contents of the marker file. An empty marker reads as the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub www: bool,
}

impl Marker {
    pub fn read(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&raw).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "unreadable marker, using defaults");
            Self::default()
        })
    }

    fn write(&self, path: &Path) -> anyhow::Result<()> {
        let body = toml::to_string(self).context("failed to serialize marker")?;
        fs::write(path, format!("# managed by flotilla\n{body}"))
            .with_context(|| format!("failed writing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: InstanceName,
    pub image: Option<String>,
    pub tag: Option<String>,
    pub clone_from: Option<InstanceName>,
    pub local_only: bool,
    pub www: bool,
    pub mail_relay: Option<String>,
    pub add_account: bool,
    /// Skips the DNS check.
    pub force: bool,
}

impl CreateOptions {
    pub fn new(name: InstanceName) -> Self {
        Self {
            name,
            image: None,
            tag: None,
            clone_from: None,
            local_only: false,
            www: false,
            mail_relay: None,
            add_account: true,
            force: false,
        }
    }
}

#[derive(Debug)]
pub struct CreateReport {
    pub instance: Instance,
    pub port: u16,
    pub certificate: bool,
    pub proxy: Option<RegistrationOutcome>,
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub name: InstanceName,
    pub image: Option<String>,
    pub tag: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug)]
pub struct UpdateReport {
    pub image: Option<String>,
    pub retired_services: Vec<String>,
    pub removed_volumes: Vec<String>,
}

#[derive(Debug)]
pub struct RemoveReport {
    pub certificate_revoked: bool,
    pub proxy: Option<RegistrationOutcome>,
}

pub fn resolves_to_host(resolved: &[IpAddr], local: &[IpAddr]) -> bool {
    !resolved.is_empty() && resolved.iter().any(|ip| local.contains(ip))
}

/// Copy a directory tree, leaving out the named top-level entries.
fn copy_tree(from: &Path, to: &Path, skip: &[&str]) -> anyhow::Result<usize> {
    runtime::create_dir(to)?;
    let mut copied = 0;
    let walker = WalkDir::new(from)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && skip.iter().any(|s| e.file_name() == *s)));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed walking {}", from.display()))?;
        let rel = entry.path().strip_prefix(from)?;
        let dest = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            runtime::create_dir(&dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), dest.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> anyhow::Result<()> {
    let target =
        fs::read_link(src).with_context(|| format!("failed to read link {}", src.display()))?;
    std::os::unix::fs::symlink(&target, dest)
        .with_context(|| format!("failed to create link {}", dest.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> anyhow::Result<()> {
    fs::copy(src, dest)
        .map(|_| ())
        .with_context(|| format!("failed to copy {}", src.display()))
}

/// Drives instances through create, start/stop, update, erase and remove.
/// Steps run one at a time and stop at the first failure; nothing is rolled
/// back, each finished step is logged instead.
pub struct Lifecycle<'a, R: ContainerRuntime, P: PortProbe = SocketProbe> {
    cfg: &'a FleetConfig,
    runtime: R,
    ports: P,
    prober: Prober,
    proxy: ProxyRegistrar,
    certs: CertManager,
}

impl<'a, R: ContainerRuntime, P: PortProbe> Lifecycle<'a, R, P> {
    pub fn new(cfg: &'a FleetConfig, runtime: R, ports: P) -> anyhow::Result<Self> {
        Ok(Self {
            cfg,
            runtime,
            ports,
            prober: Prober::new(cfg, false)?,
            proxy: ProxyRegistrar::new(cfg),
            certs: CertManager::new(cfg),
        })
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn instance(&self, name: &InstanceName) -> Instance {
        Instance::new(&self.cfg.fleet_root, name.clone(), &self.cfg.config_file_name)
    }

    fn require(&self, name: &InstanceName) -> anyhow::Result<Instance> {
        let instance = self.instance(name);
        if !instance.exists() {
            return Err(FleetError::not_found(format!(
                "no instance {name} under {}",
                self.cfg.fleet_root.display()
            ))
            .into());
        }
        Ok(instance)
    }

    fn check_marker(&self, instance: &Instance, force: bool) -> anyhow::Result<()> {
        if instance.is_managed() {
            return Ok(());
        }
        if force {
            warn!(instance = %instance.name, "no {MARKER_FILE} marker, continuing because of --force");
            return Ok(());
        }
        Err(FleetError::precondition(format!(
            "{} has no {MARKER_FILE} marker; refusing to touch it without --force",
            instance.directory.display()
        ))
        .into())
    }

    fn local_addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
        if !self.cfg.public_addresses.is_empty() {
            return Ok(self.cfg.public_addresses.clone());
        }
        let ifaces = if_addrs::get_if_addrs().context("failed to list network interfaces")?;
        Ok(ifaces.into_iter().map(|i| i.ip()).collect())
    }

    async fn verify_dns(&self, name: &InstanceName) -> anyhow::Result<()> {
        let resolved: Vec<IpAddr> = tokio::net::lookup_host((name.as_str(), 443))
            .await
            .map_err(|e| FleetError::precondition(format!("{name} does not resolve: {e}")))?
            .map(|addr| addr.ip())
            .collect();
        let local = self.local_addresses()?;
        if !resolves_to_host(&resolved, &local) {
            return Err(FleetError::precondition(format!(
                "{name} resolves to {resolved:?}, not to this host (use --force to skip this check)"
            ))
            .into());
        }
        debug!(instance = %name, ?resolved, "dns points at this host");
        Ok(())
    }

    fn write_secrets(&self, instance: &Instance, add_account: bool) -> anyhow::Result<()> {
        let dir = instance.secrets_dir();
        let len = self.cfg.secret_length;
        secrets::ensure_secret(&dir.join(secrets::ADMIN_PASSWORD), len)?;
        if add_account {
            secrets::ensure_secret(&dir.join(secrets::USER_PASSWORD), len)?;
        }
        secrets::ensure_secret(&dir.join(secrets::APP_SECRET), len)?;
        Ok(())
    }

    pub async fn create(&self, opts: &CreateOptions) -> anyhow::Result<CreateReport> {
        runtime::ensure_fleet_root(self.cfg)?;
        if opts.local_only && opts.www {
            return Err(FleetError::precondition(
                "--www and --local-only cannot be combined: local-only instances get no routing",
            )
            .into());
        }
        let instance = self.instance(&opts.name);
        if instance.exists() {
            return Err(FleetError::precondition(format!(
                "{} already exists",
                instance.directory.display()
            ))
            .into());
        }

        let source = match &opts.clone_from {
            Some(src) => {
                let source = self.clone_source(src)?;
                self.require_source_database(&source).await?;
                Some(source)
            }
            None => {
                runtime::ensure_template(self.cfg)?;
                None
            }
        };

        if opts.force || opts.local_only {
            debug!(instance = %opts.name, "dns check skipped");
        } else {
            self.verify_dns(&opts.name).await?;
        }

        let existing = scanner::discover(&self.cfg.fleet_root, &self.cfg.config_file_name)?;
        let allocator = PortAllocator {
            floor: self.cfg.port_floor,
            ceiling: self.cfg.port_ceiling,
            attempts: self.cfg.port_attempts,
            probe: &self.ports,
        };
        let port = allocator.allocate(&ports::declared_ports(&existing))?;

        let (template_dir, template_config) = match &source {
            Some(src) => (src.directory.clone(), src.config_path()),
            None => (
                self.cfg.template_dir.clone(),
                self.cfg.template_dir.join(&self.cfg.config_file_name),
            ),
        };
        let template = ComposeFile::load(&template_config)?;
        let (image, tag) = match &source {
            Some(_) => (opts.image.as_deref(), opts.tag.as_deref()),
            None => (
                opts.image.as_deref().or(self.cfg.default_image.as_deref()),
                opts.tag.as_deref().or(self.cfg.default_tag.as_deref()),
            ),
        };
        let repository = self.cfg.repository_rewrite();
        let rendered = render(
            &template,
            self.cfg,
            &RenderContext {
                name: &opts.name,
                port,
                image,
                tag,
                mail_relay: opts.mail_relay.as_deref().or(self.cfg.mail_relay.as_deref()),
                repository: repository.as_ref().map(|(d, c)| (d.as_str(), c.as_str())),
            },
        )?;

        let skip = [
            MARKER_FILE,
            SECRETS_DIR,
            METADATA_FILE,
            self.cfg.config_file_name.as_str(),
        ];
        let copied = copy_tree(&template_dir, &instance.directory, &skip)?;
        info!(instance = %opts.name, files = copied, from = %template_dir.display(), "template copied");

        rendered.save(&instance.config_path())?;
        Marker {
            local_only: opts.local_only,
            www: opts.www,
        }
        .write(&instance.marker_path())?;
        info!(instance = %opts.name, port, "config rendered");

        if let Some(src) = &source {
            let skip: &[&str] = if opts.add_account {
                &[]
            } else {
                &[secrets::USER_PASSWORD]
            };
            secrets::copy_secrets(&src.secrets_dir(), &instance.secrets_dir(), skip)?;
        }
        self.write_secrets(&instance, opts.add_account)?;
        info!(instance = %opts.name, "secrets written");

        let certificate = self
            .certs
            .issue(&opts.name, opts.www, opts.local_only)
            .await?;
        let proxy = if opts.local_only {
            None
        } else {
            let outcome = self.proxy.register(&opts.name, port, opts.www).await?;
            if !outcome.reloaded {
                warn!(instance = %opts.name, "proxy config written but reload failed");
            }
            Some(outcome)
        };

        let note = match &source {
            Some(src) => {
                self.copy_databases(src, &instance).await?;
                format!("Instance cloned from {} (port {port})", src.name)
            }
            None => format!(
                "Instance created (image {}, port {port}{}{})",
                rendered.image_of(&self.cfg.app_service).unwrap_or("unknown"),
                if opts.local_only { ", local only" } else { "" },
                if opts.www { ", www" } else { "" },
            ),
        };
        metadata::append(&instance.metadata_path(), &note)?;

        Ok(CreateReport {
            instance,
            port,
            certificate,
            proxy,
        })
    }

    /// Bring the instance up; returns its local port when the config has one.
    pub async fn start(&self, name: &InstanceName, wait: bool) -> anyhow::Result<Option<u16>> {
        let instance = self.require(name)?;
        let config = instance.config_path();
        let doc = ComposeFile::load(&config)?;
        self.runtime.up(&instance.project(), &config, &[]).await?;
        info!(instance = %name, "started");
        let port = doc.local_port(&self.cfg.proxy_service);
        if wait {
            match port {
                Some(port) => self.prober.wait_ready(port, self.cfg.ready_timeout).await?,
                None => warn!(instance = %name, "no local port, not waiting for readiness"),
            }
        }
        Ok(port)
    }

    pub async fn stop(&self, name: &InstanceName) -> anyhow::Result<()> {
        let instance = self.require(name)?;
        self.runtime
            .stop(&instance.project(), &instance.config_path())
            .await?;
        info!(instance = %name, "stopped");
        Ok(())
    }

    pub async fn update(&self, opts: &UpdateOptions) -> anyhow::Result<UpdateReport> {
        let instance = self.require(&opts.name)?;
        let path = instance.config_path();
        let mut doc = ComposeFile::load(&path)?;

        let legacy = doc.legacy_services();
        if !legacy.is_empty() {
            return Err(FleetError::configuration(format!(
                "{} still builds images locally (services: {}); convert it to registry images first",
                path.display(),
                legacy.join(", ")
            ))
            .into());
        }
        if let Some(image) = opts.image.as_deref() {
            validate_image_name(image)?;
        }

        let app_service = &self.cfg.app_service;
        let before = doc.image_of(app_service).map(str::to_string);
        doc.service_mut(app_service)
            .ok_or_else(|| FleetError::malformed(format!("no `{app_service}` service in {}", path.display())))?
            .set_image(opts.image.as_deref(), opts.tag.as_deref())?;
        let after = doc.image_of(app_service).map(str::to_string);
        doc.save(&path)?;
        info!(instance = %opts.name, image = ?after, "config updated");

        let project = instance.project();
        self.runtime
            .up(&project, &path, std::slice::from_ref(app_service))
            .await?;

        let mut retired_services = Vec::new();
        for service in self.runtime.running_services(&project).await? {
            if doc.service(&service).is_some() {
                continue;
            }
            self.runtime.scale(&project, &path, &service, 0).await?;
            self.runtime.remove_service(&project, &path, &service).await?;
            retired_services.push(service);
        }

        let declared = doc.declared_volumes();
        let prefix = format!("{project}_");
        let mut removed_volumes = Vec::new();
        for volume in self.runtime.volumes(&project).await? {
            // Only project-scoped names map back to a declaration.
            let Some(short) = volume.strip_prefix(&prefix) else {
                continue;
            };
            if declared.iter().any(|d| d == short) {
                continue;
            }
            self.runtime.remove_volume(&volume).await?;
            removed_volumes.push(volume);
        }

        self.runtime.up(&project, &path, &[]).await?;
        if let Some(port) = doc.local_port(&self.cfg.proxy_service) {
            self.prober.wait_ready(port, self.cfg.ready_timeout).await?;
        }

        let mut note = format!(
            "Instance updated ({} -> {})",
            before.as_deref().unwrap_or("unknown"),
            after.as_deref().unwrap_or("unknown")
        );
        if let Some(message) = opts.message.as_deref().filter(|m| !m.trim().is_empty()) {
            note.push_str(": ");
            note.push_str(message.trim());
        }
        metadata::append(&instance.metadata_path(), &note)?;

        Ok(UpdateReport {
            image: after,
            retired_services,
            removed_volumes,
        })
    }

    /// Delete containers and volumes; directory and routing stay.
    pub async fn erase(&self, name: &InstanceName, force: bool) -> anyhow::Result<()> {
        let instance = self.require(name)?;
        self.check_marker(&instance, force)?;
        self.runtime
            .down(&instance.project(), &instance.config_path(), true)
            .await?;
        info!(instance = %name, "runtime state erased");
        Ok(())
    }

    pub async fn remove(
        &self,
        name: &InstanceName,
        force: bool,
        www: bool,
    ) -> anyhow::Result<RemoveReport> {
        let instance = self.instance(name);
        if !instance.exists() && force {
            // An earlier run got past the directory; finish the routing steps.
            warn!(instance = %name, "directory already gone, releasing certificate and route because of --force");
            return self.release(name, www).await;
        }
        let instance = self.require(name)?;
        self.check_marker(&instance, force)?;
        let marker = Marker::read(&instance.marker_path());
        let www = www || marker.www;

        if let Err(e) = self
            .runtime
            .down(&instance.project(), &instance.config_path(), true)
            .await
        {
            if !force {
                return Err(e.context(format!("failed to erase {name}")));
            }
            warn!(instance = %name, error = %e, "erase failed, continuing because of --force");
        } else {
            info!(instance = %name, "runtime state erased");
        }

        fs::remove_dir_all(&instance.directory)
            .with_context(|| format!("failed to delete {}", instance.directory.display()))?;
        info!(instance = %name, "directory deleted");

        if marker.local_only {
            return Ok(RemoveReport {
                certificate_revoked: false,
                proxy: None,
            });
        }
        self.release(name, www).await
    }

    async fn release(&self, name: &InstanceName, www: bool) -> anyhow::Result<RemoveReport> {
        self.certs.revoke(name, www).await?;
        let outcome = self.proxy.unregister(name).await?;
        if !outcome.reloaded {
            warn!(instance = %name, "proxy config written but reload failed");
        }
        Ok(RemoveReport {
            certificate_revoked: true,
            proxy: Some(outcome),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::container::testing::RecordingRuntime;
    use crate::domain::DeploymentMode;
    use crate::error::classify;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    pub const TEMPLATE: &str = r#"services:
  app:
    image: registry.example.org/fleet/app:16.0
  proxy:
    image: registry.example.org/fleet/proxy:1.25
    ports:
      - "80:80"
      - "443:443"
  db:
    image: postgres:15
    volumes:
      - data:/var/lib/postgresql/data
volumes:
  data: {}
"#;

    const PROXY: &str = "map $ssl_preread_server_name $backend {
    hostnames;
    # BEGIN flotilla managed region
    # END flotilla managed region
}
";

    pub struct NoListeners;

    impl PortProbe for NoListeners {
        fn in_use(&self, _port: u16) -> bool {
            false
        }
    }

    pub fn fixture(label: &str) -> (PathBuf, FleetConfig) {
        let root = std::env::temp_dir().join(format!(
            "flotilla-test-lifecycle-{label}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let template = root.join("template");
        fs::create_dir_all(template.join("conf")).unwrap();
        fs::create_dir_all(root.join("fleet")).unwrap();
        fs::write(template.join("docker-compose.yml"), TEMPLATE).unwrap();
        fs::write(template.join("conf/app.conf"), "[options]\n").unwrap();
        fs::write(root.join("proxy.conf"), PROXY).unwrap();

        let mut cfg = FleetConfig::with_mode(DeploymentMode::Compose);
        cfg.fleet_root = root.join("fleet");
        cfg.template_dir = template;
        cfg.proxy_config = root.join("proxy.conf");
        cfg.proxy_backup = root.join("proxy.conf.bak");
        cfg.proxy_reload_command = vec!["true".to_string()];
        cfg.cert_tool = "true".to_string();
        cfg.probe_http_timeout = Duration::from_secs(1);
        cfg.ready_timeout = Duration::from_secs(5);
        cfg.command_timeout = Duration::from_secs(10);
        (root, cfg)
    }

    fn name(raw: &str) -> InstanceName {
        InstanceName::parse(raw).unwrap()
    }

    fn lifecycle(cfg: &FleetConfig, rt: RecordingRuntime) -> Lifecycle<'_, RecordingRuntime, NoListeners> {
        Lifecycle::new(cfg, rt, NoListeners).unwrap()
    }

    pub fn forced(raw: &str) -> CreateOptions {
        let mut opts = CreateOptions::new(InstanceName::parse(raw).unwrap());
        opts.force = true;
        opts
    }

    async fn serve_version() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"server_version":"16.0"}"#;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            }
        });
        port
    }

    fn write_instance(cfg: &FleetConfig, raw: &str, config: &str, managed: bool) -> Instance {
        let inst = Instance::new(&cfg.fleet_root, name(raw), &cfg.config_file_name);
        fs::create_dir_all(&inst.directory).unwrap();
        fs::write(inst.config_path(), config).unwrap();
        if managed {
            fs::write(inst.marker_path(), "").unwrap();
        }
        inst
    }

    #[tokio::test]
    async fn create_scenario() {
        let (root, cfg) = fixture("create");
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let report = lc.create(&forced("demo.example.org")).await.unwrap();

        assert_eq!(report.port, 61001);
        assert!(report.certificate);
        let inst = report.instance;
        let config = fs::read_to_string(inst.config_path()).unwrap();
        assert!(config.contains("61001:80"), "{config}");
        assert!(!config.contains("443:443"));
        assert!(config.contains("hostname: demo.example.org"));
        assert!(inst.is_managed());
        assert!(inst.directory.join("conf/app.conf").is_file());
        let admin = secrets::read_secret(&inst.secrets_dir().join(secrets::ADMIN_PASSWORD));
        assert_eq!(admin.map(|s| s.len()), Some(32));
        assert!(inst.secrets_dir().join(secrets::USER_PASSWORD).is_file());

        let log = metadata::read(&inst.metadata_path());
        assert_eq!(log.len(), 1);
        assert_eq!(log.iter().filter(|l| l.contains("Instance created")).count(), 1);

        let routes = ProxyRegistrar::new(&cfg).entries().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].host, "demo.example.org");
        assert_eq!(routes[0].target, "127.0.0.1:61001");
        assert!(lc.runtime().calls().is_empty());
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn second_instance_gets_next_port_and_duplicates_fail() {
        let (root, cfg) = fixture("second");
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        lc.create(&forced("demo.example.org")).await.unwrap();
        let other = lc.create(&forced("other.example.org")).await.unwrap();
        assert_eq!(other.port, 61002);

        let err = lc.create(&forced("demo.example.org")).await.expect_err("exists");
        assert!(matches!(classify(&err), Some(FleetError::Precondition(_))));
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn local_only_skips_certificate_and_proxy() {
        let (root, mut cfg) = fixture("local");
        cfg.cert_tool = "false".to_string();
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let mut opts = CreateOptions::new(name("dev.example.org"));
        opts.local_only = true;
        opts.add_account = false;
        let report = lc.create(&opts).await.unwrap();
        assert!(!report.certificate);
        assert!(report.proxy.is_none());
        assert!(ProxyRegistrar::new(&cfg).entries().unwrap().is_empty());
        assert!(!report.instance.secrets_dir().join(secrets::USER_PASSWORD).exists());
        assert!(Marker::read(&report.instance.marker_path()).local_only);

        opts.name = name("dev2.example.org");
        opts.www = true;
        let err = lc.create(&opts).await.expect_err("conflicting options");
        assert!(matches!(classify(&err), Some(FleetError::Precondition(_))));
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn missing_template_is_configuration_error() {
        let (root, mut cfg) = fixture("no-template");
        cfg.template_dir = root.join("nowhere");
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let err = lc.create(&forced("demo.example.org")).await.expect_err("no template");
        assert!(matches!(classify(&err), Some(FleetError::Configuration(_))));
        assert!(!cfg.fleet_root.join("demo.example.org").exists());
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn update_refuses_legacy_config_before_any_runtime_call() {
        let (root, cfg) = fixture("legacy");
        write_instance(
            &cfg,
            "old.example.org",
            "services:\n  app:\n    build: ./app\n  proxy:\n    image: p\n    ports: [\"61001:80\"]\n",
            true,
        );
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let opts = UpdateOptions {
            name: name("old.example.org"),
            image: None,
            tag: Some("v2".into()),
            message: None,
        };
        let err = lc.update(&opts).await.expect_err("legacy");
        assert!(matches!(classify(&err), Some(FleetError::Configuration(_))));
        assert!(lc.runtime().calls().is_empty());
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn update_rolls_services_and_prunes_volumes() {
        let (root, cfg) = fixture("update");
        let port = serve_version().await;
        let inst = write_instance(
            &cfg,
            "demo.example.org",
            &format!(
                "services:\n  app:\n    image: registry.example.org/fleet/app:16.0\n  proxy:\n    image: p\n    ports: [\"{port}:80\"]\n  db:\n    image: postgres:15\nvolumes:\n  data: {{}}\n"
            ),
            true,
        );
        let rt = RecordingRuntime {
            running: vec!["app".into(), "db".into(), "proxy".into(), "worker".into()],
            volumes: vec![
                "demo_example_org_cache".into(),
                "demo_example_org_data".into(),
                "shared_assets".into(),
            ],
            ..Default::default()
        };
        let lc = lifecycle(&cfg, rt);
        let report = lc
            .update(&UpdateOptions {
                name: name("demo.example.org"),
                image: None,
                tag: Some("v2".into()),
                message: Some("security release".into()),
            })
            .await
            .unwrap();

        assert_eq!(report.image.as_deref(), Some("registry.example.org/fleet/app:v2"));
        assert_eq!(report.retired_services, vec!["worker"]);
        assert_eq!(report.removed_volumes, vec!["demo_example_org_cache"]);
        assert_eq!(
            lc.runtime().calls(),
            vec![
                "up demo_example_org [app]",
                "running_services demo_example_org",
                "scale demo_example_org worker=0",
                "remove_service demo_example_org worker",
                "volumes demo_example_org",
                "remove_volume demo_example_org_cache",
                "up demo_example_org []",
            ]
        );
        let saved = ComposeFile::load(&inst.config_path()).unwrap();
        assert_eq!(saved.image_of("app"), Some("registry.example.org/fleet/app:v2"));
        let log = metadata::read(&inst.metadata_path());
        assert!(log[0].ends_with("Instance updated (registry.example.org/fleet/app:16.0 -> registry.example.org/fleet/app:v2): security release"));
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn remove_requires_marker_unless_forced() {
        let (root, cfg) = fixture("marker");
        let inst = write_instance(
            &cfg,
            "stray.example.org",
            "services:\n  proxy:\n    ports: [\"61001:80\"]\n",
            false,
        );
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let stray = name("stray.example.org");

        let err = lc.remove(&stray, false, false).await.expect_err("no marker");
        assert!(matches!(classify(&err), Some(FleetError::Precondition(_))));
        assert!(inst.directory.is_dir());
        assert!(lc.runtime().calls().is_empty());

        let report = lc.remove(&stray, true, false).await.unwrap();
        assert!(report.certificate_revoked);
        assert!(!inst.directory.exists());
        assert_eq!(
            lc.runtime().calls(),
            vec!["down stray_example_org volumes=true"]
        );
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn remove_unregisters_created_instance() {
        let (root, cfg) = fixture("remove");
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let mut opts = forced("demo.example.org");
        opts.www = true;
        lc.create(&opts).await.unwrap();
        assert_eq!(ProxyRegistrar::new(&cfg).entries().unwrap().len(), 2);

        let report = lc.remove(&opts.name, false, false).await.unwrap();
        assert!(report.proxy.map(|p| p.changed).unwrap_or(false));
        assert!(ProxyRegistrar::new(&cfg).entries().unwrap().is_empty());
        assert!(!lc.instance(&opts.name).exists());
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn forced_remove_finishes_after_failed_revoke() {
        let (root, cfg) = fixture("remove-retry");
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let demo = name("demo.example.org");
        lc.create(&forced("demo.example.org")).await.unwrap();

        let mut broken = cfg.clone();
        broken.cert_tool = "false".to_string();
        let failing = lifecycle(&broken, RecordingRuntime::default());
        let err = failing.remove(&demo, false, false).await.expect_err("revoke fails");
        assert!(matches!(classify(&err), Some(FleetError::ExternalTool { .. })));
        assert!(!lc.instance(&demo).exists());
        assert_eq!(ProxyRegistrar::new(&cfg).entries().unwrap().len(), 1);

        let err = lc.remove(&demo, false, false).await.expect_err("needs force");
        assert!(matches!(classify(&err), Some(FleetError::NotFound(_))));

        let report = lc.remove(&demo, true, false).await.unwrap();
        assert!(report.certificate_revoked);
        assert!(report.proxy.map(|p| p.changed).unwrap_or(false));
        assert!(ProxyRegistrar::new(&cfg).entries().unwrap().is_empty());
        assert!(lc.runtime().calls().is_empty());
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn erase_keeps_directory() {
        let (root, cfg) = fixture("erase");
        let inst = write_instance(&cfg, "demo.example.org", TEMPLATE, true);
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        lc.erase(&inst.name, false).await.unwrap();
        assert!(inst.directory.is_dir());
        assert_eq!(lc.runtime().calls(), vec!["down demo_example_org volumes=true"]);
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn operations_on_missing_instance_are_not_found() {
        let (root, cfg) = fixture("missing");
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        let ghost = name("ghost.example.org");
        let err = lc.start(&ghost, false).await.expect_err("missing");
        assert!(matches!(classify(&err), Some(FleetError::NotFound(_))));
        let err = lc.stop(&ghost).await.expect_err("missing");
        assert!(matches!(classify(&err), Some(FleetError::NotFound(_))));
        fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn start_brings_project_up() {
        let (root, cfg) = fixture("start");
        let port = serve_version().await;
        let inst = write_instance(
            &cfg,
            "demo.example.org",
            &format!("services:\n  proxy:\n    image: p\n    ports: [\"{port}:80\"]\n"),
            true,
        );
        let lc = lifecycle(&cfg, RecordingRuntime::default());
        assert_eq!(lc.start(&inst.name, true).await.unwrap(), Some(port));
        lc.stop(&inst.name).await.unwrap();
        assert_eq!(
            lc.runtime().calls(),
            vec!["up demo_example_org []", "stop demo_example_org"]
        );
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn host_match_needs_a_local_address() {
        let local: Vec<IpAddr> = vec!["203.0.113.7".parse().unwrap(), "127.0.0.1".parse().unwrap()];
        assert!(resolves_to_host(&["203.0.113.7".parse().unwrap()], &local));
        assert!(!resolves_to_host(&["198.51.100.1".parse().unwrap()], &local));
        assert!(!resolves_to_host(&[], &local));
    }

    #[test]
    fn empty_marker_reads_as_defaults() {
        let dir = std::env::temp_dir().join(format!("flotilla-test-marker-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(MARKER_FILE);
        fs::write(&path, "").unwrap();
        assert_eq!(Marker::read(&path), Marker::default());
        Marker { local_only: true, www: true }.write(&path).unwrap();
        assert_eq!(Marker::read(&path), Marker { local_only: true, www: true });
        fs::remove_dir_all(&dir).ok();
    }
}
