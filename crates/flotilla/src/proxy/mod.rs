use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::domain::InstanceName;
use crate::error::FleetError;
use crate::runtime;

pub const REGION_BEGIN: &str = "# BEGIN flotilla managed region";
pub const REGION_END: &str = "# END flotilla managed region";

/// Keeps one routing rule per instance host inside the managed region of the
/// shared SNI proxy config (`<host> <backend>:<port>;` map entries).
pub struct ProxyRegistrar {
    config_path: PathBuf,
    backup_path: PathBuf,
    reload_command: Vec<String>,
    backend_host: String,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationOutcome {
    pub changed: bool,
    /// `false` when the file changed but the daemon did not accept the reload.
    pub reloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub host: String,
    pub target: String,
}

/// Target routed for `host`, if the region has a rule for it.
pub fn target_of<'e>(entries: &'e [RouteEntry], host: &str) -> Option<&'e str> {
    entries
        .iter()
        .find(|e| e.host == host)
        .map(|e| e.target.as_str())
}

struct Document {
    lines: Vec<String>,
    begin: usize,
    end: usize,
    indent: String,
}

fn parse_rule(line: &str) -> Option<RouteEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let body = trimmed.strip_suffix(';')?;
    let mut parts = body.split_whitespace();
    let host = parts.next()?;
    let target = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(RouteEntry {
        host: host.to_string(),
        target: target.to_string(),
    })
}

impl Document {
    fn parse(raw: &str, path: &Path) -> anyhow::Result<Self> {
        let lines: Vec<String> = raw.lines().map(str::to_string).collect();
        let begin = lines.iter().position(|l| l.trim() == REGION_BEGIN);
        let end = lines.iter().position(|l| l.trim() == REGION_END);
        match (begin, end) {
            (Some(begin), Some(end)) if begin < end => {
                let indent: String = lines[begin]
                    .chars()
                    .take_while(|c| c.is_whitespace())
                    .collect();
                Ok(Self {
                    lines,
                    begin,
                    end,
                    indent,
                })
            }
            _ => Err(FleetError::configuration(format!(
                "{} has no managed region ({REGION_BEGIN} / {REGION_END})",
                path.display()
            ))
            .into()),
        }
    }

    fn region(&self) -> &[String] {
        &self.lines[self.begin + 1..self.end]
    }

    fn entries(&self) -> Vec<RouteEntry> {
        self.region().iter().filter_map(|l| parse_rule(l)).collect()
    }

    /// Rebuild the file with a new region body; everything outside is kept.
    fn with_region(&self, region: Vec<String>) -> String {
        let mut out: Vec<String> = Vec::with_capacity(self.lines.len() + 2);
        out.extend_from_slice(&self.lines[..=self.begin]);
        out.extend(region);
        out.extend_from_slice(&self.lines[self.end..]);
        let mut joined = out.join("\n");
        joined.push('\n');
        joined
    }

    fn rule(&self, host: &str, target: &str) -> String {
        format!("{}{host} {target};", self.indent)
    }
}

impl ProxyRegistrar {
    pub fn new(cfg: &FleetConfig) -> Self {
        Self {
            config_path: cfg.proxy_config.clone(),
            backup_path: cfg.proxy_backup.clone(),
            reload_command: cfg.proxy_reload_command.clone(),
            backend_host: cfg.proxy_backend_host.clone(),
            timeout: cfg.command_timeout,
        }
    }

    pub fn entries(&self) -> anyhow::Result<Vec<RouteEntry>> {
        let raw = fs::read_to_string(&self.config_path)
            .with_context(|| format!("failed reading {}", self.config_path.display()))?;
        Ok(Document::parse(&raw, &self.config_path)?.entries())
    }

    fn hosts(name: &InstanceName, www: bool) -> Vec<String> {
        let mut hosts = vec![name.to_string()];
        if www {
            hosts.push(name.www());
        }
        hosts
    }

    pub async fn register(
        &self,
        name: &InstanceName,
        port: u16,
        www: bool,
    ) -> anyhow::Result<RegistrationOutcome> {
        let hosts = Self::hosts(name, www);
        // A `www.` rule left from an earlier registration goes when `www` is off.
        let owned = Self::hosts(name, true);
        let target = format!("{}:{port}", self.backend_host);
        let outcome = self
            .rewrite(|doc| {
                let entries = doc.entries();
                let settled = owned.iter().all(|h| {
                    let count = entries.iter().filter(|e| &e.host == h).count();
                    if hosts.contains(h) {
                        count == 1 && entries.iter().any(|e| &e.host == h && e.target == target)
                    } else {
                        count == 0
                    }
                });
                if settled {
                    return None;
                }
                let mut region: Vec<String> = doc
                    .region()
                    .iter()
                    .filter(|l| parse_rule(l).map_or(true, |e| !owned.contains(&e.host)))
                    .cloned()
                    .collect();
                region.extend(hosts.iter().map(|h| doc.rule(h, &target)));
                Some(region)
            })
            .await?;
        if outcome.changed {
            info!(instance = %name, port, "registered with proxy");
        }
        Ok(outcome)
    }

    /// Drops the rules for `name` and its `www.` alias.
    pub async fn unregister(&self, name: &InstanceName) -> anyhow::Result<RegistrationOutcome> {
        let hosts = Self::hosts(name, true);
        let outcome = self
            .rewrite(|doc| {
                let region: Vec<String> = doc
                    .region()
                    .iter()
                    .filter(|l| parse_rule(l).map_or(true, |e| !hosts.contains(&e.host)))
                    .cloned()
                    .collect();
                (region.len() != doc.region().len()).then_some(region)
            })
            .await?;
        if outcome.changed {
            info!(instance = %name, "unregistered from proxy");
        }
        Ok(outcome)
    }

    /// Copy live → backup, transform the backup, swap the result in, reload.
    async fn rewrite<F>(&self, transform: F) -> anyhow::Result<RegistrationOutcome>
    where
        F: FnOnce(&Document) -> Option<Vec<String>>,
    {
        fs::copy(&self.config_path, &self.backup_path).with_context(|| {
            format!(
                "failed to back up {} to {}",
                self.config_path.display(),
                self.backup_path.display()
            )
        })?;
        let raw = fs::read_to_string(&self.backup_path)
            .with_context(|| format!("failed reading {}", self.backup_path.display()))?;
        let doc = Document::parse(&raw, &self.config_path)?;
        let Some(region) = transform(&doc) else {
            return Ok(RegistrationOutcome {
                changed: false,
                reloaded: true,
            });
        };
        let updated = doc.with_region(region);

        let mut tmp_name = self
            .config_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".flotilla.tmp");
        let tmp = self.config_path.with_file_name(tmp_name);
        fs::write(&tmp, updated).with_context(|| format!("failed writing {}", tmp.display()))?;
        if let Ok(meta) = fs::metadata(&self.backup_path) {
            fs::set_permissions(&tmp, meta.permissions()).ok();
        }
        fs::rename(&tmp, &self.config_path)
            .with_context(|| format!("failed to replace {}", self.config_path.display()))?;

        let reloaded = self.reload().await;
        Ok(RegistrationOutcome {
            changed: true,
            reloaded,
        })
    }

    async fn reload(&self) -> bool {
        let Some((program, args)) = self.reload_command.split_first() else {
            return false;
        };
        match runtime::run_tool(program, args, self.timeout).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "proxy reload failed; config file and running proxy may differ");
                false
            }
        }
    }
}
