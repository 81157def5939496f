use std::time::Duration;

use tracing::info;

use crate::config::FleetConfig;
use crate::domain::InstanceName;
use crate::runtime;

/// Drives the host's certificate tool (`<tool> want …` / `<tool> unwant …`).
pub struct CertManager {
    tool: String,
    timeout: Duration,
}

impl CertManager {
    pub fn new(cfg: &FleetConfig) -> Self {
        Self {
            tool: cfg.cert_tool.clone(),
            timeout: cfg.command_timeout,
        }
    }

    pub fn domains(name: &InstanceName, www: bool) -> Vec<String> {
        let mut domains = vec![name.to_string()];
        if www {
            domains.push(name.www());
        }
        domains
    }

    /// Returns `false` when nothing was requested (local-only instances).
    pub async fn issue(
        &self,
        name: &InstanceName,
        www: bool,
        local_only: bool,
    ) -> anyhow::Result<bool> {
        if local_only {
            info!(instance = %name, "local-only instance, no certificate requested");
            return Ok(false);
        }
        let domains = Self::domains(name, www);
        let mut args = vec!["want".to_string()];
        args.extend(domains.iter().cloned());
        runtime::run_tool(&self.tool, &args, self.timeout).await?;
        info!(instance = %name, domains = ?domains, "certificate requested");
        Ok(true)
    }

    pub async fn revoke(&self, name: &InstanceName, www: bool) -> anyhow::Result<()> {
        for domain in Self::domains(name, www) {
            runtime::run_tool(&self.tool, ["unwant", domain.as_str()], self.timeout).await?;
            info!(domain = %domain, "certificate released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeploymentMode;
    use crate::error::{classify, FleetError};

    fn manager(tool: &str) -> CertManager {
        let mut cfg = FleetConfig::with_mode(DeploymentMode::Compose);
        cfg.cert_tool = tool.to_string();
        CertManager::new(&cfg)
    }

    fn name() -> InstanceName {
        InstanceName::parse("demo.example.org").expect("name")
    }

    #[test]
    fn www_adds_alias_domain() {
        assert_eq!(CertManager::domains(&name(), false), vec!["demo.example.org"]);
        assert_eq!(
            CertManager::domains(&name(), true),
            vec!["demo.example.org", "www.demo.example.org"]
        );
    }

    #[tokio::test]
    async fn local_only_skips_tool() {
        let issued = manager("flotilla-no-such-tool")
            .issue(&name(), true, true)
            .await
            .expect("skipped");
        assert!(!issued);
    }

    #[tokio::test]
    async fn issue_and_revoke_run_tool() {
        let certs = manager("true");
        assert!(certs.issue(&name(), true, false).await.expect("issue"));
        certs.revoke(&name(), true).await.expect("revoke");
    }

    #[tokio::test]
    async fn tool_failure_is_external_error() {
        let err = manager("false")
            .issue(&name(), false, false)
            .await
            .expect_err("must fail");
        assert!(matches!(classify(&err), Some(FleetError::ExternalTool { .. })));
    }
}
