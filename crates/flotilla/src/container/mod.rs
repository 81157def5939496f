pub mod postgres;

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::DeploymentMode;
use crate::error::FleetError;
use crate::runtime;

/// Container orchestrator seen from the lifecycle: one project (compose
/// project or swarm stack) per instance.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Bring up `services`, or every service when empty.
    async fn up(&self, project: &str, compose_file: &Path, services: &[String])
        -> anyhow::Result<()>;

    async fn stop(&self, project: &str, compose_file: &Path) -> anyhow::Result<()>;

    async fn down(&self, project: &str, compose_file: &Path, volumes: bool) -> anyhow::Result<()>;

    async fn scale(
        &self,
        project: &str,
        compose_file: &Path,
        service: &str,
        replicas: u32,
    ) -> anyhow::Result<()>;

    async fn remove_service(
        &self,
        project: &str,
        compose_file: &Path,
        service: &str,
    ) -> anyhow::Result<()>;

    /// Names of services that currently have running containers.
    async fn running_services(&self, project: &str) -> anyhow::Result<Vec<String>>;

    /// Full names of the volumes owned by the project.
    async fn volumes(&self, project: &str) -> anyhow::Result<Vec<String>>;

    async fn remove_volume(&self, name: &str) -> anyhow::Result<()>;

    /// A prepared command running `args` inside `service`. Output is piped,
    /// stdin is closed unless the caller reconfigures it.
    async fn exec_command(
        &self,
        project: &str,
        compose_file: &Path,
        service: &str,
        args: &[String],
    ) -> anyhow::Result<Command>;
}

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";
const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.name";

/// `docker compose` or `docker stack`, depending on the deployment mode.
pub struct DockerRuntime {
    mode: DeploymentMode,
    program: String,
    timeout: Duration,
}

fn strings<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn compose_args(project: &str, compose_file: &Path, rest: &[&str]) -> Vec<String> {
    let mut args = strings(["compose", "-p", project, "-f"]);
    args.push(compose_file.to_string_lossy().to_string());
    args.extend(rest.iter().map(|s| s.to_string()));
    args
}

fn label_filter(label: &str, value: &str) -> String {
    format!("label={label}={value}")
}

fn stack_service(project: &str, service: &str) -> String {
    format!("{project}_{service}")
}

fn unique_sorted(mut names: Vec<String>) -> Vec<String> {
    names.retain(|n| !n.is_empty());
    names.sort();
    names.dedup();
    names
}

impl DockerRuntime {
    pub fn new(mode: DeploymentMode, timeout: Duration) -> Self {
        Self {
            mode,
            program: "docker".to_string(),
            timeout,
        }
    }

    async fn docker(&self, args: Vec<String>) -> anyhow::Result<Vec<String>> {
        let out = runtime::run_tool(&self.program, &args, self.timeout).await?;
        Ok(runtime::stdout_lines(&out))
    }

    /// Container ids matching every label filter.
    async fn containers(&self, filters: &[String], all: bool) -> anyhow::Result<Vec<String>> {
        let mut args = strings(["ps", "-q"]);
        if all {
            args.push("-a".to_string());
        }
        for f in filters {
            args.push("--filter".to_string());
            args.push(f.clone());
        }
        self.docker(args).await
    }

    fn compose_service_filters(project: &str, service: &str) -> Vec<String> {
        vec![
            label_filter(COMPOSE_PROJECT_LABEL, project),
            label_filter(COMPOSE_SERVICE_LABEL, service),
        ]
    }

    /// Stack removal is asynchronous; volumes stay busy until its containers exit.
    async fn wait_stack_gone(&self, project: &str) -> anyhow::Result<()> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(250);
        let filters = [label_filter(STACK_NAMESPACE_LABEL, project)];
        loop {
            let left = self.containers(&filters, true).await?;
            if left.is_empty() {
                return Ok(());
            }
            if start.elapsed() + delay > self.timeout {
                return Err(FleetError::external(
                    "docker",
                    format!(
                        "{} containers of stack {project} still present after {:?}",
                        left.len(),
                        self.timeout
                    ),
                )
                .into());
            }
            debug!(project, remaining = left.len(), "waiting for stack containers to exit");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn up(
        &self,
        project: &str,
        compose_file: &Path,
        services: &[String],
    ) -> anyhow::Result<()> {
        let args = match self.mode {
            DeploymentMode::Compose => {
                let mut args = compose_args(project, compose_file, &["up", "-d"]);
                if !services.is_empty() {
                    args.push("--no-deps".to_string());
                    args.extend(services.iter().cloned());
                }
                args
            }
            DeploymentMode::Stack => {
                if !services.is_empty() {
                    debug!(project, ?services, "stack deploy updates every service");
                }
                let mut args = strings(["stack", "deploy", "--prune", "-c"]);
                args.push(compose_file.to_string_lossy().to_string());
                args.push(project.to_string());
                args
            }
        };
        self.docker(args).await?;
        info!(project, mode = %self.mode, "containers up");
        Ok(())
    }

    async fn stop(&self, project: &str, compose_file: &Path) -> anyhow::Result<()> {
        let args = match self.mode {
            DeploymentMode::Compose => compose_args(project, compose_file, &["stop"]),
            DeploymentMode::Stack => strings(["stack", "rm", project]),
        };
        self.docker(args).await?;
        info!(project, mode = %self.mode, "containers stopped");
        Ok(())
    }

    async fn down(&self, project: &str, compose_file: &Path, volumes: bool) -> anyhow::Result<()> {
        match self.mode {
            DeploymentMode::Compose => {
                let rest: &[&str] = if volumes { &["down", "-v"] } else { &["down"] };
                self.docker(compose_args(project, compose_file, rest)).await?;
            }
            DeploymentMode::Stack => {
                self.docker(strings(["stack", "rm", project])).await?;
                if volumes {
                    self.wait_stack_gone(project).await?;
                    for volume in self.volumes(project).await? {
                        self.remove_volume(&volume).await?;
                    }
                }
            }
        }
        info!(project, volumes, "containers removed");
        Ok(())
    }

    async fn scale(
        &self,
        project: &str,
        compose_file: &Path,
        service: &str,
        replicas: u32,
    ) -> anyhow::Result<()> {
        match self.mode {
            DeploymentMode::Compose if replicas == 0 => {
                // Superseded services are no longer in the file, so go by label.
                let ids = self
                    .containers(&Self::compose_service_filters(project, service), false)
                    .await?;
                if !ids.is_empty() {
                    let mut args = vec!["stop".to_string()];
                    args.extend(ids);
                    self.docker(args).await?;
                }
            }
            DeploymentMode::Compose => {
                let scale = format!("{service}={replicas}");
                let args = compose_args(
                    project,
                    compose_file,
                    &["up", "-d", "--no-deps", "--scale", scale.as_str(), service],
                );
                self.docker(args).await?;
            }
            DeploymentMode::Stack => {
                let target = format!("{}={replicas}", stack_service(project, service));
                self.docker(vec!["service".into(), "scale".into(), target])
                    .await?;
            }
        }
        info!(project, service, replicas, "service scaled");
        Ok(())
    }

    async fn remove_service(
        &self,
        project: &str,
        _compose_file: &Path,
        service: &str,
    ) -> anyhow::Result<()> {
        match self.mode {
            DeploymentMode::Compose => {
                let ids = self
                    .containers(&Self::compose_service_filters(project, service), true)
                    .await?;
                if !ids.is_empty() {
                    let mut args = strings(["rm", "-f"]);
                    args.extend(ids);
                    self.docker(args).await?;
                }
            }
            DeploymentMode::Stack => {
                self.docker(vec![
                    "service".into(),
                    "rm".into(),
                    stack_service(project, service),
                ])
                .await?;
            }
        }
        info!(project, service, "service removed");
        Ok(())
    }

    async fn running_services(&self, project: &str) -> anyhow::Result<Vec<String>> {
        let names = match self.mode {
            DeploymentMode::Compose => {
                let mut args = strings(["ps", "--filter"]);
                args.push(label_filter(COMPOSE_PROJECT_LABEL, project));
                args.push("--format".to_string());
                args.push(format!("{{{{.Label \"{COMPOSE_SERVICE_LABEL}\"}}}}"));
                self.docker(args).await?
            }
            DeploymentMode::Stack => {
                let mut args = strings(["service", "ls", "--filter"]);
                args.push(label_filter(STACK_NAMESPACE_LABEL, project));
                args.push("--format".to_string());
                args.push("{{.Name}}".to_string());
                let prefix = format!("{project}_");
                self.docker(args)
                    .await?
                    .into_iter()
                    .map(|n| n.strip_prefix(&prefix).map(str::to_string).unwrap_or(n))
                    .collect()
            }
        };
        Ok(unique_sorted(names))
    }

    async fn volumes(&self, project: &str) -> anyhow::Result<Vec<String>> {
        let label = match self.mode {
            DeploymentMode::Compose => COMPOSE_PROJECT_LABEL,
            DeploymentMode::Stack => STACK_NAMESPACE_LABEL,
        };
        let mut args = strings(["volume", "ls", "-q", "--filter"]);
        args.push(label_filter(label, project));
        Ok(unique_sorted(self.docker(args).await?))
    }

    async fn remove_volume(&self, name: &str) -> anyhow::Result<()> {
        self.docker(strings(["volume", "rm", name])).await?;
        info!(volume = name, "volume removed");
        Ok(())
    }

    async fn exec_command(
        &self,
        project: &str,
        compose_file: &Path,
        service: &str,
        args: &[String],
    ) -> anyhow::Result<Command> {
        let full = match self.mode {
            DeploymentMode::Compose => {
                let mut full = compose_args(project, compose_file, &["exec", "-T", service]);
                full.extend(args.iter().cloned());
                full
            }
            DeploymentMode::Stack => {
                let filter = label_filter(SWARM_SERVICE_LABEL, &stack_service(project, service));
                let id = self
                    .containers(std::slice::from_ref(&filter), false)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        FleetError::precondition(format!(
                            "no running container for service {service} of {project}"
                        ))
                    })?;
                let mut full = strings(["exec", "-i"]);
                full.push(id);
                full.extend(args.iter().cloned());
                full
            }
        };
        Ok(runtime::tool_command(&self.program, full))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_args_carry_project_and_file() {
        let args = compose_args(
            "demo_example_org",
            Path::new("/srv/fleet/demo.example.org/docker-compose.yml"),
            &["up", "-d"],
        );
        assert_eq!(
            args,
            vec![
                "compose",
                "-p",
                "demo_example_org",
                "-f",
                "/srv/fleet/demo.example.org/docker-compose.yml",
                "up",
                "-d"
            ]
        );
    }

    #[test]
    fn stack_service_names_are_namespaced() {
        assert_eq!(stack_service("demo_example_org", "app"), "demo_example_org_app");
        assert_eq!(
            label_filter(STACK_NAMESPACE_LABEL, "demo_example_org"),
            "label=com.docker.stack.namespace=demo_example_org"
        );
    }

    #[test]
    fn service_names_are_deduplicated() {
        let names = vec!["db".into(), "app".into(), "".into(), "app".into()];
        assert_eq!(unique_sorted(names), vec!["app", "db"]);
    }

    #[tokio::test]
    async fn missing_docker_is_external_error() {
        let mut rt = DockerRuntime::new(DeploymentMode::Compose, Duration::from_secs(5));
        rt.program = "flotilla-no-such-docker".to_string();
        let err = rt
            .stop("demo_example_org", Path::new("/nonexistent.yml"))
            .await
            .expect_err("must fail");
        assert!(matches!(
            crate::error::classify(&err),
            Some(FleetError::ExternalTool { .. })
        ));
    }
}
