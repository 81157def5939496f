//! PostgreSQL client tools run inside an instance's database container.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::Context;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::ContainerRuntime;
use crate::error::FleetError;
use crate::runtime;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("regex compile"))
}

/// Database and role names are interpolated into SQL, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> anyhow::Result<()> {
    if identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(FleetError::configuration(format!("invalid database identifier: {name:?}")).into())
    }
}

pub struct Database<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    project: String,
    compose_file: PathBuf,
    service: String,
    user: String,
    timeout: Duration,
}

impl<'a, R: ContainerRuntime + ?Sized> Database<'a, R> {
    pub fn new(
        runtime: &'a R,
        project: &str,
        compose_file: &Path,
        service: &str,
        user: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            project: project.to_string(),
            compose_file: compose_file.to_path_buf(),
            service: service.to_string(),
            user: user.to_string(),
            timeout,
        }
    }

    async fn command(&self, args: &[&str]) -> anyhow::Result<tokio::process::Command> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runtime
            .exec_command(&self.project, &self.compose_file, &self.service, &args)
            .await
    }

    async fn run(&self, tool: &str, args: &[&str]) -> anyhow::Result<()> {
        let cmd = self.command(args).await?;
        runtime::run_command(tool, cmd, self.timeout).await?;
        Ok(())
    }

    async fn psql(&self, sql: &str) -> anyhow::Result<()> {
        self.run(
            "psql",
            &[
                "psql", "-U", &self.user, "-d", "postgres", "-v", "ON_ERROR_STOP=1", "-c", sql,
            ],
        )
        .await
    }

    pub async fn ready(&self) -> bool {
        match self.run("pg_isready", &["pg_isready", "-U", &self.user]).await {
            Ok(()) => true,
            Err(e) => {
                debug!(project = %self.project, error = %e, "database not ready");
                false
            }
        }
    }

    /// Poll `pg_isready` with backoff until it succeeds or `limit` passes.
    pub async fn wait_ready(&self, limit: Duration) -> anyhow::Result<()> {
        let start = Instant::now();
        let mut delay = Duration::from_millis(200);
        loop {
            if self.ready().await {
                info!(project = %self.project, elapsed = ?start.elapsed(), "database ready");
                return Ok(());
            }
            if start.elapsed() + delay > limit {
                return Err(FleetError::external(
                    "pg_isready",
                    format!("database of {} not ready within {limit:?}", self.project),
                )
                .into());
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(3));
        }
    }

    pub async fn terminate_backends(&self, db: &str) -> anyhow::Result<()> {
        validate_identifier(db)?;
        self.psql(&format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{db}' AND pid <> pg_backend_pid();"
        ))
        .await
    }

    pub async fn drop_if_exists(&self, db: &str) -> anyhow::Result<()> {
        validate_identifier(db)?;
        self.run("dropdb", &["dropdb", "-U", &self.user, "--if-exists", db])
            .await
    }

    pub async fn create(&self, db: &str, owner: &str) -> anyhow::Result<()> {
        validate_identifier(db)?;
        validate_identifier(owner)?;
        self.run("createdb", &["createdb", "-U", &self.user, "-O", owner, db])
            .await
    }

    /// Stream `pg_dump -Fc` of `db` straight into `pg_restore` on `target`.
    pub async fn dump_into(&self, db: &str, target: &Database<'_, R>) -> anyhow::Result<u64> {
        validate_identifier(db)?;
        let mut dump = self.command(&["pg_dump", "-U", &self.user, "-Fc", db]).await?;
        let mut restore = target
            .command(&[
                "pg_restore",
                "-U",
                &target.user,
                "-d",
                db,
                "--no-owner",
                "--role",
                &target.user,
            ])
            .await?;
        restore.stdin(Stdio::piped()).stdout(Stdio::null());

        let mut dump_child = dump
            .spawn()
            .map_err(|e| FleetError::external("pg_dump", format!("failed to start: {e}")))?;
        let mut restore_child = restore
            .spawn()
            .map_err(|e| FleetError::external("pg_restore", format!("failed to start: {e}")))?;

        let mut source = dump_child
            .stdout
            .take()
            .context("pg_dump stdout not captured")?;
        let mut sink = restore_child
            .stdin
            .take()
            .context("pg_restore stdin not captured")?;
        let mut dump_stderr = dump_child
            .stderr
            .take()
            .context("pg_dump stderr not captured")?;
        let mut restore_stderr = restore_child
            .stderr
            .take()
            .context("pg_restore stderr not captured")?;

        // stderr of both tools is drained alongside the copy.
        let (copied, dump_log, restore_log) = tokio::time::timeout(self.timeout, async {
            let copy = async move {
                let n = tokio::io::copy(&mut source, &mut sink).await;
                drop(sink);
                n
            };
            let mut dump_log = Vec::new();
            let mut restore_log = Vec::new();
            let (copied, _, _) = tokio::join!(
                copy,
                dump_stderr.read_to_end(&mut dump_log),
                restore_stderr.read_to_end(&mut restore_log),
            );
            (copied, dump_log, restore_log)
        })
        .await
        .map_err(|_| {
            FleetError::external("pg_restore", format!("copy of {db} timed out after {:?}", self.timeout))
        })?;

        let restored = tokio::time::timeout(self.timeout, restore_child.wait())
            .await
            .map_err(|_| FleetError::external("pg_restore", "timed out waiting for exit"))??;
        if !restored.success() {
            return Err(exit_error("pg_restore", restored, &restore_log));
        }
        let dumped = tokio::time::timeout(self.timeout, dump_child.wait())
            .await
            .map_err(|_| FleetError::external("pg_dump", "timed out waiting for exit"))??;
        if !dumped.success() {
            return Err(exit_error("pg_dump", dumped, &dump_log));
        }
        let copied = copied.context("failed streaming dump into restore")?;
        info!(db, bytes = copied, from = %self.project, to = %target.project, "database copied");
        Ok(copied)
    }
}

fn exit_error(tool: &str, status: ExitStatus, stderr: &[u8]) -> anyhow::Error {
    FleetError::external(
        tool,
        format!("exited with {status}: {}", String::from_utf8_lossy(stderr).trim()),
    )
    .into()
}
