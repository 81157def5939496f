use tracing::info;

use super::Lifecycle;
use crate::container::postgres::Database;
use crate::container::ContainerRuntime;
use crate::domain::{Instance, InstanceName};
use crate::error::FleetError;
use crate::ports::PortProbe;

impl<R: ContainerRuntime, P: PortProbe> Lifecycle<'_, R, P> {
    /// The instance to copy from: it must exist and carry the marker.
    pub(super) fn clone_source(&self, name: &InstanceName) -> anyhow::Result<Instance> {
        let source = self.instance(name);
        if !source.exists() {
            return Err(FleetError::not_found(format!("clone source {name} does not exist")).into());
        }
        if !source.is_managed() {
            return Err(FleetError::precondition(format!(
                "clone source {name} is not managed by flotilla"
            ))
            .into());
        }
        if !source.config_path().is_file() {
            return Err(FleetError::configuration(format!(
                "clone source {name} has no {}",
                self.cfg.config_file_name
            ))
            .into());
        }
        Ok(source)
    }

    /// Fails before anything is written when the source database is down.
    pub(super) async fn require_source_database(&self, source: &Instance) -> anyhow::Result<()> {
        if self.database(source).ready().await {
            return Ok(());
        }
        Err(FleetError::precondition(format!(
            "database of clone source {} is not running",
            source.name
        ))
        .into())
    }

    fn database<'r>(&'r self, instance: &Instance) -> Database<'r, R> {
        Database::new(
            &self.runtime,
            &instance.project(),
            &instance.config_path(),
            &self.cfg.db_service,
            &self.cfg.db_user,
            self.cfg.command_timeout,
        )
    }

    /// Start the target's database alone, then replace each configured
    /// database with a dump of the source's.
    pub(super) async fn copy_databases(
        &self,
        source: &Instance,
        target: &Instance,
    ) -> anyhow::Result<()> {
        self.runtime
            .up(
                &target.project(),
                &target.config_path(),
                std::slice::from_ref(&self.cfg.db_service),
            )
            .await?;
        let target_db = self.database(target);
        target_db.wait_ready(self.cfg.ready_timeout).await?;

        let source_db = self.database(source);
        for db in &self.cfg.clone_databases {
            target_db.terminate_backends(db).await?;
            target_db.drop_if_exists(db).await?;
            target_db.create(db, &self.cfg.db_user).await?;
            let bytes = source_db.dump_into(db, &target_db).await?;
            info!(db = %db, bytes, from = %source.name, to = %target.name, "database cloned");
        }
        Ok(())
    }
}
