use sea_orm_migration::prelude::*;

mod m0001_create_machines;
mod m0002_create_agents;
mod m0003_create_servers;
mod m0004_create_tasks;
mod m0005_create_port_allocations;
mod m0006_create_install_progress;
mod m0007_create_cluster_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_machines::Migration),
            Box::new(m0002_create_agents::Migration),
            Box::new(m0003_create_servers::Migration),
            Box::new(m0004_create_tasks::Migration),
            Box::new(m0005_create_port_allocations::Migration),
            Box::new(m0006_create_install_progress::Migration),
            Box::new(m0007_create_cluster_tables::Migration),
        ]
    }
}
