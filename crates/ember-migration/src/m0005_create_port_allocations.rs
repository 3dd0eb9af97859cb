use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PortAllocations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PortAllocations::ServerId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PortAllocations::MachineId).uuid().not_null())
                    .col(ColumnDef::new(PortAllocations::Ports).json_binary().not_null())
                    .col(
                        ColumnDef::new(PortAllocations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // The composite primary key is what makes overlapping allocations on
        // one machine impossible, even across control-plane replicas.
        manager
            .create_table(
                Table::create()
                    .table(AllocatedPorts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(AllocatedPorts::MachineId).uuid().not_null())
                    .col(ColumnDef::new(AllocatedPorts::Port).integer().not_null())
                    .col(ColumnDef::new(AllocatedPorts::ServerId).uuid().not_null())
                    .col(ColumnDef::new(AllocatedPorts::Role).string().not_null())
                    .primary_key(
                        Index::create()
                            .col(AllocatedPorts::MachineId)
                            .col(AllocatedPorts::Port),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_allocated_ports_server_id")
                    .table(AllocatedPorts::Table)
                    .col(AllocatedPorts::ServerId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AllocatedPorts::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(PortAllocations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PortAllocations {
    Table,
    ServerId,
    MachineId,
    Ports,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AllocatedPorts {
    Table,
    MachineId,
    Port,
    ServerId,
    Role,
}
