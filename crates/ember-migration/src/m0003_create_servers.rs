use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Servers::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Servers::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Servers::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(Servers::Name).string().not_null())
                    .col(ColumnDef::new(Servers::Game).string().not_null())
                    .col(
                        ColumnDef::new(Servers::Status)
                            .string()
                            .not_null()
                            .default("OFFLINE"),
                    )
                    .col(
                        ColumnDef::new(Servers::InstallState)
                            .string()
                            .not_null()
                            .default("NOT_INSTALLED"),
                    )
                    .col(ColumnDef::new(Servers::MachineId).uuid().not_null())
                    .col(ColumnDef::new(Servers::AgentId).uuid().null())
                    .col(ColumnDef::new(Servers::ClusterId).uuid().null())
                    .col(ColumnDef::new(Servers::Port).integer().null())
                    .col(ColumnDef::new(Servers::MaxPlayers).integer().not_null())
                    .col(ColumnDef::new(Servers::Configuration).json_binary().not_null())
                    .col(
                        ColumnDef::new(Servers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Servers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_servers_machine")
                            .from(Servers::Table, Servers::MachineId)
                            .to(Machines::Table, Machines::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_servers_cluster_id")
                    .table(Servers::Table)
                    .col(Servers::ClusterId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Servers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Servers {
    Table,
    Id,
    OwnerId,
    Name,
    Game,
    Status,
    InstallState,
    MachineId,
    AgentId,
    ClusterId,
    Port,
    MaxPlayers,
    Configuration,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Machines {
    Table,
    Id,
}
