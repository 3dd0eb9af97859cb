use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Agents::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Agents::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Agents::MachineId).uuid().not_null())
                    .col(
                        ColumnDef::new(Agents::Status)
                            .string()
                            .not_null()
                            .default("OFFLINE"),
                    )
                    .col(
                        ColumnDef::new(Agents::LastHeartbeat)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Agents::Capabilities).json_binary().not_null())
                    .col(ColumnDef::new(Agents::Version).string().null())
                    .col(ColumnDef::new(Agents::LastError).text().null())
                    .col(
                        ColumnDef::new(Agents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_agents_machine")
                            .from(Agents::Table, Agents::MachineId)
                            .to(Machines::Table, Machines::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_agents_machine_id")
                    .table(Agents::Table)
                    .col(Agents::MachineId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Agents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Agents {
    Table,
    Id,
    MachineId,
    Status,
    LastHeartbeat,
    Capabilities,
    Version,
    LastError,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Machines {
    Table,
    Id,
}
