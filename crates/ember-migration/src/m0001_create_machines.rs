use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Machines::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Machines::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Machines::Name).string().not_null())
                    .col(ColumnDef::new(Machines::Address).string().not_null())
                    .col(
                        ColumnDef::new(Machines::SshPort)
                            .integer()
                            .not_null()
                            .default(22),
                    )
                    .col(ColumnDef::new(Machines::SshUser).string().not_null())
                    .col(ColumnDef::new(Machines::SshKeyRef).string().not_null())
                    .col(
                        ColumnDef::new(Machines::Status)
                            .string()
                            .not_null()
                            .default("OFFLINE"),
                    )
                    .col(
                        ColumnDef::new(Machines::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Machines::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .index(
                        Index::create()
                            .name("idx_machines_name_unique")
                            .table(Machines::Table)
                            .col(Machines::Name)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Machines::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Machines {
    Table,
    Id,
    Name,
    Address,
    SshPort,
    SshUser,
    SshKeyRef,
    Status,
    CreatedAt,
    UpdatedAt,
}
