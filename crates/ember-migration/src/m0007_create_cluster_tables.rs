use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Clusters::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Clusters::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Clusters::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(Clusters::MachineId).uuid().not_null())
                    .col(ColumnDef::new(Clusters::Game).string().not_null())
                    .col(ColumnDef::new(Clusters::Name).string().not_null())
                    .col(
                        ColumnDef::new(Clusters::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CharacterTransfers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CharacterTransfers::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CharacterTransfers::ClusterId).uuid().not_null())
                    .col(
                        ColumnDef::new(CharacterTransfers::SourceServerId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CharacterTransfers::TargetServerId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CharacterTransfers::CharacterId)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CharacterTransfers::RequestedBy)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CharacterTransfers::ApprovedBy).uuid().null())
                    .col(ColumnDef::new(CharacterTransfers::Status).string().not_null())
                    .col(ColumnDef::new(CharacterTransfers::Error).text().null())
                    .col(
                        ColumnDef::new(CharacterTransfers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CharacterTransfers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(FailoverEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(FailoverEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(FailoverEvents::ClusterId).uuid().not_null())
                    .col(ColumnDef::new(FailoverEvents::FromServerId).uuid().not_null())
                    .col(ColumnDef::new(FailoverEvents::ToServerId).uuid().not_null())
                    .col(ColumnDef::new(FailoverEvents::Ports).json_binary().not_null())
                    .col(ColumnDef::new(FailoverEvents::Reason).text().not_null())
                    .col(
                        ColumnDef::new(FailoverEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FailoverEvents::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(CharacterTransfers::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Clusters::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Clusters {
    Table,
    Id,
    OwnerId,
    MachineId,
    Game,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
enum CharacterTransfers {
    Table,
    Id,
    ClusterId,
    SourceServerId,
    TargetServerId,
    CharacterId,
    RequestedBy,
    ApprovedBy,
    Status,
    Error,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum FailoverEvents {
    Table,
    Id,
    ClusterId,
    FromServerId,
    ToServerId,
    Ports,
    Reason,
    CreatedAt,
}
