use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InstallProgress::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstallProgress::ServerId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstallProgress::Status).string().not_null())
                    .col(ColumnDef::new(InstallProgress::Message).text().not_null())
                    .col(
                        ColumnDef::new(InstallProgress::Progress)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InstallProgress::CurrentStep)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InstallProgress::TotalSteps)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(InstallProgress::Error).text().null())
                    .col(
                        ColumnDef::new(InstallProgress::UpdatedAt)
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
                    .table(InstallLogLines::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InstallLogLines::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(InstallLogLines::ServerId).uuid().not_null())
                    .col(ColumnDef::new(InstallLogLines::Line).text().not_null())
                    .col(
                        ColumnDef::new(InstallLogLines::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_install_log_lines_server_id")
                    .table(InstallLogLines::Table)
                    .col(InstallLogLines::ServerId)
                    .col(InstallLogLines::Id)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InstallLogLines::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(InstallProgress::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InstallProgress {
    Table,
    ServerId,
    Status,
    Message,
    Progress,
    CurrentStep,
    TotalSteps,
    Error,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum InstallLogLines {
    Table,
    Id,
    ServerId,
    Line,
    CreatedAt,
}
