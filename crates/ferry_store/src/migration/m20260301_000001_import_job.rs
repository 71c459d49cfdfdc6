use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::ImportJob;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(ImportJob::Table)
                    .if_not_exists()
                    .col(row_id_col(backend))
                    .col(ColumnDef::new(ImportJob::BulkJobId).string_len(26).not_null())
                    .col(ColumnDef::new(ImportJob::StoreId).string().not_null())
                    .col(ColumnDef::new(ImportJob::InsertedAt).big_integer().not_null())
                    .col(ColumnDef::new(ImportJob::ImportedAt).big_integer())
                    .col(ColumnDef::new(ImportJob::Subject).string().not_null())
                    .col(ColumnDef::new(ImportJob::Relation).string().not_null())
                    .col(ColumnDef::new(ImportJob::Object).string().not_null())
                    .col(ColumnDef::new(ImportJob::Condition).text())
                    .col(ColumnDef::new(ImportJob::Status).integer().not_null())
                    .col(ColumnDef::new(ImportJob::Reason).text())
                    .col(ColumnDef::new(ImportJob::LeaseExpiresAt).big_integer())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_import_job_job_status")
                    .table(ImportJob::Table)
                    .col(ImportJob::BulkJobId)
                    .col(ImportJob::Status)
                    .col(ImportJob::RowId)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ImportJob::Table).to_owned())
            .await?;
        Ok(())
    }
}

// SQLite only autoincrements an INTEGER PRIMARY KEY.
fn row_id_col(backend: DatabaseBackend) -> ColumnDef {
    let mut col_def = ColumnDef::new(ImportJob::RowId);
    match backend {
        DatabaseBackend::Sqlite => {
            col_def.integer();
        }
        _ => {
            col_def.big_integer();
        }
    }
    col_def.not_null().auto_increment().primary_key();
    col_def.to_owned()
}
