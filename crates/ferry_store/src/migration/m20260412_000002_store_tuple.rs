use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::StoreTuple;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        manager
            .create_table(
                Table::create()
                    .table(StoreTuple::Table)
                    .if_not_exists()
                    .col(key_col(backend, StoreTuple::StoreId))
                    .col(key_col(backend, StoreTuple::Object))
                    .col(key_col(backend, StoreTuple::Relation))
                    .col(key_col(backend, StoreTuple::Subject))
                    .col(ColumnDef::new(StoreTuple::Condition).text())
                    .col(ColumnDef::new(StoreTuple::WrittenAt).big_integer().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_store_tuple")
                            .col(StoreTuple::StoreId)
                            .col(StoreTuple::Object)
                            .col(StoreTuple::Relation)
                            .col(StoreTuple::Subject),
                    )
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StoreTuple::Table).to_owned())
            .await?;
        Ok(())
    }
}

// MySQL caps composite index keys at 3072 bytes.
fn key_col(backend: DatabaseBackend, col: impl Iden + 'static) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::MySql => {
            col_def.string_len(190);
        }
        _ => {
            col_def.string();
        }
    }
    col_def.not_null();
    col_def.to_owned()
}
