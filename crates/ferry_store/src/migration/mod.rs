use sea_orm_migration::prelude::*;

mod m20260301_000001_import_job;
mod m20260412_000002_store_tuple;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_import_job::Migration),
            Box::new(m20260412_000002_store_tuple::Migration),
        ]
    }
}
