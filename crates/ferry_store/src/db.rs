use sea_orm::sea_query::{
    self, MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter, SqliteQueryBuilder,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, ExecResult, QueryResult, Statement};
use sea_orm_migration::prelude::Iden;

use ferry_core::FerryResult;

#[derive(Iden, Clone, Copy)]
pub enum ImportJob {
    Table,
    RowId,
    BulkJobId,
    StoreId,
    InsertedAt,
    ImportedAt,
    Subject,
    Relation,
    Object,
    Condition,
    Status,
    Reason,
    LeaseExpiresAt,
}

#[derive(Iden, Clone, Copy)]
pub enum StoreTuple {
    Table,
    StoreId,
    Subject,
    Relation,
    Object,
    Condition,
    WrittenAt,
}

pub(crate) fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        #[allow(unreachable_patterns)]
        _ => stmt.build(SqliteQueryBuilder),
    }
}

pub(crate) async fn exec<C, S>(conn: &C, stmt: &S) -> FerryResult<ExecResult>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result)
}

pub(crate) async fn query_all<C, S>(conn: &C, stmt: &S) -> FerryResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

pub(crate) async fn query_one<C, S>(conn: &C, stmt: &S) -> FerryResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}
