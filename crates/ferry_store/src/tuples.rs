use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict, Order, Query};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};

use crate::db::{StoreTuple, col_name, exec, query_all};
use crate::ledger::WriteGate;
use ferry_core::{
    Condition, FerryError, FerryResult, Operation, Tuple, TupleError, TupleOutcome, TupleWriter,
    unix_millis,
};

/// Relationship tuples kept in the same database as the ledger.
///
/// Stands in for a remote authorization service: each tuple of a batch is
/// written or deleted independently and reports its own outcome.
#[derive(Clone)]
pub struct LocalTupleStore {
    conn: DatabaseConnection,
    write_gate: WriteGate,
    failpoints: Arc<HashSet<String>>,
}

impl LocalTupleStore {
    pub(crate) fn new(
        conn: DatabaseConnection,
        write_gate: WriteGate,
        failpoints: Arc<HashSet<String>>,
    ) -> Self {
        Self {
            conn,
            write_gate,
            failpoints,
        }
    }

    pub async fn list_tuples(&self, store_id: &str) -> FerryResult<Vec<Tuple>> {
        let select = Query::select()
            .from(StoreTuple::Table)
            .columns([
                StoreTuple::Subject,
                StoreTuple::Relation,
                StoreTuple::Object,
                StoreTuple::Condition,
            ])
            .and_where(Expr::col(StoreTuple::StoreId).eq(store_id))
            .order_by(StoreTuple::Object, Order::Asc)
            .order_by(StoreTuple::Relation, Order::Asc)
            .order_by(StoreTuple::Subject, Order::Asc)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let condition: Option<String> = row.try_get("", &col_name(StoreTuple::Condition))?;
            let condition = condition
                .map(|raw| {
                    serde_json::from_str::<Condition>(&raw)
                        .map_err(|err| FerryError::storage(format!("decode condition: {err}")))
                })
                .transpose()?;
            tuples.push(Tuple {
                user: row.try_get("", &col_name(StoreTuple::Subject))?,
                relation: row.try_get("", &col_name(StoreTuple::Relation))?,
                object: row.try_get("", &col_name(StoreTuple::Object))?,
                condition,
            });
        }
        Ok(tuples)
    }

    async fn write_one(
        &self,
        tx: &DatabaseTransaction,
        store_id: &str,
        tuple: &Tuple,
        now: i64,
    ) -> FerryResult<Option<TupleError>> {
        if let Err(err) = tuple.validate() {
            return Ok(Some(TupleError::from(&err)));
        }
        let condition = tuple
            .condition
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| FerryError::storage(format!("encode condition: {err}")))?;
        let insert = Query::insert()
            .into_table(StoreTuple::Table)
            .columns([
                StoreTuple::StoreId,
                StoreTuple::Object,
                StoreTuple::Relation,
                StoreTuple::Subject,
                StoreTuple::Condition,
                StoreTuple::WrittenAt,
            ])
            .values_panic([
                store_id.into(),
                tuple.object.clone().into(),
                tuple.relation.clone().into(),
                tuple.user.clone().into(),
                condition.into(),
                now.into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    StoreTuple::StoreId,
                    StoreTuple::Object,
                    StoreTuple::Relation,
                    StoreTuple::Subject,
                ])
                .do_nothing()
                .to_owned(),
            )
            .to_owned();
        let result = exec(tx, &insert).await?;
        if result.rows_affected() == 0 {
            return Ok(Some(TupleError::new(
                "write_failed_due_to_invalid_input",
                format!("cannot write a tuple which already exists: {tuple}"),
            )));
        }
        Ok(None)
    }

    async fn delete_one(
        &self,
        tx: &DatabaseTransaction,
        store_id: &str,
        tuple: &Tuple,
    ) -> FerryResult<Option<TupleError>> {
        if let Err(err) = tuple.validate() {
            return Ok(Some(TupleError::from(&err)));
        }
        let delete = Query::delete()
            .from_table(StoreTuple::Table)
            .and_where(Expr::col(StoreTuple::StoreId).eq(store_id))
            .and_where(Expr::col(StoreTuple::Object).eq(tuple.object.as_str()))
            .and_where(Expr::col(StoreTuple::Relation).eq(tuple.relation.as_str()))
            .and_where(Expr::col(StoreTuple::Subject).eq(tuple.user.as_str()))
            .to_owned();
        let result = exec(tx, &delete).await?;
        if result.rows_affected() == 0 {
            return Ok(Some(TupleError::new(
                "write_failed_due_to_invalid_input",
                format!("cannot delete a tuple which does not exist: {tuple}"),
            )));
        }
        Ok(None)
    }
}

#[async_trait]
impl TupleWriter for LocalTupleStore {
    async fn write_batch(
        &self,
        store_id: &str,
        writes: &[Tuple],
        deletes: &[Tuple],
    ) -> FerryResult<Vec<TupleOutcome>> {
        if self.failpoints.contains("tuples.write_batch") {
            return Err(FerryError::transport("failpoint tuples.write_batch"));
        }
        if store_id.trim().is_empty() {
            return Err(FerryError::validation("store id is required"));
        }
        let _gate = self.write_gate.lock().await;
        let now = unix_millis();
        let tx = self.conn.begin().await?;
        let mut outcomes = Vec::with_capacity(writes.len() + deletes.len());
        for tuple in writes {
            let outcome = match self.write_one(&tx, store_id, tuple, now).await? {
                None => TupleOutcome::succeeded(tuple.clone(), Operation::Write),
                Some(error) => TupleOutcome::failed(tuple.clone(), Operation::Write, error),
            };
            outcomes.push(outcome);
        }
        for tuple in deletes {
            let outcome = match self.delete_one(&tx, store_id, tuple).await? {
                None => TupleOutcome::succeeded(tuple.clone(), Operation::Delete),
                Some(error) => TupleOutcome::failed(tuple.clone(), Operation::Delete, error),
            };
            outcomes.push(outcome);
        }
        tx.commit().await?;
        let failed = outcomes.iter().filter(|outcome| !outcome.is_success()).count();
        log::debug!(
            "tuples: store {store_id} applied {} writes and {} deletes, {failed} rejected",
            writes.len(),
            deletes.len()
        );
        Ok(outcomes)
    }
}
