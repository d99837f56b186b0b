//! PostgreSQL warehouse: catalog-typed statement builders and a single-connection executor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pulse_core::{quote_ident, validate_identifier, KeySet, Row, TableName, ValidationError, Value};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::{Arguments, Connection};
use tracing::debug;

use crate::warehouse::{
    normalize_text, sentinel_row, validate_row, UpsertOutcome, Warehouse, WarehouseError,
};

/// Column name -> base SQL type as rendered by `format_type` without its modifier, e.g.
/// `character varying`. Length limits are left to the assignment, which rejects overflow.
pub type ColumnTypes = HashMap<String, String>;

/// SQL text plus its positional parameters (`$1` is `params[0]`).
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Postgres type a [`Value`] is sent as; must agree with [`bind_params`].
fn wire_type(value: &Value) -> &'static str {
    match value {
        Value::Null | Value::Text(_) => "text",
        Value::Int(_) => "int8",
        Value::Float(_) => "float8",
        Value::Timestamp(_) => "timestamptz",
    }
}

fn casts_from_number(ty: &str) -> bool {
    matches!(
        ty,
        "smallint" | "integer" | "bigint" | "real" | "double precision" | "numeric" | "money"
            | "text" | "character varying" | "character" | "bpchar"
    )
}

struct Binder<'a> {
    table: &'a TableName,
    types: &'a ColumnTypes,
    params: Vec<Value>,
}

impl<'a> Binder<'a> {
    fn new(table: &'a TableName, types: &'a ColumnTypes) -> Self {
        Self {
            table,
            types,
            params: Vec::new(),
        }
    }

    /// Pushes `value` and returns a placeholder cast to the column's base type.
    ///
    /// The inner cast pins the wire type of the parameter to the bound value's kind, so
    /// rows of one job whose values differ in kind never share a prepared statement.
    fn bind(&mut self, column: &str, value: &Value) -> Result<String, ValidationError> {
        validate_identifier(column)?;
        let ty = self
            .types
            .get(column)
            .ok_or_else(|| ValidationError::UnknownColumn {
                table: self.table.to_string(),
                column: column.to_string(),
            })?;
        // Postgres only casts int8/float8 into numeric and string types; anything else
        // (boolean, date, jsonb) parses the number from its text form.
        let value = match value {
            Value::Int(i) if !casts_from_number(ty) => Value::Text(i.to_string()),
            Value::Float(f) if !casts_from_number(ty) => Value::Text(f.to_string()),
            other => other.clone(),
        };
        let placeholder = format!("CAST(${}::{} AS {ty})", self.params.len() + 1, wire_type(&value));
        self.params.push(value);
        Ok(placeholder)
    }

    /// `col = $n` predicates joined with AND; null values compare with IS NULL.
    fn predicate(&mut self, filter: &Row) -> Result<String, ValidationError> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (column, value) in filter.iter() {
            if value.is_null() {
                validate_identifier(column)?;
                clauses.push(format!("{} IS NULL", quote_ident(column)));
            } else {
                let placeholder = self.bind(column, value)?;
                clauses.push(format!("{} = {placeholder}", quote_ident(column)));
            }
        }
        Ok(clauses.join(" AND "))
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement {
            sql,
            params: self.params,
        }
    }
}

/// Builds the single-statement upsert. The result row is `(updated, inserted)` counts.
///
/// ```sql
/// WITH upsert AS (UPDATE t SET c = $1 WHERE k = $2 RETURNING 1),
/// inserted AS (INSERT INTO t (k, c) SELECT $2, $1 WHERE NOT EXISTS (SELECT 1 FROM upsert) RETURNING 1)
/// SELECT (SELECT count(*) FROM upsert), (SELECT count(*) FROM inserted)
/// ```
pub fn build_upsert(
    table: &TableName,
    row: &Row,
    keys: &KeySet,
    types: &ColumnTypes,
) -> Result<SqlStatement, ValidationError> {
    row.ensure_keys(keys)?;
    validate_row(row)?;

    let mut binder = Binder::new(table, types);
    let mut placeholders = HashMap::with_capacity(row.len());
    for (column, value) in row.iter() {
        placeholders.insert(column, binder.bind(column, value)?);
    }

    let target = table.quoted();
    let where_clause = keys
        .iter()
        .map(|key| match row.get(key) {
            Some(Value::Null) => format!("{} IS NULL", quote_ident(key)),
            _ => format!("{} = {}", quote_ident(key), placeholders[key]),
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let columns = row.column_names().map(quote_ident).collect::<Vec<_>>().join(", ");
    let values = row
        .column_names()
        .map(|c| placeholders[c].as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let assignments = row
        .column_names()
        .filter(|c| !keys.contains(c))
        .map(|c| format!("{} = {}", quote_ident(c), placeholders[c]))
        .collect::<Vec<_>>();

    let sql = if assignments.is_empty() {
        // Every column is a key: nothing to update, insert only when absent.
        format!(
            "WITH inserted AS (INSERT INTO {target} ({columns}) SELECT {values} \
             WHERE NOT EXISTS (SELECT 1 FROM {target} WHERE {where_clause}) RETURNING 1) \
             SELECT 0::bigint AS updated, (SELECT count(*) FROM inserted) AS inserted"
        )
    } else {
        format!(
            "WITH upsert AS (UPDATE {target} SET {} WHERE {where_clause} RETURNING 1), \
             inserted AS (INSERT INTO {target} ({columns}) SELECT {values} \
             WHERE NOT EXISTS (SELECT 1 FROM upsert) RETURNING 1) \
             SELECT (SELECT count(*) FROM upsert) AS updated, (SELECT count(*) FROM inserted) AS inserted",
            assignments.join(", ")
        )
    };
    Ok(binder.finish(sql))
}

pub fn build_insert(
    table: &TableName,
    row: &Row,
    types: &ColumnTypes,
) -> Result<SqlStatement, ValidationError> {
    validate_row(row)?;
    let mut binder = Binder::new(table, types);
    let mut values = Vec::with_capacity(row.len());
    for (column, value) in row.iter() {
        values.push(binder.bind(column, value)?);
    }
    let columns = row.column_names().map(quote_ident).collect::<Vec<_>>().join(", ");
    let sql = format!(
        "INSERT INTO {} ({columns}) VALUES ({})",
        table.quoted(),
        values.join(", ")
    );
    Ok(binder.finish(sql))
}

pub fn build_delete(
    table: &TableName,
    filter: &Row,
    types: &ColumnTypes,
) -> Result<SqlStatement, ValidationError> {
    validate_row(filter)?;
    let mut binder = Binder::new(table, types);
    let predicate = binder.predicate(filter)?;
    let sql = format!("DELETE FROM {} WHERE {predicate}", table.quoted());
    Ok(binder.finish(sql))
}

/// Selects matching records as `jsonb` so every column type decodes into a [`Value`].
pub fn build_query(
    table: &TableName,
    filter: &Row,
    types: &ColumnTypes,
) -> Result<SqlStatement, ValidationError> {
    let mut binder = Binder::new(table, types);
    let mut sql = format!("SELECT to_jsonb(src) AS doc FROM {} AS src", table.quoted());
    if !filter.is_empty() {
        let predicate = binder.predicate(filter)?;
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
    }
    Ok(binder.finish(sql))
}

fn statement_error(table: &TableName, source: sqlx::Error) -> WarehouseError {
    WarehouseError::Statement {
        table: table.to_string(),
        source,
    }
}

fn bind_params(table: &TableName, params: &[Value]) -> Result<PgArguments, WarehouseError> {
    let mut args = PgArguments::default();
    for value in params {
        let added = match value {
            Value::Null => args.add(Option::<String>::None),
            Value::Text(text) => args.add(normalize_text(text).into_owned()),
            Value::Int(i) => args.add(*i),
            Value::Float(f) => args.add(*f),
            Value::Timestamp(ts) => args.add(*ts),
        };
        added.map_err(|err| statement_error(table, sqlx::Error::Encode(err)))?;
    }
    Ok(args)
}

async fn execute(
    conn: &mut PgConnection,
    table: &TableName,
    statement: &SqlStatement,
) -> Result<u64, WarehouseError> {
    let args = bind_params(table, &statement.params)?;
    let result = sqlx::query_with(&statement.sql, args)
        .execute(conn)
        .await
        .map_err(|err| statement_error(table, err))?;
    Ok(result.rows_affected())
}

/// One connection per load job. Every mutating call commits its own transaction;
/// an error drops the transaction, which rolls it back.
pub struct PgWarehouse {
    conn: PgConnection,
    column_types: HashMap<TableName, Arc<ColumnTypes>>,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(WarehouseError::Connect)?;
        Ok(Self {
            conn,
            column_types: HashMap::new(),
        })
    }

    pub async fn close(self) -> Result<(), WarehouseError> {
        self.conn.close().await.map_err(WarehouseError::Connect)
    }

    /// Reads (once per table) the declared type of every column.
    async fn column_types(&mut self, table: &TableName) -> Result<Arc<ColumnTypes>, WarehouseError> {
        if let Some(types) = self.column_types.get(table) {
            return Ok(Arc::clone(types));
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT a.attname::text, format_type(a.atttypid, NULL) \
             FROM pg_attribute a \
             WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped",
        )
        .bind(table.quoted())
        .fetch_all(&mut self.conn)
        .await
        .map_err(|err| statement_error(table, err))?;

        if rows.is_empty() {
            return Err(ValidationError::UnknownTable(table.to_string()).into());
        }
        let types = Arc::new(rows.into_iter().collect::<ColumnTypes>());
        debug!(%table, columns = types.len(), "loaded column types");
        self.column_types.insert(table.clone(), Arc::clone(&types));
        Ok(types)
    }

    async fn sequence_for(
        conn: &mut PgConnection,
        table: &TableName,
        key_column: &str,
    ) -> Result<Option<String>, WarehouseError> {
        sqlx::query_scalar::<_, Option<String>>("SELECT pg_get_serial_sequence($1, $2)")
            .bind(table.quoted())
            .bind(key_column)
            .fetch_one(conn)
            .await
            .map_err(|err| statement_error(table, err))
    }

    async fn restart_sequence(
        conn: &mut PgConnection,
        table: &TableName,
        key_column: &str,
    ) -> Result<(), WarehouseError> {
        validate_identifier(key_column)?;
        match Self::sequence_for(conn, table, key_column).await? {
            Some(sequence) => {
                // pg_get_serial_sequence returns an already-quoted qualified name.
                sqlx::query(&format!("ALTER SEQUENCE {sequence} RESTART"))
                    .execute(conn)
                    .await
                    .map_err(|err| statement_error(table, err))?;
            }
            None => debug!(%table, key_column, "column owns no sequence"),
        }
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn upsert(
        &mut self,
        table: &TableName,
        row: &Row,
        keys: &KeySet,
    ) -> Result<UpsertOutcome, WarehouseError> {
        row.ensure_keys(keys)?;
        let types = self.column_types(table).await?;
        let statement = build_upsert(table, row, keys, &types)?;
        let args = bind_params(table, &statement.params)?;

        let mut tx = self.conn.begin().await.map_err(|err| statement_error(table, err))?;
        let (_updated, inserted): (i64, i64) = sqlx::query_as_with(&statement.sql, args)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| statement_error(table, err))?;
        tx.commit().await.map_err(|err| statement_error(table, err))?;

        Ok(if inserted > 0 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn insert(&mut self, table: &TableName, row: &Row) -> Result<(), WarehouseError> {
        validate_row(row)?;
        let types = self.column_types(table).await?;
        let statement = build_insert(table, row, &types)?;

        let mut tx = self.conn.begin().await.map_err(|err| statement_error(table, err))?;
        execute(&mut tx, table, &statement).await?;
        tx.commit().await.map_err(|err| statement_error(table, err))
    }

    async fn truncate(&mut self, table: &TableName) -> Result<(), WarehouseError> {
        sqlx::query(&format!("TRUNCATE TABLE {}", table.quoted()))
            .execute(&mut self.conn)
            .await
            .map_err(|err| statement_error(table, err))?;
        Ok(())
    }

    async fn reset_sequence(
        &mut self,
        table: &TableName,
        key_column: &str,
    ) -> Result<(), WarehouseError> {
        Self::restart_sequence(&mut self.conn, table, key_column).await
    }

    async fn delete(&mut self, table: &TableName, filter: &Row) -> Result<u64, WarehouseError> {
        validate_row(filter)?;
        let types = self.column_types(table).await?;
        let statement = build_delete(table, filter, &types)?;

        let mut tx = self.conn.begin().await.map_err(|err| statement_error(table, err))?;
        let deleted = execute(&mut tx, table, &statement).await?;
        tx.commit().await.map_err(|err| statement_error(table, err))?;
        Ok(deleted)
    }

    async fn query(&mut self, table: &TableName, filter: &Row) -> Result<Vec<Row>, WarehouseError> {
        let types = self.column_types(table).await?;
        let statement = build_query(table, filter, &types)?;
        let args = bind_params(table, &statement.params)?;
        let docs: Vec<JsonValue> = sqlx::query_scalar_with(&statement.sql, args)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|err| statement_error(table, err))?;
        Ok(docs.iter().filter_map(Row::from_json_object).collect())
    }

    async fn close(self: Box<Self>) -> Result<(), WarehouseError> {
        PgWarehouse::close(*self).await
    }

    /// Truncate, sequence restart and sentinel insert commit together or not at all.
    async fn reset_table(
        &mut self,
        table: &TableName,
        sentinel_key: Option<&str>,
    ) -> Result<(), WarehouseError> {
        let sentinel = match sentinel_key {
            Some(key) => {
                validate_identifier(key)?;
                let types = self.column_types(table).await?;
                Some(build_insert(table, &sentinel_row(key), &types)?)
            }
            None => None,
        };

        let mut tx = self.conn.begin().await.map_err(|err| statement_error(table, err))?;
        sqlx::query(&format!("TRUNCATE TABLE {}", table.quoted()))
            .execute(&mut *tx)
            .await
            .map_err(|err| statement_error(table, err))?;
        if let (Some(key), Some(statement)) = (sentinel_key, sentinel.as_ref()) {
            Self::restart_sequence(&mut tx, table, key).await?;
            execute(&mut tx, table, statement).await?;
        }
        tx.commit().await.map_err(|err| statement_error(table, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(columns: &[(&str, &str)]) -> ColumnTypes {
        columns
            .iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect()
    }

    fn follower_types() -> ColumnTypes {
        types(&[
            ("date_id", "integer"),
            ("total_followers", "integer"),
            ("followers", "integer"),
        ])
    }

    fn table() -> TableName {
        TableName::parse("lyf.f_twitter_daily").expect("table")
    }

    #[test]
    fn upsert_binds_each_column_once_with_declared_casts() {
        let row = Row::new()
            .with("date_id", 20261018)
            .with("total_followers", 120)
            .with("followers", 20);
        let keys = KeySet::new(["date_id"]).expect("keys");
        let stmt = build_upsert(&table(), &row, &keys, &follower_types()).expect("statement");

        assert_eq!(stmt.params, vec![Value::Int(20261018), Value::Int(120), Value::Int(20)]);
        assert_eq!(
            stmt.sql,
            "WITH upsert AS (UPDATE \"lyf\".\"f_twitter_daily\" SET \
             \"total_followers\" = CAST($2::int8 AS integer), \"followers\" = CAST($3::int8 AS integer) \
             WHERE \"date_id\" = CAST($1::int8 AS integer) RETURNING 1), \
             inserted AS (INSERT INTO \"lyf\".\"f_twitter_daily\" (\"date_id\", \"total_followers\", \"followers\") \
             SELECT CAST($1::int8 AS integer), CAST($2::int8 AS integer), CAST($3::int8 AS integer) \
             WHERE NOT EXISTS (SELECT 1 FROM upsert) RETURNING 1) \
             SELECT (SELECT count(*) FROM upsert) AS updated, (SELECT count(*) FROM inserted) AS inserted"
        );
    }

    #[test]
    fn placeholders_follow_the_kind_of_each_bound_value() {
        let keys = KeySet::new(["date_id"]).expect("keys");
        let types = types(&[("date_id", "integer"), ("total_views", "double precision")]);
        let sql_for = |views: Value| {
            let row = Row::new().with("date_id", 20261018).with("total_views", views);
            build_upsert(&table(), &row, &keys, &types).expect("statement").sql
        };

        let float = sql_for(Value::Float(1.5));
        let int = sql_for(Value::Int(5));
        let text = sql_for(Value::from("1200"));
        let null = sql_for(Value::Null);

        assert!(float.contains("CAST($2::float8 AS double precision)"));
        assert!(int.contains("CAST($2::int8 AS double precision)"));
        assert!(text.contains("CAST($2::text AS double precision)"));
        assert!(null.contains("CAST($2::text AS double precision)"));
        assert_ne!(float, int);
        assert_ne!(int, text);
    }

    #[test]
    fn numbers_bound_to_non_numeric_columns_travel_as_text() {
        let types = types(&[("active", "boolean"), ("day", "date")]);
        let row = Row::new().with("active", 1).with("day", 20261018);
        let stmt = build_insert(&TableName::parse("d_yt_channel").expect("t"), &row, &types)
            .expect("insert");

        assert_eq!(
            stmt.sql,
            "INSERT INTO \"d_yt_channel\" (\"active\", \"day\") VALUES (CAST($1::text AS boolean), CAST($2::text AS date))"
        );
        assert_eq!(stmt.params, vec![Value::from("1"), Value::from("20261018")]);
    }

    #[test]
    fn all_key_rows_degenerate_to_guarded_insert() {
        let row = Row::new().with("source", "google").with("medium", "organic");
        let keys = KeySet::new(["source", "medium"]).expect("keys");
        let types = types(&[("source", "text"), ("medium", "text")]);
        let stmt = build_upsert(&TableName::parse("d_ga_source").expect("t"), &row, &keys, &types)
            .expect("statement");

        assert!(stmt.sql.starts_with("WITH inserted AS (INSERT INTO \"d_ga_source\""));
        assert!(stmt.sql.contains(
            "WHERE NOT EXISTS (SELECT 1 FROM \"d_ga_source\" WHERE \"source\" = CAST($1::text AS text) AND \"medium\" = CAST($2::text AS text))"
        ));
        assert!(!stmt.sql.contains("UPDATE"));
    }

    #[test]
    fn missing_key_fails_before_any_sql() {
        let row = Row::new().with("name", "x");
        let keys = KeySet::new(["id"]).expect("keys");
        let err = build_upsert(&table(), &row, &keys, &ColumnTypes::new()).expect_err("invalid");
        assert_eq!(err, ValidationError::MissingKeyColumn("id".into()));
    }

    #[test]
    fn columns_absent_from_table_are_rejected() {
        let row = Row::new().with("date_id", 1).with("retweets", 4);
        let keys = KeySet::new(["date_id"]).expect("keys");
        let err = build_upsert(&table(), &row, &keys, &follower_types()).expect_err("unknown");
        assert!(matches!(err, ValidationError::UnknownColumn { ref column, .. } if column == "retweets"));
    }

    #[test]
    fn null_keys_match_with_is_null() {
        let row = Row::new().with("date_id", Value::Null).with("followers", 1);
        let keys = KeySet::new(["date_id"]).expect("keys");
        let stmt = build_upsert(&table(), &row, &keys, &follower_types()).expect("statement");
        assert!(stmt.sql.contains("WHERE \"date_id\" IS NULL RETURNING 1"));
    }

    #[test]
    fn query_and_delete_filter_on_every_column() {
        let filter = Row::new().with("date_id", 20261017);
        let query = build_query(&table(), &filter, &follower_types()).expect("query");
        assert_eq!(
            query.sql,
            "SELECT to_jsonb(src) AS doc FROM \"lyf\".\"f_twitter_daily\" AS src WHERE \"date_id\" = CAST($1::int8 AS integer)"
        );
        let all = build_query(&table(), &Row::new(), &follower_types()).expect("query");
        assert!(!all.sql.contains("WHERE"));

        let delete = build_delete(&table(), &filter, &follower_types()).expect("delete");
        assert_eq!(
            delete.sql,
            "DELETE FROM \"lyf\".\"f_twitter_daily\" WHERE \"date_id\" = CAST($1::int8 AS integer)"
        );
        assert!(build_delete(&table(), &Row::new(), &follower_types()).is_err());
    }

    #[test]
    fn insert_lists_columns_in_row_order() {
        let row = Row::new().with("source_id", -1);
        let types = types(&[("source_id", "integer"), ("source", "text")]);
        let stmt = build_insert(&TableName::parse("d_ga_source").expect("t"), &row, &types)
            .expect("insert");
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"d_ga_source\" (\"source_id\") VALUES (CAST($1::int8 AS integer))"
        );
        assert_eq!(stmt.params, vec![Value::Int(-1)]);
    }
}
