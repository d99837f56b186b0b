//! Runs against a live database only when `PULSE_TEST_DATABASE_URL` is set.

use pulse_core::{KeySet, Row, TableName, Value};
use pulse_storage::{PgWarehouse, UpsertOutcome, Warehouse};
use sqlx::{Connection, PgConnection};
use uuid::Uuid;

fn database_url() -> Option<String> {
    std::env::var("PULSE_TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

struct ScratchTable {
    admin: PgConnection,
    name: String,
}

impl ScratchTable {
    async fn create(url: &str) -> Self {
        let mut admin = PgConnection::connect(url).await.expect("admin connect");
        let name = format!("d_it_{}", Uuid::new_v4().simple());
        sqlx::query(&format!(
            "CREATE TABLE {name} (\
                item_id integer GENERATED BY DEFAULT AS IDENTITY (START WITH 0 MINVALUE -1) PRIMARY KEY, \
                label text UNIQUE, \
                hits integer, \
                total_views double precision, \
                code varchar(5) UNIQUE, \
                seen_on date)"
        ))
        .execute(&mut admin)
        .await
        .expect("create table");
        Self { admin, name }
    }

    fn table(&self) -> TableName {
        TableName::parse(&self.name).expect("table name")
    }

    async fn drop(mut self) {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.name))
            .execute(&mut self.admin)
            .await
            .expect("drop table");
    }
}

#[tokio::test]
async fn upsert_is_idempotent_and_casts_text_parameters() {
    let Some(url) = database_url() else {
        eprintln!("PULSE_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let scratch = ScratchTable::create(&url).await;
    let table = scratch.table();
    let keys = KeySet::new(["label"]).expect("keys");
    let mut wh = PgWarehouse::connect(&url).await.expect("connect");

    let first = Row::new().with("label", "a").with("hits", "3").with("seen_on", "2026-10-18");
    let second = Row::new().with("label", "a").with("hits", 5).with("seen_on", Value::Null);

    assert_eq!(wh.upsert(&table, &first, &keys).await.expect("insert"), UpsertOutcome::Inserted);
    assert_eq!(wh.upsert(&table, &second, &keys).await.expect("update"), UpsertOutcome::Updated);
    assert_eq!(wh.upsert(&table, &second, &keys).await.expect("again"), UpsertOutcome::Updated);

    let stored = wh.query(&table, &Row::new().with("label", "a")).await.expect("query");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get("hits"), Some(&Value::Int(5)));
    assert_eq!(stored[0].get("seen_on"), Some(&Value::Null));

    let err = wh
        .upsert(&table, &Row::new().with("label", "b").with("nope", 1), &keys)
        .await
        .expect_err("unknown column");
    assert!(err.is_validation());

    wh.close().await.expect("close");
    scratch.drop().await;
}

#[tokio::test]
async fn value_kinds_may_change_between_rows_of_one_column() {
    let Some(url) = database_url() else {
        eprintln!("PULSE_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let scratch = ScratchTable::create(&url).await;
    let table = scratch.table();
    let keys = KeySet::new(["label"]).expect("keys");
    let mut wh = PgWarehouse::connect(&url).await.expect("connect");

    let rows = [
        Row::new().with("label", "v1").with("total_views", 1.5).with("hits", Value::Null),
        Row::new().with("label", "v2").with("total_views", 5).with("hits", 7),
        Row::new().with("label", "v3").with("total_views", "1200").with("hits", "8"),
        Row::new().with("label", "v4").with("total_views", Value::Null).with("hits", 9),
    ];
    for row in &rows {
        assert_eq!(wh.upsert(&table, row, &keys).await.expect("upsert"), UpsertOutcome::Inserted);
    }

    let v1 = stored(&mut wh, &table, "v1").await;
    assert_eq!(v1.get("total_views").and_then(Value::as_f64), Some(1.5));
    assert_eq!(v1.get("hits"), Some(&Value::Null));
    let v2 = stored(&mut wh, &table, "v2").await;
    assert_eq!(v2.get("total_views").and_then(Value::as_f64), Some(5.0));
    assert_eq!(v2.get("hits"), Some(&Value::Int(7)));
    let v3 = stored(&mut wh, &table, "v3").await;
    assert_eq!(v3.get("total_views").and_then(Value::as_f64), Some(1200.0));
    assert_eq!(v3.get("hits"), Some(&Value::Int(8)));
    let v4 = stored(&mut wh, &table, "v4").await;
    assert_eq!(v4.get("total_views"), Some(&Value::Null));
    assert_eq!(v4.get("hits"), Some(&Value::Int(9)));

    wh.close().await.expect("close");
    scratch.drop().await;
}

#[tokio::test]
async fn over_length_keys_are_rejected_not_truncated() {
    let Some(url) = database_url() else {
        eprintln!("PULSE_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let scratch = ScratchTable::create(&url).await;
    let table = scratch.table();
    let keys = KeySet::new(["code"]).expect("keys");
    let mut wh = PgWarehouse::connect(&url).await.expect("connect");

    let first = Row::new().with("code", "Home-A").with("hits", 1);
    let second = Row::new().with("code", "Home-B").with("hits", 2);
    let err = wh.upsert(&table, &first, &keys).await.expect_err("too long");
    assert!(!err.is_validation());
    assert!(wh.upsert(&table, &second, &keys).await.is_err());
    assert_eq!(
        wh.upsert(&table, &Row::new().with("code", "Home").with("hits", 3), &keys)
            .await
            .expect("fits"),
        UpsertOutcome::Inserted
    );

    let all = wh.query(&table, &Row::new()).await.expect("query");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].get("code").and_then(Value::as_text), Some("Home"));

    wh.close().await.expect("close");
    scratch.drop().await;
}

async fn stored(wh: &mut PgWarehouse, table: &TableName, label: &str) -> Row {
    let mut rows = wh
        .query(table, &Row::new().with("label", label))
        .await
        .expect("query");
    assert_eq!(rows.len(), 1, "one row labelled {label}");
    rows.remove(0)
}

#[tokio::test]
async fn reset_leaves_sentinel_and_restarts_identity() {
    let Some(url) = database_url() else {
        eprintln!("PULSE_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let scratch = ScratchTable::create(&url).await;
    let table = scratch.table();
    let mut wh = PgWarehouse::connect(&url).await.expect("connect");
    for label in ["x", "y", "z"] {
        wh.insert(&table, &Row::new().with("label", label)).await.expect("seed");
    }

    wh.reset_table(&table, Some("item_id")).await.expect("reset");
    wh.insert(&table, &Row::new().with("label", "fresh")).await.expect("insert");

    let rows = wh.query(&table, &Row::new()).await.expect("query");
    let mut ids: Vec<_> = rows.iter().filter_map(|r| r.get("item_id").and_then(Value::as_i64)).collect();
    ids.sort_unstable();
    assert_eq!(ids, [-1, 0]);

    assert_eq!(wh.delete(&table, &Row::new().with("label", "fresh")).await.expect("delete"), 1);

    wh.close().await.expect("close");
    scratch.drop().await;
}
