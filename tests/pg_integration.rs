//! Integration tests against a live PostgreSQL server.
//!
//! Run: `SQLTAG_DATABASE_URL=postgres://postgres@localhost/sqltag_test \
//!       cargo test --test pg_integration -- --ignored --test-threads=1`

use sqltag::prelude::*;

const PEERS: [(&str, &str); 4] = [
    ("Mickey Mouse", "mickey@disney.com"),
    ("Donald Duck", "donald@disney.com"),
    ("Foo Bar", "foo@bar.com"),
    ("Double Trouble", "foo@bar.com"),
];

async fn connect() -> SqlTagResult<Db> {
    let config = DbConfig {
        database_url: std::env::var("SQLTAG_DATABASE_URL").ok(),
        sql_path: Some(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/sql/glob").into()),
        ..DbConfig::default()
    };
    init_db(&config).await
}

#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_peers_roundtrip() -> SqlTagResult<()> {
    let db = connect().await?;
    assert!(db.has_queries().await);

    let mut tx = db.begin().await?;
    tx.exec("create-peers-table", &[]).await?;
    for (name, email) in PEERS {
        tx.exec("create-peer", &[name.into(), email.into()]).await?;
    }
    tx.commit().await?;

    let rows = db.query("find-peers-by-email", &["foo@bar.com".into()]).await?;
    assert_eq!(rows.len(), 2);

    db.prepare("find-one-peer-by-email").await?;
    let row = db
        .query_row("find-one-peer-by-email", &["mickey@disney.com".into()])
        .await?;
    assert_eq!(row["name"], serde_json::json!("Mickey Mouse"));

    let mut batch = db.batch();
    batch
        .queue("rename-peer", vec!["foo@bar.com".into(), "Renamed".into()])
        .await?;
    batch
        .queue("find-peers-by-email", vec!["foo@bar.com".into()])
        .await?;
    batch
        .queue("find-one-peer-by-email", vec!["donald@disney.com".into()])
        .await?;
    let results = batch.send().await?;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].rows_affected(), 2);
    assert!(results[0].rows().is_empty());
    assert_eq!(results[1].rows().len(), 2);
    assert!(results[1].rows().iter().all(|row| row["name"] == "Renamed"));
    assert_eq!(results[2].row()?["name"], serde_json::json!("Donald Duck"));

    let mut tx = db.begin().await?;
    let handle = tx.prepare("create-peer").await?;
    assert_eq!(db.sql("create-peer").await?, handle.name());
    assert_eq!(tx.exec("create-peer", &["Minnie Mouse".into(), "minnie@disney.com".into()]).await?, 1);
    let mut batch = tx.batch();
    batch
        .queue("find-one-peer-by-email", vec!["minnie@disney.com".into()])
        .await?;
    let results = tx.send_batch(batch).await?;
    assert_eq!(results[0].row()?["name"], serde_json::json!("Minnie Mouse"));
    tx.rollback().await?;

    db.exec("drop-peers-table", &[]).await?;
    db.close().await;
    db.close().await;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_prepare_all_reports_bad_sql() -> SqlTagResult<()> {
    let db = connect().await?;
    db.load_sql("-- name: broken\nselect from where;\n".as_bytes()).await?;

    match db.prepare_all().await {
        Err(SqlTagError::Prepare { name, .. }) => assert!(name.contains("broken")),
        other => panic!("expected Prepare error, got {:?}", other.map(|h| h.len())),
    }
    db.close().await;
    Ok(())
}
