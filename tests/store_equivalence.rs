//! The in-memory and SQLite document stores must agree on every query.
//!
//! Each test seeds both stores with the same documents and runs the same [DocQuery] against
//! each, comparing ids (and, where the answer is obvious, the expected ids).
#![cfg(feature = "service")]

mod common;

use jobsite_core::{
    db::DbConnection,
    diff::Patch,
    event::StoreEvent,
    properties::DocId,
    store::{DocQuery, DocumentStore, FieldFilter, FilterOp, MemoryStore},
};
use serde_json::{json, Value};
use tempfile::TempDir;
use test_log::test;

const JOBS: &str = "jobs";

fn id(raw: &str) -> DocId {
    DocId::try_from(raw).unwrap()
}

fn seed_docs() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        (
            JOBS,
            "a",
            json!({"name": "Alpha", "total": 1500, "status": "open",
                   "tags": ["electrical", "rough"], "client": {"city": "Austin"}, "rush": true}),
        ),
        (
            JOBS,
            "b",
            json!({"name": "Bravo", "total": 250.5, "status": "sent", "tags": ["plumbing"],
                   "client": {"city": "Dallas"}, "archivedAt": null, "rush": false}),
        ),
        (
            JOBS,
            "c",
            json!({"name": "Charlie", "total": "900", "status": "open", "tags": [],
                   "client": {"city": "Austin"}, "archivedAt": 123}),
        ),
        (
            JOBS,
            "d",
            json!({"name": "Delta", "total": 3000, "status": "closed", "client": {}}),
        ),
        ("other", "e", json!({"name": "Echo", "status": "open"})),
    ]
}

async fn seeded(temp_dir: &TempDir) -> (MemoryStore, DbConnection) {
    common::init_logging();
    let memory = MemoryStore::new();
    let db = DbConnection::open(temp_dir.path().join("equivalence.db"))
        .await
        .unwrap();
    for (collection, raw_id, data) in seed_docs() {
        memory.put(collection, &id(raw_id), data.clone()).await.unwrap();
        db.put(collection, &id(raw_id), data).await.unwrap();
    }
    (memory, db)
}

async fn both(memory: &MemoryStore, db: &DbConnection, query: &DocQuery) -> Vec<String> {
    let from_memory: Vec<String> = memory
        .query(query)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id.to_string())
        .collect();
    let from_db: Vec<String> = db
        .query(query)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id.to_string())
        .collect();
    assert_eq!(from_memory, from_db, "stores disagree on {query:?}");
    from_memory
}

fn jobs_where(filter: FieldFilter) -> DocQuery {
    DocQuery::collection(JOBS).filter(filter)
}

#[test(tokio::test)]
async fn test_filters_agree() {
    let temp_dir = TempDir::new().unwrap();
    let (memory, db) = seeded(&temp_dir).await;

    let cases: Vec<(FieldFilter, Vec<&str>)> = vec![
        (FieldFilter::eq("status", "open").unwrap(), vec!["a", "c"]),
        (
            FieldFilter::new("status", FilterOp::Ne, "open").unwrap(),
            vec!["b", "d"],
        ),
        // The text "900" never compares with numbers.
        (
            FieldFilter::new("total", FilterOp::Gt, 1000).unwrap(),
            vec!["a", "d"],
        ),
        (
            FieldFilter::new("total", FilterOp::Lt, 1000).unwrap(),
            vec!["b"],
        ),
        (
            FieldFilter::new("name", FilterOp::Lt, "C").unwrap(),
            vec!["a", "b"],
        ),
        (
            FieldFilter::new("status", FilterOp::In, json!(["open", "sent"])).unwrap(),
            vec!["a", "b", "c"],
        ),
        (
            FieldFilter::new("tags", FilterOp::ArrayContains, "plumbing").unwrap(),
            vec!["b"],
        ),
        (FieldFilter::eq("client.city", "Austin").unwrap(), vec!["a", "c"]),
        // Missing and explicit null both count as null.
        (FieldFilter::eq("archivedAt", Value::Null).unwrap(), vec!["a", "b", "d"]),
        (
            FieldFilter::new("archivedAt", FilterOp::Ne, Value::Null).unwrap(),
            vec!["c"],
        ),
        (FieldFilter::eq("rush", true).unwrap(), vec!["a"]),
        (FieldFilter::eq("total", 250.5).unwrap(), vec!["b"]),
    ];
    for (filter, expected) in cases {
        let query = jobs_where(filter);
        assert_eq!(both(&memory, &db, &query).await, expected, "{query:?}");
    }

    let combined = DocQuery::collection(JOBS)
        .filter(FieldFilter::eq("status", "open").unwrap())
        .filter(FieldFilter::eq("client.city", "Austin").unwrap())
        .filter(FieldFilter::new("total", FilterOp::Gt, 1000).unwrap());
    assert_eq!(both(&memory, &db, &combined).await, vec!["a"]);
}

#[test(tokio::test)]
async fn test_ordering_and_pages_agree() {
    let temp_dir = TempDir::new().unwrap();
    let (memory, db) = seeded(&temp_dir).await;

    let by_name = DocQuery::collection(JOBS).order_by("name", false).unwrap();
    assert_eq!(both(&memory, &db, &by_name).await, vec!["a", "b", "c", "d"]);
    assert_eq!(
        both(&memory, &db, &by_name.clone().paginate(2, 1)).await,
        vec!["b", "c"]
    );

    // Mixed kinds: both stores must use the same type ordering.
    let by_total = DocQuery::collection(JOBS).order_by("total", true).unwrap();
    both(&memory, &db, &by_total).await;

    let memory_page = memory.query_page(&by_name.clone().paginate(3, 2)).await.unwrap();
    let db_page = db.query_page(&by_name.clone().paginate(3, 2)).await.unwrap();
    assert_eq!(memory_page.count, 4);
    assert_eq!(db_page.count, 4);
    assert_eq!(memory_page.start, db_page.start);
    assert_eq!(memory_page.results.len(), 2);
    assert_eq!(db_page.results.len(), 2);
}

#[test(tokio::test)]
async fn test_patches_and_batches_agree() {
    let temp_dir = TempDir::new().unwrap();
    let (memory, db) = seeded(&temp_dir).await;

    let before = json!({"name": "Alpha", "total": 1500, "client": {"city": "Austin"}});
    let after = json!({"name": "Alpha", "total": 1750, "client": {"city": "Round Rock"},
                       "notes": "Moved"});
    let patch = Patch::between(&before, &after);
    let patched_memory = memory.patch(JOBS, &id("a"), &patch).await.unwrap();
    let patched_db = db.patch(JOBS, &id("a"), &patch).await.unwrap();
    assert_eq!(patched_memory.data, patched_db.data);
    assert_eq!(patched_db.data["client"]["city"], json!("Round Rock"));
    assert_eq!(patched_db.data["notes"], json!("Moved"));

    // A batch with a patch to a missing document fails as a whole in SQLite.
    let batch = vec![
        StoreEvent::Upserted(JOBS.to_string(), id("f"), json!({"name": "Foxtrot"})),
        StoreEvent::Patched(JOBS.to_string(), id("missing"), patch.clone()),
    ];
    assert!(db.apply(&batch).await.is_err());
    assert!(db.get(JOBS, &id("f")).await.unwrap().is_none());

    let removed = vec![StoreEvent::Removed(JOBS.to_string(), vec![id("c"), id("d")])];
    assert_eq!(memory.apply(&removed).await.unwrap(), 2);
    assert_eq!(db.apply(&removed).await.unwrap(), 2);
    let all = DocQuery::collection(JOBS);
    assert_eq!(both(&memory, &db, &all).await, vec!["a", "b"]);
    assert_eq!(db.count(JOBS).await.unwrap(), 2);
}
