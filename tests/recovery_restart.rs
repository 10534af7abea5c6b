//! Restart behavior: a drained engine reopened on the same storage
//! directory serves the same answers, and damaged index files degrade
//! to records-only service instead of failing recovery.

use std::collections::HashMap;

use middb::{Config, Database};
use tempfile::TempDir;

fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|&(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn config_for(dir: &TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    }
}

#[test]
fn restart_preserves_records_and_queries() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(config_for(&dir)).unwrap();
        db.insert(
            "users",
            "user1",
            fields(&[("name", "Alice"), ("email", "a@x")]),
            vec![0.1, 0.5, 0.2],
        )
        .unwrap();
        db.insert("users", "user2", fields(&[("name", "Bob")]), vec![0.9, 0.0, 0.0])
            .unwrap();
        db.insert("orders", "o1", fields(&[("sku", "K-7")]), vec![1.0, 1.0])
            .unwrap();
        db.drain().unwrap();
        db.shutdown();
    }

    let db = Database::open(config_for(&dir)).unwrap();
    assert_eq!(db.table_count(), 2);
    assert_eq!(db.query_field("users", "name", "Alice"), vec!["user1"]);
    assert_eq!(db.query_field("orders", "sku", "K-7"), vec!["o1"]);
    assert_eq!(
        db.query_embedding("users", &[0.1, 0.5, 0.2], 1).unwrap(),
        vec!["user1"]
    );
    assert_eq!(
        db.query_hybrid("users", "name", "Bob", &[0.9, 0.0, 0.0], 3)
            .unwrap(),
        vec!["user2"]
    );
}

#[test]
fn restart_preserves_labels_and_deletes() {
    let dir = TempDir::new().unwrap();

    let stats_before = {
        let db = Database::open(config_for(&dir)).unwrap();
        for i in 0..5 {
            db.insert("items", &format!("i{i}"), HashMap::new(), vec![i as f32])
                .unwrap();
        }
        db.drain().unwrap();
        db.delete("items", "i2").unwrap();
        db.flush_now();
        let stats = db.table_stats("items").unwrap();
        db.shutdown();
        stats
    };

    let db = Database::open(config_for(&dir)).unwrap();
    let stats_after = db.table_stats("items").unwrap();
    assert_eq!(stats_after.records, stats_before.records);
    assert_eq!(stats_after.dim, stats_before.dim);

    // The deleted record stays gone, even queried by its own vector.
    assert!(db
        .query_embedding("items", &[2.0], 5)
        .unwrap()
        .iter()
        .all(|id| id != "i2"));
}

#[test]
fn shutdown_drains_pending_writes() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(config_for(&dir)).unwrap();
        for i in 0..250 {
            db.insert(
                "bulk",
                &format!("r{i}"),
                fields(&[("n", &i.to_string())]),
                vec![i as f32, -(i as f32)],
            )
            .unwrap();
        }
        // No drain: shutdown itself must apply and persist the backlog.
        db.shutdown();
    }

    let db = Database::open(config_for(&dir)).unwrap();
    let stats = db.table_stats("bulk").unwrap();
    assert_eq!(stats.records, 250);
    assert_eq!(db.query_field("bulk", "n", "249"), vec!["r249"]);
}

#[test]
fn corrupt_index_degrades_to_records_only() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(config_for(&dir)).unwrap();
        db.insert("users", "user1", fields(&[("name", "Alice")]), vec![1.0, 0.0])
            .unwrap();
        db.drain().unwrap();
        db.shutdown();
    }

    std::fs::write(dir.path().join("users.index"), b"scribbled over").unwrap();

    let db = Database::open(config_for(&dir)).unwrap();
    // Records and the field index survive; the graph is gone.
    assert_eq!(db.query_field("users", "name", "Alice"), vec!["user1"]);
    assert!(db
        .query_embedding("users", &[1.0, 0.0], 1)
        .unwrap()
        .is_empty());

    // New inserts repopulate a fresh graph.
    db.insert("users", "user2", fields(&[("name", "Bob")]), vec![0.0, 1.0])
        .unwrap();
    db.drain().unwrap();
    assert_eq!(
        db.query_embedding("users", &[0.0, 1.0], 1).unwrap(),
        vec!["user2"]
    );
}

#[test]
fn missing_index_file_leaves_table_usable() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(config_for(&dir)).unwrap();
        db.insert("users", "user1", fields(&[("name", "Alice")]), vec![1.0, 0.0])
            .unwrap();
        db.drain().unwrap();
        db.shutdown();
    }

    std::fs::remove_file(dir.path().join("users.index")).unwrap();

    let db = Database::open(config_for(&dir)).unwrap();
    assert_eq!(db.query_field("users", "name", "Alice"), vec!["user1"]);
    assert!(db
        .query_embedding("users", &[1.0, 0.0], 1)
        .unwrap()
        .is_empty());
}

#[test]
fn fresh_directory_starts_empty() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("made").join("on").join("open");
    let db = Database::open(Config {
        data_dir: nested.clone(),
        ..Config::default()
    })
    .unwrap();
    assert_eq!(db.table_count(), 0);
    assert!(nested.is_dir());
}
