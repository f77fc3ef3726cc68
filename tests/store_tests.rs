//! Integration tests for the durable store contract.
//!
//! Every property is checked against both backends through the `Store` trait.

use agent_tasks::store::file::FileStoreOptions;
use agent_tasks::store::{FileStore, SqliteStore, Store, WatchCallback};
use agent_tasks::types::{Task, TaskStatus};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn fast_file_options() -> FileStoreOptions {
    FileStoreOptions {
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn setup_file() -> (TempDir, Arc<dyn Store>) {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("store"), fast_file_options()).unwrap();
    (dir, Arc::new(store))
}

fn setup_sqlite() -> (TempDir, Arc<dyn Store>) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("tasks.db"), Duration::from_millis(20)).unwrap();
    (dir, Arc::new(store))
}

fn sample_task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        parent_id: None,
        title: format!("Task {}", id),
        description: String::new(),
        status: if deps.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        },
        version: 0,
        assigned_to: None,
        created_by: "agent-1".to_string(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        claimed_at: None,
        completed_at: None,
        created_at: 1_700_000_000_000,
        updated_at: 1_700_000_000_000,
        metadata: HashMap::from([("priority".to_string(), json!("high"))]),
    }
}

async fn check_task_round_trip(store: &dyn Store) {
    let task = sample_task("t1", &["c", "a", "b"]);
    let value = serde_json::to_value(&task).unwrap();
    assert!(store.write_if_version("tasks/t1", &value, 0).await.unwrap());

    let read: Task = serde_json::from_value(store.read("tasks/t1").await.unwrap().unwrap()).unwrap();
    assert_eq!(read, task);
    let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(read.dependencies, expected);
}

async fn check_cas_semantics(store: &dyn Store) {
    let key = "docs/counter";
    assert!(!store.write_if_version(key, &json!({"version": 1}), 3).await.unwrap());
    assert!(store.read(key).await.unwrap().is_none());

    assert!(store.write_if_version(key, &json!({"version": 1, "n": 1}), 0).await.unwrap());
    assert!(!store.write_if_version(key, &json!({"version": 1, "n": 2}), 0).await.unwrap());
    assert!(store.write_if_version(key, &json!({"version": 2, "n": 3}), 1).await.unwrap());

    let value = store.read(key).await.unwrap().unwrap();
    assert_eq!(value["n"], 3);
    assert_eq!(value["version"], 2);
}

async fn check_list_and_delete(store: &dyn Store) {
    for id in ["b", "a", "c"] {
        let value = serde_json::to_value(sample_task(id, &[])).unwrap();
        store.write_if_version(&format!("tasks/{}", id), &value, 0).await.unwrap();
    }
    store.write("history/agent-1", &json!({"entries": []})).await.unwrap();

    assert_eq!(
        store.list("tasks/").await.unwrap(),
        vec!["tasks/a", "tasks/b", "tasks/c"]
    );
    assert!(store.exists("history/agent-1").await.unwrap());

    store.delete("tasks/b").await.unwrap();
    store.delete("tasks/never-existed").await.unwrap();
    assert_eq!(store.list("tasks/").await.unwrap(), vec!["tasks/a", "tasks/c"]);
    assert!(!store.exists("tasks/b").await.unwrap());
}

async fn check_invalid_keys(store: &dyn Store) {
    assert!(store.read("tasks/../escape").await.is_err());
    assert!(store.write("bad key", &json!({})).await.is_err());
}

async fn check_racing_cas(store: Arc<dyn Store>) {
    let mut handles = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .write_if_version("docs/race", &json!({"version": 1, "winner": n}), 0)
                .await
                .unwrap()
        }));
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

async fn check_local_watch(store: &dyn Store) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<Value>>();
    let callback: WatchCallback = Arc::new(move |value| {
        let _ = tx.send(value);
    });
    let handle = store.watch("meta/agents", callback).unwrap();

    store
        .write_if_version("meta/agents", &json!({"version": 1, "next_id": 2}), 0)
        .await
        .unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.unwrap()["next_id"], 2);

    handle.unsubscribe();
    store
        .write_if_version("meta/agents", &json!({"version": 2, "next_id": 3}), 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

mod file_backend {
    use super::*;

    #[tokio::test]
    async fn task_round_trip() {
        let (_dir, store) = setup_file();
        check_task_round_trip(store.as_ref()).await;
    }

    #[tokio::test]
    async fn cas_semantics() {
        let (_dir, store) = setup_file();
        check_cas_semantics(store.as_ref()).await;
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (_dir, store) = setup_file();
        check_list_and_delete(store.as_ref()).await;
    }

    #[tokio::test]
    async fn invalid_keys() {
        let (_dir, store) = setup_file();
        check_invalid_keys(store.as_ref()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_cas_has_one_winner() {
        let (_dir, store) = setup_file();
        check_racing_cas(store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_cas_across_instances() {
        let dir = TempDir::new().unwrap();
        let mut handles = Vec::new();
        for n in 0..6 {
            let store = FileStore::open(dir.path(), fast_file_options()).unwrap();
            handles.push(tokio::spawn(async move {
                store
                    .write_if_version("docs/race", &json!({"version": 1, "winner": n}), 0)
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_breakers_of_a_stale_lock_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        for round in 0..5 {
            let key = format!("docs/stale-{}", round);
            std::fs::create_dir_all(&docs).unwrap();
            // A lock left behind by a crashed writer a minute ago.
            let lock_path = docs.join(format!("stale-{}.json.lock", round));
            let lock = std::fs::File::create(&lock_path).unwrap();
            lock.set_modified(SystemTime::now() - Duration::from_secs(60))
                .unwrap();
            drop(lock);

            let mut handles = Vec::new();
            for n in 0..8 {
                let store = FileStore::open(
                    dir.path(),
                    FileStoreOptions {
                        stale_lock: Duration::from_millis(500),
                        ..fast_file_options()
                    },
                )
                .unwrap();
                let key = key.clone();
                handles.push(tokio::spawn(async move {
                    store
                        .write_if_version(&key, &json!({"version": 1, "winner": n}), 0)
                        .await
                        .unwrap()
                }));
            }
            let mut wins = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    wins += 1;
                }
            }
            assert_eq!(wins, 1, "round {}", round);
        }

        let leftovers: Vec<String> = std::fs::read_dir(&docs)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| !name.ends_with(".json"))
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    }

    #[tokio::test]
    async fn malformed_document_reads_as_absent() {
        let (dir, store) = setup_file();
        let path = dir.path().join("store").join("docs");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("broken.json"), "{not json").unwrap();
        assert!(store.read("docs/broken").await.unwrap().is_none());
        assert!(!store.exists("docs/broken").await.unwrap());
    }

    #[tokio::test]
    async fn local_watch() {
        let (_dir, store) = setup_file();
        check_local_watch(store.as_ref()).await;
    }

    #[tokio::test]
    async fn watch_sees_writes_from_another_instance() {
        let dir = TempDir::new().unwrap();
        let watcher = FileStore::open(dir.path(), fast_file_options()).unwrap();
        let writer = FileStore::open(dir.path(), fast_file_options()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Value>>();
        let _handle = watcher
            .watch(
                "meta/agents",
                Arc::new(move |value| {
                    let _ = tx.send(value);
                }),
            )
            .unwrap();

        writer
            .write_if_version("meta/agents", &json!({"version": 1}), 0)
            .await
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.unwrap()["version"], 1);
    }
}

mod sqlite_backend {
    use super::*;
    use agent_tasks::db::Database;

    #[tokio::test]
    async fn task_round_trip() {
        let (_dir, store) = setup_sqlite();
        check_task_round_trip(store.as_ref()).await;
    }

    #[tokio::test]
    async fn cas_semantics() {
        let (_dir, store) = setup_sqlite();
        check_cas_semantics(store.as_ref()).await;
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (_dir, store) = setup_sqlite();
        check_list_and_delete(store.as_ref()).await;
    }

    #[tokio::test]
    async fn invalid_keys() {
        let (_dir, store) = setup_sqlite();
        check_invalid_keys(store.as_ref()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_cas_has_one_winner() {
        let (_dir, store) = setup_sqlite();
        check_racing_cas(store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_cas_across_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        // Create the schema once so the racers only contend on the CAS.
        drop(SqliteStore::open(&path, Duration::from_millis(20)).unwrap());

        let mut handles = Vec::new();
        for n in 0..6 {
            let store = SqliteStore::open(&path, Duration::from_millis(20)).unwrap();
            handles.push(tokio::spawn(async move {
                store
                    .write_if_version("docs/race", &json!({"version": 1, "winner": n}), 0)
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn task_row_with_malformed_metadata_reads_as_absent() {
        let sqlite = SqliteStore::open_in_memory().unwrap();
        let mut task = sample_task("t1", &[]);
        task.version = 3;
        let value = serde_json::to_value(&task).unwrap();
        assert!(sqlite.write_if_version("tasks/t1", &value, 0).await.unwrap());
        sqlite
            .database()
            .with_conn(|conn| {
                conn.execute("UPDATE tasks SET metadata = '{oops' WHERE id = 't1'", [])?;
                Ok(())
            })
            .unwrap();

        assert!(sqlite.read("tasks/t1").await.unwrap().is_none());
        assert!(!sqlite.exists("tasks/t1").await.unwrap());
        // The row keeps its version, so a create cannot overwrite it.
        assert!(!sqlite.write_if_version("tasks/t1", &value, 0).await.unwrap());
    }

    #[tokio::test]
    async fn dependencies_live_in_edge_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        let store = SqliteStore::open(&path, Duration::from_millis(20)).unwrap();
        let value = serde_json::to_value(sample_task("t1", &["b", "a"])).unwrap();
        store.write_if_version("tasks/t1", &value, 0).await.unwrap();

        let edges: Vec<String> = store
            .database()
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT dependency_id FROM task_dependencies WHERE task_id = 't1' ORDER BY dependency_id",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .unwrap();
        assert_eq!(edges, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn migrations_are_recorded() {
        let db = Database::open_in_memory().unwrap();
        let applied = db
            .with_conn(agent_tasks::db::migrations::applied_migrations)
            .unwrap();
        let names: Vec<&str> = applied.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "create_tasks",
                "create_task_dependencies",
                "create_agents",
                "create_registry_versions",
                "create_documents"
            ]
        );
    }

    #[tokio::test]
    async fn malformed_document_reads_as_absent() {
        let sqlite = SqliteStore::open_in_memory().unwrap();
        sqlite
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO documents (key, value, version, updated_at) VALUES ('docs/broken', '{oops', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(sqlite.read("docs/broken").await.unwrap().is_none());
        assert!(!sqlite.exists("docs/broken").await.unwrap());
    }

    #[tokio::test]
    async fn local_watch() {
        let (_dir, store) = setup_sqlite();
        check_local_watch(store.as_ref()).await;
    }

    #[tokio::test]
    async fn watch_sees_writes_from_another_connection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        let watcher = SqliteStore::open(&path, Duration::from_millis(20)).unwrap();
        let writer = SqliteStore::open(&path, Duration::from_millis(20)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Value>>();
        let _handle = watcher
            .watch(
                "meta/agents",
                Arc::new(move |value| {
                    let _ = tx.send(value);
                }),
            )
            .unwrap();

        writer
            .write_if_version("meta/agents", &json!({"version": 1}), 0)
            .await
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.unwrap()["version"], 1);
    }
}
