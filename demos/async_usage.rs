//! Using a database from async code

use esox_sqlpool::{JournalMode, SqlDatabase, Value};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    println!("=== esox_sqlpool - Async Examples ===\n");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("async.db").to_string_lossy().into_owned();
    let db = Arc::new(SqlDatabase::open_with_journal_mode(path, JournalMode::Wal).unwrap());
    db.exec("CREATE TABLE events (id INTEGER PRIMARY KEY, payload TEXT)", &[])
        .unwrap();

    // Borrowing blocks the calling thread, so database work runs on the
    // blocking pool.
    let writers: Vec<_> = (0..4)
        .map(|i| {
            let db = Arc::clone(&db);
            tokio::task::spawn_blocking(move || {
                let rows = (0..250).map(|j| vec![Value::from(format!("event {i}/{j}"))]);
                db.batch("INSERT INTO events (payload) VALUES (?)", rows)
            })
        })
        .collect();
    for writer in writers {
        let inserted = writer.await.unwrap().unwrap();
        println!("   Writer inserted {inserted} events");
    }

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let db = Arc::clone(&db);
            tokio::task::spawn_blocking(move || db.query_for_long("SELECT count(*) FROM events", &[]))
        })
        .collect();
    for reader in readers {
        println!("   Reader saw {:?} events", reader.await.unwrap().unwrap());
    }

    let metrics = db.metrics();
    println!("\n   Connections live: {}", metrics.live_objects());
    db.close();
}
