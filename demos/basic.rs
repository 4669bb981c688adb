//! Basic usage examples for SqlDatabase

use esox_sqlpool::{JournalMode, Priority, SqlDatabase, TransactionMode, Value};

fn main() {
    println!("=== esox_sqlpool - Basic Examples ===\n");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basic.db").to_string_lossy().into_owned();
    let db = SqlDatabase::open_with_journal_mode(path, JournalMode::Wal).unwrap();

    // Example 1: Statements and queries
    statements(&db);

    // Example 2: Batches
    batches(&db);

    // Example 3: Transactions
    transactions(&db);

    // Example 4: Metrics
    metrics(&db);

    db.close();
}

fn statements(db: &SqlDatabase) {
    println!("1. Statements:");
    db.exec("CREATE TABLE people (name TEXT, age INTEGER)", &[]).unwrap();
    let id = db
        .execute_insert("INSERT INTO people VALUES (?, ?)", &["Ada".into(), 36.into()])
        .unwrap();
    println!("   Inserted row {id}");

    for row in db.query("SELECT name, age FROM people", &[]).unwrap() {
        let row = row.unwrap();
        println!("   {:?} is {:?}", row.get(0).and_then(Value::as_str), row.get(1).and_then(Value::as_i64));
    }
    println!();
}

fn batches(db: &SqlDatabase) {
    println!("2. Batches:");
    let rows = (0..1000).map(|i| vec![Value::from(format!("person {i}")), Value::from(i % 90)]);
    let inserted = db.batch("INSERT INTO people VALUES (?, ?)", rows).unwrap();
    println!("   Inserted {inserted} rows with one borrowed connection\n");
}

fn transactions(db: &SqlDatabase) {
    println!("3. Transactions:");
    let result = db.transact(TransactionMode::Immediate, |tx| {
        tx.exec("DELETE FROM people WHERE age > ?", &[50.into()])?;
        let left = tx.query_for_long("SELECT count(*) FROM people", &[])?;
        println!("   Inside the transaction: {left:?} people");
        Err::<(), _>(esox_sqlpool::PoolError::Misuse("rolled back on purpose".into()))
    });
    println!("   Transaction result: {result:?}");
    println!(
        "   After rollback: {:?} people\n",
        db.query_for_long("SELECT count(*) FROM people", &[]).unwrap()
    );
}

fn metrics(db: &SqlDatabase) {
    println!("4. Metrics:");
    db.clear(Priority::Low);
    let metrics = db.metrics();
    println!("   Connections made: {}", metrics.total_created);
    println!("   Borrows: {}", metrics.total_borrowed);
    for (key, value) in metrics.export() {
        println!("   {key}: {value}");
    }
    println!();
}
