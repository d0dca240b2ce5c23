use crate::{Constraint, StoreFacade, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use tracecap_schema::{core_schema, ColumnType, SchemaBuilder, TimeType};

fn open_with_core_schema() -> Arc<StoreFacade> {
    let facade = StoreFacade::open_in_memory().unwrap();
    let schema = core_schema(5, TimeType::Int).unwrap();
    facade.apply_schema(&schema).unwrap();
    facade
}

#[test]
fn insert_and_get_record_round_trips() {
    let facade = open_with_core_schema();
    let handle = facade
        .safe_transaction(|tx| {
            tx.insert(
                "Clocks",
                &["id", "name", "period"],
                &[Value::U32(0), Value::Text("tick".into()), Value::U32(1)],
            )
        })
        .unwrap();

    let row = facade
        .safe_transaction(|tx| tx.get_record("Clocks", &["name", "period"], handle.id))
        .unwrap()
        .unwrap();
    assert_eq!(row[0], Value::Text("tick".into()));
    assert_eq!(row[1].as_i64(), Some(1));
}

#[test]
fn find_record_returns_none_on_miss() {
    let facade = open_with_core_schema();
    let row = facade
        .safe_transaction(|tx| tx.find_record("Clocks", &["name"], "id", &Value::U32(999)))
        .unwrap();
    assert!(row.is_none());
}

#[test]
fn update_scalar_mutates_the_row() {
    let facade = open_with_core_schema();
    let handle = facade
        .safe_transaction(|tx| {
            tx.insert(
                "Clocks",
                &["id", "name", "period"],
                &[Value::U32(0), Value::Text("tick".into()), Value::U32(1)],
            )
        })
        .unwrap();
    facade
        .safe_transaction(|tx| tx.update_scalar(&handle, "period", Value::U32(42)))
        .unwrap();
    let row = facade
        .safe_transaction(|tx| tx.get_record("Clocks", &["period"], handle.id))
        .unwrap()
        .unwrap();
    assert_eq!(row[0].as_i64(), Some(42));
}

#[test]
fn query_filters_orders_and_limits() {
    let facade = open_with_core_schema();
    facade
        .safe_transaction(|tx| {
            for (id, name, period) in [(0u32, "a", 3u32), (1, "b", 1), (2, "c", 2)] {
                tx.insert(
                    "Clocks",
                    &["id", "name", "period"],
                    &[Value::U32(id), Value::Text(name.into()), Value::U32(period)],
                )?;
            }
            Ok(())
        })
        .unwrap();

    let rows: Vec<_> = facade
        .query("Clocks")
        .select(&["name"])
        .filter("period", Constraint::GreaterEqual, Value::U32(2))
        .order_by("period", false)
        .run()
        .unwrap()
        .collect();
    assert_eq!(
        rows,
        vec![
            vec![Value::Text("c".into())],
            vec![Value::Text("a".into())],
        ]
    );
}

#[test]
fn query_in_set_and_not_in_set() {
    let facade = open_with_core_schema();
    facade
        .safe_transaction(|tx| {
            for (id, name) in [(0u32, "a"), (1, "b"), (2, "c")] {
                tx.insert(
                    "Clocks",
                    &["id", "name", "period"],
                    &[Value::U32(id), Value::Text(name.into()), Value::U32(1)],
                )?;
            }
            Ok(())
        })
        .unwrap();

    let in_set: Vec<_> = facade
        .query("Clocks")
        .select(&["name"])
        .filter_in("id", &[Value::U32(0), Value::U32(2)], false)
        .order_by("id", false)
        .run()
        .unwrap()
        .collect();
    assert_eq!(
        in_set,
        vec![vec![Value::Text("a".into())], vec![Value::Text("c".into())]]
    );

    let not_in_set: Vec<_> = facade
        .query("Clocks")
        .select(&["name"])
        .filter_in("id", &[Value::U32(0), Value::U32(2)], true)
        .run()
        .unwrap()
        .collect();
    assert_eq!(not_in_set, vec![vec![Value::Text("b".into())]]);
}

#[test]
fn query_fuzzy_match_tolerates_float_noise() {
    let mut builder = SchemaBuilder::new();
    builder
        .add_table("Samples")
        .unwrap()
        .column("v", ColumnType::Double)
        .unwrap()
        .finish();
    let facade = StoreFacade::open_in_memory().unwrap();
    facade.apply_schema(&builder.build()).unwrap();
    facade
        .safe_transaction(|tx| tx.insert("Samples", &["v"], &[Value::F64(1.0 + 1e-16)]))
        .unwrap();

    let rows: Vec<_> = facade
        .query("Samples")
        .select(&["v"])
        .filter_fuzzy("v", 1.0, Constraint::Equal)
        .run()
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 1);
}

/// Opening an existing file then calling `apply_schema` fails with a
/// configuration error.
#[test]
fn schema_is_immutable_after_first_open_of_an_existing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.db");
    {
        let facade = StoreFacade::open(&path, false).unwrap();
        facade.apply_schema(&core_schema(5, TimeType::Int).unwrap()).unwrap();
    }
    let facade = StoreFacade::open(&path, false).unwrap();
    let err = facade.apply_schema(&core_schema(5, TimeType::Int).unwrap());
    assert!(err.is_err());
}

/// apply_schema is also rejected on a newly created file after its
/// first commit, even without reopening.
#[test]
fn schema_is_immutable_after_first_commit() {
    let facade = StoreFacade::open_in_memory().unwrap();
    facade.apply_schema(&core_schema(5, TimeType::Int).unwrap()).unwrap();
    facade
        .safe_transaction(|tx| {
            tx.insert("Clocks", &["id", "name", "period"], &[
                Value::U32(0),
                Value::Text("tick".into()),
                Value::U32(1),
            ])
        })
        .unwrap();
    let err = facade.apply_schema(&core_schema(5, TimeType::Int).unwrap());
    assert!(err.is_err());
}

/// A nested `safe_transaction` call does not issue a second `BEGIN`,
/// and the whole thing still commits atomically.
#[test]
fn safe_transaction_is_reentrant() {
    let facade = open_with_core_schema();
    facade
        .safe_transaction(|tx| {
            tx.insert(
                "Clocks",
                &["id", "name", "period"],
                &[Value::U32(0), Value::Text("outer".into()), Value::U32(1)],
            )?;
            // nested call — must join the outer transaction, not deadlock
            facade.safe_transaction(|tx2| {
                tx2.insert(
                    "Clocks",
                    &["id", "name", "period"],
                    &[Value::U32(1), Value::Text("inner".into()), Value::U32(2)],
                )
            })
        })
        .unwrap();

    let rows: Vec<_> = facade.query("Clocks").select(&["name"]).run().unwrap().collect();
    assert_eq!(rows.len(), 2);
}

/// A second writer holding the lock for 75 ms does not cause the first
/// writer's `safe_transaction` to fail; it retries silently until the
/// lock is free.
#[test]
fn contention_is_absorbed_by_retry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.db");
    let facade = StoreFacade::open(&path, false).unwrap();
    facade.apply_schema(&core_schema(5, TimeType::Int).unwrap()).unwrap();

    let blocker = Arc::clone(&facade);
    let handle = thread::spawn(move || {
        blocker
            .safe_transaction(|tx| {
                tx.insert(
                    "Clocks",
                    &["id", "name", "period"],
                    &[Value::U32(0), Value::Text("blocker".into()), Value::U32(1)],
                )?;
                thread::sleep(Duration::from_millis(75));
                Ok(())
            })
            .unwrap();
    });

    // give the blocker a moment to actually acquire the write lock first
    thread::sleep(Duration::from_millis(10));
    let result = facade.safe_transaction(|tx| {
        tx.insert(
            "Clocks",
            &["id", "name", "period"],
            &[Value::U32(1), Value::Text("waiter".into()), Value::U32(1)],
        )
    });
    handle.join().unwrap();
    assert!(result.is_ok());
}

/// For 1000 consecutive commits, rows read back in ascending id have
/// strictly increasing timestamps.
#[test]
fn commit_order_matches_insertion_order() {
    let facade = open_with_core_schema();
    for i in 0..1000i64 {
        facade
            .safe_transaction(|tx| {
                tx.insert(
                    "CollectionData",
                    &["id", "timestamp", "data_vals", "is_compressed"],
                    &[
                        Value::U32(0),
                        Value::F64(i as f64),
                        Value::Blob(vec![]),
                        Value::I32(0),
                    ],
                )
            })
            .unwrap();
    }
    let rows: Vec<_> = facade
        .query("CollectionData")
        .select(&["timestamp"])
        .order_by("rowid", false)
        .run()
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 1000);
    for window in rows.windows(2) {
        assert!(window[0][0].as_f64().unwrap() < window[1][0].as_f64().unwrap());
    }
}
