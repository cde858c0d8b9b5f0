///
/// # Engine Integration Tests
///
/// End-to-end runs through `Engine`: inline and threaded submission,
/// reconciliation, callback marshaling, re-entrant frees, handle validity
/// and owner teardown, against SQLite and the gated mock backend.
///

mod common;

use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

use tempfile::TempDir;

use common::{connect_mock, connect_sqlite, mock_engine, RecordingHost, MOCK_FAILURE};
use tickql::natives;
use tickql::{
    Arg, ConnectParams, Engine, EngineConfig, EngineError, HandlerId, NoCallbacks, OwnerId, QueryRequest,
    StatementFlags, StatementId, StatementStatus, Value,
};

const OWNER: OwnerId = OwnerId(1);

fn threaded(db: HandlerId, sql: &str) -> QueryRequest {
    QueryRequest::new(OWNER, db, sql).flags(StatementFlags::THREADED)
}

#[test]
fn test_inline_callback_reads_arguments_in_format_order() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_sqlite(&engine, OWNER, ":memory:");
    let mut host = RecordingHost::new(&["OnUserLoaded"]);

    let request = QueryRequest::new(OWNER, db, "SELECT 7 AS id, 'Bob' AS name")
        .callback("OnUserLoaded", "disr")
        .param(7)
        .param(42)
        .param("Bob");
    let id = engine.submit(request, &mut host).unwrap();

    assert_eq!(engine.status(id).unwrap(), StatementStatus::Executed);
    assert_eq!(engine.num_rows(id).unwrap(), 1);
    assert_eq!(
        host.calls[0].args,
        vec![Arg::Cell(7), Arg::Cell(42), Arg::Str("Bob".into()), Arg::Cell(id.as_cell())]
    );
    assert_eq!(engine.fetch_by_name(id, "name").unwrap(), "Bob");
    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "7");
}

#[test]
fn test_threaded_statement_is_processed_only_by_a_tick() {
    let (engine, backend) = mock_engine(EngineConfig::default(), false);
    let db = connect_mock(&engine, OWNER);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_in_callback = Rc::clone(&seen);
    let mut host = RecordingHost::new(&["OnDone"]).with_hook(move |engine, call| {
        if let Some(Arg::Cell(id)) = call.args.first() {
            let status = engine.status(StatementId(i64::from(*id))).unwrap();
            seen_in_callback.borrow_mut().push(status);
        }
    });

    let id = engine
        .submit(threaded(db, "SELECT 1").callback("OnDone", "r"), &mut host)
        .unwrap();
    backend.gate.wait_for_waiters(1);
    assert_eq!(engine.status(id).unwrap(), StatementStatus::None);
    assert_eq!(engine.process_tick(&mut host), 0);
    assert!(matches!(engine.num_rows(id), Err(EngineError::NotExecuted(_))));

    backend.gate.open();
    engine.wait(db).unwrap();
    assert_eq!(engine.status(id).unwrap(), StatementStatus::Executed);

    assert_eq!(engine.process_tick(&mut host), 1);
    assert_eq!(host.names(), vec!["OnDone"]);
    assert_eq!(*seen.borrow(), vec![StatementStatus::Processed]);
    assert!(matches!(engine.status(id), Err(EngineError::UnknownStatement(_))));

    assert_eq!(engine.process_tick(&mut host), 0);
    assert_eq!(host.calls.len(), 1);
}

#[test]
fn test_worker_runs_statements_in_submission_order() {
    let (engine, backend) = mock_engine(EngineConfig::default(), false);
    let db = connect_mock(&engine, OWNER);
    let mut host = RecordingHost::new(&["OnDone"]);

    let first = engine.submit(threaded(db, "A").callback("OnDone", "r"), &mut host).unwrap();
    let second = engine.submit(threaded(db, "B").callback("OnDone", "r"), &mut host).unwrap();
    let third = engine.submit(threaded(db, "C").callback("OnDone", "r"), &mut host).unwrap();
    backend.gate.open();
    engine.wait(db).unwrap();

    assert_eq!(backend.executed(), vec!["A", "B", "C"]);
    engine.process_tick(&mut host);
    let reported: Vec<Arg> = host.calls.iter().map(|call| call.args[0].clone()).collect();
    assert_eq!(
        reported,
        vec![
            Arg::Cell(first.as_cell()),
            Arg::Cell(second.as_cell()),
            Arg::Cell(third.as_cell())
        ]
    );
}

#[test]
fn test_failed_statement_reports_to_error_handler() {
    let (engine, backend) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let mut host = RecordingHost::new(&["OnSQLError", "OnLoaded"]);

    let id = engine
        .submit(threaded(db, "FAIL").callback("OnLoaded", "d").param(5), &mut host)
        .unwrap();
    engine.wait(db).unwrap();
    assert_eq!(engine.error(id).unwrap(), MOCK_FAILURE);
    engine.process_tick(&mut host);

    assert_eq!(backend.executed(), vec!["FAIL"]);
    assert_eq!(host.names(), vec!["OnSQLError"]);
    assert_eq!(
        host.calls[0].args,
        vec![
            Arg::Cell(db.as_cell()),
            Arg::Cell(MOCK_FAILURE),
            Arg::Str("Table 'game.missing' doesn't exist".into()),
            Arg::Str("FAIL".into()),
            Arg::Str("OnLoaded".into()),
        ]
    );
}

#[test]
fn test_configured_error_handler_name() {
    let config = EngineConfig::from_toml_str("[callbacks]\nerror_handler = \"OnQueryFailed\"\n").unwrap();
    let (engine, _) = mock_engine(config, true);
    let db = connect_mock(&engine, OWNER);
    let mut host = RecordingHost::new(&["OnQueryFailed"]);

    engine.submit(QueryRequest::new(OWNER, db, "FAIL"), &mut host).unwrap();

    assert_eq!(host.names(), vec!["OnQueryFailed"]);
}

#[test]
fn test_multi_result_seek() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let id = engine
        .submit(QueryRequest::new(OWNER, db, "FIRST; SECOND"), &mut NoCallbacks)
        .unwrap();

    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "FIRST");
    engine.seek_result(id, -1).unwrap();
    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "SECOND");
    assert!(matches!(engine.seek_result(id, -1), Err(EngineError::OutOfRange { .. })));
    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "SECOND");

    engine.seek_result(id, 0).unwrap();
    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "FIRST");
}

#[test]
fn test_error_in_later_result_keeps_earlier_results() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let id = engine
        .submit(QueryRequest::new(OWNER, db, "FIRST; FAIL; THIRD"), &mut NoCallbacks)
        .unwrap();

    assert_eq!(engine.error(id).unwrap(), MOCK_FAILURE);
    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "FIRST");
    assert!(engine.seek_result(id, 1).is_err());
}

#[test]
fn test_null_field_renders_as_null_text() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_sqlite(&engine, OWNER, ":memory:");
    let id = engine
        .submit(QueryRequest::new(OWNER, db, "SELECT NULL AS gone, '' AS blank"), &mut NoCallbacks)
        .unwrap();

    assert_eq!(engine.fetch_by_name(id, "gone").unwrap(), "NULL");
    assert_eq!(engine.fetch_by_name(id, "blank").unwrap(), "");
    assert_eq!(engine.fetch_by_name(id, "missing").unwrap(), "");
    assert_eq!(engine.num_fields(id).unwrap(), 2);
}

#[test]
fn test_cached_and_streamed_fetches_agree() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("game.db");
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_sqlite(&engine, OWNER, path.to_str().unwrap());

    let setup = engine
        .submit(
            QueryRequest::new(
                OWNER,
                db,
                "CREATE TABLE items (id INTEGER, name TEXT, price REAL);
                 INSERT INTO items VALUES (1, 'sword', 9.5), (2, NULL, 3.25), (3, 'bow', 12.0);",
            ),
            &mut NoCallbacks,
        )
        .unwrap();
    assert_eq!(engine.error(setup).unwrap(), 0);
    engine.free_result(setup).unwrap();

    let select = "SELECT id, name, price FROM items ORDER BY id";
    let cached = engine
        .submit(QueryRequest::new(OWNER, db, select).flags(StatementFlags::CACHED), &mut NoCallbacks)
        .unwrap();
    let streamed = engine
        .submit(QueryRequest::new(OWNER, db, select), &mut NoCallbacks)
        .unwrap();

    assert_eq!(engine.num_rows(cached).unwrap(), 3);
    assert_eq!(engine.num_rows(streamed).unwrap(), 3);
    for row in 0..3 {
        engine.seek_row(cached, row).unwrap();
        engine.seek_row(streamed, row).unwrap();
        for field in 0..3 {
            assert_eq!(
                engine.fetch_by_index(cached, field).unwrap(),
                engine.fetch_by_index(streamed, field).unwrap()
            );
        }
    }
}

#[test]
fn test_escaped_text_round_trips_through_sqlite() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("escape.db");
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_sqlite(&engine, OWNER, path.to_str().unwrap());
    engine
        .submit(QueryRequest::new(OWNER, db, "CREATE TABLE notes (body TEXT)"), &mut NoCallbacks)
        .unwrap();

    let original = "it's a 'quoted' \\ string; DROP TABLE notes; --";
    let escaped = engine.escape(db, original).unwrap();
    let insert = engine
        .submit(
            QueryRequest::new(OWNER, db, format!("INSERT INTO notes VALUES ('{}')", escaped)),
            &mut NoCallbacks,
        )
        .unwrap();
    assert_eq!(engine.error(insert).unwrap(), 0);
    assert_eq!(engine.affected_rows(insert).unwrap(), 1);

    let select = engine
        .submit(QueryRequest::new(OWNER, db, "SELECT body FROM notes"), &mut NoCallbacks)
        .unwrap();
    assert_eq!(engine.num_rows(select).unwrap(), 1);
    assert_eq!(engine.fetch_by_index(select, 0).unwrap(), original);
}

#[test]
fn test_callback_may_free_its_own_statement() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let freed = Rc::new(RefCell::new(Vec::new()));
    let freed_in_callback = Rc::clone(&freed);
    let mut host = RecordingHost::new(&["OnDone"]).with_hook(move |engine, call| {
        if let Some(Arg::Cell(id)) = call.args.first() {
            let result = engine.free_result(StatementId(i64::from(*id)));
            freed_in_callback.borrow_mut().push(result.is_ok());
        }
    });

    let inline = engine
        .submit(QueryRequest::new(OWNER, db, "INLINE").callback("OnDone", "r"), &mut host)
        .unwrap();
    assert!(matches!(engine.status(inline), Err(EngineError::UnknownStatement(_))));
    // A second free of the same statement reports it as unknown.
    assert!(matches!(engine.free_result(inline), Err(EngineError::UnknownStatement(_))));

    let queued = engine
        .submit(threaded(db, "QUEUED").callback("OnDone", "r"), &mut host)
        .unwrap();
    engine.wait(db).unwrap();
    assert_eq!(engine.process_tick(&mut host), 1);
    assert!(matches!(engine.status(queued), Err(EngineError::UnknownStatement(_))));

    assert_eq!(*freed.borrow(), vec![true, true]);
    assert_eq!(engine.statement_count(), 0);
}

#[test]
fn test_stored_result_survives_reconciliation() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let mut host = RecordingHost::new(&["OnDone"]).with_hook(|engine, call| {
        if let Some(Arg::Cell(id)) = call.args.first() {
            engine.store_result(StatementId(i64::from(*id))).unwrap();
        }
    });

    let id = engine
        .submit(threaded(db, "KEEP").callback("OnDone", "r"), &mut host)
        .unwrap();
    engine.wait(db).unwrap();
    engine.process_tick(&mut host);
    engine.process_tick(&mut host);

    assert_eq!(engine.status(id).unwrap(), StatementStatus::Processed);
    assert_eq!(engine.fetch_by_index(id, 0).unwrap(), "KEEP");
    assert_eq!(host.calls.len(), 1);
    engine.free_result(id).unwrap();
    assert_eq!(engine.statement_count(), 0);
}

#[test]
fn test_threaded_statement_without_callback_is_reclaimed() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let id = engine.submit(threaded(db, "QUIET"), &mut NoCallbacks).unwrap();
    engine.wait(db).unwrap();

    assert_eq!(engine.process_tick(&mut NoCallbacks), 1);
    assert!(engine.status(id).is_err());
}

#[test]
fn test_stale_handles_leave_registries_untouched() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let id = engine.submit(QueryRequest::new(OWNER, db, "KEEP"), &mut NoCallbacks).unwrap();
    let stale_handler = HandlerId(99);
    let stale_stmt = StatementId(99);

    assert!(matches!(
        engine.submit(QueryRequest::new(OWNER, stale_handler, "X"), &mut NoCallbacks),
        Err(EngineError::UnknownHandler(_))
    ));
    assert!(matches!(engine.ping(stale_handler), Err(EngineError::UnknownHandler(_))));
    assert!(matches!(engine.disconnect(stale_handler), Err(EngineError::UnknownHandler(_))));
    assert!(matches!(engine.free_result(stale_stmt), Err(EngineError::UnknownStatement(_))));
    assert!(matches!(engine.seek_row(stale_stmt, 0), Err(EngineError::UnknownStatement(_))));
    assert!(matches!(engine.store_result(stale_stmt), Err(EngineError::UnknownStatement(_))));

    assert_eq!(engine.handler_count(), 1);
    assert_eq!(engine.statement_count(), 1);
    assert_eq!(engine.status(id).unwrap(), StatementStatus::Executed);
}

#[test]
fn test_statement_outliving_its_handler_is_reclaimed() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let db = connect_mock(&engine, OWNER);
    let id = engine.submit(QueryRequest::new(OWNER, db, "ORPHAN"), &mut NoCallbacks).unwrap();

    engine.disconnect(db).unwrap();
    assert!(matches!(engine.fetch_by_index(id, 0), Err(EngineError::UnknownHandler(_))));
    engine.process_tick(&mut NoCallbacks);

    assert!(matches!(engine.status(id), Err(EngineError::UnknownStatement(_))));
    assert_eq!(engine.handler_count(), 0);
}

#[test]
fn test_refused_connection_registers_nothing() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let params = ConnectParams {
        database: "refuse".into(),
        ..ConnectParams::default()
    };
    let err = engine.connect(OWNER, common::MOCK, &params).unwrap_err();

    assert!(matches!(err, EngineError::ConnectFailed { code: 2003, .. }));
    assert_eq!(engine.handler_count(), 0);
}

#[test]
fn test_release_owner_only_touches_that_owner() {
    let (engine, _) = mock_engine(EngineConfig::default(), true);
    let mine = connect_mock(&engine, OwnerId(1));
    let theirs = connect_mock(&engine, OwnerId(2));
    engine.submit(QueryRequest::new(OwnerId(1), mine, "MINE"), &mut NoCallbacks).unwrap();
    let kept = engine
        .submit(QueryRequest::new(OwnerId(2), theirs, "THEIRS"), &mut NoCallbacks)
        .unwrap();

    engine.release_owner(OwnerId(1));

    assert_eq!(engine.handler_count(), 1);
    assert_eq!(engine.statement_count(), 1);
    assert!(matches!(engine.ping(mine), Err(EngineError::UnknownHandler(_))));
    assert_eq!(engine.ping(theirs).unwrap(), 0);
    assert_eq!(engine.fetch_by_index(kept, 0).unwrap(), "THEIRS");
}

#[test]
fn test_full_queue_rejects_without_blocking() {
    let config = EngineConfig::from_toml_str("[worker]\nqueue_capacity = 1\n").unwrap();
    let (engine, backend) = mock_engine(config, false);
    let db = connect_mock(&engine, OWNER);

    engine.submit(threaded(db, "RUNNING"), &mut NoCallbacks).unwrap();
    backend.gate.wait_for_waiters(1);
    engine.submit(threaded(db, "QUEUED"), &mut NoCallbacks).unwrap();
    let err = engine.submit(threaded(db, "REJECTED"), &mut NoCallbacks).unwrap_err();

    assert!(matches!(err, EngineError::QueueFull(_)));
    assert_eq!(engine.statement_count(), 2);

    backend.gate.open();
    engine.wait(db).unwrap();
    assert_eq!(backend.executed(), vec!["RUNNING", "QUEUED"]);
}

#[test]
fn test_rejecting_unknown_format_characters() {
    let config = EngineConfig::from_toml_str("[callbacks]\nunknown_specifier = \"reject\"\n").unwrap();
    let (engine, _) = mock_engine(config, true);
    let db = connect_mock(&engine, OWNER);

    let request = QueryRequest::new(OWNER, db, "SELECT 1").callback("OnDone", "dq").param(1).param(2);
    let err = engine.submit(request, &mut NoCallbacks).unwrap_err();

    assert!(matches!(err, EngineError::Format(_)));
    assert_eq!(engine.statement_count(), 0);
}

#[test]
fn test_config_file_drives_engine() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("tickql.toml");
    fs::write(
        &path,
        r#"[worker]
tick_ms = 5

[callbacks]
error_handler = "OnFailure"

[logging]
file = ""
console_level = "none"
"#,
    )
    .unwrap();

    let config = EngineConfig::from_path(&path).unwrap();
    assert_eq!(config.worker.tick_ms, 5);
    let (engine, _) = mock_engine(config, true);
    let db = connect_mock(&engine, OWNER);
    let mut host = RecordingHost::new(&["OnFailure"]);

    engine.submit(threaded(db, "FAIL"), &mut host).unwrap();
    engine.wait(db).unwrap();
    engine.process_tick(&mut host);
    assert_eq!(host.names(), vec!["OnFailure"]);
}

#[test]
fn test_natives_drive_a_threaded_query() {
    let engine = Engine::new(EngineConfig::default());
    let db = natives::sql_connect(&engine, OWNER, 1, "", "", "", ":memory:", 0);
    assert_eq!(db, 1);
    let mut host = RecordingHost::new(&["OnScores"]).with_hook(|engine, call| {
        if let Some(Arg::Cell(id)) = call.args.first() {
            assert_eq!(natives::sql_store_result(engine, *id), 1);
        }
    });

    let stmt = natives::sql_query(
        &engine,
        &mut host,
        OWNER,
        db,
        "SELECT 'ann' AS name, 30 AS score UNION ALL SELECT 'ben', 12",
        StatementFlags::THREADED.bits() as i32,
        "OnScores",
        "r",
        Vec::<Value>::new(),
    );
    assert_ne!(stmt, 0);
    assert_eq!(natives::sql_wait(&engine, db), 1);
    engine.process_tick(&mut host);
    assert_eq!(natives::sql_status(&engine, stmt), 2);
    assert_eq!(host.calls[0].args, vec![Arg::Cell(stmt)]);

    let mut name = String::new();
    assert_eq!(natives::sql_num_rows(&engine, stmt), 2);
    assert_eq!(natives::sql_get_field_assoc(&engine, stmt, Some(1), "name", &mut name, 32), 3);
    assert_eq!(name, "ben");
    assert_eq!(natives::sql_get_field_assoc_int(&engine, stmt, Some(0), "score"), 30);
    assert_eq!(natives::sql_free_result(&engine, stmt), 1);
    assert_eq!(natives::sql_free_result(&engine, stmt), 0);
    assert_eq!(natives::sql_disconnect(&engine, db), 1);
    assert_eq!(natives::sql_ping(&engine, db), -1);
}
