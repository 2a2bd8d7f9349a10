use plbridge::{
    BridgeConfig, BridgeErrorCode, CursorOptions, CursorState, HandleKind, MockHost, Session,
    Value,
};
use proptest::prelude::*;
use std::sync::Arc;

fn session_over(rows: i64, config: BridgeConfig) -> (Arc<MockHost>, Session) {
    let host = Arc::new(MockHost::new().with_series("select n from series", rows));
    let session = Session::open(host.clone(), config).expect("open session");
    (host, session)
}

#[test]
fn test_limit_and_batch_drive_fetch_count() {
    let (host, session) = session_over(10, BridgeConfig::default());
    let plan = session.prepare("select n from series", &[]).expect("prepare");
    let mut cursor = session
        .open_cursor(
            &plan,
            &[],
            CursorOptions::named("c1").with_row_limit(5).with_batch_size(2),
        )
        .expect("open cursor");
    assert_eq!(cursor.name(), "c1");
    assert_eq!(cursor.columns(), ["n".to_string()]);

    let mut advances = 0;
    while cursor.next().expect("next") {
        advances += 1;
        assert_eq!(cursor.get(0).expect("n"), &Value::Int(advances));
    }
    assert_eq!(advances, 5);
    for _ in 0..5 {
        assert!(!cursor.next().expect("still exhausted"));
    }
    assert_eq!(host.fetch_calls(), 3);
    assert_eq!(session.metrics().cursor_fetches, 3);
}

#[test]
fn test_session_batch_size_is_the_default() {
    let (host, session) =
        session_over(7, BridgeConfig::default().with_cursor_batch_size(3));
    let plan = session.prepare("select n from series", &[]).expect("prepare");
    let mut cursor = session
        .open_cursor(&plan, &[], CursorOptions::default())
        .expect("open cursor");
    assert!(cursor.name().starts_with("<unnamed portal"));
    let mut rows = 0;
    while cursor.next().expect("next") {
        rows += 1;
    }
    assert_eq!(rows, 7);
    // 3 + 3 + 1, the short batch ends the data.
    assert_eq!(host.fetch_calls(), 3);
}

#[test]
fn test_scope_end_closes_cursor() {
    let (host, session) = session_over(10, BridgeConfig::default());
    session.begin().expect("begin");
    let plan = session.prepare("select n from series", &[]).expect("prepare");
    let mut cursor = session
        .open_cursor(&plan, &[], CursorOptions::default().with_batch_size(2))
        .expect("open cursor");
    assert!(cursor.next().expect("next"));
    assert_eq!(cursor.state(), CursorState::Fetching);

    session.abort().expect("abort");
    assert_eq!(cursor.state(), CursorState::Closed);
    let fetches = host.fetch_calls();
    let err = cursor.next().expect_err("closed by scope end");
    assert_eq!(err.code(), BridgeErrorCode::StaleHandle);
    assert_eq!(host.fetch_calls(), fetches);
    assert!(!cursor.close());
    assert_eq!(host.live_allocations_of(HandleKind::Portal), 0);
    assert!(host.violations().is_empty(), "{:?}", host.violations());
}

#[test]
fn test_dropped_cursor_releases_portal_on_next_entry() {
    let (host, session) = session_over(10, BridgeConfig::default());
    let plan = session.prepare("select n from series", &[]).expect("prepare");
    let cursor = session
        .open_cursor(&plan, &[], CursorOptions::default())
        .expect("open cursor");
    drop(cursor);
    assert_eq!(host.live_allocations_of(HandleKind::Portal), 1);
    assert_eq!(session.pending_reclaims(), 1);
    let stats = session.drain_and_reclaim().expect("drain");
    assert_eq!(stats.released, 1);
    assert_eq!(host.live_allocations_of(HandleKind::Portal), 0);
}

#[test]
fn test_fetch_failure_surfaces_native_error() {
    let (host, session) = session_over(10, BridgeConfig::default());
    let plan = session.prepare("select n from series", &[]).expect("prepare");
    let mut cursor = session
        .open_cursor(&plan, &[], CursorOptions::default())
        .expect("open cursor");
    host.fail_next_call("57014", "canceling statement due to user request");
    let err = cursor.next().expect_err("fetch fails");
    assert_eq!(err.code(), BridgeErrorCode::Native);
    assert_eq!(err.sqlstate(), Some("57014"));
    let blocked = cursor.next().expect_err("blocked");
    assert_eq!(blocked.code(), BridgeErrorCode::UnhandledError);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn cursor_never_exceeds_limit_and_stops_fetching(
        rows in 0i64..40,
        limit in proptest::option::of(0u64..50),
        batch in 0usize..8,
    ) {
        let (host, session) = session_over(rows, BridgeConfig::default());
        let plan = session.prepare("select n from series", &[]).expect("prepare");
        let mut options = CursorOptions::default().with_batch_size(batch);
        options.row_limit = limit;
        let mut cursor = session.open_cursor(&plan, &[], options).expect("open cursor");

        let mut returned = 0u64;
        while cursor.next().expect("next") {
            returned += 1;
            prop_assert!(returned <= limit.unwrap_or(u64::MAX));
        }
        let expected = if batch == 0 {
            0
        } else {
            (rows as u64).min(limit.unwrap_or(u64::MAX))
        };
        prop_assert_eq!(returned, expected);

        let fetches = host.fetch_calls();
        prop_assert!(!cursor.next().expect("after end"));
        prop_assert_eq!(host.fetch_calls(), fetches);
        prop_assert_eq!(cursor.state(), CursorState::Exhausted);
    }
}
