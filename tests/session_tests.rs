//! Integration tests for the session lifecycle and dispatch controller
//!
//! Everything here runs against the mock runtime, whose accounting lets the
//! tests assert that no queue, allocation or signal outlives its owner.
//! Hardware-bound behavior (real HSA dispatch) is exercised by the driver
//! binary on a ROCm machine, not here.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::tempdir;

use hsafuzz::device::predicates;
use hsafuzz::runtime::mock::{MockAgent, MockPool, MockProbe, MockRuntime};
use hsafuzz::{
    CodeLoader, DeviceClass, Dispatcher, FuzzError, KernelArg, LaunchDims, Runtime, Scan,
    SegmentClass, Session, SessionConfig, SessionState,
};

fn open_session(backend: MockRuntime) -> (Session, MockProbe, Runtime) {
    let probe = backend.probe();
    let runtime = Runtime::new(Box::new(backend)).unwrap();
    let session =
        Session::open(&runtime, predicates::accelerator, SessionConfig::default()).unwrap();
    (session, probe, runtime)
}

/// Mock code objects are symbol lists, one name per line.
fn write_artifact(dir: &std::path::Path, name: &str, symbols: &[&str]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, symbols.join("\n")).unwrap();
    path
}

#[test]
fn test_open_matches_accelerator_not_host() {
    let (session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.agent().class, DeviceClass::Accelerator);
    assert_eq!(session.agent().name, "gfx90a-mock");
    assert!(session.queue().is_some());
    assert_eq!(probe.live_queues(), 1);
}

#[test]
fn test_open_without_matching_agent_leaks_nothing() {
    let backend = MockRuntime::host_only();
    let probe = backend.probe();
    let runtime = Runtime::new(Box::new(backend)).unwrap();

    let err = Session::open(&runtime, predicates::accelerator, SessionConfig::default())
        .unwrap_err();
    assert!(matches!(err, FuzzError::AgentNotFound));
    assert_eq!(probe.live_queues(), 0);
    assert_eq!(probe.live_allocations(), 0);
}

#[test]
fn test_close_is_idempotent() {
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());
    session.allocate(4096).unwrap();

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(probe.live_queues(), 0);
    assert_eq!(probe.live_allocations(), 0);

    // Second close is a no-op.
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(probe.live_queues(), 0);
}

#[test]
fn test_allocations_tracked_and_released_on_close() {
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    let one_mib = 1024 * 1024;
    let a = session.allocate(one_mib).unwrap();
    let b = session.allocate(one_mib).unwrap();
    assert_eq!(session.tracked_buffers().len(), 2);
    assert_ne!(a.id(), b.id());
    assert_eq!(probe.live_allocations(), 2);

    session.close();
    assert_eq!(session.tracked_buffers().len(), 0);
    assert!(session.queue().is_none());
    assert_eq!(probe.live_allocations(), 0);
}

#[test]
fn test_explicit_free_stops_tracking() {
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    let buffer = session.allocate(4096).unwrap();
    session.free(buffer).unwrap();
    assert_eq!(session.tracked_buffers().len(), 0);
    assert_eq!(probe.live_allocations(), 0);

    // Freeing again is an error: the buffer is no longer tracked.
    let err = session.free(buffer).unwrap_err();
    assert!(matches!(err, FuzzError::UntrackedBuffer(_)));
}

#[test]
fn test_allocate_without_global_pool() {
    let backend = MockRuntime::new(vec![MockAgent {
        name: "groups-only".to_string(),
        class: DeviceClass::Accelerator,
        pools: vec![MockPool {
            segment: SegmentClass::Group,
            capacity: 64 * 1024,
        }],
    }]);
    let (mut session, _probe, _runtime) = open_session(backend);

    let err = session.allocate(4096).unwrap_err();
    assert!(matches!(err, FuzzError::PoolNotFound { .. }));
    assert_eq!(session.tracked_buffers().len(), 0);
}

#[test]
fn test_rejected_allocation_tracks_nothing() {
    let backend = MockRuntime::new(vec![MockAgent {
        name: "tiny".to_string(),
        class: DeviceClass::Accelerator,
        pools: vec![MockPool {
            segment: SegmentClass::Global,
            capacity: 4096,
        }],
    }]);
    let (mut session, probe, _runtime) = open_session(backend);

    let err = session.allocate(8192).unwrap_err();
    assert!(matches!(err, FuzzError::Allocation { size: 8192, .. }));
    assert_eq!(session.tracked_buffers().len(), 0);
    assert_eq!(probe.live_allocations(), 0);

    // The session stays usable for a request the pool can satisfy.
    assert!(session.allocate(2048).is_ok());
}

#[test]
fn test_load_and_dispatch_round_trip() {
    let dir = tempdir().unwrap();
    let artifact = write_artifact(dir.path(), "vector.hsaco", &["vector_add", "vector_mul"]);
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    let loader = CodeLoader::default();
    let symbol = loader.load(&mut session, &artifact, "vector_add").unwrap();
    assert_eq!(symbol.name, "vector_add");
    assert!(symbol.kernarg_segment_size > 0);

    let n = 256u32;
    let a = session.allocate(u64::from(n) * 4).unwrap();
    let b = session.allocate(u64::from(n) * 4).unwrap();
    let c = session.allocate(u64::from(n) * 4).unwrap();

    let dispatch = Dispatcher::default()
        .execute(
            &mut session,
            &symbol,
            &[
                KernelArg::buffer(&a),
                KernelArg::buffer(&b),
                KernelArg::buffer(&c),
                KernelArg::U32(n),
            ],
            LaunchDims::linear(n),
        )
        .unwrap();

    // The kernarg buffer joins the session's tracked list.
    assert_eq!(session.tracked_buffers().len(), 4);
    assert_eq!(probe.submitted(), 1);

    dispatch.wait(Duration::from_secs(1)).unwrap();
    drop(dispatch);
    session.close();
    assert_eq!(probe.live_allocations(), 0);
    assert_eq!(probe.live_signals(), 0);
    assert_eq!(probe.live_executables(), 0);
}

#[test]
fn test_misspelled_symbol_leaves_context_usable() {
    let dir = tempdir().unwrap();
    let artifact = write_artifact(dir.path(), "vector.hsaco", &["vector_add"]);
    let (mut session, _probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    let loader = CodeLoader::default();
    let id = loader.load_artifact(&mut session, &artifact).unwrap();

    let err = loader.resolve(&session, id, "vector_ad").unwrap_err();
    assert!(matches!(err, FuzzError::SymbolNotFound { .. }));

    // Frozen but still queryable with the correct name.
    assert!(session.executable(id).unwrap().is_frozen());
    let symbol = loader.resolve(&session, id, "vector_add").unwrap();
    assert_eq!(symbol.name, "vector_add");
}

#[test]
fn test_artifact_found_via_device_fallback() {
    let dir = tempdir().unwrap();
    let device_dir = dir.path().join("gfx90a-mock");
    fs::create_dir(&device_dir).unwrap();
    write_artifact(&device_dir, "fallback.hsaco", &["vector_add"]);

    let (mut session, _probe, _runtime) = open_session(MockRuntime::host_and_accelerator());
    let loader = CodeLoader::default();

    // Primary path is missing; the device-qualified sibling is found.
    let primary = dir.path().join("fallback.hsaco");
    let id = loader.load_artifact(&mut session, &primary).unwrap();
    let resolved = session.executable(id).unwrap().artifact().to_path_buf();
    assert!(resolved.ends_with("gfx90a-mock/fallback.hsaco"));
}

#[test]
fn test_missing_artifact() {
    let dir = tempdir().unwrap();
    let (mut session, _probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    let err = CodeLoader::default()
        .load_artifact(&mut session, &dir.path().join("absent.hsaco"))
        .unwrap_err();
    assert!(matches!(err, FuzzError::ArtifactNotFound { .. }));

    // A failed load does not tear the session down.
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_zero_timeout_wait_reports_timeout() {
    let dir = tempdir().unwrap();
    let artifact = write_artifact(dir.path(), "vector.hsaco", &["vector_add"]);
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());
    probe.hold_completions(true);

    let symbol = CodeLoader::default()
        .load(&mut session, &artifact, "vector_add")
        .unwrap();
    let dispatch = Dispatcher::default()
        .execute(&mut session, &symbol, &[KernelArg::U32(1)], LaunchDims::default())
        .unwrap();

    let err = dispatch.wait(Duration::ZERO).unwrap_err();
    assert!(matches!(err, FuzzError::Timeout(_)));

    // Buffers referenced by the pending dispatch stay tracked.
    assert_eq!(session.tracked_buffers().len(), 1);

    probe.complete_all();
    dispatch.wait(Duration::ZERO).unwrap();
}

#[test]
fn test_kernarg_overflow_is_reportable_and_submits_nothing() {
    let dir = tempdir().unwrap();
    let artifact = write_artifact(dir.path(), "vector.hsaco", &["vector_add"]);
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());
    probe.set_kernarg_layout(8, 8);

    let symbol = CodeLoader::default()
        .load(&mut session, &artifact, "vector_add")
        .unwrap();
    let err = Dispatcher::default()
        .execute(
            &mut session,
            &symbol,
            &[KernelArg::U64(1), KernelArg::U64(2)],
            LaunchDims::default(),
        )
        .unwrap_err();

    assert!(matches!(err, FuzzError::KernargLayout(_)));
    assert_eq!(probe.submitted(), 0);
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_submission_failure_is_session_fatal() {
    let dir = tempdir().unwrap();
    let artifact = write_artifact(dir.path(), "vector.hsaco", &["vector_add"]);
    let (mut session, probe, _runtime) = open_session(MockRuntime::host_and_accelerator());

    let symbol = CodeLoader::default()
        .load(&mut session, &artifact, "vector_add")
        .unwrap();
    probe.fail_next_submit();

    let err = Dispatcher::default()
        .execute(&mut session, &symbol, &[KernelArg::U32(1)], LaunchDims::default())
        .unwrap_err();
    assert!(matches!(err, FuzzError::Submission(_)));
    assert!(err.is_session_fatal());
    assert_eq!(session.state(), SessionState::Closing);

    // No further work is accepted; teardown still completes.
    assert!(matches!(
        session.allocate(4096).unwrap_err(),
        FuzzError::SessionClosed
    ));
    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(probe.live_allocations(), 0);
    assert_eq!(probe.live_queues(), 0);
}

#[test]
fn test_runtime_shuts_down_after_last_owner() {
    let backend = MockRuntime::host_and_accelerator();
    let probe = backend.probe();
    let runtime = Runtime::new(Box::new(backend)).unwrap();
    assert_eq!(probe.init_count(), 1);

    let mut session =
        Session::open(&runtime, predicates::accelerator, SessionConfig::default()).unwrap();
    session.close();
    assert_eq!(probe.shutdown_count(), 0, "driver still owns the runtime");

    drop(runtime);
    drop(session);
    assert_eq!(probe.shutdown_count(), 1);
}

#[test]
fn test_drop_closes_session() {
    let backend = MockRuntime::host_and_accelerator();
    let probe = backend.probe();
    let runtime = Runtime::new(Box::new(backend)).unwrap();
    {
        let mut session =
            Session::open(&runtime, predicates::accelerator, SessionConfig::default()).unwrap();
        session.allocate(4096).unwrap();
        // Dropped without an explicit close().
    }
    assert_eq!(probe.live_queues(), 0);
    assert_eq!(probe.live_allocations(), 0);
}

#[test]
fn test_predicate_stop_is_not_found() {
    let backend = MockRuntime::host_and_accelerator();
    let runtime = Runtime::new(Box::new(backend)).unwrap();

    let err = Session::open(&runtime, |_| Scan::Stop, SessionConfig::default()).unwrap_err();
    assert!(matches!(err, FuzzError::AgentNotFound));
}
