//! Dispatch loop tests against a scripted artifact.

mod support;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use support::{init_tracing, ScriptedArtifact, AWAIT, GET, SLEEP};
use tern_host::{
    CancellationSource, CancellationToken, HandlerError, HandlerRegistry, HostConfig, HostRuntime,
    RunError, RunOutcome, Scalar,
};

fn runtime(handlers: HandlerRegistry) -> HostRuntime {
    init_tracing();
    HostRuntime::new(HostConfig::default(), handlers)
}

fn last_resumed(resumed: &[Scalar]) -> Scalar {
    resumed.last().copied().unwrap_or(Scalar::Unit)
}

fn contract_message(err: RunError) -> String {
    match err {
        RunError::Contract { message, .. } => message,
        other => panic!("expected a contract violation, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resume_handler_increments() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |call, k| async move {
        Ok(Some(k.resume(call.arg(0)? + 1)))
    });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![3]);

    let outcome = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Scalar::Int(4)));
    assert_eq!(artifact.resumed, vec![Scalar::Int(4)]);
}

#[tokio::test]
async fn test_sequential_requests_share_host_state() {
    let total = Arc::new(AtomicI32::new(0));
    let events = Arc::new(Mutex::new(Vec::new()));

    let mut handlers = HandlerRegistry::new();
    {
        let total = Arc::clone(&total);
        let events = Arc::clone(&events);
        handlers.on("Async.await", move |call, k| {
            let total = Arc::clone(&total);
            let events = Arc::clone(&events);
            async move {
                let v = call.arg(0)?;
                events.lock().push(format!("start {v}"));
                tokio::task::yield_now().await;
                let running = total.fetch_add(v, Ordering::SeqCst) + v;
                events.lock().push(format!("end {v}"));
                Ok(Some(k.resume(running)))
            }
        });
    }

    // The second argument depends on the first resume, so the artifact
    // must have been resumed before the second request exists.
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed)
        .perform(AWAIT, |_| vec![5])
        .perform(AWAIT, |resumed| {
            assert_eq!(resumed, &[Scalar::Int(5)]);
            vec![10]
        });

    let (outcome, stats) = runtime(handlers)
        .run_with_stats(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Scalar::Int(15)));
    assert_eq!(total.load(Ordering::SeqCst), 15);
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.resumes, 2);
    assert_eq!(*events.lock(), vec!["start 5", "end 5", "start 10", "end 10"]);
}

#[tokio::test]
async fn test_tail_handler_with_tail_action() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("State.get", |_, k| async move { Ok(Some(k.tail(7))) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(GET, |_| vec![]);

    let outcome = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Scalar::Int(7)));
}

#[tokio::test]
async fn test_tail_action_on_resume_op_is_rejected() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |_, k| async move { Ok(Some(k.tail(1))) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![3]);

    let err = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot return tail"));
    assert_eq!(contract_message(err), "cannot return tail");
    assert_eq!(artifact.resume_calls, 0);
}

#[tokio::test]
async fn test_resume_action_on_tail_op_is_rejected() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("State.get", |_, k| async move { Ok(Some(k.resume(1))) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(GET, |_| vec![]);

    let err = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(contract_message(err), "must return tail");
    assert_eq!(artifact.resume_calls, 0);
}

#[tokio::test]
async fn test_handler_without_action_is_rejected() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |_, _k| async move { Ok(None) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![3]);

    let err = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(contract_message(err), "must return a continuation call");
}

#[tokio::test]
async fn test_end_is_legal_for_both_kinds() {
    for op in [AWAIT, GET] {
        let mut handlers = HandlerRegistry::new();
        handlers.on_op(op, |_, k| async move { Ok(Some(k.end(42))) });
        let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed)
            .perform(op, |_| vec![])
            .perform(AWAIT, |_| vec![]);

        let outcome = runtime(handlers)
            .run(&mut artifact, "main", &[], &CancellationToken::default())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Ended(Scalar::Int(42)));
        assert_eq!(artifact.resume_calls, 0);
    }
}

#[tokio::test]
async fn test_cancellation_before_resume_aborts() {
    let source = Arc::new(CancellationSource::new());
    let token = source.token();

    let mut handlers = HandlerRegistry::new();
    {
        let source = Arc::clone(&source);
        handlers.on("Async.await", move |call, k| {
            let source = Arc::clone(&source);
            async move {
                source.cancel_with_reason("test shutdown");
                Ok(Some(k.resume(call.arg(0)?)))
            }
        });
    }
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![3]);

    let outcome = runtime(handlers)
        .run(&mut artifact, "main", &[], &token)
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Aborted);
    assert_eq!(artifact.resume_calls, 0);
}

#[tokio::test]
async fn test_unperformed_op_needs_no_handler() {
    // `Async.sleep` and `State.get` are in the table but never performed.
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |call, k| async move { Ok(Some(k.resume(call.arg(0)?))) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![9]);

    let outcome = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Scalar::Int(9)));

    let mut pure = ScriptedArtifact::new("main", 4096, |_: &[Scalar]| Scalar::Bool(true));
    let outcome = runtime(HandlerRegistry::new())
        .run(&mut pure, "main", &[], &CancellationToken::default())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Scalar::Bool(true)));
}

#[tokio::test]
async fn test_missing_handler_fails_the_run() {
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(SLEEP, |_| vec![10]);
    let err = runtime(HandlerRegistry::new())
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RunError::MissingHandler {
            op_index: SLEEP,
            op: "Async.sleep".into()
        }
    );
}

#[tokio::test]
async fn test_request_overflow_is_reported() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |call, k| async move { Ok(Some(k.resume(call.arg(0)?))) });
    // A request with one argument needs 36 bytes.
    let mut artifact = ScriptedArtifact::new("main", 32, last_resumed).perform(AWAIT, |_| vec![1]);
    let config = HostConfig::builder().exchange_capacity(32).build().unwrap();

    let err = HostRuntime::new(config, handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(err, RunError::Overflow { capacity: 32 });
    assert!(err.to_string().contains("encoding overflow"));
}

#[tokio::test]
async fn test_handler_error_propagates() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |_, _k| async move { Err(HandlerError::failed("backend unavailable")) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![1]);

    let err = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(err, RunError::Handler(HandlerError::failed("backend unavailable")));
    assert_eq!(artifact.resume_calls, 0);
}

#[tokio::test]
async fn test_request_limit() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |call, k| async move { Ok(Some(k.resume(call.arg(0)?))) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed)
        .perform(AWAIT, |_| vec![1])
        .perform(AWAIT, |_| vec![2]);
    let config = HostConfig::builder().max_requests(Some(1)).build().unwrap();

    let err = HostRuntime::new(config, handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(err, RunError::RequestLimit { limit: 1 });
    assert_eq!(artifact.resume_calls, 1);
}

#[tokio::test]
async fn test_request_outside_table_is_a_mismatch() {
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(9, |_| vec![]);
    let err = runtime(HandlerRegistry::new())
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::TableMismatch(_)));
}

#[tokio::test]
async fn test_unknown_entry_and_handler_keys() {
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed);
    let err = runtime(HandlerRegistry::new())
        .run(&mut artifact, "start", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no export `start`"));

    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.wait", |_, k| async move { Ok(Some(k.end(0))) });
    let err = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(err, RunError::UnknownOperation("Async.wait".into()));
}

#[tokio::test]
async fn test_reference_resume_value_is_rejected() {
    let mut handlers = HandlerRegistry::new();
    handlers.on("Async.await", |_, k| async move { Ok(Some(k.resume(Scalar::Ref))) });
    let mut artifact = ScriptedArtifact::new("main", 4096, last_resumed).perform(AWAIT, |_| vec![1]);

    let err = runtime(handlers)
        .run(&mut artifact, "main", &[], &CancellationToken::default())
        .await
        .unwrap_err();
    assert_eq!(err, RunError::UnsupportedResumeValue(Scalar::Ref));
    assert_eq!(artifact.resume_calls, 0);
}
