//! End-to-end tool invocation through the controller
//!
//! Covers the invoker against real `echo-worker` processes over both
//! transports, including every failure a misbehaving worker can cause.
//!
//! The default-timeout test waits the full 30 seconds; it is `#[serial]` so
//! it doesn't compete with other slow tests for the runtime.

use mcpswitch::process::LifecycleController;
use mcpswitch::{Settings, ToolInvoker, WorkerConfig, WorkerConfigSet, WorkerError};
use serde_json::{json, Map, Value};
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ECHO_WORKER: &str = env!("CARGO_BIN_EXE_echo-worker");

fn setup(workers: Vec<WorkerConfig>, settings: Settings) -> (Arc<LifecycleController>, ToolInvoker) {
    let configs = WorkerConfigSet::new(workers, None).expect("valid worker set");
    let controller = Arc::new(LifecycleController::new(configs, settings));
    let invoker = ToolInvoker::new(controller.clone(), settings.invocation_timeout);
    (controller, invoker)
}

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("arguments must be an object, got {other}"),
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let result = invoker
        .invoke("echo", args(json!({ "message": "hi" })))
        .await
        .unwrap();
    assert_eq!(result["echoed_message"], "hi");
    assert_eq!(result["server"], "echo-worker");

    let sum = invoker
        .invoke("add", args(json!({ "a": 2, "b": 3.5 })))
        .await
        .unwrap();
    assert_eq!(sum["sum"], json!(5.5));

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_sequential_calls_stay_correlated() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    for i in 0..20 {
        let message = format!("message {i}");
        let result = invoker
            .invoke("echo", args(json!({ "message": message })))
            .await
            .unwrap();
        assert_eq!(result["echoed_message"], json!(message));
    }

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_invoke_without_active_worker() {
    let (_c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );

    let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::NoActiveWorker));
}

#[tokio::test]
async fn test_invoke_after_active_worker_stopped() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();
    c.stop("echo").await.unwrap();

    let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::NoActiveWorker));
}

#[tokio::test]
async fn test_remote_error_is_surfaced() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let err = invoker.invoke("no_such_tool", Map::new()).await.unwrap_err();
    match err {
        WorkerError::Remote { message } => assert!(message.contains("Unknown tool")),
        other => panic!("expected remote error, got {other:?}"),
    }

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_crash_mid_call_is_disconnect() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let started = Instant::now();
    let err = invoker.invoke("crash", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::WorkerDisconnected(ref n) if n == "echo"));
    assert!(started.elapsed() < Duration::from_secs(5), "no waiting for the timeout");

    // Once the exit is observed, the active worker is reported as gone
    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
        if matches!(err, WorkerError::WorkerNotRunning(_)) || Instant::now() >= deadline {
            break err;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert!(matches!(err, WorkerError::WorkerNotRunning(ref n) if n == "echo"));
}

#[tokio::test]
async fn test_unparsable_reply_is_malformed() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let err = invoker.invoke("garbage", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::MalformedResponse { .. }));

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_mismatched_id_is_malformed() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let err = invoker.invoke("wrong_id", Map::new()).await.unwrap_err();
    match err {
        WorkerError::MalformedResponse { worker, .. } => assert_eq!(worker, "echo"),
        other => panic!("expected malformed response, got {other:?}"),
    }

    // The channel stays usable for the next call
    let ok = invoker
        .invoke("echo", args(json!({ "message": "still here" })))
        .await
        .unwrap();
    assert_eq!(ok["echoed_message"], "still here");

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_short_timeout_then_recovery() {
    let settings = Settings {
        invocation_timeout: Duration::from_millis(300),
        ..Settings::default()
    };
    let (c, invoker) = setup(vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])], settings);
    c.switch_to("echo").await.unwrap();

    let err = invoker
        .invoke("sleep", args(json!({ "ms": 1000 })))
        .await
        .unwrap_err();
    match err {
        WorkerError::InvocationTimeout { worker, timeout, .. } => {
            assert_eq!(worker, "echo");
            assert_eq!(timeout, Duration::from_millis(300));
        }
        other => panic!("expected timeout, got {other:?}"),
    }

    // The late reply to the abandoned call must not be mistaken for this one
    tokio::time::sleep(Duration::from_millis(900)).await;
    let ok = invoker
        .invoke("echo", args(json!({ "message": "after" })))
        .await
        .unwrap();
    assert_eq!(ok["echoed_message"], "after");

    c.shutdown_all().await;
}

#[tokio::test]
#[serial]
async fn test_silent_worker_times_out_after_default_timeout() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("mute", ECHO_WORKER, &["--silent"])],
        Settings::default(),
    );
    assert_eq!(invoker.timeout(), Duration::from_secs(30));
    c.switch_to("mute").await.unwrap();

    let started = Instant::now();
    let err = invoker
        .invoke("echo", args(json!({ "message": "hello?" })))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, WorkerError::InvocationTimeout { .. }));
    assert!(elapsed >= Duration::from_secs(30), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(31), "overran: {elapsed:?}");

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_initialize_and_read_resource() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let caps = invoker.initialize().await.unwrap();
    let tools = caps.tool_names();
    assert!(tools.contains(&"echo"));
    assert!(tools.contains(&"add"));
    assert_eq!(caps.resources.len(), 1);

    let resource = invoker.read_resource("echo://status").await.unwrap();
    assert_eq!(resource["uri"], "echo://status");

    let err = invoker.call("prompts/get", None).await.unwrap_err();
    assert!(matches!(err, WorkerError::Remote { .. }));

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_switch_routes_calls_to_new_worker() {
    let (c, invoker) = setup(
        vec![
            WorkerConfig::stdio("first", ECHO_WORKER, &[]),
            WorkerConfig::stdio("second", ECHO_WORKER, &["--silent"]),
        ],
        Settings {
            invocation_timeout: Duration::from_millis(500),
            ..Settings::default()
        },
    );

    c.switch_to("first").await.unwrap();
    assert!(invoker.invoke("echo", Map::new()).await.is_ok());

    c.switch_to("second").await.unwrap();
    let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::InvocationTimeout { ref worker, .. } if worker == "second"));

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_network_worker_round_trip() {
    let port = free_port();
    let listen = format!("127.0.0.1:{port}");
    let (c, invoker) = setup(
        vec![WorkerConfig::network(
            "net",
            ECHO_WORKER,
            &["--listen", &listen],
            "127.0.0.1",
            port,
        )],
        Settings::default(),
    );
    c.switch_to("net").await.unwrap();

    let result = invoker
        .invoke("echo", args(json!({ "message": "over tcp" })))
        .await
        .unwrap();
    assert_eq!(result["echoed_message"], "over tcp");

    let outcome = c.stop("net").await.unwrap();
    assert!(matches!(outcome, mcpswitch::StopOutcome::Exited { .. }));
}

#[tokio::test]
async fn test_network_worker_unreachable() {
    let port = free_port();
    // The worker listens somewhere other than the configured port
    let elsewhere = format!("127.0.0.1:{}", free_port());
    let (c, invoker) = setup(
        vec![WorkerConfig::network(
            "net",
            ECHO_WORKER,
            &["--listen", &elsewhere],
            "127.0.0.1",
            port,
        )],
        Settings {
            invocation_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(500),
        },
    );
    c.switch_to("net").await.unwrap();

    let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::ConnectFailed { .. }));

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_stop_lets_in_flight_call_finish() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let call = {
        let invoker = invoker.clone();
        tokio::spawn(async move { invoker.invoke("sleep", args(json!({ "ms": 500 }))).await })
    };
    // Let the request reach the worker before stopping it
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = c.stop("echo").await.unwrap();
    let result = call.await.unwrap().unwrap();

    assert_eq!(result["slept_ms"], 500);
    assert!(matches!(outcome, mcpswitch::StopOutcome::Exited { .. }));
    assert!(!c.status_of("echo").is_running());
}

#[tokio::test]
async fn test_concurrent_calls_on_one_worker_get_their_own_results() {
    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();

    let (first, second) = tokio::join!(
        invoker.invoke("echo", args(json!({ "message": "first" }))),
        invoker.invoke("echo", args(json!({ "message": "second" }))),
    );

    assert_eq!(first.unwrap()["echoed_message"], "first");
    assert_eq!(second.unwrap()["echoed_message"], "second");

    c.shutdown_all().await;
}

#[tokio::test]
async fn test_stop_waiting_on_slow_call_does_not_block_other_workers() {
    let (c, invoker) = setup(
        vec![
            WorkerConfig::stdio("a", ECHO_WORKER, &[]),
            WorkerConfig::stdio("b", ECHO_WORKER, &[]),
        ],
        Settings::default(),
    );
    c.switch_to("a").await.unwrap();

    let call = {
        let invoker = invoker.clone();
        tokio::spawn(async move { invoker.invoke("sleep", args(json!({ "ms": 3000 }))).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stop = {
        let c = c.clone();
        tokio::spawn(async move { c.stop("a").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    c.start("b").await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "start(b) waited {:?} behind stop(a)",
        started.elapsed()
    );

    // A worker being stopped can't be revived half-way
    let err = c.switch_to("a").await.unwrap_err();
    assert!(matches!(err, WorkerError::Stopping(ref n) if n == "a"));

    assert!(call.await.unwrap().is_ok());
    assert!(matches!(
        stop.await.unwrap().unwrap(),
        mcpswitch::StopOutcome::Exited { .. }
    ));

    c.shutdown_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_on_reaped_active_worker_clears_active() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let (c, invoker) = setup(
        vec![WorkerConfig::stdio("echo", ECHO_WORKER, &[])],
        Settings::default(),
    );
    c.switch_to("echo").await.unwrap();
    let pid = c.status_of("echo").pid().unwrap();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while c.status_of("echo").is_running() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(c.current_active().as_deref(), Some("echo"));

    let err = c.stop("echo").await.unwrap_err();
    assert!(matches!(err, WorkerError::NotRunning(ref n) if n == "echo"));
    assert_eq!(c.current_active(), None);

    let err = invoker.invoke("echo", Map::new()).await.unwrap_err();
    assert!(matches!(err, WorkerError::NoActiveWorker));
}
