//! Engine behaviour against recording test doubles for the supervisor and
//! the ingress client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request as HttpRequest, StatusCode};
use fold_manifest::{HttpMethod, Manifest, Route, Version};
use fold_runtime::addr::SOCK_ADDR_ENV;
use fold_runtime::fsm::FsmError;
use fold_runtime::ingress::IngressClient;
use fold_runtime::supervisor::{Supervisor, SupervisorFactory, SupervisorStatus};
use fold_runtime::transport::{Request, Response};
use fold_runtime::{
    CrashPolicy, Event, ExitReason, IngressError, Runtime, RuntimeConfig, State, SupervisorError,
};
use nix::sys::signal::Signal;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Code(i32),
    Signal(i32),
}

struct FakeSupervisor {
    trace: Trace,
    fail_start: bool,
    started: AtomicBool,
    exit: watch::Sender<Option<Exit>>,
}

impl FakeSupervisor {
    fn exit_with(&self, exit: Exit) {
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn start(&self) -> Result<(), SupervisorError> {
        self.trace.push("supervisor.start");
        if self.fail_start {
            return Err(SupervisorError::SpawnFailed {
                command: "fake-worker".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        self.trace.push("supervisor.stop");
        if self.started.load(Ordering::SeqCst) {
            self.exit_with(Exit::Signal(Signal::SIGTERM as i32));
        }
        Ok(())
    }

    fn kill(&self) -> Result<(), SupervisorError> {
        self.trace.push("supervisor.kill");
        self.exit_with(Exit::Signal(Signal::SIGKILL as i32));
        Ok(())
    }

    fn signal(&self, signal: Signal) -> Result<(), SupervisorError> {
        self.trace.push(format!("supervisor.signal {}", signal.as_str()));
        self.exit_with(Exit::Signal(signal as i32));
        Ok(())
    }

    async fn wait(&self) -> Result<(), SupervisorError> {
        let mut exit = self.exit.subscribe();
        let exit = match exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(Exit::Code(0)),
            Err(_) => Exit::Code(0),
        };
        match exit {
            Exit::Code(0) => Ok(()),
            Exit::Code(code) => Err(SupervisorError::Crashed { code: Some(code) }),
            Exit::Signal(sig) => Err(SupervisorError::TerminatedBySignal(sig)),
        }
    }

    fn status(&self) -> SupervisorStatus {
        match *self.exit.borrow() {
            None if self.started.load(Ordering::SeqCst) => SupervisorStatus::Running,
            None => SupervisorStatus::NotStarted,
            Some(Exit::Code(code)) if code != 0 => SupervisorStatus::Crashed,
            Some(_) => SupervisorStatus::Complete,
        }
    }
}

#[derive(Clone, Default)]
struct FakeFactory {
    trace: Trace,
    fail_start: Arc<AtomicBool>,
    spawned: Arc<Mutex<Vec<Arc<FakeSupervisor>>>>,
    envs: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
}

impl FakeFactory {
    fn latest(&self) -> Arc<FakeSupervisor> {
        self.spawned.lock().unwrap().last().cloned().expect("a supervisor was created")
    }

    fn spawned(&self) -> Vec<Arc<FakeSupervisor>> {
        self.spawned.lock().unwrap().clone()
    }
}

impl SupervisorFactory for FakeFactory {
    fn create(&self, env: BTreeMap<String, String>) -> Arc<dyn Supervisor> {
        let (exit, _) = watch::channel(None);
        let supervisor = Arc::new(FakeSupervisor {
            trace: self.trace.clone(),
            fail_start: self.fail_start.load(Ordering::SeqCst),
            started: AtomicBool::new(false),
            exit,
        });
        self.spawned.lock().unwrap().push(supervisor.clone());
        self.envs.lock().unwrap().push(env);
        supervisor
    }
}

#[derive(Default)]
struct FakeClient {
    trace: Trace,
    fail_dial: AtomicBool,
    fail_manifest: AtomicBool,
    fetches: AtomicU32,
    extra_routes: Mutex<Vec<Route>>,
}

#[async_trait]
impl IngressClient for FakeClient {
    async fn start(&self, _addr: &std::path::Path, _deadline: Instant) -> Result<(), IngressError> {
        self.trace.push("client.start");
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(IngressError::Timeout);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), IngressError> {
        self.trace.push("client.stop");
        Ok(())
    }

    async fn get_manifest(&self) -> Result<Manifest, IngressError> {
        self.trace.push("client.get_manifest");
        if self.fail_manifest.load(Ordering::SeqCst) {
            return Err(IngressError::Remote("manifest unavailable".to_string()));
        }
        let patch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let mut manifest =
            Manifest::new("fake").with_route(Route::new(HttpMethod::Get, "hello", "/hello/:name"));
        manifest.routes.extend(self.extra_routes.lock().unwrap().iter().cloned());
        manifest.version = Version {
            major: 1,
            minor: 0,
            patch,
        };
        Ok(manifest)
    }

    async fn do_request(&self, request: Request) -> Result<Response, IngressError> {
        Ok(Response::json(
            200,
            &json!({ "route": request.route, "params": request.path_params }),
        ))
    }
}

struct Harness {
    runtime: Runtime,
    factory: FakeFactory,
    client: Arc<FakeClient>,
    trace: Trace,
}

fn harness(policy: CrashPolicy) -> Harness {
    let trace = Trace::default();
    let factory = FakeFactory {
        trace: trace.clone(),
        ..FakeFactory::default()
    };
    let client = Arc::new(FakeClient {
        trace: trace.clone(),
        ..FakeClient::default()
    });
    let mut config = RuntimeConfig::new("fake-worker", Vec::new());
    config.crash_policy = policy;
    let runtime = Runtime::builder(config)
        .supervisor_factory(Arc::new(factory.clone()))
        .ingress_client(client.clone())
        .build()
        .expect("runtime");
    Harness {
        runtime,
        factory,
        client,
        trace,
    }
}

async fn get(runtime: &Runtime, path: &str) -> (StatusCode, Value) {
    let request = HttpRequest::builder()
        .uri(path)
        .body(Body::empty())
        .expect("request");
    let response = runtime.handle(request).await;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&body).expect("json body"))
}

async fn wait_for_state(runtime: &Runtime, want: State) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while runtime.state() != want {
        assert!(Instant::now() < deadline, "state stuck at {:?}, wanted {want:?}", runtime.state());
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_done(runtime: &Runtime) -> ExitReason {
    tokio::time::timeout(Duration::from_secs(5), runtime.wait_done())
        .await
        .expect("runtime should exit")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_fetches_manifest_and_serves_it() {
    let h = harness(CrashPolicy::Exit);
    assert_eq!(h.runtime.state(), State::Down);
    assert!(h.runtime.manifest().is_none());

    assert_eq!(h.runtime.start().await, State::Up);
    assert_eq!(
        h.trace.take(),
        vec!["supervisor.start", "client.start", "client.get_manifest"]
    );
    let manifest = h.runtime.manifest().expect("manifest while up");
    assert_eq!(manifest.version.patch, 1);

    let envs = h.factory.envs.lock().unwrap().clone();
    let addr = envs[0].get(SOCK_ADDR_ENV).expect("socket address in env");
    assert!(addr.ends_with(".sock"), "got {addr}");

    let (status, body) = get(&h.runtime, "/hello/ada").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["route"], "/hello/:name");
    assert_eq!(body["params"]["name"], "ada");
}

#[tokio::test]
async fn file_change_restarts_in_teardown_then_startup_order() {
    let h = harness(CrashPolicy::Exit);
    h.runtime.start().await;
    h.trace.take();

    tokio_test::assert_ok!(h.runtime.emit(Event::FileChange).await);
    assert_eq!(
        h.trace.take(),
        vec![
            "client.stop",
            "supervisor.stop",
            "supervisor.start",
            "client.start",
            "client.get_manifest",
        ]
    );
    assert_eq!(h.runtime.state(), State::Up);
    assert_eq!(h.runtime.manifest().expect("manifest").version.patch, 2);

    let spawned = h.factory.spawned();
    assert_eq!(spawned.len(), 2);
    assert!(spawned[0].status().is_terminal());
    assert_eq!(spawned[1].status(), SupervisorStatus::Running);

    // The old worker's exit belongs to a torn-down cycle and must not stop
    // the runtime.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.runtime.state(), State::Up);
}

#[tokio::test]
async fn file_change_while_down_starts_the_worker() {
    let h = harness(CrashPolicy::KeepAlive);
    assert_eq!(h.runtime.emit(Event::FileChange).await.expect("emit"), State::Up);
    assert_eq!(
        h.trace.take(),
        vec!["supervisor.start", "client.start", "client.get_manifest"]
    );
}

#[tokio::test]
async fn stop_exits_and_later_events_are_ignored() {
    let h = harness(CrashPolicy::Exit);
    h.runtime.start().await;
    h.trace.take();

    assert_eq!(h.runtime.stop().await, State::Exited);
    assert_eq!(h.trace.take(), vec!["client.stop", "supervisor.stop"]);
    assert_eq!(wait_done(&h.runtime).await, ExitReason::Stopped);

    let (status, body) = get(&h.runtime, "/hello/ada").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["title"], "Service is shutting down");

    assert_eq!(h.runtime.emit(Event::Stop).await.expect("second stop"), State::Exited);
    assert_eq!(h.runtime.emit(Event::Start).await.expect("start after exit"), State::Exited);
    assert!(h.trace.take().is_empty(), "no side effects after exit");
}

#[tokio::test]
async fn stop_while_down_exits_without_touching_the_worker() {
    let h = harness(CrashPolicy::Exit);
    assert_eq!(h.runtime.stop().await, State::Exited);
    assert!(h.trace.take().is_empty());
    assert_eq!(wait_done(&h.runtime).await, ExitReason::Stopped);
}

#[tokio::test]
async fn undefined_transition_leaves_state_unchanged() {
    let h = harness(CrashPolicy::Exit);
    let err = tokio_test::assert_err!(h.runtime.emit(Event::Crash).await);
    assert_eq!(
        err,
        FsmError::NoSuchTransition {
            from: State::Down,
            event: Event::Crash,
        }
    );
    assert_eq!(h.runtime.state(), State::Down);
    assert!(h.trace.take().is_empty());
}

#[tokio::test]
async fn crash_under_exit_policy_ends_the_runtime() {
    let h = harness(CrashPolicy::Exit);
    h.runtime.start().await;

    h.factory.latest().exit_with(Exit::Code(1));
    match wait_done(&h.runtime).await {
        ExitReason::Crashed(cause) => assert!(cause.contains("exit code Some(1)"), "got {cause}"),
        other => panic!("expected a crash, got {other:?}"),
    }
    assert_eq!(h.runtime.state(), State::Exited);

    let (status, _) = get(&h.runtime, "/hello/ada").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn crash_under_keep_alive_goes_down_until_the_next_change() {
    let h = harness(CrashPolicy::KeepAlive);
    h.runtime.start().await;

    h.factory.latest().exit_with(Exit::Code(1));
    wait_for_state(&h.runtime, State::Down).await;

    let (status, body) = get(&h.runtime, "/hello/ada").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["title"], "Service is not ready");
    let (status, body) = get(&h.runtime, "/_foldadmin/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "DOWN");

    h.runtime.post(Event::FileChange);
    wait_for_state(&h.runtime, State::Up).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.runtime.manifest().is_none() {
        assert!(Instant::now() < deadline, "worker never became ready");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, _) = get(&h.runtime, "/hello/ada").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.factory.spawned().len(), 2);
}

#[tokio::test]
async fn worker_killed_by_signal_stops_the_runtime() {
    let h = harness(CrashPolicy::Exit);
    h.runtime.start().await;

    h.runtime.signal(Signal::SIGTERM);
    assert_eq!(wait_done(&h.runtime).await, ExitReason::Stopped);
    assert!(h
        .trace
        .take()
        .contains(&"supervisor.signal SIGTERM".to_string()));
}

#[tokio::test]
async fn process_end_hook_replaces_the_default_stop() {
    let trace = Trace::default();
    let factory = FakeFactory {
        trace: trace.clone(),
        ..FakeFactory::default()
    };
    let client = Arc::new(FakeClient {
        trace,
        ..FakeClient::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let runtime = Runtime::builder(RuntimeConfig::new("fake-worker", Vec::new()))
        .supervisor_factory(Arc::new(factory.clone()))
        .ingress_client(client)
        .on_process_end(Arc::new(move |_runtime: &Runtime| {
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .build()
        .expect("runtime");
    runtime.start().await;

    factory.latest().exit_with(Exit::Signal(Signal::SIGINT as i32));
    let deadline = Instant::now() + Duration::from_secs(5);
    while calls.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "hook never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runtime.state(), State::Up);
}

#[tokio::test]
async fn failed_dial_is_treated_as_a_crash() {
    let h = harness(CrashPolicy::KeepAlive);
    h.client.fail_dial.store(true, Ordering::SeqCst);

    h.runtime.start().await;
    wait_for_state(&h.runtime, State::Down).await;
    assert!(h.runtime.manifest().is_none());
    assert!(h.factory.latest().status().is_terminal());

    let trace = h.trace.take();
    assert_eq!(&trace[..2], ["supervisor.start", "client.start"]);
    assert!(!trace.contains(&"client.get_manifest".to_string()));
}

#[tokio::test]
async fn spawn_failure_exits_under_default_policy() {
    let h = harness(CrashPolicy::Exit);
    h.factory.fail_start.store(true, Ordering::SeqCst);

    h.runtime.start().await;
    match wait_done(&h.runtime).await {
        ExitReason::Crashed(cause) => assert!(cause.contains("fake-worker"), "got {cause}"),
        other => panic!("expected a crash, got {other:?}"),
    }
}

#[tokio::test]
async fn manifest_fetch_failure_crashes_under_exit_policy() {
    let h = harness(CrashPolicy::Exit);
    h.client.fail_manifest.store(true, Ordering::SeqCst);

    h.runtime.start().await;
    match wait_done(&h.runtime).await {
        ExitReason::Crashed(cause) => {
            assert!(cause.contains("manifest fetch failed"), "got {cause}");
            assert!(cause.contains("manifest unavailable"), "got {cause}");
        }
        other => panic!("expected a crash, got {other:?}"),
    }
    assert_eq!(h.runtime.state(), State::Exited);
    assert!(h.runtime.manifest().is_none());

    let trace = h.trace.take();
    assert_eq!(
        &trace[..5],
        [
            "supervisor.start",
            "client.start",
            "client.get_manifest",
            "client.stop",
            "supervisor.stop",
        ]
    );
}

#[tokio::test]
async fn manifest_fetch_failure_goes_down_under_keep_alive() {
    let h = harness(CrashPolicy::KeepAlive);
    h.client.fail_manifest.store(true, Ordering::SeqCst);

    h.runtime.start().await;
    wait_for_state(&h.runtime, State::Down).await;
    assert!(h.runtime.manifest().is_none());
    assert!(h.factory.latest().status().is_terminal());

    let trace = h.trace.take();
    assert_eq!(
        &trace[..5],
        [
            "supervisor.start",
            "client.start",
            "client.get_manifest",
            "client.stop",
            "supervisor.stop",
        ]
    );

    let (status, body) = get(&h.runtime, "/_foldadmin/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "DOWN");
}

#[tokio::test]
async fn unroutable_manifest_route_does_not_wedge_the_engine() {
    let h = harness(CrashPolicy::Exit);
    h.client
        .extra_routes
        .lock()
        .unwrap()
        .extend([
            Route::new(HttpMethod::Get, "brace", "/a/:b}c"),
            Route::new(HttpMethod::Get, "rest", "/files/:*rest/more"),
        ]);

    assert_eq!(h.runtime.start().await, State::Up);
    let (status, body) = get(&h.runtime, "/hello/ada").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["params"]["name"], "ada");

    h.runtime.post(Event::FileChange);
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.runtime.manifest().map(|m| m.version.patch) != Some(2) {
        assert!(Instant::now() < deadline, "restart never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.runtime.post(Event::Stop);
    assert_eq!(wait_done(&h.runtime).await, ExitReason::Stopped);
    assert_eq!(h.runtime.state(), State::Exited);
}
