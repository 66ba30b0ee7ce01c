//! The runtime engine: one worker, one state machine.
//!
//! ```text
//! DOWN ──START/FILE_CHANGE──▶ UP ──START/FILE_CHANGE──▶ UP (restart)
//!  │                          │
//!  └──STOP──▶ EXITED ◀──STOP──┤
//!                             └──CRASH──▶ EXITED (exit) | DOWN (keep-alive)
//! ```
//!
//! Transition callbacks drive the supervisor, the ingress client and the
//! router. Anything that happens outside a transition (child exit, file
//! change, signal-driven stop) is posted to an event queue drained by a pump
//! task, so callbacks never re-enter the state machine.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use axum::extract::Request as HttpRequest;
use axum::http::StatusCode;
use axum::response::Response as HttpResponse;
use fold_manifest::Manifest;
use nix::sys::signal::Signal;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::addr::{remove_socket, socket_factory, SocketFactory, SOCK_ADDR_ENV};
use crate::config::{CrashPolicy, RuntimeConfig};
use crate::error::{IngressError, RuntimeError, SupervisorError};
use crate::fsm::{BoxFuture, Callback, Fsm, FsmError, Transition};
use crate::ingress::{IngressClient, UnixIngressClient};
use crate::router::{json_body, json_error, RequestDoer, Router, HEALTHZ_PATH};
use crate::supervisor::{ProcessSupervisorFactory, Supervisor, SupervisorFactory};
use crate::transport::{Request, Response};
use crate::watcher::{ChangeCallback, Debouncer, RecursiveWatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Down,
    Up,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Start,
    Stop,
    Crash,
    FileChange,
}

/// Why the runtime reached EXITED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    Crashed(String),
}

impl ExitReason {
    pub fn into_result(self) -> Result<(), RuntimeError> {
        match self {
            ExitReason::Stopped => Ok(()),
            ExitReason::Crashed(cause) => Err(RuntimeError::Crashed(cause)),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Stopped => f.write_str("stopped"),
            ExitReason::Crashed(cause) => write!(f, "crashed: {cause}"),
        }
    }
}

/// Called when the worker is terminated by a signal while serving. The
/// default posts STOP.
pub type ProcessEndHook = Arc<dyn Fn(&Runtime) + Send + Sync>;

struct Posted {
    event: Event,
    /// Cycle the event belongs to; dropped if that cycle is gone.
    cycle: Option<u64>,
}

struct Cycle {
    id: u64,
    addr: PathBuf,
    supervisor: Arc<dyn Supervisor>,
    /// Cancelled when the runtime tears the cycle down on purpose.
    teardown: CancellationToken,
}

struct ClientDoer(Arc<dyn IngressClient>);

#[async_trait]
impl RequestDoer for ClientDoer {
    async fn do_request(&self, request: Request) -> Result<Response, IngressError> {
        self.0.do_request(request).await
    }
}

struct Inner {
    config: RuntimeConfig,
    fsm: Fsm<State, Event>,
    supervisors: Arc<dyn SupervisorFactory>,
    client: Arc<dyn IngressClient>,
    router: Arc<Router>,
    sockets: SocketFactory,
    on_process_end: Option<ProcessEndHook>,
    public: RwLock<Option<Arc<Router>>>,
    cycle: Mutex<Option<Cycle>>,
    cycle_seq: AtomicU64,
    events: mpsc::UnboundedSender<Posted>,
    root: CancellationToken,
    done: watch::Sender<Option<ExitReason>>,
    last_crash: Mutex<Option<String>>,
    debouncer: Mutex<Option<Arc<Debouncer>>>,
    watchers: Mutex<Vec<RecursiveWatcher>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    supervisors: Option<Arc<dyn SupervisorFactory>>,
    client: Option<Arc<dyn IngressClient>>,
    sockets: Option<SocketFactory>,
    on_process_end: Option<ProcessEndHook>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            supervisors: None,
            client: None,
            sockets: None,
            on_process_end: None,
        }
    }

    pub fn supervisor_factory(mut self, factory: Arc<dyn SupervisorFactory>) -> Self {
        self.supervisors = Some(factory);
        self
    }

    pub fn ingress_client(mut self, client: Arc<dyn IngressClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn socket_factory(mut self, sockets: SocketFactory) -> Self {
        self.sockets = Some(sockets);
        self
    }

    pub fn on_process_end(mut self, hook: ProcessEndHook) -> Self {
        self.on_process_end = Some(hook);
        self
    }

    /// Builds the runtime in state DOWN and starts watching the configured
    /// directories. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        let supervisors = self.supervisors.unwrap_or_else(|| {
            Arc::new(
                ProcessSupervisorFactory::new(config.command.clone(), config.args.clone())
                    .with_stop_timeout(config.stop_timeout),
            )
        });
        let client = self
            .client
            .unwrap_or_else(|| Arc::new(UnixIngressClient::default()));
        let sockets = self
            .sockets
            .unwrap_or_else(|| socket_factory(config.socket_dir.clone()));
        let router = Arc::new(Router::new(Arc::new(ClientDoer(client.clone()))));
        let (events, events_rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(None);
        let policy = config.crash_policy;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            fsm: Fsm::new(State::Down, transitions(weak, policy)),
            config,
            supervisors,
            client,
            router,
            sockets,
            on_process_end: self.on_process_end,
            public: RwLock::new(None),
            cycle: Mutex::new(None),
            cycle_seq: AtomicU64::new(0),
            events,
            root: CancellationToken::new(),
            done,
            last_crash: Mutex::new(None),
            debouncer: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
        });
        tokio::spawn(pump(Arc::downgrade(&inner), events_rx));

        let runtime = Runtime { inner };
        runtime.start_watching()?;
        Ok(runtime)
    }
}

fn transitions(weak: &Weak<Inner>, policy: CrashPolicy) -> Vec<Transition<State, Event>> {
    let start = callback(weak, |inner| async move { inner.start_cycle().await });
    let stop = callback(weak, |inner| async move { inner.stop_cycle().await });
    let stopped = callback(weak, |inner| async move { inner.finish(ExitReason::Stopped) });
    let crashed = callback(weak, |inner| async move {
        let cause = inner.take_crash_cause();
        inner.finish(ExitReason::Crashed(cause))
    });

    let crash = match policy {
        CrashPolicy::Exit => Transition::new(Event::Crash, State::Up, State::Exited)
            .then(stop.clone())
            .then(crashed),
        CrashPolicy::KeepAlive => Transition::new(Event::Crash, State::Up, State::Down).then(stop.clone()),
    };

    vec![
        Transition::new(Event::Start, State::Down, State::Up).then(start.clone()),
        Transition::new(Event::Start, State::Up, State::Up)
            .then(stop.clone())
            .then(start.clone()),
        Transition::new(Event::FileChange, State::Down, State::Up).then(start.clone()),
        Transition::new(Event::FileChange, State::Up, State::Up)
            .then(stop.clone())
            .then(start),
        Transition::new(Event::Stop, State::Up, State::Exited)
            .then(stop)
            .then(stopped.clone()),
        Transition::new(Event::Stop, State::Down, State::Exited).then(stopped),
        crash,
    ]
}

fn callback<F, Fut>(weak: &Weak<Inner>, f: F) -> Callback
where
    F: Fn(Arc<Inner>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak = weak.clone();
    Arc::new(move || -> BoxFuture {
        match weak.upgrade() {
            Some(inner) => Box::pin(f(inner)),
            None => Box::pin(async {}),
        }
    })
}

async fn pump(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<Posted>) {
    while let Some(posted) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        if let Some(cycle) = posted.cycle {
            if inner.current_cycle() != Some(cycle) {
                tracing::debug!(event = ?posted.event, cycle, "dropping event for a finished cycle");
                continue;
            }
        }
        if let Err(err) = inner.dispatch(posted.event).await {
            tracing::debug!(error = %err, "event rejected");
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime handle
// ---------------------------------------------------------------------------

/// Cheap, clonable handle to the engine.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn state(&self) -> State {
        self.inner.fsm.state()
    }

    /// Manifest of the worker currently serving, if any.
    pub fn manifest(&self) -> Option<Arc<Manifest>> {
        read(&self.inner.public).as_ref().map(|router| router.manifest())
    }

    /// Applies `event` and waits for its callbacks. Events reaching an
    /// EXITED runtime are dropped and report `Exited`.
    pub async fn emit(&self, event: Event) -> Result<State, FsmError<State, Event>> {
        self.inner.dispatch(event).await
    }

    pub async fn start(&self) -> State {
        self.emit_logged(Event::Start).await
    }

    pub async fn stop(&self) -> State {
        self.emit_logged(Event::Stop).await
    }

    async fn emit_logged(&self, event: Event) -> State {
        match self.emit(event).await {
            Ok(state) => state,
            Err(err) => {
                tracing::debug!(error = %err, "event rejected");
                self.state()
            }
        }
    }

    /// Queues `event` for the pump task without waiting.
    pub fn post(&self, event: Event) {
        self.inner.post(event, None);
    }

    /// Forwards `sig` to the current worker, if one is running.
    pub fn signal(&self, sig: Signal) {
        let supervisor = lock(&self.inner.cycle)
            .as_ref()
            .map(|cycle| cycle.supervisor.clone());
        let Some(supervisor) = supervisor else {
            tracing::debug!(signal = sig.as_str(), "no worker to signal");
            return;
        };
        match supervisor.signal(sig) {
            Ok(()) => tracing::info!(signal = sig.as_str(), "signal forwarded to worker"),
            Err(SupervisorError::NotRunning) => {
                tracing::debug!(signal = sig.as_str(), "worker already exited")
            }
            Err(err) => tracing::warn!(signal = sig.as_str(), error = %err, "failed to signal worker"),
        }
    }

    /// Resolves once the runtime reaches EXITED.
    pub async fn wait_done(&self) -> ExitReason {
        let mut done = self.inner.done.subscribe();
        let reason = match done.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(ExitReason::Stopped),
            Err(_) => ExitReason::Stopped,
        };
        reason
    }

    /// Serves one HTTP request: through the worker's router while serving,
    /// otherwise a 503.
    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let public = read(&self.inner.public).clone();
        match public {
            Some(router) => router.serve(request).await,
            None => unavailable(self.state(), request.uri().path()),
        }
    }

    fn start_watching(&self) -> Result<(), RuntimeError> {
        let dirs = &self.inner.config.watch_dirs;
        if dirs.is_empty() {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let downstream: ChangeCallback = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                tracing::info!("change detected, restarting worker");
                inner.post(Event::FileChange, None);
            }
        });
        let debouncer = Arc::new(Debouncer::new(self.inner.config.debounce, downstream));
        let mut watchers = Vec::with_capacity(dirs.len());
        for dir in dirs {
            watchers.push(RecursiveWatcher::start(dir, debouncer.as_callback())?);
        }
        *lock(&self.inner.debouncer) = Some(debouncer);
        *lock(&self.inner.watchers) = watchers;
        Ok(())
    }
}

fn unavailable(state: State, path: &str) -> HttpResponse {
    let exited = state == State::Exited;
    if path == HEALTHZ_PATH {
        let status = if exited { "EXITED" } else { "DOWN" };
        return json_body(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "status": status }).to_string().into_bytes(),
        );
    }
    let title = if exited {
        "Service is shutting down"
    } else {
        "Service is not ready"
    };
    json_error(StatusCode::SERVICE_UNAVAILABLE, title, None)
}

// ---------------------------------------------------------------------------
// Cycle management
// ---------------------------------------------------------------------------

impl Inner {
    async fn dispatch(&self, event: Event) -> Result<State, FsmError<State, Event>> {
        if self.fsm.state() == State::Exited {
            tracing::debug!(?event, "runtime exited, dropping event");
            return Ok(State::Exited);
        }
        match self.fsm.emit(event).await {
            Err(FsmError::NoSuchTransition {
                from: State::Exited, ..
            }) => Ok(State::Exited),
            other => other,
        }
    }

    fn post(&self, event: Event, cycle: Option<u64>) {
        if self.events.send(Posted { event, cycle }).is_err() {
            tracing::debug!(?event, "event queue closed");
        }
    }

    fn post_crash(&self, cycle: u64, cause: String) {
        *lock(&self.last_crash) = Some(cause);
        self.post(Event::Crash, Some(cycle));
    }

    fn take_crash_cause(&self) -> String {
        lock(&self.last_crash)
            .take()
            .unwrap_or_else(|| "worker exited unexpectedly".to_string())
    }

    fn current_cycle(&self) -> Option<u64> {
        lock(&self.cycle).as_ref().map(|cycle| cycle.id)
    }

    fn set_public(&self, router: Option<Arc<Router>>) {
        match self.public.write() {
            Ok(mut public) => *public = router,
            Err(poisoned) => *poisoned.into_inner() = router,
        }
    }

    async fn start_cycle(self: &Arc<Self>) {
        let id = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let addr = (self.sockets)();
        if let Err(err) = remove_socket(&addr) {
            tracing::warn!(error = %err, "failed to clear socket path");
        }

        let mut env = self.config.env.clone();
        env.insert(SOCK_ADDR_ENV.to_string(), addr.to_string_lossy().into_owned());
        let supervisor = self.supervisors.create(env);
        let teardown = self.root.child_token();
        let exited = CancellationToken::new();
        *lock(&self.cycle) = Some(Cycle {
            id,
            addr: addr.clone(),
            supervisor: supervisor.clone(),
            teardown: teardown.clone(),
        });

        tracing::info!(cycle = id, addr = %addr.display(), "starting worker");
        if let Err(err) = supervisor.start().await {
            tracing::error!(cycle = id, error = %err, "worker failed to start");
            teardown.cancel();
            self.post_crash(id, err.to_string());
            return;
        }
        tokio::spawn(observe(
            Arc::downgrade(self),
            id,
            supervisor.clone(),
            teardown.clone(),
            exited.clone(),
        ));

        let deadline = Instant::now() + self.config.dial_timeout;
        let dialed = tokio::select! {
            _ = exited.cancelled() => Err("worker exited before accepting connections".to_string()),
            dialed = self.client.start(&addr, deadline) => dialed.map_err(|err| err.to_string()),
        };
        if let Err(cause) = dialed {
            self.abort_start(id, &supervisor, &teardown, cause).await;
            return;
        }

        let fetched = tokio::select! {
            _ = exited.cancelled() => Err("worker exited before sending its manifest".to_string()),
            fetched = tokio::time::timeout(self.config.manifest_timeout, self.client.get_manifest()) => {
                match fetched {
                    Ok(Ok(manifest)) => Ok(manifest),
                    Ok(Err(err)) => Err(format!("manifest fetch failed: {err}")),
                    Err(_) => Err(format!("manifest fetch failed: {}", IngressError::Timeout)),
                }
            }
        };
        let manifest = match fetched {
            Ok(manifest) => manifest,
            Err(cause) => {
                self.abort_start(id, &supervisor, &teardown, cause).await;
                return;
            }
        };

        self.router.configure(manifest);
        self.set_public(Some(self.router.clone()));
        tracing::info!(cycle = id, "worker ready");
    }

    async fn abort_start(
        &self,
        id: u64,
        supervisor: &Arc<dyn Supervisor>,
        teardown: &CancellationToken,
        cause: String,
    ) {
        tracing::error!(cycle = id, cause = %cause, "worker startup failed");
        teardown.cancel();
        if let Err(err) = self.client.stop().await {
            tracing::warn!(error = %err, "failed to stop ingress client");
        }
        if let Err(err) = supervisor.stop().await {
            tracing::warn!(error = %err, "failed to stop worker");
        }
        self.post_crash(id, cause);
    }

    async fn stop_cycle(&self) {
        self.set_public(None);
        let cycle = lock(&self.cycle).take();
        let Some(cycle) = cycle else { return };

        tracing::info!(cycle = cycle.id, "stopping worker");
        cycle.teardown.cancel();
        if let Err(err) = self.client.stop().await {
            tracing::warn!(cycle = cycle.id, error = %err, "failed to stop ingress client");
        }
        if let Err(err) = cycle.supervisor.stop().await {
            tracing::warn!(cycle = cycle.id, error = %err, "failed to stop worker");
        }
        if let Err(err) = remove_socket(&cycle.addr) {
            tracing::warn!(cycle = cycle.id, error = %err, "failed to remove worker socket");
        }
    }

    fn finish(&self, reason: ExitReason) {
        match &reason {
            ExitReason::Stopped => tracing::info!("runtime stopped"),
            ExitReason::Crashed(cause) => tracing::warn!(cause = %cause, "runtime exited after worker crash"),
        }
        if let Some(debouncer) = lock(&self.debouncer).take() {
            debouncer.close();
        }
        for watcher in lock(&self.watchers).drain(..) {
            watcher.close();
        }
        self.root.cancel();
        self.done.send_replace(Some(reason));
    }

    fn process_ended(self: &Arc<Self>, cycle: u64) {
        match &self.on_process_end {
            Some(hook) => hook(&Runtime {
                inner: self.clone(),
            }),
            None => self.post(Event::Stop, Some(cycle)),
        }
    }
}

/// Watches one cycle's child and reports how it ended.
async fn observe(
    weak: Weak<Inner>,
    cycle: u64,
    supervisor: Arc<dyn Supervisor>,
    teardown: CancellationToken,
    exited: CancellationToken,
) {
    let result = supervisor.wait().await;
    exited.cancel();
    let Some(inner) = weak.upgrade() else { return };
    if teardown.is_cancelled() {
        tracing::debug!(cycle, "worker exited during teardown");
        return;
    }

    match result {
        Err(SupervisorError::TerminatedBySignal(sig)) => {
            tracing::info!(cycle, signal = sig, "worker terminated by signal");
            inner.process_ended(cycle);
        }
        Ok(()) => {
            tracing::warn!(cycle, "worker exited with status 0 while serving");
            inner.post_crash(cycle, "worker exited with status 0".to_string());
        }
        Err(err) => {
            tracing::error!(cycle, error = %err, "worker crashed");
            inner.post_crash(cycle, err.to_string());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
