//! Forward engine: lifecycle, listeners and per-task dispatch.
//!
//! `start()` builds a rule snapshot, subscribes every source session to the
//! union of source chats and spawns one listener per session. Each routed
//! (rule, event) pair then runs as its own tokio task: filter, optional
//! delay, adapter, stats, archive. A failure or panic inside one task is
//! recorded as a failed attempt and never reaches its siblings.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, EngineError};
use crate::outbound::{Delivery, Outbound, PostAdapter, RelayAdapter, deliver};
use crate::pipeline::router::route;
use crate::pipeline::snapshot::{load_snapshot, source_ids};
use crate::pipeline::types::{
    ActiveRule, DispatchTask, EngineState, EventStream, InboundEvent, RuleSnapshot,
};
use crate::sessions::SessionRegistry;
use crate::stats::StatsSink;
use crate::store::model::{ForwardAttempt, Role, TargetKind};
use crate::store::{AttemptArchive, RuleStore};

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub store: Arc<dyn RuleStore>,
    pub sessions: Arc<dyn SessionRegistry>,
    pub stats: Arc<dyn StatsSink>,
    pub relay: Arc<dyn Outbound>,
    pub post: Arc<dyn Outbound>,
    pub archive: Option<Arc<dyn AttemptArchive>>,
}

impl EngineDeps {
    /// Default adapters over `sessions`, no archive.
    pub fn new(
        store: Arc<dyn RuleStore>,
        sessions: Arc<dyn SessionRegistry>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            relay: Arc::new(RelayAdapter::new(Arc::clone(&sessions))),
            post: Arc::new(PostAdapter::new(Arc::clone(&sessions))),
            store,
            sessions,
            stats,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn AttemptArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_adapters(mut self, relay: Arc<dyn Outbound>, post: Arc<dyn Outbound>) -> Self {
        self.relay = relay;
        self.post = post;
        self
    }

    fn adapter(&self, kind: TargetKind) -> &Arc<dyn Outbound> {
        match kind {
            TargetKind::Relay => &self.relay,
            TargetKind::Post => &self.post,
        }
    }
}

/// What one run holds between `start()` and `stop()`.
#[derive(Default)]
struct Run {
    listeners: Vec<JoinHandle<()>>,
    /// Sessions to disconnect on stop.
    held: Vec<String>,
    rules: usize,
}

struct Inner {
    deps: EngineDeps,
    state: watch::Sender<EngineState>,
    lifecycle: Mutex<Run>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct ForwardEngine {
    inner: Arc<Inner>,
}

impl ForwardEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            inner: Arc::new(Inner {
                deps,
                state,
                lifecycle: Mutex::new(Run::default()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Dispatch tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Load rules, connect sessions and start listening.
    ///
    /// A no-op while already running. On any subscription failure the
    /// engine returns to `Stopped`, disconnects every session this call
    /// connected or subscribed, and the error is returned.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut run = self.inner.lifecycle.lock().await;
        match self.state() {
            EngineState::Stopped => {}
            EngineState::Running => {
                debug!("Forward engine already running");
                return Ok(());
            }
            state => {
                return Err(EngineError::InvalidTransition {
                    operation: "start",
                    state,
                });
            }
        }

        self.inner.set_state(EngineState::Starting);
        let mut opened = Vec::new();
        match self.inner.bootstrap(&mut run, &mut opened).await {
            Ok(()) => {
                self.inner.set_state(EngineState::Running);
                info!(
                    rules = run.rules,
                    listeners = run.listeners.len(),
                    "Forward engine running"
                );
                Ok(())
            }
            Err(e) => {
                error!("Forward engine failed to start: {e}");
                for handle in run.listeners.drain(..) {
                    handle.abort();
                }
                let mut release = std::mem::take(&mut run.held);
                for identity in opened {
                    if !release.contains(&identity) {
                        release.push(identity);
                    }
                }
                for identity in release {
                    if let Err(e) = self.inner.deps.sessions.disconnect(&identity).await {
                        warn!(account = %identity, "Disconnect after failed start failed: {e}");
                    }
                }
                self.inner.set_state(EngineState::Stopped);
                Err(e)
            }
        }
    }

    /// Stop listening and disconnect held sessions.
    ///
    /// In-flight dispatch tasks keep running; see [`drain`](Self::drain).
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut run = self.inner.lifecycle.lock().await;
        match self.state() {
            EngineState::Running => {}
            EngineState::Stopped => return Ok(()),
            state => {
                return Err(EngineError::InvalidTransition {
                    operation: "stop",
                    state,
                });
            }
        }

        self.inner.set_state(EngineState::Stopping);
        for handle in run.listeners.drain(..) {
            handle.abort();
            // Wait for the listener so no routing happens after we return.
            let _ = handle.await;
        }

        for identity in run.held.drain(..) {
            match self.inner.deps.sessions.disconnect(&identity).await {
                Ok(()) => debug!(account = %identity, "Session disconnected"),
                Err(e) => warn!(account = %identity, "Disconnect failed: {e}"),
            }
        }
        run.rules = 0;

        self.inner.set_state(EngineState::Stopped);
        info!(in_flight = self.in_flight(), "Forward engine stopped");
        Ok(())
    }

    /// Resolves once no dispatch task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout` for in-flight tasks. Returns whether all finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, self.wait_idle()).await.is_ok();
        if !drained {
            warn!(
                in_flight = self.in_flight(),
                "Drain timed out with dispatch tasks still running"
            );
        }
        drained
    }
}

impl Inner {
    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    fn is_running(&self) -> bool {
        *self.state.borrow() == EngineState::Running
    }

    async fn bootstrap(
        self: &Arc<Self>,
        run: &mut Run,
        opened: &mut Vec<String>,
    ) -> Result<(), EngineError> {
        let snapshot = load_snapshot(self.deps.store.as_ref()).await?;
        let sources: Vec<String> = source_ids(&snapshot).into_iter().collect();
        run.rules = snapshot.len();

        let sessions = self.deps.sessions.list_sessions();
        if sources.is_empty() {
            warn!("No enabled rules with a source; nothing to subscribe");
        }

        for info in sessions.iter().filter(|s| s.role == Role::Source) {
            if sources.is_empty() {
                break;
            }
            let identity = info.identity.as_str();
            if !self.deps.sessions.is_connected(identity).await {
                self.deps.sessions.connect(identity).await?;
                opened.push(identity.to_string());
            }
            let stream = self.deps.sessions.subscribe(identity, &sources).await?;
            info!(account = %identity, sources = sources.len(), "Subscribed");
            run.held.push(identity.to_string());
            run.listeners.push(self.spawn_listener(identity.to_string(), stream, Arc::clone(&snapshot)));
        }

        for info in sessions.iter().filter(|s| s.role == Role::Target) {
            let identity = info.identity.as_str();
            if self.deps.sessions.is_connected(identity).await {
                continue;
            }
            match self.deps.sessions.connect(identity).await {
                Ok(()) => {
                    opened.push(identity.to_string());
                    run.held.push(identity.to_string());
                }
                Err(e) => warn!(account = %identity, "Target session unavailable: {e}"),
            }
        }
        Ok(())
    }

    fn spawn_listener(
        self: &Arc<Self>,
        identity: String,
        mut stream: EventStream,
        snapshot: RuleSnapshot,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let mut state = self.state.subscribe();

        tokio::spawn(async move {
            if !wait_until_running(&mut state).await {
                return;
            }
            debug!(account = %identity, "Listener started");

            loop {
                tokio::select! {
                    biased;
                    _ = wait_until_not_running(&mut state) => break,
                    next = stream.next() => match next {
                        Some(event) => inner.handle_event(event, &snapshot),
                        None => {
                            warn!(account = %identity, "Event stream ended");
                            break;
                        }
                    },
                }
            }
            debug!(account = %identity, "Listener stopped");
        })
    }

    fn handle_event(self: &Arc<Self>, event: InboundEvent, snapshot: &RuleSnapshot) {
        if !self.is_running() {
            return;
        }
        let event = Arc::new(event);
        for task in route(&event, snapshot) {
            self.spawn_dispatch(task);
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, task: DispatchTask) {
        let guard = InFlight::enter(Arc::clone(self));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let (rule, event) = (Arc::clone(&task.rule), Arc::clone(&task.event));
            if let Err(panic) = AssertUnwindSafe(inner.run_task(task)).catch_unwind().await {
                let err = DispatchError::Panicked(panic_message(&panic));
                error!(rule = %rule.name(), "Dispatch task panicked outside the adapter: {err}");
                inner.log_failure(&rule, event.body(), err.to_string()).await;
            }
        });
    }

    /// Record a failed attempt for a task that unwound past the adapter.
    async fn log_failure(&self, rule: &ActiveRule, text: &str, error: String) {
        let logged = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.deps.stats.append_log(rule, text, false, Some(error))
        }));
        match logged {
            Ok(attempt) => self.archive(rule, &attempt).await,
            Err(panic) => error!(
                rule = %rule.name(),
                "Failed attempt could not be logged: {}",
                panic_message(&panic)
            ),
        }
    }

    async fn archive(&self, rule: &ActiveRule, attempt: &ForwardAttempt) {
        if let Some(archive) = &self.deps.archive {
            if let Err(e) = archive.archive(attempt).await {
                warn!(rule = %rule.name(), "Failed to archive attempt: {e}");
            }
        }
    }

    async fn run_task(&self, task: DispatchTask) {
        let DispatchTask { rule, event } = task;
        let text = event.body();

        if !rule.filter.matches(text) {
            debug!(rule = %rule.name(), "Filtered out");
            return;
        }

        let delay = rule.rule.options.delay;
        if delay.enabled && delay.seconds > 0 {
            debug!(rule = %rule.name(), seconds = delay.seconds, "Delaying dispatch");
            tokio::time::sleep(Duration::from_secs(delay.seconds)).await;
        }

        let adapter = Arc::clone(self.deps.adapter(rule.target.kind()));
        let started = Instant::now();
        let delivery = match AssertUnwindSafe(deliver(adapter.as_ref(), &rule, &event))
            .catch_unwind()
            .await
        {
            Ok(delivery) => delivery,
            Err(panic) => {
                let err = DispatchError::Panicked(panic_message(&panic));
                error!(rule = %rule.name(), "{err}");
                Delivery {
                    success: false,
                    error: Some(err.to_string()),
                }
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        self.deps.stats.record(&rule, delivery.success, elapsed);
        let attempt = self
            .deps
            .stats
            .append_log(&rule, text, delivery.success, delivery.error);
        self.archive(&rule, &attempt).await;
    }
}

/// Counts a dispatch task from spawn until it finishes or unwinds.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: Arc<Inner>) -> Self {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Wait out `Starting`. Returns `false` if the engine never reached `Running`.
async fn wait_until_running(state: &mut watch::Receiver<EngineState>) -> bool {
    loop {
        let current = *state.borrow_and_update();
        match current {
            EngineState::Running => return true,
            EngineState::Starting => {}
            EngineState::Stopping | EngineState::Stopped => return false,
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

async fn wait_until_not_running(state: &mut watch::Receiver<EngineState>) {
    loop {
        let current = *state.borrow_and_update();
        if current != EngineState::Running {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_transitions_are_observable() {
        let (tx, mut rx) = watch::channel(EngineState::Starting);
        let waiter = tokio::spawn(async move { wait_until_running(&mut rx).await });
        tx.send_replace(EngineState::Running);
        assert!(waiter.await.unwrap());

        let (tx, mut rx) = watch::channel(EngineState::Starting);
        let waiter = tokio::spawn(async move { wait_until_running(&mut rx).await });
        tx.send_replace(EngineState::Stopped);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn not_running_wait_resolves_on_stop() {
        let (tx, mut rx) = watch::channel(EngineState::Running);
        let waiter = tokio::spawn(async move { wait_until_not_running(&mut rx).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.send_replace(EngineState::Stopping);
        waiter.await.unwrap();
    }

    #[test]
    fn panic_message_extracts_payload() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&p), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&p), "bang");
        let p: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&p), "unknown panic");
    }
}
