//! Refresh loop
//!
//! Drives provisioning and display fetches on a single timer:
//!
//! ```text
//!            start(first_run)              timer fires
//! Stopped ───────────────────▶ Armed ──────────────────▶ Running
//!    ▲                           ▲                          │
//!    │         stop()            │   cycle ok: re-arm       │
//!    ├───────────────────────────┴──────────────────────────┤
//!    │                 cycle failed: alert, stop            │
//!    └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every `start` and `stop` bumps a generation counter. A timer or an
//! in-flight cycle only acts on the session while its generation is current,
//! so `stop()` wins against a timer that has already fired. Network calls of a
//! cycle past that check are not aborted and may still show an image, but the
//! cycle neither re-arms nor alerts.

use crate::{
    ClientError, DEFAULT_REFRESH_INTERVAL_SECS, DisplayFetcher, ErrorKind, InputSource, Presenter,
    Provisioner, Transport,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Lifecycle phase of the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// No timer scheduled, no cycle in flight
    Stopped,
    /// Timer scheduled, not yet fired
    Armed,
    /// Cycle in flight
    Running,
}

/// Step of a cycle that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Provision,
    Display,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleStage::Provision => write!(f, "Device setup"),
            CycleStage::Display => write!(f, "Display refresh"),
        }
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed: {source}")]
pub struct CycleError {
    pub stage: CycleStage,
    #[source]
    pub source: ClientError,
}

impl CycleError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Notifications published by the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// A cycle is scheduled to run after `delay`
    Armed { delay: Duration },
    /// A cycle finished; the next one waits `refresh_interval`
    CycleCompleted { refresh_interval: Duration },
    /// A cycle failed; the loop is about to stop
    CycleFailed { error: String },
    /// The loop stopped
    Stopped,
}

struct Session {
    phase: LoopPhase,
    generation: u64,
    refresh_interval: Duration,
    api_key: Option<String>,
    timer: Option<JoinHandle<()>>,
}

impl Session {
    /// Claim the loop for a new schedule; returns the new generation
    fn reserve(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.phase = LoopPhase::Armed;
        self.generation
    }
}

struct Inner {
    provisioner: Provisioner,
    fetcher: DisplayFetcher,
    presenter: Arc<dyn Presenter>,
    inputs: Arc<dyn InputSource>,
    session: Mutex<Session>,
    events: broadcast::Sender<LoopEvent>,
}

/// Controller owning the refresh loop.
///
/// Cloning yields another handle to the same loop. A scheduled timer keeps the
/// loop alive until it is stopped, even if every handle is dropped.
#[derive(Clone)]
pub struct PollLoop {
    inner: Arc<Inner>,
}

impl PollLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        presenter: Arc<dyn Presenter>,
        inputs: Arc<dyn InputSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(32);

        Self {
            inner: Arc::new(Inner {
                provisioner: Provisioner::new(Arc::clone(&transport), Arc::clone(&presenter)),
                fetcher: DisplayFetcher::new(transport, Arc::clone(&presenter)),
                presenter,
                inputs,
                session: Mutex::new(Session {
                    phase: LoopPhase::Stopped,
                    generation: 0,
                    refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
                    api_key: None,
                    timer: None,
                }),
                events,
            }),
        }
    }

    /// Set the interval used until the server sends one
    pub fn with_refresh_interval(self, refresh_interval: Duration) -> Self {
        self.session().refresh_interval = refresh_interval;
        self
    }

    /// Start the loop.
    ///
    /// `first_run` is for user-initiated starts: the first cycle runs
    /// immediately and the presenter is told the loop is running. Otherwise
    /// the cycle runs after the current refresh interval. Does nothing if the
    /// loop is already armed or running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, first_run: bool) {
        let generation = {
            let mut session = self.session();
            if session.phase != LoopPhase::Stopped {
                tracing::debug!("Already running...");
                return;
            }
            session.reserve()
        };

        if first_run {
            tracing::info!("Starting...");
            self.inner.presenter.set_controls_enabled(true);
        }

        self.schedule(generation, first_run);
    }

    /// Stop the loop. Does nothing if it is already stopped.
    pub fn stop(&self) {
        self.halt(None);
    }

    /// Run one provision + display cycle and return the next refresh interval.
    ///
    /// Updates the cached API key and refresh interval but does not touch the
    /// timer. A manually supplied key is used for the cycle but never cached.
    pub async fn execute_cycle(&self) -> Result<Duration, CycleError> {
        self.run_cycle(None).await
    }

    /// Cycle body. With a generation, session writes are skipped once the
    /// loop has moved on to a newer start or stop.
    async fn run_cycle(&self, generation: Option<u64>) -> Result<Duration, CycleError> {
        let inner = &self.inner;
        let server_url = inner.inputs.server_url();
        let device_id = inner.inputs.device_id();
        let manual_key = inner.inputs.api_key();

        let (cached_key, current_interval) = {
            let session = self.session();
            (session.api_key.clone(), session.refresh_interval)
        };

        let provisioned = manual_key.is_none();
        let api_key = inner
            .provisioner
            .provision(
                &server_url,
                &device_id,
                manual_key.or(cached_key).as_deref(),
            )
            .await
            .map_err(|source| CycleError {
                stage: CycleStage::Provision,
                source,
            })?;

        if provisioned {
            self.update_session(generation, |session| {
                session.api_key = Some(api_key.clone());
            });
        }

        let update = inner
            .fetcher
            .fetch(&server_url, &device_id, &api_key, current_interval)
            .await
            .map_err(|source| CycleError {
                stage: CycleStage::Display,
                source,
            })?;

        self.update_session(generation, |session| {
            session.refresh_interval = update.refresh_interval;
        });
        Ok(update.refresh_interval)
    }

    fn update_session(&self, generation: Option<u64>, apply: impl FnOnce(&mut Session)) {
        let mut session = self.session();
        if generation.is_none_or(|g| g == session.generation) {
            apply(&mut session);
        } else {
            tracing::debug!("Loop restarted during cycle, leaving session untouched");
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.session().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() != LoopPhase::Stopped
    }

    pub fn refresh_interval(&self) -> Duration {
        self.session().refresh_interval
    }

    /// API key cached from the last successful provisioning
    pub fn api_key(&self) -> Option<String> {
        self.session().api_key.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the timer for a reserved generation, unless it went stale
    fn schedule(&self, generation: u64, immediate: bool) {
        let mut session = self.session();
        if session.generation != generation {
            tracing::debug!("Loop stopped before the timer was scheduled");
            return;
        }

        let delay = if immediate {
            Duration::ZERO
        } else {
            session.refresh_interval
        };

        let this = self.clone();
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.fire(generation).await;
        }));

        tracing::debug!("Next refresh in {:?}", delay);
        self.emit(LoopEvent::Armed { delay });
    }

    async fn fire(&self, generation: u64) {
        {
            let mut session = self.session();
            if session.generation != generation || session.phase != LoopPhase::Armed {
                tracing::debug!("Timer fired after stop, skipping cycle");
                return;
            }
            session.phase = LoopPhase::Running;
            session.timer = None;
        }

        match self.run_cycle(Some(generation)).await {
            Ok(refresh_interval) => {
                let next = {
                    let mut session = self.session();
                    if session.generation != generation {
                        tracing::debug!("Loop stopped during cycle, not re-arming");
                        return;
                    }
                    self.emit(LoopEvent::CycleCompleted { refresh_interval });
                    session.timer = None;
                    session.reserve()
                };
                self.schedule(next, false);
            }
            Err(err) => {
                if self.session().generation != generation {
                    tracing::warn!("Cycle failed after stop: {}", err);
                    return;
                }

                tracing::error!("{}", err);
                let message = err.to_string();
                self.inner.presenter.alert(&message);
                self.emit(LoopEvent::CycleFailed { error: message });
                self.halt(Some(generation));
            }
        }
    }

    /// Stop the loop if it is running and, when given, still on `generation`
    fn halt(&self, generation: Option<u64>) {
        let timer = {
            let mut session = self.session();
            if session.phase == LoopPhase::Stopped {
                return;
            }
            if generation.is_some_and(|g| g != session.generation) {
                return;
            }

            tracing::info!("Stopping...");
            session.generation = session.generation.wrapping_add(1);
            session.phase = LoopPhase::Stopped;
            session.timer.take()
        };

        // Only an armed timer is aborted; a running cycle finishes on its own
        if let Some(timer) = timer {
            timer.abort();
        }

        self.inner.presenter.set_controls_enabled(false);
        self.emit(LoopEvent::Stopped);
    }

    fn emit(&self, event: LoopEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigInputs;
    use crate::api::{DISPLAY_PATH, HEADER_ACCESS_TOKEN, SETUP_PATH};
    use crate::mock::{MockTransport, RecordingPresenter};
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        poll: PollLoop,
        transport: Arc<MockTransport>,
        presenter: Arc<RecordingPresenter>,
        inputs: Arc<ConfigInputs>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(MockTransport::new());
        let presenter = Arc::new(RecordingPresenter::new());
        let inputs = Arc::new(ConfigInputs::new("https://x.test", "dev1"));
        let poll = PollLoop::new(transport.clone(), presenter.clone(), inputs.clone());

        Harness {
            poll,
            transport,
            presenter,
            inputs,
        }
    }

    fn push_setup(transport: &MockTransport, key: &str) {
        transport.push_json(
            SETUP_PATH,
            200,
            json!({"status": 200, "image_url": "https://x.test/a.png", "api_key": key}),
        );
    }

    fn push_display(transport: &MockTransport, refresh_rate: &str) {
        transport.push_json(
            DISPLAY_PATH,
            200,
            json!({"status": 0, "image_url": "https://x.test/b.png", "refresh_rate": refresh_rate}),
        );
    }

    async fn next_event(rx: &mut broadcast::Receiver<LoopEvent>) -> LoopEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for loop event")
            .expect("event channel closed")
    }

    async fn wait_for_requests(transport: &MockTransport, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.request_count() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for requests");
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let h = harness();
        let mut rx = h.poll.subscribe();

        h.poll.stop();
        h.poll.stop();

        assert_eq!(h.poll.phase(), LoopPhase::Stopped);
        assert!(h.presenter.calls().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_start_when_armed_is_noop() {
        let h = harness();
        let mut rx = h.poll.subscribe();

        h.poll.start(true);
        h.poll.start(true);
        h.poll.start(false);

        assert_eq!(h.poll.phase(), LoopPhase::Armed);
        assert!(h.poll.is_running());
        assert_eq!(h.presenter.controls(), vec![true]);
        assert_eq!(
            rx.try_recv().unwrap(),
            LoopEvent::Armed {
                delay: Duration::ZERO
            }
        );
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        h.poll.stop();
    }

    #[tokio::test]
    async fn test_end_to_end_cycle_rearms_with_server_interval() {
        let h = harness();
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "300");
        let mut rx = h.poll.subscribe();

        h.poll.start(true);

        assert_eq!(
            next_event(&mut rx).await,
            LoopEvent::Armed {
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            LoopEvent::CycleCompleted {
                refresh_interval: Duration::from_millis(300_000)
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            LoopEvent::Armed {
                delay: Duration::from_millis(300_000)
            }
        );

        assert_eq!(h.poll.phase(), LoopPhase::Armed);
        assert_eq!(h.poll.refresh_interval(), Duration::from_secs(300));
        assert_eq!(h.poll.api_key().as_deref(), Some("k1"));
        assert_eq!(
            h.presenter.images(),
            vec!["https://x.test/a.png", "https://x.test/b.png"]
        );

        let display = h.transport.requests_to(DISPLAY_PATH);
        assert_eq!(display.len(), 1);
        assert_eq!(display[0].header_value(HEADER_ACCESS_TOKEN), Some("k1"));

        h.poll.stop();
        assert_eq!(h.presenter.controls(), vec![true, false]);
        assert!(h.presenter.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_display_failure_stops_loop() {
        let h = harness();
        push_setup(&h.transport, "k1");
        h.transport.push_response(DISPLAY_PATH, 500, "");
        let mut rx = h.poll.subscribe();

        h.poll.start(true);

        assert!(matches!(next_event(&mut rx).await, LoopEvent::Armed { .. }));
        match next_event(&mut rx).await {
            LoopEvent::CycleFailed { error } => assert!(error.contains("(500)")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(next_event(&mut rx).await, LoopEvent::Stopped);

        assert_eq!(h.poll.phase(), LoopPhase::Stopped);
        assert_eq!(h.presenter.alerts().len(), 1);
        assert!(h.presenter.alerts()[0].contains("Display refresh failed"));
        assert_eq!(h.presenter.controls(), vec![true, false]);

        // No re-arm after the failure
        tokio::task::yield_now().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_missing_device_id_is_config_failure() {
        let h = harness();
        h.inputs.set_device_id("");
        let mut rx = h.poll.subscribe();

        h.poll.start(true);

        assert!(matches!(next_event(&mut rx).await, LoopEvent::Armed { .. }));
        match next_event(&mut rx).await {
            LoopEvent::CycleFailed { error } => assert!(error.contains("Device ID")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(next_event(&mut rx).await, LoopEvent::Stopped);
        assert_eq!(h.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_cycle_reuses_cached_key() {
        let h = harness();
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "300");
        push_display(&h.transport, "60");

        assert_eq!(
            h.poll.execute_cycle().await.unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            h.poll.execute_cycle().await.unwrap(),
            Duration::from_secs(60)
        );

        assert_eq!(h.transport.requests_to(SETUP_PATH).len(), 1);
        assert_eq!(h.transport.requests_to(DISPLAY_PATH).len(), 2);
        assert_eq!(h.poll.refresh_interval(), Duration::from_secs(60));
        // Timer untouched
        assert_eq!(h.poll.phase(), LoopPhase::Stopped);
    }

    #[tokio::test]
    async fn test_execute_cycle_with_manual_key() {
        let h = harness();
        h.inputs.set_api_key(Some("manual".into()));
        push_display(&h.transport, "300");

        h.poll.execute_cycle().await.unwrap();

        assert!(h.transport.requests_to(SETUP_PATH).is_empty());
        let display = h.transport.requests_to(DISPLAY_PATH);
        assert_eq!(display[0].header_value(HEADER_ACCESS_TOKEN), Some("manual"));
    }

    #[tokio::test]
    async fn test_cleared_manual_key_provisions_again() {
        let h = harness();
        h.inputs.set_api_key(Some("manual".into()));
        push_display(&h.transport, "300");

        h.poll.execute_cycle().await.unwrap();
        assert_eq!(h.poll.api_key(), None);

        h.inputs.set_api_key(None);
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "300");

        h.poll.execute_cycle().await.unwrap();

        assert_eq!(h.transport.requests_to(SETUP_PATH).len(), 1);
        let display = h.transport.requests_to(DISPLAY_PATH);
        assert_eq!(display.len(), 2);
        assert_eq!(display[1].header_value(HEADER_ACCESS_TOKEN), Some("k1"));
        assert_eq!(h.poll.api_key().as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_execute_cycle_reports_stage() {
        let h = harness();
        h.transport.push_json(SETUP_PATH, 200, json!({"status": 500}));

        let err = h.poll.execute_cycle().await.unwrap_err();
        assert_eq!(err.stage, CycleStage::Provision);
        assert_eq!(err.kind(), ErrorKind::Api);
        assert_eq!(h.poll.api_key(), None);
    }

    #[tokio::test]
    async fn test_unusable_refresh_rate_keeps_interval() {
        let h = harness();
        let poll = h.poll.clone().with_refresh_interval(Duration::from_secs(42));
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "whenever");

        assert_eq!(poll.execute_cycle().await.unwrap(), Duration::from_secs(42));
        assert_eq!(h.poll.refresh_interval(), Duration::from_secs(42));
    }

    #[tokio::test]
    async fn test_stop_before_fire_cancels_cycle() {
        let h = harness();
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "300");

        h.poll.start(true);
        h.poll.stop();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.transport.request_count(), 0);
        assert_eq!(h.poll.phase(), LoopPhase::Stopped);
        assert_eq!(h.presenter.controls(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_stop_during_cycle_suppresses_rearm() {
        let h = harness();
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "300");
        let gate = h.transport.hold_requests();
        let mut rx = h.poll.subscribe();

        h.poll.start(true);
        wait_for_requests(&h.transport, 1).await;
        assert_eq!(h.poll.phase(), LoopPhase::Running);

        h.poll.stop();
        assert_eq!(h.poll.phase(), LoopPhase::Stopped);

        // Let the in-flight cycle finish
        gate.notify_one();
        wait_for_requests(&h.transport, 2).await;
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(next_event(&mut rx).await, LoopEvent::Armed { .. }));
        assert_eq!(next_event(&mut rx).await, LoopEvent::Stopped);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(h.poll.phase(), LoopPhase::Stopped);
        assert!(h.presenter.alerts().is_empty());
        assert_eq!(h.presenter.controls(), vec![true, false]);
        // The cycle's image still lands
        assert_eq!(
            h.presenter.current_image().as_deref(),
            Some("https://x.test/b.png")
        );
    }

    #[tokio::test]
    async fn test_stale_cycle_leaves_session_untouched() {
        let h = harness();
        let initial_interval = h.poll.refresh_interval();
        push_setup(&h.transport, "k1");
        push_display(&h.transport, "300");
        let gate = h.transport.hold_requests();

        h.poll.start(true);
        wait_for_requests(&h.transport, 1).await;
        h.poll.stop();

        gate.notify_one();
        wait_for_requests(&h.transport, 2).await;
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both requests completed, but neither the key nor the interval stuck
        assert_eq!(h.transport.requests_to(DISPLAY_PATH).len(), 1);
        assert_eq!(h.poll.api_key(), None);
        assert_eq!(h.poll.refresh_interval(), initial_interval);
    }

    #[tokio::test]
    async fn test_restart_after_failure() {
        let h = harness();
        h.transport.push_response(SETUP_PATH, 502, "");
        let mut rx = h.poll.subscribe();

        h.poll.start(true);
        assert!(matches!(next_event(&mut rx).await, LoopEvent::Armed { .. }));
        assert!(matches!(
            next_event(&mut rx).await,
            LoopEvent::CycleFailed { .. }
        ));
        assert_eq!(next_event(&mut rx).await, LoopEvent::Stopped);

        push_setup(&h.transport, "k2");
        push_display(&h.transport, "120");
        h.poll.start(true);

        assert!(matches!(next_event(&mut rx).await, LoopEvent::Armed { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            LoopEvent::CycleCompleted {
                refresh_interval: Duration::from_secs(120)
            }
        );
        assert_eq!(h.poll.api_key().as_deref(), Some("k2"));

        h.poll.stop();
        assert_eq!(h.presenter.controls(), vec![true, false, true, false]);
    }
}
