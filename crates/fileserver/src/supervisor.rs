//! Session lifecycle: file server in the background, tunnel in the foreground
//!
//! A session walks `Starting → Serving → ShuttingDown → Stopped`. Whatever
//! ends the tunnel phase (normal exit, failure, user interrupt, the server
//! dying underneath it) funnels into one cleanup path that stops the
//! tunnel and the file server before `run_session` returns.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::SessionError;
use crate::server::{FileServer, StopOutcome, DEFAULT_GRACE_PERIOD};
use crate::spec::{FileInfo, ServeSpec};
use crate::tunnel::{reachable_addr, Tunnel};

/// Default pause between server start and tunnel start
pub const DEFAULT_WARM_UP: Duration = Duration::from_secs(2);

/// Default bound on waiting for the server unit to exit
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing knobs for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Delay after the server reported it is bound, before the tunnel starts
    pub warm_up: Duration,
    /// Time in-flight downloads get to finish once shutdown begins
    pub grace_period: Duration,
    /// Upper bound for each cleanup step
    pub stop_timeout: Duration,
}

impl SupervisorConfig {
    /// Set the drain grace period, widening `stop_timeout` to cover it
    ///
    /// A server stop can take two grace periods: the drain itself, then
    /// runtime teardown.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        let needed = grace_period
            .saturating_mul(2)
            .saturating_add(Duration::from_secs(1));
        self.grace_period = grace_period;
        self.stop_timeout = self.stop_timeout.max(needed);
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            warm_up: DEFAULT_WARM_UP,
            grace_period: DEFAULT_GRACE_PERIOD,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

impl SessionState {
    /// Transitions only move forward; skipping ahead is allowed
    pub fn can_transition_to(self, next: SessionState) -> bool {
        next > self
    }
}

/// How a session that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The tunnel exited on its own
    Completed,
    /// The user interrupted the session
    Interrupted,
}

impl SessionOutcome {
    /// Conventional process exit code
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionOutcome::Completed => 0,
            SessionOutcome::Interrupted => 130,
        }
    }
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub file: FileInfo,
    pub local_addr: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub server_stop: StopOutcome,
}

/// What ended the foreground phase
enum PhaseEnd {
    Tunnel(Result<(), crate::error::TunnelError>),
    Interrupted,
    ServerExited,
}

/// Runs one file-sharing session
///
/// A supervisor is single use: once a session reached `Stopped`, a new
/// supervisor is needed for the next one.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    state: watch::Sender<SessionState>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (state, _rx) = watch::channel(SessionState::Starting);
        Self { config, state }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            tracing::warn!("Ignoring session transition {:?} -> {:?}", current, next);
            return;
        }
        tracing::debug!("Session {:?} -> {:?}", current, next);
        self.state.send_replace(next);
    }

    /// Serve `spec` until the tunnel ends or the user presses Ctrl+C
    pub async fn run_session<T: Tunnel>(
        &mut self,
        spec: ServeSpec,
        tunnel: &mut T,
    ) -> Result<SessionReport, SessionError> {
        let interrupt = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Interrupt received, shutting down...");
        };
        self.run_session_until(spec, tunnel, interrupt).await
    }

    /// Serve `spec` until the tunnel ends or `interrupt` resolves
    ///
    /// # Returns
    /// * `Ok(report)` - the tunnel exited normally or the session was interrupted
    /// * `Err(SessionError::Validation | Start)` - nothing was left running
    /// * `Err(SessionError::Tunnel | ServerExited)` - reported after cleanup
    pub async fn run_session_until<T, F>(
        &mut self,
        spec: ServeSpec,
        tunnel: &mut T,
        interrupt: F,
    ) -> Result<SessionReport, SessionError>
    where
        T: Tunnel,
        F: Future<Output = ()>,
    {
        if self.state() != SessionState::Starting {
            return Err(SessionError::Finished);
        }
        tokio::pin!(interrupt);

        let file = match spec.validate() {
            Ok(file) => file,
            Err(e) => {
                self.transition(SessionState::Stopped);
                return Err(SessionError::Validation(e));
            }
        };

        let started_at = Utc::now();
        let server = FileServer::new(spec).with_grace_period(self.config.grace_period);

        // The interrupt is watched from here on; a start in progress is
        // still completed so the server can be stopped properly.
        let start = server.start();
        tokio::pin!(start);
        let mut interrupted_early = false;
        let started = tokio::select! {
            biased;
            result = &mut start => result,
            _ = &mut interrupt => {
                interrupted_early = true;
                (&mut start).await
            }
        };

        let mut handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                self.transition(SessionState::Stopped);
                return Err(SessionError::Start(e));
            }
        };
        let local_addr = handle.local_addr();
        tracing::info!("File server ready on {}", local_addr);

        let warm_up = if interrupted_early {
            Some(PhaseEnd::Interrupted)
        } else {
            tokio::select! {
                biased;
                _ = &mut interrupt => Some(PhaseEnd::Interrupted),
                _ = handle.exited() => Some(PhaseEnd::ServerExited),
                _ = tokio::time::sleep(self.config.warm_up) => None,
            }
        };

        let end = match warm_up {
            Some(end) => end,
            None => {
                self.transition(SessionState::Serving);
                let target = reachable_addr(local_addr);
                tracing::info!("Starting {} tunnel to {}", tunnel.name(), target);
                tokio::select! {
                    biased;
                    _ = &mut interrupt => PhaseEnd::Interrupted,
                    _ = handle.exited() => PhaseEnd::ServerExited,
                    result = tunnel.run(target) => PhaseEnd::Tunnel(result),
                }
            }
        };

        self.transition(SessionState::ShuttingDown);

        if tokio::time::timeout(self.config.stop_timeout, tunnel.stop())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} tunnel did not stop within {:?}",
                tunnel.name(),
                self.config.stop_timeout
            );
        }

        let server_stop = handle.stop(self.config.stop_timeout).await;
        match server_stop {
            StopOutcome::Stopped | StopOutcome::AlreadyStopped => {
                tracing::info!("Background server stopped")
            }
            StopOutcome::Crashed => tracing::warn!("Background server had crashed"),
            StopOutcome::TimedOut => {
                tracing::warn!("Background server did not stop in time, continuing shutdown")
            }
        }

        self.transition(SessionState::Stopped);
        let ended_at = Utc::now();

        let outcome = match end {
            PhaseEnd::Tunnel(Ok(())) => SessionOutcome::Completed,
            PhaseEnd::Interrupted => SessionOutcome::Interrupted,
            PhaseEnd::Tunnel(Err(e)) => return Err(SessionError::Tunnel(e)),
            PhaseEnd::ServerExited => return Err(SessionError::ServerExited),
        };

        tracing::info!(
            "Session finished ({:?}) after {}s",
            outcome,
            (ended_at - started_at).num_seconds()
        );

        Ok(SessionReport {
            outcome,
            file,
            local_addr,
            started_at,
            ended_at,
            server_stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ServeError, TunnelError};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    /// How the fake tunnel's `run()` behaves
    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Block,
        /// Download the file through the local port, then succeed
        Fetch,
    }

    #[derive(Clone)]
    struct FakeTunnel {
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fetched: Arc<std::sync::Mutex<Option<Vec<u8>>>>,
        target: Arc<std::sync::Mutex<Option<SocketAddr>>>,
    }

    impl FakeTunnel {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                runs: Arc::new(AtomicUsize::new(0)),
                stops: Arc::new(AtomicUsize::new(0)),
                fetched: Arc::new(std::sync::Mutex::new(None)),
                target: Arc::new(std::sync::Mutex::new(None)),
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl Tunnel for FakeTunnel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn run(&mut self, local_addr: SocketAddr) -> Result<(), TunnelError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.target.lock().unwrap() = Some(local_addr);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(TunnelError::Connect("tunnel refused".to_string())),
                Behavior::Block => std::future::pending().await,
                Behavior::Fetch => {
                    let client = reqwest::Client::builder().no_proxy().build().unwrap();
                    let body = client
                        .get(format!("http://{}/", local_addr))
                        .send()
                        .await
                        .map_err(|e| TunnelError::Connect(e.to_string()))?
                        .bytes()
                        .await
                        .map_err(|e| TunnelError::Connect(e.to_string()))?;
                    *self.fetched.lock().unwrap() = Some(body.to_vec());
                    Ok(())
                }
            }
        }

        async fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fixture(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn quick_config() -> SupervisorConfig {
        SupervisorConfig {
            warm_up: Duration::from_millis(50),
            grace_period: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
        }
    }

    fn assert_port_free(port: u16) {
        assert!(
            TcpListener::bind(("127.0.0.1", port)).is_ok(),
            "port {} still bound",
            port
        );
    }

    #[test]
    fn test_state_transitions() {
        use SessionState::*;
        assert!(Starting.can_transition_to(Serving));
        assert!(Starting.can_transition_to(ShuttingDown));
        assert!(Serving.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));
        assert!(!Serving.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SessionOutcome::Completed.exit_code(), 0);
        assert_eq!(SessionOutcome::Interrupted.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_tunnel_reaches_server() {
        let file = fixture(b"0123456789");
        let port = free_port();
        let spec = ServeSpec::new(file.path()).with_download_name("a.txt").with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Fetch);
        let mut supervisor = ProcessSupervisor::new(quick_config());

        let report = supervisor
            .run_session_until(spec, &mut tunnel, std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Completed);
        assert_eq!(report.file.size, 10);
        assert_eq!(report.local_addr.port(), port);
        assert_eq!(report.server_stop, StopOutcome::Stopped);
        assert_eq!(
            tunnel.fetched.lock().unwrap().as_deref(),
            Some(&b"0123456789"[..])
        );
        assert_eq!(supervisor.state(), SessionState::Stopped);
        assert_port_free(port);
    }

    #[tokio::test]
    async fn test_tunnel_failure_still_cleans_up() {
        let file = fixture(b"data");
        let port = free_port();
        let spec = ServeSpec::new(file.path()).with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Fail);
        let mut supervisor = ProcessSupervisor::new(quick_config());

        let err = supervisor
            .run_session_until(spec, &mut tunnel, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Tunnel(TunnelError::Connect(_))));
        assert_eq!(tunnel.runs(), 1);
        assert_eq!(tunnel.stops(), 1);
        assert_eq!(supervisor.state(), SessionState::Stopped);
        assert_port_free(port);
    }

    #[tokio::test]
    async fn test_interrupt_during_tunnel() {
        let file = fixture(b"data");
        let port = free_port();
        let spec = ServeSpec::new(file.path()).with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Block);
        let mut supervisor = ProcessSupervisor::new(quick_config());
        let mut states = supervisor.subscribe();

        let interrupt = tokio::time::sleep(Duration::from_millis(300));
        let report = supervisor
            .run_session_until(spec, &mut tunnel, interrupt)
            .await
            .unwrap();
        let interrupted_at = Instant::now();

        assert_eq!(report.outcome, SessionOutcome::Interrupted);
        assert_eq!(tunnel.runs(), 1);
        assert_eq!(tunnel.stops(), 1);
        assert_eq!(*states.borrow_and_update(), SessionState::Stopped);

        while TcpListener::bind(("127.0.0.1", port)).is_err() {
            assert!(interrupted_at.elapsed() < Duration::from_secs(2));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_interrupt_during_start_stops_server() {
        let file = fixture(b"data");
        let port = free_port();
        let spec = ServeSpec::new(file.path()).with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Succeed);
        let mut supervisor = ProcessSupervisor::new(SupervisorConfig {
            warm_up: Duration::from_secs(30),
            ..quick_config()
        });

        // Already resolved: seen while the server is still starting
        let started = Instant::now();
        let report = supervisor
            .run_session_until(spec, &mut tunnel, std::future::ready(()))
            .await
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Interrupted);
        assert_eq!(report.server_stop, StopOutcome::Stopped);
        assert_eq!(tunnel.runs(), 0);
        assert_eq!(tunnel.stops(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_port_free(port);
    }

    #[tokio::test]
    async fn test_interrupt_during_warm_up_skips_tunnel() {
        let file = fixture(b"data");
        let port = free_port();
        let spec = ServeSpec::new(file.path()).with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Succeed);
        let mut supervisor = ProcessSupervisor::new(SupervisorConfig {
            warm_up: Duration::from_secs(30),
            ..quick_config()
        });

        let started = Instant::now();
        let interrupt = tokio::time::sleep(Duration::from_millis(200));
        let report = supervisor
            .run_session_until(spec, &mut tunnel, interrupt)
            .await
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Interrupted);
        assert_eq!(tunnel.runs(), 0);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_port_free(port);
    }

    #[tokio::test]
    async fn test_wildcard_host_reached_over_loopback() {
        let file = fixture(b"0123456789");
        let spec = ServeSpec::new(file.path()).with_host("0.0.0.0").with_port(0);
        let mut tunnel = FakeTunnel::new(Behavior::Fetch);
        let mut supervisor = ProcessSupervisor::new(quick_config());

        let report = supervisor
            .run_session_until(spec, &mut tunnel, std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.outcome, SessionOutcome::Completed);
        let target = *tunnel.target.lock().unwrap();
        let target = target.unwrap();
        assert!(target.ip().is_loopback());
        assert_eq!(target.port(), report.local_addr.port());
        assert_eq!(
            tunnel.fetched.lock().unwrap().as_deref(),
            Some(&b"0123456789"[..])
        );
    }

    #[test]
    fn test_grace_period_widens_stop_timeout() {
        let config = SupervisorConfig::default().with_grace_period(Duration::from_secs(10));
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.stop_timeout, Duration::from_secs(21));

        // Never shrinks below the default
        let config = SupervisorConfig::default().with_grace_period(Duration::ZERO);
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let spec = ServeSpec::new(dir.path().join("gone.zip")).with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Succeed);
        let mut supervisor = ProcessSupervisor::new(quick_config());

        let err = supervisor
            .run_session_until(spec, &mut tunnel, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Validation(ServeError::InvalidFile { .. })));
        assert_eq!(tunnel.runs(), 0);
        assert_eq!(tunnel.stops(), 0);
        assert_port_free(port);
    }

    #[tokio::test]
    async fn test_busy_port_never_starts_tunnel() {
        let file = fixture(b"data");
        let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupant.local_addr().unwrap().port();
        let spec = ServeSpec::new(file.path()).with_port(port);
        let mut tunnel = FakeTunnel::new(Behavior::Succeed);
        let mut supervisor = ProcessSupervisor::new(quick_config());

        let err = supervisor
            .run_session_until(spec, &mut tunnel, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Start(ServeError::Bind { .. })));
        assert_eq!(tunnel.runs(), 0);
        assert_eq!(supervisor.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_supervisor_is_single_use() {
        let file = fixture(b"data");
        let mut tunnel = FakeTunnel::new(Behavior::Succeed);
        let mut supervisor = ProcessSupervisor::new(quick_config());

        let spec = ServeSpec::new(file.path()).with_port(0);
        supervisor
            .run_session_until(spec.clone(), &mut tunnel, std::future::pending())
            .await
            .unwrap();

        let err = supervisor
            .run_session_until(spec, &mut tunnel, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Finished));
        assert_eq!(tunnel.runs(), 1);
    }
}
