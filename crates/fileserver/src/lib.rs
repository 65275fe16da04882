//! Single-file sharing core
//!
//! This crate serves exactly one file over HTTP as a forced download and
//! supervises it together with a public tunnel for the length of one
//! interactive session.
//!
//! ```no_run
//! use fileserver::{ProcessSupervisor, ServeSpec, TunnelClient, TunnelProvider};
//!
//! # async fn example() -> Result<(), fileserver::SessionError> {
//! let spec = ServeSpec::new("report.pdf");
//! let mut tunnel = TunnelClient::new(TunnelProvider::Pinggy);
//! let report = ProcessSupervisor::default().run_session(spec, &mut tunnel).await?;
//! println!("session ended: {:?}", report.outcome);
//! # Ok(())
//! # }
//! ```

mod error;
mod server;
mod spec;
mod supervisor;
mod tunnel;

pub use error::{
    InvalidFileReason, RequestIoError, ServeError, SessionError, SessionPhase, TunnelError,
};
pub use server::{content_disposition, FileServer, ServerHandle, StopOutcome, DEFAULT_GRACE_PERIOD};
pub use spec::{FileInfo, ServeSpec, DEFAULT_HOST, DEFAULT_PORT};
pub use supervisor::{
    ProcessSupervisor, SessionOutcome, SessionReport, SessionState, SupervisorConfig,
    DEFAULT_STOP_TIMEOUT, DEFAULT_WARM_UP,
};
pub use tunnel::{
    CommandTunnel, LocalTunnel, LocalhostRunTunnel, Tunnel, TunnelClient, TunnelInfo,
    TunnelProvider,
};
