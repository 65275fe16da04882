//! HTTP server that offers a single file as a forced download

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::TryStreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::fs::File;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio_util::io::ReaderStream;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::{RequestIoError, ServeError};
use crate::spec::ServeSpec;

/// How long in-flight downloads may keep running after `stop()`
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Sent on every response, including 404s
const NO_CACHE: &str = "no-cache, max-age=0";

/// Single-file download server
///
/// The server runs on its own OS thread with its own tokio runtime, so a
/// crash in it cannot take the caller down and it can be stopped
/// independently through the returned [`ServerHandle`].
#[derive(Clone)]
pub struct FileServer {
    spec: Arc<ServeSpec>,
    grace_period: Duration,
}

impl FileServer {
    /// Create a new file server for `spec`
    pub fn new(spec: ServeSpec) -> Self {
        Self {
            spec: Arc::new(spec),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Bound the time in-flight transfers get to finish after `stop()`
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Get the spec being served
    pub fn spec(&self) -> &ServeSpec {
        &self.spec
    }

    /// Create the axum router with all routes configured
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(download).fallback(not_found))
            .fallback(not_found)
            .with_state(self.spec.clone())
            .layer(SetResponseHeaderLayer::overriding(
                header::CACHE_CONTROL,
                HeaderValue::from_static(NO_CACHE),
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Start the file server in the background
    ///
    /// Validates the file, then launches the server thread and waits until
    /// it reports that the listening socket is bound. When this returns
    /// `Ok`, connections to [`ServerHandle::local_addr`] are accepted.
    ///
    /// # Errors
    /// * `ServeError::InvalidFile` - checked before any socket is opened
    /// * `ServeError::Bind` - the address is unavailable
    pub async fn start(self) -> Result<ServerHandle, ServeError> {
        let info = self.spec.validate()?;
        tracing::debug!(
            "Validated {} ({} bytes) as '{}'",
            info.path.display(),
            info.size,
            info.download_name
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("fileserver".to_string())
            .spawn(move || {
                // Dropped when the thread ends, even by unwinding
                let _exited = exited_tx;
                self.run_blocking(ready_tx, shutdown_rx);
            })
            .map_err(ServeError::Spawn)?;

        match ready_rx.await {
            Ok(Ok(local_addr)) => Ok(ServerHandle {
                local_addr,
                shutdown_tx,
                exited_rx: Some(exited_rx),
                thread: Some(thread),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ServeError::Crashed),
        }
    }

    /// Body of the server thread
    fn run_blocking(
        self,
        ready_tx: oneshot::Sender<Result<SocketAddr, ServeError>>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fileserver-worker")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready_tx.send(Err(ServeError::Runtime(e)));
                return;
            }
        };

        let grace_period = self.grace_period;
        runtime.block_on(self.serve(ready_tx, shutdown_rx));

        // Connection tasks still alive here are dropped; blocking file reads
        // get the same grace before the runtime is torn down.
        runtime.shutdown_timeout(grace_period);
        tracing::info!("File server stopped");
    }

    async fn serve(
        self,
        ready_tx: oneshot::Sender<Result<SocketAddr, ServeError>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let addr = self.spec.bind_addr();
        let listener = match TcpListener::bind((self.spec.host(), self.spec.port())).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = ready_tx.send(Err(ServeError::Bind { addr, source }));
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(source) => {
                let _ = ready_tx.send(Err(ServeError::Bind { addr, source }));
                return;
            }
        };

        tracing::info!(
            "Serving '{}' at http://{}",
            self.spec.download_name(),
            local_addr
        );

        let mut graceful_rx = shutdown_rx.clone();
        let server = axum::serve(listener, self.router()).with_graceful_shutdown(async move {
            let _ = graceful_rx.wait_for(|stop| *stop).await;
        });
        let mut server = tokio::spawn(async move { server.await });

        if ready_tx.send(Ok(local_addr)).is_err() {
            tracing::warn!("Server starter went away before readiness, shutting down");
            server.abort();
            return;
        }

        tokio::select! {
            result = &mut server => {
                match result {
                    Ok(Ok(())) => tracing::warn!("File server exited without a stop request"),
                    Ok(Err(e)) => tracing::error!("File server failed: {}", e),
                    Err(e) => tracing::error!("File server task failed: {}", e),
                }
                return;
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => {}
        }

        tracing::info!("Stop requested, no longer accepting connections on {}", local_addr);

        match tokio::time::timeout(self.grace_period, &mut server).await {
            Ok(Ok(Ok(()))) => tracing::debug!("All transfers drained"),
            Ok(Ok(Err(e))) => tracing::error!("File server failed during shutdown: {}", e),
            Ok(Err(e)) => tracing::error!("File server task failed during shutdown: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Transfers still running after {:?}, cutting them off",
                    self.grace_period
                );
                server.abort();
            }
        }
    }
}

/// Result of [`ServerHandle::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The server thread exited cleanly
    Stopped,
    /// The server thread had panicked
    Crashed,
    /// Nothing to do, the handle was stopped before
    AlreadyStopped,
    /// The thread did not exit in time and was left behind
    TimedOut,
}

/// Owner of a running [`FileServer`]
///
/// Dropping the handle requests shutdown but does not wait for it.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    exited_rx: Option<oneshot::Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the server actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the server thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Resolve once the server thread has ended, for whatever reason
    ///
    /// Cancel-safe. Never resolves after a successful `stop()`.
    pub async fn exited(&mut self) {
        match self.exited_rx.as_mut() {
            Some(exited_rx) => {
                let _ = exited_rx.await;
                self.exited_rx = None;
            }
            None if self.thread.is_some() => {}
            None => std::future::pending().await,
        }
    }

    /// Stop the server and wait up to `timeout` for its thread to exit
    ///
    /// Calling this on an already stopped handle is a no-op.
    pub async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        let Some(thread) = self.thread.take() else {
            return StopOutcome::AlreadyStopped;
        };

        self.shutdown_tx.send_replace(true);

        if let Some(exited_rx) = self.exited_rx.take() {
            if tokio::time::timeout(timeout, exited_rx).await.is_err() {
                tracing::warn!(
                    "File server on {} did not exit within {:?}, leaving it behind",
                    self.local_addr,
                    timeout
                );
                return StopOutcome::TimedOut;
            }
        }

        // The exit signal fires as the thread finishes, so this join is short
        match thread.join() {
            Ok(()) => StopOutcome::Stopped,
            Err(_) => {
                tracing::error!("File server thread panicked");
                StopOutcome::Crashed
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Build the `Content-Disposition` value for `name`
///
/// Quotes, backslashes and non-ASCII characters are replaced in the plain
/// `filename` parameter; when anything had to be replaced the exact name is
/// also sent as RFC 5987 `filename*`.
pub fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if fallback == name {
        format!("attachment; filename=\"{}\"", name)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            urlencoding::encode(name)
        )
    }
}

/// Stream the served file
async fn download(State(spec): State<Arc<ServeSpec>>) -> Result<Response, AppError> {
    // Opened per request so a rebuilt archive is always picked up
    let file = File::open(spec.file_path())
        .await
        .map_err(|e| RequestIoError::new("open", e))?;

    let metadata = file
        .metadata()
        .await
        .map_err(|e| RequestIoError::new("metadata", e))?;
    let file_size = metadata.len();

    let path = spec.file_path().to_path_buf();
    let stream = ReaderStream::new(file).inspect_err(move |e| {
        tracing::error!("Read failed while streaming {}: {}", path.display(), e);
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, file_size)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(spec.download_name()),
        )
        .body(Body::from_stream(stream))
        .map_err(AppError::Build)?;

    Ok(response)
}

async fn not_found() -> impl IntoResponse {
    AppError::NotFound
}

/// Application error types
#[derive(Debug)]
enum AppError {
    NotFound,
    Io(RequestIoError),
    Build(axum::http::Error),
}

impl From<RequestIoError> for AppError {
    fn from(err: RequestIoError) -> Self {
        AppError::Io(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            AppError::Io(err) => {
                tracing::error!("Error serving file: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to serve file").into_response()
            }
            AppError::Build(err) => {
                tracing::error!("Failed to build response: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to serve file").into_response()
            }
        }
    }
}
