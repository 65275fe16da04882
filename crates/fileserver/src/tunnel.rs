//! Tunnel clients for exposing the file server to the internet
//!
//! Supports multiple tunnel providers:
//! - Pinggy (SSH-based, runs the system `ssh` client)
//! - localhost.run (SSH-based, using russh async library)
//! - Cloudflare Tunnel (requires cloudflared)
//! - None (local only, no public URL)
//!
//! Every client implements [`Tunnel`]: `run()` blocks until the tunnel ends
//! and `stop()` tears it down within a few seconds.
//!
//! Tunnels forward to the address the file server actually bound, so a
//! server on a LAN address is reached there rather than on loopback.

use russh::client::{self, Msg};
use russh::keys::ssh_key::PublicKey;
use russh::{Channel, ChannelId, Disconnect};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;

use crate::error::TunnelError;

/// Upper bound for tearing a tunnel down
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// How long to keep reading output after the helper exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Placeholders replaced in command arguments
const ADDR_PLACEHOLDER: &str = "{addr}";
const PORT_PLACEHOLDER: &str = "{port}";

/// Longest unfinished output line kept between chunks
const MAX_PENDING_LINE: usize = 8 * 1024;

/// Address a tunnel should connect to for a server bound on `addr`
///
/// Wildcard binds are reached over loopback of the same family.
pub(crate) fn reachable_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}

/// Tunnel provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProvider {
    /// Pinggy - SSH-based tunnel through the system ssh client
    Pinggy,
    /// localhost.run - SSH-based tunnel, no installation required
    LocalhostRun,
    /// Cloudflare Tunnel - requires cloudflared binary
    Cloudflare,
    /// No tunnel - local access only
    None,
}

impl TunnelProvider {
    pub fn name(&self) -> &'static str {
        match self {
            TunnelProvider::Pinggy => "Pinggy",
            TunnelProvider::LocalhostRun => "localhost.run",
            TunnelProvider::Cloudflare => "Cloudflare",
            TunnelProvider::None => "local",
        }
    }

    /// Whether `url` is the public endpoint this provider hands out
    fn is_public_url(&self, url: &str) -> bool {
        match self {
            // localhost.run URLs look like: https://xxxx.lhr.life or https://xxxx.localhost.run
            TunnelProvider::LocalhostRun => {
                !url.contains("admin.localhost.run")
                    && !url.contains("localhost.run/docs")
                    && !url.contains("twitter.com")
                    && (url.contains(".lhr.life") || url.contains(".localhost.run"))
            }
            TunnelProvider::Cloudflare => url.contains(".trycloudflare.com"),
            TunnelProvider::Pinggy => url.contains(".pinggy.link") || url.contains(".pinggy.online"),
            TunnelProvider::None => false,
        }
    }

    /// Find this provider's public URL in a chunk of tunnel output
    pub fn find_public_url(&self, text: &str) -> Option<String> {
        text.lines()
            .filter_map(extract_url_from_line)
            .find(|url| self.is_public_url(url))
    }
}

/// Parse tunnel provider from string
impl std::str::FromStr for TunnelProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pinggy" | "pinggy.io" => Ok(TunnelProvider::Pinggy),
            "localhost.run" | "localhostrun" | "localhost-run" => Ok(TunnelProvider::LocalhostRun),
            "cloudflare" | "cf" => Ok(TunnelProvider::Cloudflare),
            "none" | "local" | "disabled" | "" => Ok(TunnelProvider::None),
            _ => Err(format!("Unknown tunnel provider: {}", s)),
        }
    }
}

/// Public endpoint announced by a running tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    /// Public URL for accessing the server
    pub public_url: String,
    /// Provider name
    pub provider: String,
}

/// A tunnel client the supervisor can run in the foreground
pub trait Tunnel: Send {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Forward the server at `local_addr` publicly; resolves when the tunnel ends
    fn run(
        &mut self,
        local_addr: SocketAddr,
    ) -> impl Future<Output = Result<(), TunnelError>> + Send;

    /// Tear the tunnel down; a no-op when it is not running
    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}

/// Publishes the discovered public URL to whoever listens
#[derive(Clone)]
struct UrlAnnouncer {
    provider: TunnelProvider,
    tx: Arc<watch::Sender<Option<TunnelInfo>>>,
}

impl UrlAnnouncer {
    fn new(provider: TunnelProvider) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            provider,
            tx: Arc::new(tx),
        }
    }

    fn announce(&self, url: String) {
        let provider = self.provider.name();
        self.tx.send_if_modified(|current| {
            if current.as_ref().is_some_and(|info| info.public_url == url) {
                return false;
            }
            tracing::info!("{} tunnel established: {}", provider, url);
            *current = Some(TunnelInfo {
                public_url: url.clone(),
                provider: provider.to_string(),
            });
            true
        });
    }

    /// Scan a chunk of output for the public URL
    fn observe(&self, text: &str) {
        if let Some(url) = self.provider.find_public_url(text) {
            self.announce(url);
        }
    }

    fn subscribe(&self) -> watch::Receiver<Option<TunnelInfo>> {
        self.tx.subscribe()
    }
}

/// Tunnel backed by an external helper process
pub struct CommandTunnel {
    provider: TunnelProvider,
    program: String,
    args: Vec<String>,
    hint: &'static str,
    announcer: UrlAnnouncer,
    child: Option<Child>,
}

impl CommandTunnel {
    /// Create a tunnel running `program` with `args`
    ///
    /// `{addr}` in any argument is replaced with the server's `host:port`
    /// (IPv6 bracketed) and `{port}` with the port alone.
    pub fn new<I, S>(provider: TunnelProvider, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            provider,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            hint: "Make sure it is installed and on your PATH.",
            announcer: UrlAnnouncer::new(provider),
            child: None,
        }
    }

    fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = hint;
        self
    }

    /// Pinggy through the system OpenSSH client
    pub fn pinggy() -> Self {
        Self::new(
            TunnelProvider::Pinggy,
            "ssh",
            [
                "-p",
                "443",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "ServerAliveInterval=30",
                "-o",
                "ExitOnForwardFailure=yes",
                "-R0:{addr}",
                "a.pinggy.io",
            ],
        )
        .with_hint("Install an OpenSSH client to use Pinggy tunnels.")
    }

    /// Cloudflare quick tunnel through cloudflared
    pub fn cloudflare() -> Self {
        Self::new(
            TunnelProvider::Cloudflare,
            "cloudflared",
            ["tunnel", "--url", "http://{addr}"],
        )
        .with_hint("Install from: https://developers.cloudflare.com/cloudflare-one/connections/connect-apps/install-and-setup/installation/")
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TunnelInfo>> {
        self.announcer.subscribe()
    }

    fn spawn(&self, local_addr: SocketAddr) -> Result<Child, TunnelError> {
        let args = expand_args(&self.args, local_addr);

        tracing::debug!("Spawning {} {}", self.program, args.join(" "));

        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => TunnelError::MissingBinary {
                    program: self.program.clone(),
                    hint: self.hint,
                },
                _ => TunnelError::Spawn {
                    program: self.program.clone(),
                    source,
                },
            })
    }
}

impl Tunnel for CommandTunnel {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn run(&mut self, local_addr: SocketAddr) -> Result<(), TunnelError> {
        tracing::info!("Starting {} tunnel to {}", self.provider.name(), local_addr);

        let mut child = self.spawn(local_addr)?;
        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stderr = child.stderr.take().map(|err| BufReader::new(err).lines());
        let watcher = OutputWatcher {
            program: self.program.clone(),
            announcer: self.announcer.clone(),
        };
        let child = self.child.insert(child);

        let status = loop {
            tokio::select! {
                line = next_line(&mut stdout) => match line {
                    Some(line) => watcher.line(&line),
                    None => stdout = None,
                },
                line = next_line(&mut stderr) => match line {
                    Some(line) => watcher.line(&line),
                    None => stderr = None,
                },
                status = child.wait() => break status?,
            }
        };

        // Output written right before exit may still be buffered in the pipes
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            watcher.drain(stdout).await;
            watcher.drain(stderr).await;
        })
        .await;

        self.child = None;

        if status.success() {
            tracing::info!("{} tunnel closed", self.provider.name());
            Ok(())
        } else {
            Err(TunnelError::Exited {
                provider: self.provider.name().to_string(),
                status,
            })
        }
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        tracing::info!("Shutting down {} tunnel", self.provider.name());
        if let Err(e) = child.start_kill() {
            tracing::debug!("Failed to signal {}: {}", self.program, e);
        }

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("{} exited: {}", self.program, status),
            Ok(Err(e)) => tracing::warn!("Failed to reap {}: {}", self.program, e),
            Err(_) => tracing::warn!("{} did not exit within {:?}", self.program, STOP_TIMEOUT),
        }
    }
}

fn expand_args(args: &[String], local_addr: SocketAddr) -> Vec<String> {
    let addr = local_addr.to_string();
    let port = local_addr.port().to_string();
    args.iter()
        .map(|arg| {
            arg.replace(ADDR_PLACEHOLDER, &addr)
                .replace(PORT_PLACEHOLDER, &port)
        })
        .collect()
}

/// Logs helper output and looks for the public URL in it
struct OutputWatcher {
    program: String,
    announcer: UrlAnnouncer,
}

impl OutputWatcher {
    fn line(&self, line: &str) {
        tracing::debug!("{}: {}", self.program, line);
        self.announcer.observe(line);
    }

    async fn drain<R>(&self, lines: Option<Lines<BufReader<R>>>)
    where
        R: AsyncRead + Unpin,
    {
        let Some(mut lines) = lines else {
            return;
        };
        while let Ok(Some(line)) = lines.next_line().await {
            self.line(&line);
        }
    }
}

/// Next line of a child's output, or pending forever once it is closed
async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Splits streamed output into lines and scans each one for the URL
///
/// Only the unfinished last line is kept between chunks.
struct LineScanner {
    announcer: UrlAnnouncer,
    pending: Vec<u8>,
}

impl LineScanner {
    fn new(announcer: UrlAnnouncer) -> Self {
        Self {
            announcer,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.pending[start..]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
        {
            let end = start + offset;
            self.scan(start, end);
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > MAX_PENDING_LINE {
            self.scan(0, self.pending.len());
            self.pending.clear();
        }
    }

    fn scan(&self, start: usize, end: usize) {
        let line = String::from_utf8_lossy(&self.pending[start..end]);
        if !line.trim().is_empty() {
            tracing::debug!("localhost.run: {}", line);
            self.announcer.observe(&line);
        }
    }
}

/// Client handler for localhost.run SSH connection
struct LocalhostRunClient {
    local_addr: SocketAddr,
    scanner: Arc<Mutex<LineScanner>>,
}

impl LocalhostRunClient {
    fn record(&self, data: Vec<u8>) -> impl Future<Output = Result<(), russh::Error>> + Send {
        let scanner = self.scanner.clone();
        async move {
            scanner.lock().await.push(&data);
            Ok(())
        }
    }
}

impl client::Handler for LocalhostRunClient {
    type Error = russh::Error;

    /// Called when server sends auth banner - localhost.run sends URL here
    fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        tracing::debug!("SSH auth banner: {}", banner);
        let mut data = banner.as_bytes().to_vec();
        data.push(b'\n');
        self.record(data)
    }

    /// Called when server sends channel data
    fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.record(data.to_vec())
    }

    /// Called when server sends extended data (stderr)
    fn extended_data(
        &mut self,
        _channel: ChannelId,
        _ext: u32,
        data: &[u8],
        _session: &mut client::Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.record(data.to_vec())
    }

    /// Handle incoming forwarded TCP connection
    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        let local_addr = self.local_addr;
        async move {
            tracing::debug!(
                "Forwarded connection received, proxying to {}",
                local_addr
            );

            tokio::spawn(async move {
                if let Err(e) = handle_forwarded_connection(channel, local_addr).await {
                    tracing::warn!("Error handling forwarded connection: {}", e);
                }
            });

            Ok(())
        }
    }

    /// Accept all host keys (localhost.run is a known service)
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Proxy a forwarded SSH channel to the local server
async fn handle_forwarded_connection(
    channel: Channel<Msg>,
    local_addr: SocketAddr,
) -> Result<(), TunnelError> {
    let mut local = TcpStream::connect(local_addr).await?;
    let mut remote = Box::pin(channel.into_stream());
    tokio::io::copy_bidirectional(&mut remote, &mut local).await?;
    Ok(())
}

/// localhost.run tunnel over an in-process SSH session
pub struct LocalhostRunTunnel {
    announcer: UrlAnnouncer,
    session: Option<client::Handle<LocalhostRunClient>>,
    reader: Option<AbortHandle>,
}

impl Default for LocalhostRunTunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalhostRunTunnel {
    pub fn new() -> Self {
        Self {
            announcer: UrlAnnouncer::new(TunnelProvider::LocalhostRun),
            session: None,
            reader: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TunnelInfo>> {
        self.announcer.subscribe()
    }

    async fn connect(&mut self, local_addr: SocketAddr) -> Result<(), TunnelError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });

        let handler = LocalhostRunClient {
            local_addr,
            scanner: Arc::new(Mutex::new(LineScanner::new(self.announcer.clone()))),
        };

        tracing::info!("Connecting to localhost.run:22...");
        let handle = client::connect(config, ("localhost.run", 22), handler)
            .await
            .map_err(|e| TunnelError::Connect(format!("Failed to connect to localhost.run: {}", e)))?;
        let handle = self.session.insert(handle);

        // Authenticate with "none" method (anonymous)
        let auth_result = handle
            .authenticate_none("nokey")
            .await
            .map_err(|e| TunnelError::Connect(format!("Authentication failed: {}", e)))?;

        if !auth_result.success() {
            return Err(TunnelError::Connect(
                "Authentication rejected by localhost.run".to_string(),
            ));
        }

        // localhost.run sends the URL through a session channel with a PTY
        let channel = handle.channel_open_session().await?;
        channel.request_pty(false, "xterm", 80, 24, 0, 0, &[]).await?;
        channel.request_shell(false).await?;

        handle
            .tcpip_forward("localhost", 80)
            .await
            .map_err(|e| TunnelError::Connect(format!("Failed to request port forwarding: {}", e)))?;

        tracing::info!("Port forwarding requested, waiting for URL...");

        let mut scanner = LineScanner::new(self.announcer.clone());
        let reader = tokio::spawn(async move {
            let mut reader = Box::pin(channel.into_stream());
            let mut chunk = [0u8; 4096];

            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => scanner.push(&chunk[..n]),
                    Err(e) => {
                        tracing::debug!("Channel read error: {}", e);
                        break;
                    }
                }
            }
        });
        self.reader = Some(reader.abort_handle());

        Ok(())
    }
}

impl Tunnel for LocalhostRunTunnel {
    fn name(&self) -> &str {
        TunnelProvider::LocalhostRun.name()
    }

    async fn run(&mut self, local_addr: SocketAddr) -> Result<(), TunnelError> {
        tracing::info!("Starting localhost.run tunnel to {}", local_addr);

        if let Err(e) = self.connect(local_addr).await {
            self.stop().await;
            return Err(e);
        }

        // The handle processes forwarded connections via the Handler trait
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match self.session.as_ref() {
                Some(handle) if !handle.is_closed() => continue,
                _ => break,
            }
        }

        self.session = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Err(TunnelError::Connect(
            "Connection closed by localhost.run".to_string(),
        ))
    }

    async fn stop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        let Some(handle) = self.session.take() else {
            return;
        };

        tracing::info!("Shutting down localhost.run tunnel");
        let disconnect = handle.disconnect(Disconnect::ByApplication, "shutdown", "en");
        match tokio::time::timeout(STOP_TIMEOUT, disconnect).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Disconnect from localhost.run failed: {}", e),
            Err(_) => tracing::warn!("Disconnect from localhost.run timed out"),
        }
    }
}

/// No public endpoint; advertises the local URL and waits for interruption
pub struct LocalTunnel {
    announcer: UrlAnnouncer,
}

impl Default for LocalTunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTunnel {
    pub fn new() -> Self {
        Self {
            announcer: UrlAnnouncer::new(TunnelProvider::None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TunnelInfo>> {
        self.announcer.subscribe()
    }
}

impl Tunnel for LocalTunnel {
    fn name(&self) -> &str {
        TunnelProvider::None.name()
    }

    async fn run(&mut self, local_addr: SocketAddr) -> Result<(), TunnelError> {
        self.announcer.announce(format!("http://{}/", local_addr));
        std::future::pending().await
    }

    async fn stop(&mut self) {}
}

/// Tunnel client selected at runtime from a [`TunnelProvider`]
pub enum TunnelClient {
    Command(CommandTunnel),
    LocalhostRun(LocalhostRunTunnel),
    Local(LocalTunnel),
}

impl TunnelClient {
    pub fn new(provider: TunnelProvider) -> Self {
        match provider {
            TunnelProvider::Pinggy => TunnelClient::Command(CommandTunnel::pinggy()),
            TunnelProvider::Cloudflare => TunnelClient::Command(CommandTunnel::cloudflare()),
            TunnelProvider::LocalhostRun => TunnelClient::LocalhostRun(LocalhostRunTunnel::new()),
            TunnelProvider::None => TunnelClient::Local(LocalTunnel::new()),
        }
    }

    /// Watch for the public URL once the tunnel announces it
    pub fn subscribe(&self) -> watch::Receiver<Option<TunnelInfo>> {
        match self {
            TunnelClient::Command(tunnel) => tunnel.subscribe(),
            TunnelClient::LocalhostRun(tunnel) => tunnel.subscribe(),
            TunnelClient::Local(tunnel) => tunnel.subscribe(),
        }
    }
}

impl Tunnel for TunnelClient {
    fn name(&self) -> &str {
        match self {
            TunnelClient::Command(tunnel) => tunnel.name(),
            TunnelClient::LocalhostRun(tunnel) => tunnel.name(),
            TunnelClient::Local(tunnel) => tunnel.name(),
        }
    }

    async fn run(&mut self, local_addr: SocketAddr) -> Result<(), TunnelError> {
        match self {
            TunnelClient::Command(tunnel) => tunnel.run(local_addr).await,
            TunnelClient::LocalhostRun(tunnel) => tunnel.run(local_addr).await,
            TunnelClient::Local(tunnel) => tunnel.run(local_addr).await,
        }
    }

    async fn stop(&mut self) {
        match self {
            TunnelClient::Command(tunnel) => tunnel.stop().await,
            TunnelClient::LocalhostRun(tunnel) => tunnel.stop().await,
            TunnelClient::Local(tunnel) => tunnel.stop().await,
        }
    }
}

/// Extract URL from a line of text
fn extract_url_from_line(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    let url_part = &line[start..];
    let end = url_part
        .find(|c: char| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '<' | '>' | '|'))
        .unwrap_or(url_part.len());

    let url = url_part[..end].trim().to_string();
    if url.len() > 10 {
        Some(url)
    } else {
        None
    }
}
