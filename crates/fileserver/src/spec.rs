//! Description of the single file a session serves

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{InvalidFileReason, ServeError};

/// Port used when none is given
pub const DEFAULT_PORT: u16 = 8000;

/// Host used by supervised sessions; only reachable locally, the tunnel
/// connects to it over loopback
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Fallback download name for paths without a final component
const FALLBACK_DOWNLOAD_NAME: &str = "download";

/// What to serve and where to listen.
///
/// Built once and handed to [`crate::FileServer`], which keeps it behind an
/// `Arc` for the lifetime of the server. There are no setters after that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServeSpec {
    file_path: PathBuf,
    download_name: String,
    port: u16,
    host: String,
}

/// File metadata exposed to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub download_name: String,
    pub size: u64,
}

impl ServeSpec {
    /// Create a spec for `file_path` with default port, host and download name
    ///
    /// Relative paths are made absolute against the current directory. The
    /// file itself is not checked here; see [`ServeSpec::validate`].
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let file_path = std::path::absolute(&file_path).unwrap_or(file_path);
        let download_name = default_download_name(&file_path);

        Self {
            file_path,
            download_name,
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
        }
    }

    /// Override the name offered to downloaders
    pub fn with_download_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.download_name = name;
        }
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn download_name(&self) -> &str {
        &self.download_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Check that the path is a regular, readable file
    ///
    /// # Returns
    /// * `Ok(FileInfo)` - metadata for display
    /// * `Err(ServeError::InvalidFile)` - the file cannot be served
    pub fn validate(&self) -> Result<FileInfo, ServeError> {
        let invalid = |reason| ServeError::InvalidFile {
            path: self.file_path.clone(),
            reason,
        };

        let metadata = std::fs::metadata(&self.file_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => invalid(InvalidFileReason::Missing),
            kind => invalid(InvalidFileReason::Unreadable(kind)),
        })?;

        if !metadata.is_file() {
            return Err(invalid(InvalidFileReason::NotRegularFile));
        }

        File::open(&self.file_path).map_err(|e| invalid(InvalidFileReason::Unreadable(e.kind())))?;

        Ok(FileInfo {
            path: self.file_path.clone(),
            download_name: self.download_name.clone(),
            size: metadata.len(),
        })
    }
}

fn default_download_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_DOWNLOAD_NAME.to_string())
}
