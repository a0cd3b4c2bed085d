//! Filesystem-backed read handler
//!
//! Serves files below a root directory. Requests that escape the root (`..`
//! components or symlinks pointing outside) are refused with an access
//! violation.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tftp::{ReadHandler, Session, TftpErrorCode, TransferMode, convert_to_netascii};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Where a requested filename leads
#[derive(Debug, PartialEq, Eq)]
pub enum Resolved {
    File(PathBuf),
    NotFound,
    /// Outside the root, or not a regular file
    Forbidden,
}

/// Resolve `filename` below `root`, which must already be canonical.
///
/// A leading `/` is ignored since many boot firmwares send absolute names.
pub async fn resolve_path(root: &Path, filename: &str) -> Resolved {
    let relative = Path::new(filename.trim_start_matches('/'));

    if filename.is_empty() || relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return Resolved::Forbidden;
    }

    let canonical = match tokio::fs::canonicalize(root.join(relative)).await {
        Ok(path) => path,
        Err(e) if e.kind() == ErrorKind::NotFound => return Resolved::NotFound,
        Err(e) => {
            tracing::debug!("Cannot resolve '{}': {}", filename, e);
            return Resolved::Forbidden;
        }
    };

    // Symlinks may point anywhere
    if !canonical.starts_with(root) {
        return Resolved::Forbidden;
    }

    match tokio::fs::metadata(&canonical).await {
        Ok(meta) if meta.is_file() => Resolved::File(canonical),
        Ok(_) => Resolved::Forbidden,
        Err(_) => Resolved::NotFound,
    }
}

/// Serves files from a directory in octet or netascii mode
#[derive(Debug, Clone)]
pub struct FsReadHandler {
    root: PathBuf,
}

impl FsReadHandler {
    /// Create a handler for `root`, which must be an existing directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .with_context(|| format!("failed to canonicalize root directory {}", root.as_ref().display()))?;

        if !root.is_dir() {
            return Err(anyhow!("{} is not a directory", root.display()));
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ReadHandler for FsReadHandler {
    async fn handle(&self, session: &mut Session) -> Result<()> {
        let Some(mode) = TransferMode::from_str_opt(session.mode()) else {
            let message = format!("Transfer mode '{}' not supported", session.mode());
            session.write_error(TftpErrorCode::IllegalOpcode, &message);
            return Ok(());
        };

        let path = match resolve_path(&self.root, session.filename()).await {
            Resolved::File(path) => path,
            Resolved::NotFound => {
                session.write_error(TftpErrorCode::FileNotFound, TftpErrorCode::FileNotFound.default_message());
                return Ok(());
            }
            Resolved::Forbidden => {
                tracing::warn!("Refusing '{}' requested by {}", session.filename(), session.peer());
                session.write_error(
                    TftpErrorCode::AccessViolation,
                    TftpErrorCode::AccessViolation.default_message(),
                );
                return Ok(());
            }
        };

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Cannot open {}: {}", path.display(), e);
                session.write_error(
                    TftpErrorCode::AccessViolation,
                    TftpErrorCode::AccessViolation.default_message(),
                );
                return Ok(());
            }
        };

        send_file(session, &mut file, mode)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        session.close().await?;
        Ok(())
    }
}

async fn send_file(session: &mut Session, file: &mut File, mode: TransferMode) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    // CR held back until we know whether LF follows
    let mut pending_cr = false;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        match mode {
            TransferMode::Octet => session.write_all(&buf[..n]).await?,
            TransferMode::NetAscii => {
                let mut chunk = Vec::with_capacity(n + 1);
                if pending_cr {
                    chunk.push(b'\r');
                }
                chunk.extend_from_slice(&buf[..n]);

                pending_cr = chunk.last() == Some(&b'\r');
                if pending_cr {
                    chunk.pop();
                }
                session.write_all(&convert_to_netascii(&chunk)).await?;
            }
        }
    }

    if pending_cr {
        session.write_all(&convert_to_netascii(b"\r")).await?;
    }

    Ok(())
}
