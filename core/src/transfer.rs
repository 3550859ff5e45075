//! Point-to-point file copy over its own TCP connection, verified with a
//! SHA-256 checksum. Wire shape: `[u64 BE length][32-byte digest][raw
//! bytes]` in 64 KiB chunks. Independent of the control-channel framing.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::TransferConfig;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const CHECKSUM_SIZE: usize = 32;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum FileTransferEvent {
    Progress {
        file_name: String,
        percent: u8,
    },
    Success {
        file_name: String,
    },
    Failure {
        file_name: String,
        reason: String,
    },
    RetryAttempt {
        file_name: String,
        attempt: u32,
        max_retries: u32,
    },
    ChecksumFailed {
        file_name: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Moves single files between peers, reporting progress and outcomes on an
/// event stream. Spawned transfers are tracked so `shutdown` can abort
/// whatever is still in flight.
pub struct FileTransfer {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: TransferConfig,
    events_tx: broadcast::Sender<FileTransferEvent>,
}

impl FileTransfer {
    pub fn new(config: TransferConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner { config, events_tx }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<FileTransferEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Single send attempt; failures surface as a `Failure` event.
    pub async fn send_file(&self, host: &str, port: u16, path: &Path) {
        if let Err(e) = self.inner.send_once(host, port, path).await {
            self.inner.emit_terminal(path, e);
        }
    }

    /// Single receive attempt on `port`; failures surface as events.
    pub async fn start_receiving(&self, port: u16, output: &Path) {
        if let Err(e) = self.inner.receive_once(port, output).await {
            self.inner.emit_terminal(output, e);
        }
    }

    /// Sends with exponential-backoff retries, announcing each retry and a
    /// terminal `Failure` when all attempts are spent.
    pub async fn send_file_with_retry(&self, host: &str, port: u16, path: &Path) {
        let inner = &self.inner;
        inner
            .with_retry(path, || inner.send_once(host, port, path))
            .await;
    }

    /// Receive counterpart of `send_file_with_retry`, re-listening on the
    /// same port between attempts.
    pub async fn start_receiving_with_retry(&self, port: u16, output: &Path) {
        let inner = &self.inner;
        inner
            .with_retry(output, || inner.receive_once(port, output))
            .await;
    }

    /// Fire-and-forget send, tracked for `shutdown`.
    pub fn spawn_send_with_retry(&self, host: String, port: u16, path: PathBuf) {
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            inner
                .with_retry(&path, || inner.send_once(&host, port, &path))
                .await;
        }));
    }

    /// Binds `port` (0 for OS-assigned), spawns the receive task, and
    /// returns the bound port so it can be advertised in a
    /// `FileTransferRequest`.
    pub async fn spawn_receiving(&self, port: u16, output: PathBuf) -> io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound = listener.local_addr()?.port();
        let inner = Arc::clone(&self.inner);
        self.track(tokio::spawn(async move {
            if let Err(e) = inner.receive_on(listener, &output).await {
                inner.emit_terminal(&output, e);
            }
        }));
        Ok(bound)
    }

    /// Aborts every transfer this component still owns. Idempotent.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

impl Inner {
    fn emit(&self, event: FileTransferEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Terminal failure for a single-shot operation. A checksum mismatch
    /// already produced its own event.
    fn emit_terminal(&self, path: &Path, error: TransferError) {
        if matches!(error, TransferError::ChecksumMismatch) {
            return;
        }
        self.emit(FileTransferEvent::Failure {
            file_name: file_label(path),
            reason: error.to_string(),
        });
    }

    async fn with_retry<F, Fut>(&self, path: &Path, mut operation: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), TransferError>>,
    {
        let file_name = file_label(path);
        let max_retries = self.config.max_retries;
        for attempt in 1..=max_retries {
            match operation().await {
                Ok(()) => return,
                Err(e) if attempt < max_retries => {
                    tracing::warn!("transfer of {file_name} failed on attempt {attempt}: {e}");
                    self.emit(FileTransferEvent::RetryAttempt {
                        file_name: file_name.clone(),
                        attempt,
                        max_retries,
                    });
                    let shift = attempt.saturating_sub(1).min(31);
                    sleep(self.config.base_delay.saturating_mul(1u32 << shift)).await;
                }
                Err(e) => {
                    tracing::error!("transfer of {file_name} exhausted retries: {e}");
                    self.emit(FileTransferEvent::Failure {
                        file_name: file_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn send_once(&self, host: &str, port: u16, path: &Path) -> Result<(), TransferError> {
        let file_name = file_label(path);
        let size = query_size(path).await?;
        let digest = checksum_of(path).await?;

        let mut stream = TcpStream::connect((host, port)).await?;
        stream.write_u64(size).await?;
        stream.write_all(&digest).await?;

        let mut file = File::open(path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
        }
        stream.flush().await?;
        tracing::info!("sent {file_name} ({size} bytes) to {host}:{port}");
        self.emit(FileTransferEvent::Success { file_name });
        Ok(())
    }

    async fn receive_once(&self, port: u16, output: &Path) -> Result<(), TransferError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        self.receive_on(listener, output).await
    }

    async fn receive_on(&self, listener: TcpListener, output: &Path) -> Result<(), TransferError> {
        let file_name = file_label(output);
        let (mut stream, peer) = listener.accept().await?;
        tracing::info!("receiving {file_name} from {peer}");

        let total = stream.read_u64().await?;
        let mut expected = [0u8; CHECKSUM_SIZE];
        stream.read_exact(&mut expected).await?;

        let mut hasher = Sha256::new();
        let mut received = 0u64;
        {
            let mut file = File::create(output).await?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            while received < total {
                let want = (total - received).min(CHUNK_SIZE as u64) as usize;
                let n = stream.read(&mut buf[..want]).await?;
                if n == 0 {
                    // Sender went away early; the digest check below fails.
                    break;
                }
                file.write_all(&buf[..n]).await?;
                hasher.update(&buf[..n]);
                received += n as u64;
                self.emit(FileTransferEvent::Progress {
                    file_name: file_name.clone(),
                    percent: ((received * 100) / total) as u8,
                });
            }
            file.flush().await?;
        }

        let computed: [u8; CHECKSUM_SIZE] = hasher.finalize().into();
        if received < total || computed != expected {
            let _ = tokio::fs::remove_file(output).await;
            tracing::warn!("checksum mismatch for {file_name}, dropped partial file");
            self.emit(FileTransferEvent::ChecksumFailed { file_name });
            return Err(TransferError::ChecksumMismatch);
        }
        self.emit(FileTransferEvent::Success { file_name });
        Ok(())
    }
}

/// File length from metadata, falling back to counting the stream for
/// sources whose metadata is unusable.
pub async fn query_size(path: &Path) -> io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(_) => {
            let mut file = File::open(path).await?;
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok(total);
                }
                total += n as u64;
            }
        }
    }
}

async fn checksum_of(path: &Path) -> io::Result<[u8; CHECKSUM_SIZE]> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(hasher.finalize().into());
        }
        hasher.update(&buf[..n]);
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown_file".to_string())
}
