//! Common test utilities: an in-memory network of scripted SFTP hosts.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use ferry::config::TransferSettings;
use ferry::error::{SessionError, TransportError};
use ferry::pool::{ConnectionPool, PoolConfig};
use ferry::ssh::{Credential, HostTarget};
use ferry::transfer::TransferService;
use ferry::transport::{OpenMode, RemoteMetadata, RemoteSession, SessionFactory};

/// Largest slice a fake read hands out, so callers see short reads
const MAX_READ: usize = 4096;

#[derive(Default)]
struct HostFs {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    modes: HashMap<String, u32>,
    chmod_fails: bool,
    read_fault_after: Option<usize>,
}

/// Shared state of every fake host plus session open/close counters
#[derive(Default)]
pub struct FakeNet {
    hosts: Mutex<HashMap<String, HostFs>>,
    unreachable: Mutex<HashSet<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_host<T>(&self, host: &str, f: impl FnOnce(&mut HostFs) -> T) -> T {
        let mut hosts = self.hosts.lock();
        f(hosts.entry(host.to_string()).or_default())
    }

    pub fn put_file(&self, host: &str, path: &str, data: impl Into<Vec<u8>>) {
        let data = data.into();
        self.with_host(host, |fs| fs.files.insert(path.to_string(), data));
    }

    pub fn put_dir(&self, host: &str, path: &str) {
        self.with_host(host, |fs| fs.dirs.insert(path.to_string()));
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.with_host(host, |fs| fs.files.get(path).cloned())
    }

    pub fn mode(&self, host: &str, path: &str) -> Option<u32> {
        self.with_host(host, |fs| fs.modes.get(path).copied())
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().insert(host.to_string());
    }

    pub fn fail_chmod(&self, host: &str) {
        self.with_host(host, |fs| fs.chmod_fails = true);
    }

    /// Reads on `host` fail with a connection reset after `bytes` bytes
    pub fn break_reads_after(&self, host: &str, bytes: usize) {
        self.with_host(host, |fs| fs.read_fault_after = Some(bytes));
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open a session directly, bypassing the factory
    pub fn session(self: &Arc<Self>, host: &str) -> FakeSession {
        self.opened.fetch_add(1, Ordering::SeqCst);
        FakeSession {
            net: self.clone(),
            host: host.to_string(),
        }
    }
}

pub struct FakeFactory {
    net: Arc<FakeNet>,
}

impl FakeFactory {
    pub fn new(net: Arc<FakeNet>) -> Self {
        Self { net }
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn open_session(
        &self,
        target: &HostTarget,
        _credential: &Credential,
    ) -> Result<FakeSession, SessionError> {
        // Give concurrent callers a chance to interleave
        tokio::task::yield_now().await;
        if self.net.unreachable.lock().contains(&target.host) {
            return Err(SessionError::Unreachable {
                host: target.host.clone(),
                port: target.port,
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.net.session(&target.host))
    }
}

pub struct FakeSession {
    net: Arc<FakeNet>,
    host: String,
}

#[async_trait]
impl RemoteSession for FakeSession {
    type File = FakeFile;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<FakeFile, TransportError> {
        self.net.with_host(&self.host, |fs| {
            if fs.dirs.contains(path) {
                return Err(TransportError::Status("is a directory".to_string()));
            }
            match mode {
                OpenMode::Read => {
                    if !fs.files.contains_key(path) {
                        return Err(TransportError::NotFound);
                    }
                    Ok(FakeFile::Reader {
                        net: self.net.clone(),
                        host: self.host.clone(),
                        path: path.to_string(),
                        pos: 0,
                        fault_after: fs.read_fault_after,
                    })
                }
                OpenMode::CreateTruncate => {
                    fs.files.insert(path.to_string(), Vec::new());
                    Ok(FakeFile::Writer {
                        net: self.net.clone(),
                        host: self.host.clone(),
                        path: path.to_string(),
                    })
                }
            }
        })
    }

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, TransportError> {
        self.net.with_host(&self.host, |fs| {
            if fs.dirs.contains(path) {
                return Ok(RemoteMetadata {
                    size: 0,
                    is_dir: true,
                });
            }
            fs.files
                .get(path)
                .map(|data| RemoteMetadata {
                    size: data.len() as u64,
                    is_dir: false,
                })
                .ok_or(TransportError::NotFound)
        })
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), TransportError> {
        self.net.with_host(&self.host, |fs| {
            if fs.chmod_fails {
                return Err(TransportError::Status("permission denied".to_string()));
            }
            if !fs.files.contains_key(path) {
                return Err(TransportError::NotFound);
            }
            fs.modes.insert(path.to_string(), mode);
            Ok(())
        })
    }

    async fn close(self) {
        self.net.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reads see the host's file as it is at each poll, like a remote handle
pub enum FakeFile {
    Reader {
        net: Arc<FakeNet>,
        host: String,
        path: String,
        pos: usize,
        fault_after: Option<usize>,
    },
    Writer {
        net: Arc<FakeNet>,
        host: String,
        path: String,
    },
}

impl AsyncRead for FakeFile {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FakeFile::Reader {
                net,
                host,
                path,
                pos,
                fault_after,
            } => net.with_host(host.as_str(), |fs| {
                let data = fs.files.get(path.as_str()).map(Vec::as_slice).unwrap_or_default();
                let end = fault_after.map_or(data.len(), |limit| limit.min(data.len()));
                if *pos >= end {
                    if end < data.len() {
                        return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                    }
                    return Poll::Ready(Ok(()));
                }
                let n = buf.remaining().min(end - *pos).min(MAX_READ);
                buf.put_slice(&data[*pos..*pos + n]);
                *pos += n;
                Poll::Ready(Ok(()))
            }),
            FakeFile::Writer { .. } => Poll::Ready(Err(io::Error::other("opened for writing"))),
        }
    }
}

impl AsyncWrite for FakeFile {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FakeFile::Writer { net, host, path } => {
                net.with_host(host, |fs| {
                    fs.files.entry(path.clone()).or_default().extend_from_slice(buf)
                });
                Poll::Ready(Ok(buf.len()))
            }
            FakeFile::Reader { .. } => Poll::Ready(Err(io::Error::other("opened for reading"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Sink that accepts `limit` bytes and then reports a broken pipe
pub struct BrokenSink {
    pub accepted: usize,
    pub limit: usize,
}

impl BrokenSink {
    pub fn new(limit: usize) -> Self {
        Self { accepted: 0, limit }
    }
}

impl AsyncWrite for BrokenSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.accepted >= this.limit {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let n = buf.len().min(this.limit - this.accepted);
        this.accepted += n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub fn pool_config(capacity: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        idle_timeout: Duration::from_secs(60),
        checkout_timeout: Duration::from_secs(5),
    }
}

pub fn pool(capacity: usize) -> Arc<ConnectionPool<FakeSession>> {
    Arc::new(ConnectionPool::new(pool_config(capacity)))
}

pub fn service(net: &Arc<FakeNet>, capacity: usize) -> TransferService<FakeFactory> {
    TransferService::new(
        pool(capacity),
        Arc::new(FakeFactory::new(net.clone())),
        TransferSettings::default(),
    )
}

pub fn target(host: &str) -> HostTarget {
    HostTarget::new(host, 22, "deploy")
}

pub fn credential() -> Credential {
    Credential::password("hunter2")
}

/// Let spawned close tasks run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
