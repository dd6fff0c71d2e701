use std::sync::Arc;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::TransferSettings;
use crate::error::{Disposition, PoolError, TransferError, TransportError};
use crate::pool::{Admission, ConnectionPool, SessionKey, SessionLease, ShedReason};
use crate::ssh::{Credential, HostTarget};
use crate::transport::{OpenMode, RemoteMetadata, RemoteSession, SessionFactory};

use super::copy::{self, CopyError};
use super::task::{Endpoint, TransferKind, TransferReport, TransferTask};

type Lease<F> = SessionLease<<F as SessionFactory>::Session>;

/// Opens per provision when a racing operation evicts the new session
const OPEN_ATTEMPTS: u32 = 2;

/// Moves bytes between callers and remote hosts over pooled sessions.
///
/// Every operation borrows its sessions through a [`SessionLease`] and ends
/// the lease with release or evict depending on how the operation failed.
pub struct TransferService<F: SessionFactory> {
    pool: Arc<ConnectionPool<F::Session>>,
    factory: Arc<F>,
    settings: TransferSettings,
}

impl<F: SessionFactory> Clone for TransferService<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            factory: self.factory.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<F: SessionFactory> TransferService<F> {
    pub fn new(
        pool: Arc<ConnectionPool<F::Session>>,
        factory: Arc<F>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            pool,
            factory,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F::Session>> {
        &self.pool
    }

    /// Pooled session for `target`, opening one when none is pooled.
    async fn provision(
        &self,
        target: &HostTarget,
        credential: &Credential,
    ) -> Result<Lease<F>, TransferError> {
        let key = target.session_key();
        match self.pool.checkout(&key).await {
            Ok(lease) => return Ok(lease),
            Err(PoolError::NoConnection(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let mut attempt = 1;
        loop {
            debug!(key = %key, attempt, "No pooled session, opening one");
            let transport = self.factory.open_session(target, credential).await?;
            if let Admission::Shed(ShedReason::Capacity) =
                self.pool.add(key.clone(), transport).await
            {
                return Err(TransferError::NoConnection(key));
            }

            // Another operation may have raced us to the key; checkout waits for it.
            match self.pool.checkout(&key).await {
                Ok(lease) => return Ok(lease),
                Err(PoolError::NoConnection(_)) if attempt < OPEN_ATTEMPTS => {
                    debug!(key = %key, "Session was evicted before checkout, reopening");
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Write `source` to `remote_path`, replacing any existing file.
    pub async fn upload<R>(
        &self,
        target: &HostTarget,
        credential: &Credential,
        remote_path: &str,
        source: &mut R,
    ) -> Result<TransferReport, TransferError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let key = target.session_key();
        let task = TransferTask::new(
            TransferKind::Upload,
            Endpoint::Local,
            Endpoint::remote(&key, remote_path),
        );
        debug!(task = %task.id, key = %key, path = remote_path, "Upload started");

        let lease = self.provision(target, credential).await?;
        let result = self.upload_with(lease.transport(), &key, remote_path, source).await;
        settle(lease, &result).await;

        self.report(task, result)
    }

    async fn upload_with<R>(
        &self,
        session: &F::Session,
        key: &SessionKey,
        path: &str,
        source: &mut R,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        reject_directory(session, key, path).await?;
        let mut file = session
            .open(path, OpenMode::CreateTruncate)
            .await
            .map_err(|e| remote_io(key, path, e))?;

        let bytes = copy::pump(source, &mut file, self.settings.chunk_size)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => TransferError::LocalIo(e),
                CopyError::Write(e) => remote_io(key, path, e.into()),
            })?;
        file.shutdown().await.map_err(|e| remote_io(key, path, e.into()))?;
        drop(file);

        self.apply_mode(session, key, path).await?;
        Ok(bytes)
    }

    /// Copy `remote_path` into `sink`.
    ///
    /// Directories are rejected before anything is written. A sink that goes
    /// away mid-copy is reported as [`TransferError::ClientDisconnected`].
    pub async fn download<W>(
        &self,
        target: &HostTarget,
        credential: &Credential,
        remote_path: &str,
        sink: &mut W,
    ) -> Result<TransferReport, TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let key = target.session_key();
        let task = TransferTask::new(
            TransferKind::Download,
            Endpoint::remote(&key, remote_path),
            Endpoint::Local,
        );
        debug!(task = %task.id, key = %key, path = remote_path, "Download started");

        let lease = self.provision(target, credential).await?;
        let result = self.download_with(lease.transport(), &key, remote_path, sink).await;
        settle(lease, &result).await;

        self.report(task, result)
    }

    async fn download_with<W>(
        &self,
        session: &F::Session,
        key: &SessionKey,
        path: &str,
        sink: &mut W,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let (mut file, metadata) = open_for_read(session, key, path).await?;
        debug!(key = %key, path, size = metadata.size, "Streaming remote file");

        copy::pump(&mut file, sink, self.settings.chunk_size)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => remote_io(key, path, e.into()),
                CopyError::Write(e) if copy::is_disconnect(&e) => {
                    TransferError::ClientDisconnected
                }
                CopyError::Write(e) => TransferError::Sink(e),
            })
    }

    /// Yield `remote_path` as chunks of the configured size.
    ///
    /// Dropping the stream before it ends counts as a client disconnect and
    /// evicts the session.
    pub fn download_stream(
        &self,
        target: HostTarget,
        credential: Credential,
        remote_path: String,
    ) -> impl Stream<Item = Result<Vec<u8>, TransferError>> + Send + 'static {
        let service = self.clone();

        async_stream::stream! {
            let key = target.session_key();
            let task = TransferTask::new(
                TransferKind::Download,
                Endpoint::remote(&key, &remote_path),
                Endpoint::Local,
            );

            let lease = match service.provision(&target, &credential).await {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(task = %task.id, key = %key, error = %err, "Download failed");
                    yield Err(err);
                    return;
                }
            };

            let mut file = match open_for_read(lease.transport(), &key, &remote_path).await {
                Ok((file, _)) => file,
                Err(err) => {
                    let disposition = err.disposition_for(&key);
                    lease.finish(disposition).await;
                    warn!(task = %task.id, key = %key, error = %err, "Download failed");
                    yield Err(err);
                    return;
                }
            };

            let mut buf = vec![0u8; service.settings.chunk_size.max(1)];
            let mut total = 0u64;
            loop {
                match copy::read_chunk(&mut file, &mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n as u64;
                        yield Ok(buf[..n].to_vec());
                    }
                    Err(e) => {
                        let err = remote_io(&key, &remote_path, e.into());
                        drop(file);
                        lease.finish(err.disposition_for(&key)).await;
                        warn!(task = %task.id, key = %key, error = %err, "Download failed");
                        yield Err(err);
                        return;
                    }
                }
            }

            drop(file);
            lease.release().await;
            info!(
                task = %task.id,
                key = %key,
                path = %remote_path,
                bytes = total,
                elapsed_ms = task.elapsed().as_millis() as u64,
                "Download streamed"
            );
        }
    }

    /// Copy a file from one remote host to another without touching local disk.
    pub async fn transfer_between(
        &self,
        source: &HostTarget,
        source_credential: &Credential,
        source_path: &str,
        destination: &HostTarget,
        destination_credential: &Credential,
        destination_path: &str,
    ) -> Result<TransferReport, TransferError> {
        let source_key = source.session_key();
        let destination_key = destination.session_key();
        let task = TransferTask::new(
            TransferKind::Relay,
            Endpoint::remote(&source_key, source_path),
            Endpoint::remote(&destination_key, destination_path),
        );
        debug!(
            task = %task.id,
            from = %source_key,
            to = %destination_key,
            "Relay started"
        );

        // Opening the destination would truncate the source under the reader.
        if source_key == destination_key && source_path == destination_path {
            let err = TransferError::SameFile {
                key: source_key,
                path: source_path.to_string(),
            };
            return self.report(task, Err(err));
        }

        let source_lease = self.provision(source, source_credential).await?;

        if source_key == destination_key {
            let session = source_lease.transport();
            let result = self
                .relay_with(
                    (session, &source_key, source_path),
                    (session, &destination_key, destination_path),
                )
                .await;
            settle(source_lease, &result).await;
            return self.report(task, result);
        }

        let destination_lease = match self.provision(destination, destination_credential).await {
            Ok(lease) => lease,
            Err(err) => {
                source_lease.release().await;
                warn!(task = %task.id, error = %err, "Relay failed");
                return Err(err);
            }
        };

        let result = self
            .relay_with(
                (source_lease.transport(), &source_key, source_path),
                (destination_lease.transport(), &destination_key, destination_path),
            )
            .await;
        settle(source_lease, &result).await;
        settle(destination_lease, &result).await;

        self.report(task, result)
    }

    async fn relay_with(
        &self,
        (from, from_key, from_path): (&F::Session, &SessionKey, &str),
        (to, to_key, to_path): (&F::Session, &SessionKey, &str),
    ) -> Result<u64, TransferError> {
        let (mut reader, _) = open_for_read(from, from_key, from_path).await?;
        reject_directory(to, to_key, to_path).await?;
        let mut writer = to
            .open(to_path, OpenMode::CreateTruncate)
            .await
            .map_err(|e| remote_io(to_key, to_path, e))?;

        let bytes = copy::pump(&mut reader, &mut writer, self.settings.chunk_size)
            .await
            .map_err(|e| match e {
                CopyError::Read(e) => remote_io(from_key, from_path, e.into()),
                CopyError::Write(e) => remote_io(to_key, to_path, e.into()),
            })?;
        writer
            .shutdown()
            .await
            .map_err(|e| remote_io(to_key, to_path, e.into()))?;
        drop(writer);
        drop(reader);

        self.apply_mode(to, to_key, to_path).await?;
        Ok(bytes)
    }

    async fn apply_mode(
        &self,
        session: &F::Session,
        key: &SessionKey,
        path: &str,
    ) -> Result<(), TransferError> {
        session
            .chmod(path, self.settings.file_mode)
            .await
            .map_err(|source| TransferError::Permissions {
                key: key.clone(),
                path: path.to_string(),
                source,
            })
    }

    fn report(
        &self,
        task: TransferTask,
        result: Result<u64, TransferError>,
    ) -> Result<TransferReport, TransferError> {
        match result {
            Ok(bytes) => {
                let report = task.complete(bytes);
                info!(
                    task = %report.task.id,
                    kind = ?report.task.kind,
                    bytes = report.bytes,
                    elapsed_ms = report.elapsed_ms,
                    "Transfer complete"
                );
                Ok(report)
            }
            Err(TransferError::ClientDisconnected) => {
                warn!(task = %task.id, "Client disconnected mid-download");
                Err(TransferError::ClientDisconnected)
            }
            Err(err) => {
                warn!(task = %task.id, kind = ?task.kind, error = %err, "Transfer failed");
                Err(err)
            }
        }
    }
}

/// Return the lease to the pool or drop it, depending on the outcome.
async fn settle<S: RemoteSession, T>(lease: SessionLease<S>, result: &Result<T, TransferError>) {
    let disposition = match result {
        Ok(_) => Disposition::Release,
        Err(err) => err.disposition_for(lease.key()),
    };
    lease.finish(disposition).await;
}

fn remote_io(key: &SessionKey, path: &str, source: TransportError) -> TransferError {
    TransferError::RemoteIo {
        key: key.clone(),
        path: path.to_string(),
        source,
    }
}

/// Stat first so directories fail before any byte moves.
async fn open_for_read<S: RemoteSession>(
    session: &S,
    key: &SessionKey,
    path: &str,
) -> Result<(S::File, RemoteMetadata), TransferError> {
    let metadata = session
        .stat(path)
        .await
        .map_err(|e| remote_io(key, path, e))?;
    if metadata.is_dir {
        return Err(TransferError::NotAFile {
            key: key.clone(),
            path: path.to_string(),
        });
    }
    let file = session
        .open(path, OpenMode::Read)
        .await
        .map_err(|e| remote_io(key, path, e))?;
    Ok((file, metadata))
}

/// A missing destination is fine; an existing directory is not.
async fn reject_directory<S: RemoteSession>(
    session: &S,
    key: &SessionKey,
    path: &str,
) -> Result<(), TransferError> {
    match session.stat(path).await {
        Ok(metadata) if metadata.is_dir => Err(TransferError::NotAFile {
            key: key.clone(),
            path: path.to_string(),
        }),
        Ok(_) | Err(TransportError::NotFound) => Ok(()),
        Err(e) => Err(remote_io(key, path, e)),
    }
}
