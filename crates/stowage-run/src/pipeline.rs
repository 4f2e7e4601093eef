//! Streaming pipelines between the run pod and the storage provider
//!
//! Backup: `exec stdout -> [compress] -> [encrypt] -> provider.put`
//!
//! Restore: `provider.get -> [decrypt] -> [decompress] -> exec stdin`
//!
//! Stages are joined by in-memory pipes and driven concurrently; the first
//! failure wins and drops the rest, which closes every pipe and releases the
//! blocking codec tasks. A backup upload is only completed once the command
//! and every stage have finished cleanly, so a failed or timed-out run never
//! leaves a truncated object behind.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use age::x25519;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, info};

use stowage_common::crd::{CompressionSpec, EncryptionSpec};
use stowage_common::Error;
use stowage_storage::{BoxReader, StorageProvider};

use crate::codec::{parse_recipients, BoxWriter, Stage};
use crate::exec::{ExecTarget, RemoteExec};

const PIPE_BUFFER: usize = 64 * 1024;

fn pipe() -> (BoxWriter, BoxReader) {
    let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
    (Box::new(writer), Box::new(reader))
}

/// One backup or restore transfer
pub struct Pipeline<'a> {
    /// Run name, used in errors
    pub run: &'a str,
    /// Exec primitive
    pub exec: &'a dyn RemoteExec,
    /// Storage holding the backup object
    pub provider: &'a dyn StorageProvider,
    /// Object path
    pub path: &'a str,
    /// Where the command runs
    pub target: ExecTarget,
    /// Upper bound for the command
    pub deadline: Option<Duration>,
}

impl<'a> Pipeline<'a> {
    /// Stream the command's stdout into storage, returning the stored byte count
    pub async fn backup(
        self,
        compression: Option<&CompressionSpec>,
        encryption: Option<&EncryptionSpec>,
    ) -> Result<u64, Error> {
        let mut stages = Vec::new();
        if let Some(compression) = compression {
            stages.push(Stage::Compress {
                level: compression.level,
            });
        }
        if let Some(encryption) = encryption {
            let recipients = parse_recipients(&encryption.recipients)
                .map_err(|e| Error::pipeline(self.run, "encrypt", e))?;
            stages.push(Stage::Encrypt { recipients });
        }
        info!(
            backup_run = %self.run,
            path = %self.path,
            stages = ?stages.iter().map(Stage::name).collect::<Vec<_>>(),
            "starting backup stream"
        );

        let (exec_stdout, mut upstream) = pipe();
        let mut tasks = self.chain(stages, &mut upstream);
        tasks.push(self.exec_with_deadline(None, Some(exec_stdout)));

        let (commit, gate) = oneshot::channel();
        let produce = async move {
            try_join_all(tasks).await?;
            // receiver is gone only when the upload already failed
            let _ = commit.send(());
            Ok::<_, Error>(())
        };
        let upload = self
            .provider
            .put(self.path, Box::new(GatedReader::new(upstream, gate)));

        let ((), written) = tokio::try_join!(produce, upload)?;
        debug!(backup_run = %self.run, path = %self.path, bytes = written, "backup stream finished");
        Ok(written)
    }

    /// Stream the stored object into the command's stdin.
    ///
    /// An encrypted backup without an identity is rejected before storage is
    /// touched.
    pub async fn restore(
        self,
        compression: Option<&CompressionSpec>,
        encryption: Option<&EncryptionSpec>,
        identity: Option<x25519::Identity>,
    ) -> Result<(), Error> {
        let mut stages = Vec::new();
        if encryption.is_some() {
            let identity = identity.ok_or_else(|| {
                Error::pipeline(
                    self.run,
                    "decrypt",
                    "backup is not restorable, but restore has been requested",
                )
            })?;
            stages.push(Stage::Decrypt { identity });
        }
        if compression.is_some() {
            stages.push(Stage::Decompress);
        }
        info!(
            backup_run = %self.run,
            path = %self.path,
            stages = ?stages.iter().map(Stage::name).collect::<Vec<_>>(),
            "starting restore stream"
        );

        let mut upstream = self.provider.get(self.path).await?;
        let mut tasks = self.chain(stages, &mut upstream);
        tasks.push(self.exec_with_deadline(Some(upstream), None));
        try_join_all(tasks).await?;
        debug!(backup_run = %self.run, path = %self.path, "restore stream finished");
        Ok(())
    }

    /// Connect `stages` behind `upstream`, leaving the tail reader in `upstream`
    fn chain(
        &self,
        stages: Vec<Stage>,
        upstream: &mut BoxReader,
    ) -> Vec<BoxFuture<'a, Result<(), Error>>> {
        let run = self.run;
        stages
            .into_iter()
            .map(|stage| {
                let (writer, reader) = pipe();
                let input = std::mem::replace(upstream, reader);
                let name = stage.name();
                async move {
                    stage
                        .run(input, writer)
                        .await
                        .map_err(|e| Error::pipeline(run, name, e.to_string()))
                }
                .boxed()
            })
            .collect()
    }

    fn exec_with_deadline(
        &self,
        stdin: Option<BoxReader>,
        stdout: Option<BoxWriter>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let exec = self.exec;
        let run = self.run;
        let target = self.target.clone();
        let deadline = self.deadline;
        async move {
            let call = exec.exec(&target, stdin, stdout);
            match deadline {
                Some(deadline) => tokio::time::timeout(deadline, call).await.map_err(|_| {
                    Error::pipeline(
                        run,
                        "exec",
                        format!("deadline of {}s exceeded", deadline.as_secs()),
                    )
                })?,
                None => call.await,
            }
        }
        .boxed()
    }
}

/// Reader that withholds end-of-stream until the producers signalled success.
///
/// If the signal sender is dropped instead, the reader fails, which makes the
/// provider abort the upload.
struct GatedReader {
    inner: BoxReader,
    gate: Option<oneshot::Receiver<()>>,
}

impl GatedReader {
    fn new(inner: BoxReader, gate: oneshot::Receiver<()>) -> Self {
        Self {
            inner,
            gate: Some(gate),
        }
    }
}

impl AsyncRead for GatedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let Some(gate) = this.gate.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match ready!(Pin::new(gate).poll(cx)) {
            Ok(()) => {
                this.gate = None;
                Poll::Ready(Ok(()))
            }
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream aborted before completion",
            ))),
        }
    }
}
