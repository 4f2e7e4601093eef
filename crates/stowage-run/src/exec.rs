//! Remote command execution inside the run pod
//!
//! [`KubePodExec`] opens an exec session through the Kubernetes API, feeds
//! stdin, drains stdout into the pipeline and forwards stderr to the log.
//! The call returns once the command has exited and both streams are closed.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use stowage_common::Error;
use stowage_storage::BoxReader;

use crate::codec::BoxWriter;

/// Target of an exec call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecTarget {
    /// Namespace of the pod
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
    /// Command and arguments
    pub command: Vec<String>,
}

/// Streaming exec primitive
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run the command, copying `stdin` into it and its stdout into `stdout`.
    ///
    /// `stdout` is shut down after the command's output has been drained.
    async fn exec(
        &self,
        target: &ExecTarget,
        stdin: Option<BoxReader>,
        stdout: Option<BoxWriter>,
    ) -> Result<(), Error>;
}

/// [`RemoteExec`] over the Kubernetes exec subresource
pub struct KubePodExec {
    client: Client,
}

impl KubePodExec {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExec for KubePodExec {
    async fn exec(
        &self,
        target: &ExecTarget,
        stdin: Option<BoxReader>,
        stdout: Option<BoxWriter>,
    ) -> Result<(), Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = AttachParams {
            container: Some(target.container.clone()),
            stdin: stdin.is_some(),
            stdout: stdout.is_some(),
            stderr: true,
            tty: false,
            max_stdin_buf_size: None,
            max_stdout_buf_size: None,
            max_stderr_buf_size: None,
        };
        let fail = |msg: String| Error::pipeline(&target.pod, "exec", msg);

        debug!(pod = %target.pod, container = %target.container, command = ?target.command, "starting exec");
        let mut attached = pods
            .exec(&target.pod, target.command.clone(), &params)
            .await
            .map_err(|e| fail(format!("failed to start exec: {}", e)))?;

        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();
        let status = attached.take_status();

        let feed = async {
            if let (Some(mut source), Some(mut sink)) = (stdin, remote_stdin) {
                tokio::io::copy(&mut source, &mut sink).await?;
                sink.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let drain = async {
            if let (Some(mut source), Some(mut sink)) = (remote_stdout, stdout) {
                tokio::io::copy(&mut source, &mut sink).await?;
                sink.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let log = async {
            if let Some(stderr) = remote_stderr {
                forward_stderr(&target.pod, stderr).await;
            }
            Ok::<_, std::io::Error>(())
        };
        tokio::try_join!(feed, drain, log).map_err(|e| fail(format!("stream error: {}", e)))?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(fail(format!(
                        "command failed: {}",
                        status.message.unwrap_or_default()
                    )));
                }
            }
        }
        attached
            .join()
            .await
            .map_err(|e| fail(format!("exec session failed: {}", e)))?;
        Ok(())
    }
}

async fn forward_stderr(pod: &str, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(pod = %pod, "stderr: {}", line);
    }
}
