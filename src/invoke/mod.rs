//! Boundary between the delegation engine and the delegate plugin binaries.

use itertools::Itertools;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{MultusError, Result};
use crate::types::{CmdArgs, CniError};

/// One call into a delegate plugin.
///
/// The interface name is carried explicitly instead of being written into the
/// process environment, so requests stay independent of each other.
#[derive(Debug, Clone)]
pub struct InvokeRequest<'a> {
    /// Plugin binary name (the delegate's `type`)
    pub plugin: &'a str,
    /// Configuration written to the plugin's stdin
    pub payload: Vec<u8>,
    /// Value of CNI_IFNAME for this delegate
    pub ifname: String,
    /// The invocation this request belongs to
    pub args: &'a CmdArgs,
}

/// Runs delegate plugins
#[allow(async_fn_in_trait)]
pub trait DelegateInvoker {
    /// ADD the delegate, returning its raw result JSON
    async fn add(&self, req: &InvokeRequest<'_>) -> Result<Vec<u8>>;

    /// DEL the delegate
    async fn del(&self, req: &InvokeRequest<'_>) -> Result<()>;
}

/// Executes delegates as child processes found on CNI_PATH
#[derive(Debug, Clone, Default)]
pub struct ExecInvoker;

impl ExecInvoker {
    pub fn new() -> Self {
        Self
    }

    /// Locate the plugin binary in the search path
    pub fn find_plugin(plugin: &str, dirs: &[PathBuf]) -> Result<PathBuf> {
        if plugin.is_empty() || plugin.contains('/') {
            return Err(MultusError::Delegate {
                plugin: plugin.to_string(),
                code: None,
                msg: "invalid plugin name".to_string(),
            });
        }

        dirs.iter()
            .map(|dir| dir.join(plugin))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| MultusError::Delegate {
                plugin: plugin.to_string(),
                code: None,
                msg: format!(
                    "failed to find plugin in path [{}]",
                    dirs.iter().map(|d| d.display()).join(" ")
                ),
            })
    }

    async fn exec(&self, verb: &str, req: &InvokeRequest<'_>) -> Result<Vec<u8>> {
        let binary = Self::find_plugin(req.plugin, &req.args.path_dirs())?;
        debug!(
            "Invoking {} {} with CNI_IFNAME={}",
            verb,
            binary.display(),
            req.ifname
        );

        let delegate_err = |msg: String| MultusError::Delegate {
            plugin: req.plugin.to_string(),
            code: None,
            msg,
        };

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", verb)
            .env("CNI_CONTAINERID", &req.args.container_id)
            .env("CNI_NETNS", &req.args.netns)
            .env("CNI_IFNAME", &req.ifname)
            .env("CNI_ARGS", &req.args.raw_args)
            .env("CNI_PATH", &req.args.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| delegate_err(format!("failed to execute {}: {}", binary.display(), e)))?;

        // A plugin may exit without reading its config
        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&req.payload).await {
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
                    return Err(delegate_err(format!("failed to write config: {}", e)));
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| delegate_err(format!("failed to wait for plugin: {}", e)))?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        Err(plugin_failure(
            req.plugin,
            &binary,
            &output.stdout,
            &output.stderr,
            output.status,
        ))
    }
}

/// Build the error for a plugin that exited non-zero, preferring the CNI
/// error it printed on stdout
fn plugin_failure(
    plugin: &str,
    binary: &Path,
    stdout: &[u8],
    stderr: &[u8],
    status: std::process::ExitStatus,
) -> MultusError {
    if let Ok(cni_err) = serde_json::from_slice::<CniError>(stdout) {
        let msg = if cni_err.details.is_empty() {
            cni_err.msg
        } else {
            format!("{}; {}", cni_err.msg, cni_err.details)
        };
        return MultusError::Delegate {
            plugin: plugin.to_string(),
            code: Some(cni_err.code),
            msg,
        };
    }

    let stderr = String::from_utf8_lossy(stderr);
    let msg = match stderr.trim() {
        "" => format!("{} exited with {}", binary.display(), status),
        text => text.to_string(),
    };

    MultusError::Delegate {
        plugin: plugin.to_string(),
        code: None,
        msg,
    }
}

impl DelegateInvoker for ExecInvoker {
    async fn add(&self, req: &InvokeRequest<'_>) -> Result<Vec<u8>> {
        self.exec("ADD", req).await
    }

    async fn del(&self, req: &InvokeRequest<'_>) -> Result<()> {
        self.exec("DEL", req).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[test]
    fn test_find_plugin_searches_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("flannel"), b"").unwrap();

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let found = ExecInvoker::find_plugin("flannel", &dirs).unwrap();
        assert_eq!(found, second.path().join("flannel"));

        let err = ExecInvoker::find_plugin("sriov", &dirs).unwrap_err();
        assert!(err.to_string().contains("failed to find plugin"));

        let err = ExecInvoker::find_plugin("../flannel", &dirs).unwrap_err();
        assert!(err.to_string().contains("invalid plugin name"));
    }

    #[test]
    fn test_failure_prefers_cni_error() {
        let stdout = br#"{"cniVersion":"0.3.1","code":11,"msg":"busy","details":"retry"}"#;
        let err = plugin_failure(
            "flannel",
            Path::new("/opt/cni/bin/flannel"),
            stdout,
            b"ignored",
            ExitStatus::from_raw(256),
        );
        assert_eq!(err.code(), 11);
        assert_eq!(err.to_string(), "delegate \"flannel\" failed: busy; retry");

        let err = plugin_failure(
            "flannel",
            Path::new("/opt/cni/bin/flannel"),
            b"",
            b"segfault\n",
            ExitStatus::from_raw(256),
        );
        assert_eq!(err.to_string(), "delegate \"flannel\" failed: segfault");
    }
}
