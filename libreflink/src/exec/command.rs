//! Command-backed [`RemoteExec`]: `test`, `cp` and `rm` run through the
//! configured transport.
//!
//! | Transport | Invocation |
//! |---|---|
//! | local | `cp -rp --reflink=always <src> <dst>` |
//! | ssh | `ssh -o BatchMode=yes <dest> -- '<quoted command>'` |
//! | kubectl | `kubectl exec -n <ns> <pod> [-c <container>] -- cp ...` |

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::{CloneMode, HostTransport};
use crate::error::{ReflinkError, Result};
use crate::exec::RemoteExec;

/// Runs path operations as child processes, possibly hopping to another host.
#[derive(Debug, Clone)]
pub struct CommandExec {
    host: String,
    transport: HostTransport,
    clone_mode: CloneMode,
}

impl CommandExec {
    /// Commands for `host`, carried over `transport`.
    pub fn new(host: impl Into<String>, transport: HostTransport, clone_mode: CloneMode) -> Self {
        Self {
            host: host.into(),
            transport,
            clone_mode,
        }
    }

    /// Local-process executor, mostly for tests and single-node setups.
    pub fn local(host: impl Into<String>, clone_mode: CloneMode) -> Self {
        Self::new(host, HostTransport::Local, clone_mode)
    }

    /// Build the full command line for `argv` on this transport.
    fn command(&self, argv: &[&str]) -> Command {
        match &self.transport {
            HostTransport::Local => {
                let mut cmd = Command::new(argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            HostTransport::Ssh {
                destination,
                port,
                identity_file,
            } => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                if let Some(port) = port {
                    cmd.arg("-p").arg(port.to_string());
                }
                if let Some(identity) = identity_file {
                    cmd.arg("-i").arg(identity);
                }
                // ssh joins its arguments into one remote shell string.
                let remote = argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
                cmd.arg(destination).arg("--").arg(remote);
                cmd
            }
            HostTransport::Kubectl {
                namespace,
                pod,
                container,
            } => {
                let mut cmd = Command::new("kubectl");
                cmd.args(["exec", "-n", namespace.as_str(), pod.as_str()]);
                if let Some(container) = container {
                    cmd.args(["-c", container.as_str()]);
                }
                cmd.arg("--").args(argv);
                cmd
            }
        }
    }

    async fn run(&self, op: &str, path: &Path, argv: &[&str]) -> Result<Output> {
        let mut cmd = self.command(argv);
        cmd.kill_on_drop(true);
        debug!(host = %self.host, ?argv, "running");
        cmd.output().await.map_err(|e| self.exec_error(op, path, e))
    }

    fn exec_error<E: std::fmt::Display>(&self, op: &str, path: &Path, reason: E) -> ReflinkError {
        ReflinkError::Exec {
            op: op.to_owned(),
            host: self.host.clone(),
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn utf8<'p>(&self, op: &str, path: &'p Path) -> Result<&'p str> {
        path.to_str()
            .ok_or_else(|| self.exec_error(op, path, "path is not valid UTF-8"))
    }

    fn failure(&self, op: &str, path: &Path, output: &Output) -> ReflinkError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        self.exec_error(
            op,
            path,
            format!("exit {:?}: {}", output.status.code(), stderr.trim()),
        )
    }
}

#[async_trait]
impl RemoteExec for CommandExec {
    fn host(&self) -> &str {
        &self.host
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn exists(&self, path: &Path) -> Result<bool> {
        let p = self.utf8("exists", path)?;
        let output = self.run("exists", path, &["test", "-d", p]).await?;
        // `test` exits 1 for "no"; anything else is a transport or usage error.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure("exists", path, &output)),
        }
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn clone_tree(&self, src: &Path, dst: &Path) -> Result<()> {
        let s = self.utf8("clone", src)?;
        let d = self.utf8("clone", dst)?;
        let output = self
            .run("clone", dst, &["cp", "-rp", self.clone_mode.cp_flag(), s, d])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure("clone", dst, &output))
        }
    }

    #[instrument(skip(self), fields(host = %self.host))]
    async fn remove_tree(&self, path: &Path) -> Result<()> {
        let p = self.utf8("remove", path)?;
        let output = self.run("remove", path, &["rm", "-rf", "--", p]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure("remove", path, &output))
        }
    }
}

/// Quote `arg` for a POSIX shell.
fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return arg.to_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
