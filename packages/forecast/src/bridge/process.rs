//! Spawning and talking to the external model process.
//!
//! [`ProcessLauncher`] and [`BridgeProcess`] are the seam between the
//! bridge and the operating system. [`CommandLauncher`] is the real
//! implementation on top of `tokio::process`.

use std::ffi::OsString;
use std::io;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

/// Everything a finished process produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Whether the process exited successfully.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

/// A running external process.
#[async_trait::async_trait]
pub trait BridgeProcess: Send {
    /// Writes `input` to stdin, closes it, and waits for the process to
    /// exit while draining stdout and stderr.
    async fn communicate(&mut self, input: Vec<u8>) -> io::Result<ProcessOutput>;

    /// Forcibly kills the process and reaps it.
    async fn terminate(&mut self) -> io::Result<()>;
}

/// Starts external processes.
pub trait ProcessLauncher: Send + Sync {
    /// Spawns `program` with `args`, stdio piped.
    ///
    /// # Errors
    ///
    /// Returns the spawn error. [`io::ErrorKind::NotFound`] means the
    /// program is not installed.
    fn launch(&self, program: &str, args: &[OsString]) -> io::Result<Box<dyn BridgeProcess>>;
}

/// Launches real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, program: &str, args: &[OsString]) -> io::Result<Box<dyn BridgeProcess>> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        log::debug!("Spawned {program} (pid {:?})", child.id());
        Ok(Box::new(ChildProcess { child }))
    }
}

/// A `tokio` child process. Killed on drop, so a cancelled request never
/// leaves it running.
struct ChildProcess {
    child: Child,
}

#[async_trait::async_trait]
impl BridgeProcess for ChildProcess {
    async fn communicate(&mut self, input: Vec<u8>) -> io::Result<ProcessOutput> {
        let stdin = self.child.stdin.take();
        let mut stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout is not piped"))?;
        let mut stderr = self
            .child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr is not piped"))?;

        let write = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&input).await {
                // The process may exit without reading its input.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                Err(e) => Err(e),
                Ok(()) => stdin.shutdown().await.or_else(|e| {
                    if e.kind() == io::ErrorKind::BrokenPipe {
                        Ok(())
                    } else {
                        Err(e)
                    }
                }),
            }
        };
        let read_out = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };
        let read_err = async {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        };

        let (written, stdout, stderr) = tokio::join!(write, read_out, read_err);
        written?;
        let stdout = stdout?;
        let stderr = stderr?;
        let status = self.child.wait().await?;

        Ok(ProcessOutput {
            success: status.success(),
            code: status.code(),
            stdout,
            stderr,
        })
    }

    async fn terminate(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Ok(()) => {}
            // Already exited and reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => return Ok(()),
            Err(e) => return Err(e),
        }
        let status = self.child.wait().await?;
        log::debug!("Terminated external process ({status})");
        Ok(())
    }
}
