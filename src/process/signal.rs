//! Platform glue for console interrupts
//!
//! A console interrupt can only be raised for the caller's own process
//! group, so the process that raises it must share a group with the target.

use crate::error::{RelayError, Result};
use std::io;
use std::process::{Child, Command};

/// Start `cmd` outside the caller's process group (Unix) or console
/// (Windows), so interrupts raised by the child never reach the caller.
#[cfg(unix)]
pub fn detach(cmd: &mut Command) -> &mut Command {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0)
}

#[cfg(windows)]
pub fn detach(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    use windows_sys::Win32::System::Threading::CREATE_NEW_CONSOLE;
    cmd.creation_flags(CREATE_NEW_CONSOLE)
}

/// Kill a child started with [`detach`] together with everything it
/// spawned into its process group, then reap it
#[cfg(unix)]
pub fn kill_detached(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        tracing::debug!(pid = child.id(), "killpg failed, killing leader only: {e}");
        let _ = child.kill();
    }
    let _ = child.wait();
}

#[cfg(windows)]
pub fn kill_detached(child: &mut Child) {
    // A new console is not a job object: children outlive the leader
    tracing::warn!(pid = child.id(), "killing relay server; its target may keep running");
    let _ = child.kill();
    let _ = child.wait();
}

/// Raise a console interrupt for process group 0, the caller's own group
#[cfg(unix)]
pub fn raise_console_interrupt() -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(0), Signal::SIGINT).map_err(|e| RelayError::Signal(e.to_string()))
}

#[cfg(windows)]
pub fn raise_console_interrupt() -> Result<()> {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

    // SAFETY: plain FFI call without pointers; group 0 addresses every
    // process attached to this console.
    let ok = unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) };
    if ok == 0 {
        return Err(RelayError::Signal(io::Error::last_os_error().to_string()));
    }
    Ok(())
}

/// Listener for interrupts aimed at the current process.
///
/// The handler is registered on construction, before the relay raises an
/// interrupt for its own group.
pub struct InterruptListener {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
    #[cfg(windows)]
    inner: tokio::signal::windows::CtrlC,
}

impl InterruptListener {
    /// Register the handler; must run inside a tokio runtime
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            inner: signal(SignalKind::interrupt())?,
        })
    }

    #[cfg(windows)]
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            inner: tokio::signal::windows::ctrl_c()?,
        })
    }

    /// Wait for the next interrupt
    pub async fn recv(&mut self) {
        if self.inner.recv().await.is_none() {
            // Stream closed: never resolve
            std::future::pending::<()>().await;
        }
    }
}

/// Listener for a launcher being asked to stop: interrupt or terminate
pub struct StopListener {
    interrupt: InterruptListener,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl StopListener {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: InterruptListener::install()?,
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    #[cfg(unix)]
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            Some(_) = self.terminate.recv() => {}
        }
    }

    #[cfg(windows)]
    pub async fn recv(&mut self) {
        self.interrupt.recv().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::liveness::wait_for_exit;
    use std::io::{BufRead, BufReader};
    use std::process::Stdio;
    use std::time::Duration;

    #[test]
    fn test_kill_detached_takes_the_group_down() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & echo $!; wait"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        detach(&mut cmd);
        let mut leader = cmd.spawn().unwrap();

        let mut line = String::new();
        BufReader::new(leader.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let grandchild: u32 = line.trim().parse().unwrap();

        kill_detached(&mut leader);

        assert!(leader.try_wait().unwrap().is_some());
        assert!(
            wait_for_exit(grandchild, Duration::from_secs(5)),
            "process started by the leader must not be left behind"
        );
    }
}
