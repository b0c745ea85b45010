//! Relay client - the launcher's handle on a relayed target process

use crate::command::CommandSpec;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::process::liveness;
use crate::process::signal;
use crate::protocol::{self, ACK, MAX_READY_LINE, TERMINATION_SENTINEL};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Handle on a target process started through a relay server.
///
/// The target cannot be interrupted from the launcher's process group, so
/// the client asks the relay server, which shares a group with the target,
/// to raise the interrupt instead.
pub struct RelayClient {
    server: Child,
    connection: Option<TcpStream>,
    port: u16,
    target_pid: u32,
    await_ack: bool,
    ack_timeout: Duration,
}

impl RelayClient {
    /// Spawn a detached relay server for `command` and connect to it
    pub fn spawn(command: &CommandSpec, config: &RelayConfig) -> Result<Self> {
        let port = reserve_port(config.port)?;
        let program = config.server_program();

        let stderr = match &config.server_log {
            Some(path) => Stdio::from(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => Stdio::null(),
        };

        let mut cmd = Command::new(&program);
        cmd.arg("serve")
            .arg("--grace-ms")
            .arg(config.grace_period_ms.to_string())
            .arg(command.to_command_line())
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);
        signal::detach(&mut cmd);

        let mut server = cmd.spawn().map_err(|source| RelayError::Spawn {
            what: format!("relay server {}", program.display()),
            source,
        })?;

        info!(port, server_pid = server.id(), command = %command, "relay server spawned");

        let connected = connect_with_backoff(&mut server, port, config)
            .and_then(|stream| read_ready_line(stream, config.connect_timeout()));

        match connected {
            Ok((stream, target_pid)) => {
                info!(port, target_pid, "connected to relay server");
                Ok(Self {
                    server,
                    connection: Some(stream),
                    port,
                    target_pid,
                    await_ack: config.await_ack,
                    ack_timeout: config.ack_timeout(),
                })
            }
            Err(e) => {
                // The server may already have started the target
                warn!(port, server_pid = server.id(), "relay startup failed, killing its process group");
                signal::kill_detached(&mut server);
                Err(e)
            }
        }
    }

    /// Loopback port of the control connection
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pid of the relay server process
    pub fn server_pid(&self) -> u32 {
        self.server.id()
    }

    /// Pid of the target, as announced by the relay server
    pub fn target_pid(&self) -> u32 {
        self.target_pid
    }

    /// Whether the control connection is still open
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Ask the relay server to interrupt the target's process group.
    ///
    /// Fire-and-forget: the caller learns about success only from the
    /// target's exit, see [`RelayClient::wait_for_target_exit`].
    pub fn request_termination(&mut self) -> Result<()> {
        let acknowledged = self.request_termination_acknowledged()?;
        if self.await_ack && !self.ack_timeout.is_zero() && !acknowledged {
            warn!(port = self.port, "relay server did not acknowledge termination request");
        }
        Ok(())
    }

    /// Like [`RelayClient::request_termination`], but reports whether the
    /// relay server acknowledged the request
    pub fn request_termination_acknowledged(&mut self) -> Result<bool> {
        let mut stream = self.connection.take().ok_or_else(|| {
            RelayError::Connection("termination requested on a closed connection".to_string())
        })?;

        stream
            .write_all(TERMINATION_SENTINEL)
            .and_then(|()| stream.flush())
            .map_err(|e| RelayError::Connection(format!("failed to send termination request: {e}")))?;

        info!(port = self.port, target_pid = self.target_pid, "termination requested");

        if !self.await_ack || self.ack_timeout.is_zero() {
            return Ok(false);
        }

        Ok(read_ack(&mut stream, self.ack_timeout))
    }

    /// Drop the connection without requesting termination; the relay
    /// server exits and leaves the target running
    pub fn close(&mut self) {
        if let Some(stream) = self.connection.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(port = self.port, "control connection closed");
        }
    }

    /// Reap the relay server, waiting at most `timeout`
    pub fn wait_for_server(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.server.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(SERVER_POLL_INTERVAL);
        }
    }

    /// Wait at most `timeout` for the target to exit. Returns true if it did.
    pub fn wait_for_target_exit(&self, timeout: Duration) -> bool {
        liveness::wait_for_exit(self.target_pid, timeout)
    }
}

/// Pick the control port: the configured one if it is free, otherwise a
/// fresh ephemeral port when none is configured
fn reserve_port(configured: u16) -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, configured)).map_err(|e| {
        RelayError::Connection(format!("control port {configured} is not available: {e}"))
    })?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn connect_with_backoff(server: &mut Child, port: u16, config: &RelayConfig) -> Result<TcpStream> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let deadline = Instant::now() + config.connect_timeout();
    let mut backoff = config.initial_backoff();
    let mut attempts = 0u32;

    loop {
        if let Some(status) = server.try_wait()? {
            return Err(RelayError::Connection(format!(
                "relay server exited ({status}) before accepting on port {port}"
            )));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RelayError::Connection(format!(
                "relay server on port {port} not reachable after {attempts} attempts"
            )));
        }

        attempts += 1;
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => {
                debug!(port, attempts, "control connection established");
                return Ok(stream);
            }
            Err(e) => debug!(port, attempts, "relay server not listening yet: {e}"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(backoff.min(remaining));
        backoff = (backoff * 2).min(config.max_backoff());
    }
}

fn read_ready_line(mut stream: TcpStream, timeout: Duration) -> Result<(TcpStream, u32)> {
    let timeout = timeout.max(Duration::from_millis(1));
    stream.set_read_timeout(Some(timeout))?;

    let mut line = Vec::with_capacity(MAX_READY_LINE);
    let mut byte = [0u8; 1];
    while line.len() < MAX_READY_LINE {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(RelayError::Connection(format!(
                    "no ready line from relay server: {e}"
                )))
            }
        }
    }

    let line = String::from_utf8_lossy(&line);
    let target_pid = protocol::parse_ready_line(&line).ok_or_else(|| {
        RelayError::Connection(format!("unexpected greeting from relay server: {line:?}"))
    })?;

    stream.set_read_timeout(None)?;
    Ok((stream, target_pid))
}

fn read_ack(stream: &mut TcpStream, timeout: Duration) -> bool {
    if stream.shutdown(Shutdown::Write).is_err() || stream.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }

    let mut byte = [0u8; 1];
    matches!(stream.read(&mut byte), Ok(1) if byte[0] == ACK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_port_allocates_ephemeral() {
        let port = reserve_port(0).unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn test_reserve_port_rejects_bound_port() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        let result = reserve_port(port);
        assert!(matches!(result, Err(RelayError::Connection(_))));
    }

    #[test]
    fn test_ready_line_is_read_from_stream() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let greeter = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(protocol::ready_line(4321).as_bytes()).unwrap();
            conn
        });

        let stream = TcpStream::connect(addr).unwrap();
        let (_stream, pid) = read_ready_line(stream, Duration::from_secs(5)).unwrap();
        assert_eq!(pid, 4321);
        drop(greeter.join().unwrap());
    }

    #[test]
    fn test_foreign_listener_is_not_a_relay() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let greeter = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"HTTP/1.1 400 Bad Request\r\n").unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let result = read_ready_line(stream, Duration::from_secs(5));
        assert!(matches!(result, Err(RelayError::Connection(_))));
        greeter.join().unwrap();
    }

    #[test]
    fn test_ack_is_read_after_half_close() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).unwrap();
            conn.write_all(&[ACK]).unwrap();
            received
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(TERMINATION_SENTINEL).unwrap();
        assert!(read_ack(&mut stream, Duration::from_secs(5)));
        assert_eq!(server.join().unwrap(), TERMINATION_SENTINEL);
    }
}
