//! Relay server - owns the target process and raises the console interrupt
//!
//! Lifecycle: STARTED -> LISTENING -> CONNECTED -> {SIGNALED, IDLE_EXIT} ->
//! TERMINATED. The server accepts exactly one control connection and exits
//! once that connection has either delivered the termination sentinel or
//! closed.

use crate::command::CommandSpec;
use crate::error::{RelayError, Result};
use crate::process::signal::{self, InterruptListener};
use crate::protocol::{self, MatchState, SentinelMatcher, ACK};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, trace, warn};

const READ_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Started,
    Listening,
    Connected,
    Signaled,
    IdleExit,
    Terminated,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Started => "STARTED",
            RelayState::Listening => "LISTENING",
            RelayState::Connected => "CONNECTED",
            RelayState::Signaled => "SIGNALED",
            RelayState::IdleExit => "IDLE_EXIT",
            RelayState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// What the control connection asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Terminate,
    Closed,
}

/// How a relay server run ended. Every outcome exits the process with 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Sentinel received and the interrupt raised
    Signaled,
    /// Connection closed without the sentinel
    IdleExit,
    /// The server itself was interrupted
    Interrupted,
}

pub struct RelayServer {
    command: CommandSpec,
    port: u16,
    grace_period: Duration,
    state: RelayState,
    target_pid: Option<u32>,
}

impl RelayServer {
    /// Prepare a relay for `command`, controlled through loopback `port`
    pub fn new(command: CommandSpec, port: u16, grace_period: Duration) -> Self {
        Self {
            command,
            port,
            grace_period,
            state: RelayState::Started,
            target_pid: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Pid of the target once it has been started
    pub fn target_pid(&self) -> Option<u32> {
        self.target_pid
    }

    /// Run the relay to completion
    pub async fn run(&mut self) -> Result<Outcome> {
        self.transition(RelayState::Started);

        // Register before anything can raise an interrupt for our group
        let mut interrupts = InterruptListener::install()?;
        let grace_period = self.grace_period;

        let target_pid = spawn_target(&self.command)?;
        self.target_pid = Some(target_pid);
        info!(target_pid, command = %self.command, "target process started");

        let outcome = tokio::select! {
            outcome = self.serve(target_pid) => outcome,
            _ = interrupts.recv() => {
                info!(grace_ms = grace_period.as_millis() as u64, "relay server interrupted");
                tokio::time::sleep(grace_period).await;
                Ok(Outcome::Interrupted)
            }
        };

        self.transition(RelayState::Terminated);
        outcome
    }

    async fn serve(&mut self, target_pid: u32) -> Result<Outcome> {
        let port = self.port;
        let listener = bind_control_port(port)?;
        self.transition(RelayState::Listening);

        let (mut stream, peer) = listener.accept().await?;
        // No second connection is ever accepted
        drop(listener);
        debug!(%peer, "control connection accepted");
        self.transition(RelayState::Connected);

        if let Err(e) = stream
            .write_all(protocol::ready_line(target_pid).as_bytes())
            .await
        {
            warn!("failed to send ready line: {e}");
        }

        match wait_for_request(&mut stream).await {
            Request::Terminate => {
                self.transition(RelayState::Signaled);
                close_with_ack(stream).await;
                signal::raise_console_interrupt()?;
                info!(target_pid, "console interrupt raised for process group");
                Ok(Outcome::Signaled)
            }
            Request::Closed => {
                self.transition(RelayState::IdleExit);
                Ok(Outcome::IdleExit)
            }
        }
    }

    fn transition(&mut self, state: RelayState) {
        self.state = state;
        info!(port = self.port, %state, "relay state");
    }
}

/// Start the target in the relay's own process group with inherited stdio.
/// The child is never waited on.
fn spawn_target(command: &CommandSpec) -> Result<u32> {
    let child = Command::new(command.program())
        .args(command.args())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| RelayError::Spawn {
            what: format!("target {}", command.program()),
            source,
        })?;
    Ok(child.id())
}

/// Listen on the loopback control port with a backlog of one
fn bind_control_port(port: u16) -> Result<tokio::net::TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let bind = || -> std::io::Result<tokio::net::TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(addr)?;
        socket.listen(1)
    };
    bind().map_err(|source| RelayError::Bind { port, source })
}

/// Read the control connection until it carries the termination sentinel
/// or closes. Reads that are not part of a sentinel are skipped and the loop
/// keeps reading. Read errors count as a closed connection.
pub async fn wait_for_request<R: AsyncRead + Unpin>(reader: &mut R) -> Request {
    let mut matcher = SentinelMatcher::new();
    let mut buf = [0u8; READ_BUFFER];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Request::Closed,
            Ok(n) => n,
            Err(e) => {
                debug!("control connection failed: {e}");
                return Request::Closed;
            }
        };

        match matcher.feed(&buf[..n]) {
            MatchState::Matched => return Request::Terminate,
            MatchState::Pending => {}
            MatchState::Rejected => trace!(bytes = n, "ignoring non-sentinel payload"),
        }
    }
}

async fn close_with_ack(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(&[ACK]).await {
        debug!("acknowledgement not delivered: {e}");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TERMINATION_SENTINEL;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_sentinel_requests_termination() {
        let mut payload: &[u8] = TERMINATION_SENTINEL;
        assert_eq!(wait_for_request(&mut payload).await, Request::Terminate);
    }

    #[tokio::test]
    async fn test_fragmented_sentinel_requests_termination() {
        let (mut client, mut server) = duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in TERMINATION_SENTINEL.chunks(4) {
                client.write_all(chunk).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        assert_eq!(wait_for_request(&mut server).await, Request::Terminate);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_other_payload_then_close_is_idle() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"stop please").await.unwrap();
        drop(client);

        assert_eq!(wait_for_request(&mut server).await, Request::Closed);
    }

    #[tokio::test]
    async fn test_sentinel_after_stray_payload_requests_termination() {
        let (mut client, mut server) = duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"hello").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(TERMINATION_SENTINEL).await.unwrap();
            // Connection stays open: the sentinel alone must be enough
            client
        });

        let request = tokio::time::timeout(Duration::from_secs(5), wait_for_request(&mut server))
            .await
            .expect("sentinel after a stray payload should still be recognised");
        assert_eq!(request, Request::Terminate);
        drop(writer.await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_idle_run_ends_terminated() {
        use tokio::io::AsyncBufReadExt;

        let port = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let command = CommandSpec::new(["true"]).unwrap();
        let mut relay = RelayServer::new(command, port, Duration::from_millis(50));
        assert_eq!(relay.state(), RelayState::Started);
        assert_eq!(relay.target_pid(), None);

        let run = tokio::spawn(async move {
            let outcome = relay.run().await;
            (relay, outcome)
        });

        let mut attempts = 0;
        let stream = loop {
            match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
                Ok(stream) => break stream,
                Err(e) => {
                    attempts += 1;
                    assert!(attempts < 500, "relay never listened: {e}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };

        let mut line = String::new();
        tokio::io::BufReader::new(stream)
            .read_line(&mut line)
            .await
            .unwrap();
        let announced = protocol::parse_ready_line(&line).expect("ready line");

        let (relay, outcome) = run.await.unwrap();
        assert_eq!(outcome.unwrap(), Outcome::IdleExit);
        assert_eq!(relay.state(), RelayState::Terminated);
        assert_eq!(relay.target_pid(), Some(announced));
    }

    #[tokio::test]
    async fn test_immediate_close_is_idle() {
        let mut payload: &[u8] = b"";
        assert_eq!(wait_for_request(&mut payload).await, Request::Closed);
    }

    #[tokio::test]
    async fn test_partial_sentinel_then_close_is_idle() {
        let mut payload: &[u8] = b"Terminate with";
        assert_eq!(wait_for_request(&mut payload).await, Request::Closed);
    }

    #[tokio::test]
    async fn test_bind_fails_on_busy_port() {
        let holder = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        match bind_control_port(port) {
            Err(RelayError::Bind { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let command = CommandSpec::new(["/nonexistent/ctrlc-relay-target"]).unwrap();
        assert!(matches!(
            spawn_target(&command),
            Err(RelayError::Spawn { .. })
        ));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(RelayState::IdleExit.to_string(), "IDLE_EXIT");
        assert_eq!(RelayState::Signaled.to_string(), "SIGNALED");
    }
}
