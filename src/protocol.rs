//! Wire format of the control connection
//!
//! The client writes payloads to the server; only the termination sentinel
//! means anything. The server greets with a ready line naming the target
//! pid, and acknowledges a termination request with a single byte before
//! closing.

/// Payload that requests the console interrupt
pub const TERMINATION_SENTINEL: &[u8] = b"Terminate with CTRL-C";

/// Byte written by the server after it recognised the sentinel
pub const ACK: u8 = 0x06;

const READY_PREFIX: &str = "RELAY-READY ";

/// Longest ready line the client is willing to read
pub const MAX_READY_LINE: usize = 64;

/// Greeting the server writes once it has accepted the control connection
pub fn ready_line(target_pid: u32) -> String {
    format!("{READY_PREFIX}{target_pid}\n")
}

/// Parse a ready line (with or without the trailing newline)
pub fn parse_ready_line(line: &str) -> Option<u32> {
    line.trim_end_matches(['\r', '\n'])
        .strip_prefix(READY_PREFIX)?
        .parse()
        .ok()
}

/// Progress of the bytes read so far against the sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Everything since the last reset is a prefix of the sentinel
    Pending,
    /// The sentinel has been read in full
    Matched,
    /// The last read was not part of a sentinel; matching starts over
    Rejected,
}

/// Accumulates reads until they form the sentinel.
///
/// A sentinel split across several reads is still recognised. A read that
/// breaks the match is discarded and the next read is checked from the
/// start, so stray payloads never block a later termination request.
#[derive(Debug, Default)]
pub struct SentinelMatcher {
    received: usize,
}

impl SentinelMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read result and report where matching stands
    pub fn feed(&mut self, chunk: &[u8]) -> MatchState {
        if let Some(end) = continues_sentinel(self.received, chunk) {
            self.received = end;
            return self.state();
        }

        // The read may itself start a fresh sentinel
        match continues_sentinel(0, chunk) {
            Some(end) => {
                self.received = end;
                self.state()
            }
            None => {
                self.received = 0;
                MatchState::Rejected
            }
        }
    }

    /// Where matching stands without feeding more bytes
    pub fn state(&self) -> MatchState {
        if self.received == TERMINATION_SENTINEL.len() {
            MatchState::Matched
        } else {
            MatchState::Pending
        }
    }
}

/// New match length if `chunk` extends a sentinel prefix of length `received`
fn continues_sentinel(received: usize, chunk: &[u8]) -> Option<usize> {
    let end = received + chunk.len();
    (end <= TERMINATION_SENTINEL.len() && TERMINATION_SENTINEL[received..end] == *chunk)
        .then_some(end)
}
