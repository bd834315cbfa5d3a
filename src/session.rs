#![forbid(unsafe_code)]

//! Write-session tokens.
//!
//! A token binds a client to the frontend node that issued it, the client's
//! call sequence number and the issue time, so successive writes of one
//! client are routed consistently. The wire form is
//! `"<nodeId>-<clientSequence>-<timestamp>"`; other services parse the
//! second field, so the layout must not change.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

const SEPARATOR: char = '-';

/// Token parsing failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The token does not have the documented layout.
    #[error("malformed write session '{token}': {reason}")]
    Malformed {
        /// Offending token.
        token: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl SessionError {
    fn malformed(token: &str, reason: impl Into<String>) -> Self {
        SessionError::Malformed {
            token: token.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Renders a session token.
pub fn encode(node_id: u32, client_seq: u64, timestamp: u64) -> String {
    format!("{node_id}{SEPARATOR}{client_seq}{SEPARATOR}{timestamp}")
}

/// Extracts the client sequence number, the token's second field.
///
/// Only the field count and the second field are checked; the other fields
/// are opaque to callers that only route by sequence.
pub fn decode_client_seq(token: &str) -> Result<u64, SessionError> {
    let fields: Vec<&str> = token.split(SEPARATOR).collect();
    if fields.len() < 3 {
        return Err(SessionError::malformed(
            token,
            format!("expected 3 fields, found {}", fields.len()),
        ));
    }
    fields[1].parse::<u64>().map_err(|err| {
        SessionError::malformed(token, format!("client sequence '{}': {err}", fields[1]))
    })
}

/// Parsed write-session token.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WriteSession {
    /// Frontend node that issued the session.
    pub node_id: u32,
    /// Client call sequence number.
    pub client_seq: u64,
    /// Issue time, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl fmt::Display for WriteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self.node_id, self.client_seq, self.timestamp))
    }
}

impl FromStr for WriteSession {
    type Err = SessionError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let client_seq = decode_client_seq(token)?;
        let fields: Vec<&str> = token.split(SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(SessionError::malformed(
                token,
                format!("expected 3 fields, found {}", fields.len()),
            ));
        }
        let node_id = fields[0]
            .parse::<u32>()
            .map_err(|err| SessionError::malformed(token, format!("node id '{}': {err}", fields[0])))?;
        let timestamp = fields[2].parse::<u64>().map_err(|err| {
            SessionError::malformed(token, format!("timestamp '{}': {err}", fields[2]))
        })?;
        Ok(Self {
            node_id,
            client_seq,
            timestamp,
        })
    }
}

/// Issues sessions for one frontend node with strictly increasing sequence
/// numbers.
#[derive(Debug)]
pub struct SessionAllocator {
    node_id: u32,
    next_seq: AtomicU64,
}

impl SessionAllocator {
    /// Allocator whose first sequence number is 0.
    pub fn new(node_id: u32) -> Self {
        Self::starting_at(node_id, 0)
    }

    /// Allocator resuming at `first_seq`.
    pub fn starting_at(node_id: u32, first_seq: u64) -> Self {
        Self {
            node_id,
            next_seq: AtomicU64::new(first_seq),
        }
    }

    /// Node the allocator issues sessions for.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Issues a session stamped with the current wall-clock time.
    pub fn next_session(&self) -> WriteSession {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        self.next_session_at(u64::try_from(millis).unwrap_or(0))
    }

    /// Issues a session with an explicit timestamp.
    pub fn next_session_at(&self, timestamp: u64) -> WriteSession {
        WriteSession {
            node_id: self.node_id,
            client_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            timestamp,
        }
    }
}
