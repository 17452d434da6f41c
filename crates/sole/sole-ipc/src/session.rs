//! Per-connection protocol state on the primary.
//!
//! A session owns no socket. The listener appends whatever bytes arrive and
//! calls [`ConnectionSession::advance`], which consumes every complete frame
//! and reports what the listener must do next.
//!
//! ```text
//!  AwaitingInitHeader ──8 bytes──▶ AwaitingInitBody ──valid init──▶ AwaitingDataHeader
//!                                        │                               ▲        │
//!                                   invalid init                     body done  8 bytes
//!                                        ▼                               │        ▼
//!                                   (rejected)                     AwaitingDataBody
//! ```
//!
//! Every consumed header and body yields one [`SessionAction::Ack`].

use crate::wire::{self, ConnectionKind, HEADER_LEN, InitMessage, MAX_INIT_BODY_LEN, WireError};
use sole_core::Identifier;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitingInitHeader,
    AwaitingInitBody,
    AwaitingDataHeader,
    AwaitingDataBody,
}

impl Stage {
    pub fn is_handshake(&self) -> bool {
        matches!(self, Stage::AwaitingInitHeader | Stage::AwaitingInitBody)
    }
}

/// What every session on one listener checks a peer against.
#[derive(Debug, Clone)]
pub struct HandshakePolicy {
    pub identifier: Identifier,
    /// Report `SecondaryInstance` handshakes as started instances too.
    pub notify_secondary: bool,
    pub max_message_len: u64,
    /// Connections still in the handshake after this long are dropped.
    pub handshake_timeout: Duration,
}

impl HandshakePolicy {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            notify_secondary: false,
            max_message_len: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Ack,
    InstanceStarted,
    Message { instance_id: u32, payload: Vec<u8> },
}

/// Why a peer was cut off. Never sent back to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeRejected {
    #[error("peer addressed a different server identity")]
    IdentityMismatch,

    #[error("malformed init message")]
    Malformed(#[from] WireError),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: u64 },
}

#[derive(Debug)]
pub struct ConnectionSession {
    stage: Stage,
    pending_length: u64,
    peer_instance_id: u32,
    inbox: Vec<u8>,
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSession {
    pub fn new() -> Self {
        Self {
            stage: Stage::AwaitingInitHeader,
            pending_length: 0,
            peer_instance_id: 0,
            inbox: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn peer_instance_id(&self) -> u32 {
        self.peer_instance_id
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.inbox.len()
    }

    pub fn receive(&mut self, bytes: &[u8]) {
        self.inbox.extend_from_slice(bytes);
    }

    /// Consumes every complete frame currently buffered.
    ///
    /// Actions are appended to `out` in the order the peer must observe them.
    /// On rejection the session is dead and the socket must be closed.
    pub fn advance(
        &mut self,
        policy: &HandshakePolicy,
        out: &mut Vec<SessionAction>,
    ) -> Result<(), HandshakeRejected> {
        while self.step(policy, out)? {}
        Ok(())
    }

    fn step(
        &mut self,
        policy: &HandshakePolicy,
        out: &mut Vec<SessionAction>,
    ) -> Result<bool, HandshakeRejected> {
        match self.stage {
            Stage::AwaitingInitHeader => {
                let Some(len) = self.take_header() else {
                    return Ok(false);
                };
                check_len(len, MAX_INIT_BODY_LEN)?;
                self.pending_length = len;
                self.stage = Stage::AwaitingInitBody;
            }
            Stage::AwaitingInitBody => {
                let Some(body) = self.take_body() else {
                    return Ok(false);
                };
                let init = InitMessage::decode(&body)?;
                if init.server_identity != policy.identifier.as_bytes() {
                    return Err(HandshakeRejected::IdentityMismatch);
                }

                self.peer_instance_id = init.instance_id;
                self.stage = Stage::AwaitingDataHeader;

                let announces = match init.kind {
                    ConnectionKind::NewInstance => true,
                    ConnectionKind::SecondaryInstance => policy.notify_secondary,
                    ConnectionKind::Reconnect | ConnectionKind::Invalid => false,
                };
                if announces {
                    out.push(SessionAction::InstanceStarted);
                }
            }
            Stage::AwaitingDataHeader => {
                let Some(len) = self.take_header() else {
                    return Ok(false);
                };
                check_len(len, policy.max_message_len)?;
                self.pending_length = len;
                self.stage = Stage::AwaitingDataBody;
            }
            Stage::AwaitingDataBody => {
                let Some(payload) = self.take_body() else {
                    return Ok(false);
                };
                out.push(SessionAction::Message {
                    instance_id: self.peer_instance_id,
                    payload,
                });
                self.stage = Stage::AwaitingDataHeader;
            }
        }
        out.push(SessionAction::Ack);
        Ok(true)
    }

    fn take_header(&mut self) -> Option<u64> {
        if self.inbox.len() < HEADER_LEN {
            return None;
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.inbox[..HEADER_LEN]);
        self.inbox.drain(..HEADER_LEN);
        Some(wire::decode_header(&header))
    }

    fn take_body(&mut self) -> Option<Vec<u8>> {
        // Lengths were bounded by check_len, so this fits in usize.
        let len = self.pending_length as usize;
        if self.inbox.len() < len {
            return None;
        }
        self.pending_length = 0;
        Some(self.inbox.drain(..len).collect())
    }
}

fn check_len(len: u64, max: u64) -> Result<(), HandshakeRejected> {
    if len > max || usize::try_from(len).is_err() {
        return Err(HandshakeRejected::FrameTooLarge { len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_header;
    use sole_core::AppIdentity;

    fn policy() -> HandshakePolicy {
        HandshakePolicy::new(Identifier::derive(&AppIdentity::new("session-test")))
    }

    fn init_frame(identity: &[u8], kind: ConnectionKind, instance_id: u32) -> Vec<u8> {
        let body = InitMessage {
            server_identity: identity.to_vec(),
            kind,
            instance_id,
        }
        .encode();
        let mut frame = encode_header(body.len() as u64).to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    fn data_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = encode_header(payload.len() as u64).to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    fn acks(out: &[SessionAction]) -> usize {
        out.iter().filter(|a| **a == SessionAction::Ack).count()
    }

    #[test]
    fn new_instance_handshake_then_message() {
        let policy = policy();
        let mut session = ConnectionSession::new();
        let mut out = Vec::new();

        session.receive(&init_frame(policy.identifier.as_bytes(), ConnectionKind::NewInstance, 1));
        session.advance(&policy, &mut out).unwrap();
        assert_eq!(
            out,
            vec![SessionAction::Ack, SessionAction::InstanceStarted, SessionAction::Ack]
        );
        assert_eq!(session.stage(), Stage::AwaitingDataHeader);
        assert_eq!(session.peer_instance_id(), 1);

        out.clear();
        session.receive(&data_frame(b"hello"));
        session.advance(&policy, &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                SessionAction::Ack,
                SessionAction::Message {
                    instance_id: 1,
                    payload: b"hello".to_vec()
                },
                SessionAction::Ack,
            ]
        );
        assert_eq!(session.buffered(), 0);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let policy = policy();
        let mut session = ConnectionSession::new();
        let mut out = Vec::new();

        let mut wire = init_frame(policy.identifier.as_bytes(), ConnectionKind::Reconnect, 4);
        wire.extend(data_frame(b"one"));
        wire.extend(data_frame(b""));
        wire.extend(data_frame(b"three"));

        for byte in wire {
            session.receive(&[byte]);
            session.advance(&policy, &mut out).unwrap();
        }

        let messages: Vec<_> = out
            .iter()
            .filter_map(|a| match a {
                SessionAction::Message { instance_id, payload } => Some((*instance_id, payload.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            messages,
            vec![(4, b"one".to_vec()), (4, Vec::new()), (4, b"three".to_vec())]
        );
        // Two acks per frame, four frames.
        assert_eq!(acks(&out), 8);
        assert!(!out.contains(&SessionAction::InstanceStarted));
    }

    #[test]
    fn wrong_identity_is_rejected_without_start() {
        let policy = policy();
        let mut session = ConnectionSession::new();
        let mut out = Vec::new();

        session.receive(&init_frame(b"someone-else", ConnectionKind::NewInstance, 1));
        let err = session.advance(&policy, &mut out).unwrap_err();

        assert_eq!(err, HandshakeRejected::IdentityMismatch);
        assert!(!out.contains(&SessionAction::InstanceStarted));
        // Only the header was acknowledged.
        assert_eq!(out, vec![SessionAction::Ack]);
    }

    #[test]
    fn corrupted_init_is_rejected() {
        let policy = policy();
        let mut session = ConnectionSession::new();
        let mut out = Vec::new();

        let mut frame = init_frame(policy.identifier.as_bytes(), ConnectionKind::NewInstance, 1);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        session.receive(&frame);

        assert!(matches!(
            session.advance(&policy, &mut out),
            Err(HandshakeRejected::Malformed(WireError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn secondary_announces_only_when_enabled() {
        let mut policy = policy();
        for (notify, expect_start) in [(false, false), (true, true)] {
            policy.notify_secondary = notify;
            let mut session = ConnectionSession::new();
            let mut out = Vec::new();
            session.receive(&init_frame(
                policy.identifier.as_bytes(),
                ConnectionKind::SecondaryInstance,
                2,
            ));
            session.advance(&policy, &mut out).unwrap();
            assert_eq!(out.contains(&SessionAction::InstanceStarted), expect_start);
        }
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut policy = policy();
        policy.max_message_len = 4;

        let mut session = ConnectionSession::new();
        let mut out = Vec::new();
        session.receive(&encode_header(MAX_INIT_BODY_LEN + 1));
        assert_eq!(
            session.advance(&policy, &mut out),
            Err(HandshakeRejected::FrameTooLarge {
                len: MAX_INIT_BODY_LEN + 1,
                max: MAX_INIT_BODY_LEN
            })
        );

        let mut session = ConnectionSession::new();
        session.receive(&init_frame(policy.identifier.as_bytes(), ConnectionKind::Reconnect, 1));
        session.receive(&data_frame(b"too long"));
        assert!(matches!(
            session.advance(&policy, &mut out),
            Err(HandshakeRejected::FrameTooLarge { len: 8, max: 4 })
        ));
    }

    #[test]
    fn partial_body_waits() {
        let policy = policy();
        let mut session = ConnectionSession::new();
        let mut out = Vec::new();

        session.receive(&init_frame(policy.identifier.as_bytes(), ConnectionKind::Reconnect, 1));
        let frame = data_frame(b"hello");
        session.receive(&frame[..10]);
        session.advance(&policy, &mut out).unwrap();

        assert_eq!(session.stage(), Stage::AwaitingDataBody);
        assert_eq!(session.buffered(), 2);
        assert!(!out.iter().any(|a| matches!(a, SessionAction::Message { .. })));
    }
}
