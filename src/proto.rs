//! The slice of the wire protocol this engine interprets.
//!
//! The engine does not own the framing or the payload encoding; it only
//! writes the request header and reads the one-byte reply status plus the
//! status-specific body. Everything here is pure and non-blocking, because
//! [parse_reply] runs on the channel's reply-parsing path with the
//! channel's own lock held.

use crate::buffer::{ReplyReader, RequestBuffer};
use crate::error::{InvokeError, NotExist};
use crate::target::{EncodingVersion, OperationMode, TargetRef};
use std::fmt;

/// Reply status byte, a fixed external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = InvokeError;

    fn try_from(value: u8) -> Result<Self, InvokeError> {
        match value {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::UserException),
            2 => Ok(ReplyStatus::ObjectNotExist),
            3 => Ok(ReplyStatus::FacetNotExist),
            4 => Ok(ReplyStatus::OperationNotExist),
            5 => Ok(ReplyStatus::UnknownLocalException),
            6 => Ok(ReplyStatus::UnknownUserException),
            7 => Ok(ReplyStatus::UnknownException),
            other => Err(InvokeError::Protocol(format!(
                "received unknown reply status {}",
                other
            ))),
        }
    }
}

/// Object identity on the peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self { name: name.into(), category: category.into() }
    }

    pub fn encode(&self, buf: &mut RequestBuffer) {
        buf.write_string(&self.name);
        buf.write_string(&self.category);
    }

    pub fn decode(r: &mut ReplyReader<'_>) -> Result<Self, InvokeError> {
        let name = r.read_string()?;
        let category = r.read_string()?;
        Ok(Self { name, category })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// A successfully interpreted reply: either the encoded return values
/// (`ok`) or the encoded user exception payload (`!ok`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub payload: Vec<u8>,
}

/// Write the request header: identity, legacy facet path, operation name,
/// operation mode byte, context map.
///
/// The facet is encoded as a string sequence for compatibility with the
/// old facet path: empty facet writes an empty sequence, anything else a
/// single element.
pub fn encode_request_header(buf: &mut RequestBuffer, target: &TargetRef, operation: &str, mode: OperationMode) {
    target.identity.encode(buf);
    if target.facet.is_empty() {
        buf.write_string_seq(&[]);
    } else {
        buf.write_string_seq(&[&target.facet]);
    }
    buf.write_string(operation);
    buf.write_u8(mode as u8);
    buf.write_u32(target.context.len() as u32);
    for (k, v) in &target.context {
        buf.write_string(k);
        buf.write_string(v);
    }
}

/// Write an argument encapsulation: self-inclusive size, encoding version,
/// opaque payload bytes.
pub fn encode_encapsulation(buf: &mut RequestBuffer, encoding: EncodingVersion, payload: &[u8]) {
    buf.write_u32(6 + payload.len() as u32);
    buf.write_u8(encoding.major);
    buf.write_u8(encoding.minor);
    buf.write_bytes(payload);
}

/// Interpret raw reply bytes.
///
/// Returns `Ok` for the two statuses carrying a payload, the decoded
/// remote failure otherwise. A facet path with more than one element is a
/// protocol error and never constructs the not-exist error.
pub fn parse_reply(bytes: &[u8]) -> Result<Reply, InvokeError> {
    let mut r = ReplyReader::new(bytes);
    let status = ReplyStatus::try_from(r.read_u8()?)?;
    match status {
        ReplyStatus::Ok => Ok(Reply { ok: true, payload: r.remaining().to_vec() }),
        ReplyStatus::UserException => Ok(Reply { ok: false, payload: r.remaining().to_vec() }),
        ReplyStatus::ObjectNotExist
        | ReplyStatus::FacetNotExist
        | ReplyStatus::OperationNotExist => {
            let identity = Identity::decode(&mut r)?;
            let mut facet_path = r.read_string_seq()?;
            if facet_path.len() > 1 {
                return Err(InvokeError::Protocol(
                    "received facet path with more than one element".into(),
                ));
            }
            let facet = facet_path.pop().unwrap_or_default();
            let operation = r.read_string()?;
            let not_exist = NotExist { identity, facet, operation };
            Err(match status {
                ReplyStatus::ObjectNotExist => InvokeError::ObjectNotExist(not_exist),
                ReplyStatus::FacetNotExist => InvokeError::FacetNotExist(not_exist),
                _ => InvokeError::OperationNotExist(not_exist),
            })
        }
        ReplyStatus::UnknownLocalException
        | ReplyStatus::UnknownUserException
        | ReplyStatus::UnknownException => {
            let message = r.read_string()?;
            Err(match status {
                ReplyStatus::UnknownLocalException => InvokeError::UnknownLocal(message),
                ReplyStatus::UnknownUserException => InvokeError::UnknownUser(message),
                _ => InvokeError::Unknown(message),
            })
        }
    }
}

/// Encode an OK or user-exception reply. The server side of the contract,
/// provided for collocated dispatch and tests.
pub fn encode_payload_reply(buf: &mut RequestBuffer, status: ReplyStatus, payload: &[u8]) {
    debug_assert!(matches!(status, ReplyStatus::Ok | ReplyStatus::UserException));
    buf.write_u8(status as u8);
    buf.write_bytes(payload);
}

/// Encode a `*NotExist` reply body.
pub fn encode_not_exist_reply(
    buf: &mut RequestBuffer,
    status: ReplyStatus,
    identity: &Identity,
    facet: &str,
    operation: &str,
) {
    buf.write_u8(status as u8);
    identity.encode(buf);
    if facet.is_empty() {
        buf.write_string_seq(&[]);
    } else {
        buf.write_string_seq(&[facet]);
    }
    buf.write_string(operation);
}

/// Encode an `Unknown*` reply body.
pub fn encode_unknown_reply(buf: &mut RequestBuffer, status: ReplyStatus, message: &str) {
    buf.write_u8(status as u8);
    buf.write_string(message);
}
