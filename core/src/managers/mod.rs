//! Command layer
//!
//! A manager owns one SMP group. It encodes a request body as CBOR, frames
//! it with a fresh sequence number, hands it to any [`McuMgrTransport`] and
//! decodes the CBOR body of the response. What the body *means* is left to
//! the caller.
//!
//! - **logs**: the `logs` group (show, clear, module/level/log listings)

pub mod logs;

pub use logs::{
    LevelListResponse, LogEntry, LogListResponse, LogManager, LogResult, McuMgrLogResponse,
    ModuleListResponse,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::smp::{next_sequence_number, McuMgrGroup, McuMgrHeader, McuMgrOperation, HEADER_LENGTH};
use crate::transport::abstraction::{McuMgrTransport, TransportError};

/// CBOR encoding of an empty map, sent when a command has no arguments
static EMPTY_MAP: [u8; 1] = [0xA0];

/// Device-reported status (`rc` field of a response)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McuMgrReturnCode {
    Ok,
    Unknown,
    NoMemory,
    InvalidValue,
    Timeout,
    NoEntry,
    BadState,
    MessageTooLarge,
    NotSupported,
    Corrupt,
    Busy,
    Other(i32),
}

impl McuMgrReturnCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Unknown,
            2 => Self::NoMemory,
            3 => Self::InvalidValue,
            4 => Self::Timeout,
            5 => Self::NoEntry,
            6 => Self::BadState,
            7 => Self::MessageTooLarge,
            8 => Self::NotSupported,
            9 => Self::Corrupt,
            10 => Self::Busy,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Unknown => 1,
            Self::NoMemory => 2,
            Self::InvalidValue => 3,
            Self::Timeout => 4,
            Self::NoEntry => 5,
            Self::BadState => 6,
            Self::MessageTooLarge => 7,
            Self::NotSupported => 8,
            Self::Corrupt => 9,
            Self::Busy => 10,
            Self::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == Self::Ok
    }
}

impl fmt::Display for McuMgrReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum McuMgrError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode request: {0}")]
    Encoding(String),

    #[error("Failed to decode response: {0}")]
    Decoding(String),

    #[error("Unexpected response: {0}")]
    BadResponse(String),

    #[error("Device returned {0}")]
    ReturnCode(McuMgrReturnCode),
}

/// Body shared by every response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McuMgrResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
}

impl McuMgrResponse {
    pub fn return_code(&self) -> McuMgrReturnCode {
        McuMgrReturnCode::from_code(self.rc.unwrap_or(0))
    }
}

/// Arbitrary CBOR map, for commands whose body is not modeled
pub type CborMap = BTreeMap<String, ciborium::Value>;

pub(crate) fn encode_cbor<P: Serialize + ?Sized>(payload: &P) -> Result<Vec<u8>, McuMgrError> {
    let mut body = Vec::new();
    ciborium::into_writer(payload, &mut body).map_err(|e| McuMgrError::Encoding(e.to_string()))?;
    Ok(body)
}

pub(crate) fn decode_cbor<R: DeserializeOwned>(body: &[u8]) -> Result<R, McuMgrError> {
    ciborium::from_reader(body).map_err(|e| McuMgrError::Decoding(e.to_string()))
}

/// Sends the commands of one group through a shared transport
pub struct McuManager<T: ?Sized> {
    group: McuMgrGroup,
    transport: Arc<T>,
}

impl<T: ?Sized> Clone for McuManager<T> {
    fn clone(&self) -> Self {
        Self {
            group: self.group,
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: McuMgrTransport + ?Sized> McuManager<T> {
    pub fn new(group: McuMgrGroup, transport: Arc<T>) -> Self {
        Self { group, transport }
    }

    pub fn group(&self) -> McuMgrGroup {
        self.group
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Build the request frame for `command_id`
    pub fn build_frame<P: Serialize + ?Sized>(
        &self,
        op: McuMgrOperation,
        command_id: u8,
        payload: Option<&P>,
    ) -> Result<Vec<u8>, McuMgrError> {
        let body = match payload {
            Some(payload) => encode_cbor(payload)?,
            None => EMPTY_MAP.to_vec(),
        };
        McuMgrHeader::new(op, self.group.id(), next_sequence_number(), command_id, 0)
            .serialize(&body)
            .map_err(|e| McuMgrError::Encoding(e.to_string()))
    }

    /// Send one command and decode its response body.
    ///
    /// A non-zero `rc` in the response is returned as
    /// [`McuMgrError::ReturnCode`].
    pub fn send<P, R>(&self, op: McuMgrOperation, command_id: u8, payload: Option<&P>) -> Result<R, McuMgrError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let frame = self.build_frame(op, command_id, payload)?;
        let request = McuMgrHeader::parse(&frame)
            .ok_or_else(|| McuMgrError::Encoding("frame has no header".into()))?;
        debug!(
            "{} command {} ({:?}) seq {}",
            self.group, command_id, op, request.sequence_number
        );

        let response = self.transport.send(&frame)?;
        let body = validate_response(&request, &response)?;
        let body = if body.is_empty() { &EMPTY_MAP[..] } else { body };

        let status: McuMgrResponse = decode_cbor(body)?;
        let rc = status.return_code();
        if !rc.is_success() {
            warn!("{} command {} failed: {}", self.group, command_id, rc);
            return Err(McuMgrError::ReturnCode(rc));
        }
        decode_cbor(body)
    }
}

/// Check `response` answers `request` and return its body
fn validate_response<'a>(request: &McuMgrHeader, response: &'a [u8]) -> Result<&'a [u8], McuMgrError> {
    let header = McuMgrHeader::parse(response)
        .ok_or_else(|| McuMgrError::BadResponse(format!("{} bytes, no header", response.len())))?;
    if Some(header.op) != request.op.response() {
        return Err(McuMgrError::BadResponse(format!(
            "{:?} does not answer {:?}",
            header.op, request.op
        )));
    }
    if header.group != request.group
        || header.command_id != request.command_id
        || header.sequence_number != request.sequence_number
    {
        return Err(McuMgrError::BadResponse(format!(
            "group {} command {} seq {} does not answer group {} command {} seq {}",
            header.group,
            header.command_id,
            header.sequence_number,
            request.group,
            request.command_id,
            request.sequence_number
        )));
    }
    response
        .get(HEADER_LENGTH..header.frame_length())
        .ok_or_else(|| McuMgrError::BadResponse(format!("truncated to {} bytes", response.len())))
}
