//! Transport abstraction layer for McuMgr
//!
//! Defines the transport-agnostic contract the command layer talks to, the
//! connection lifecycle states and the error taxonomy shared by all
//! transports.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Transport schemes a management channel can run over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportScheme {
    /// SMP over a BLE GATT characteristic
    Ble,
    /// SMP over UDP
    Udp,
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportScheme::Ble => write!(f, "BLE"),
            TransportScheme::Udp => write!(f, "UDP"),
        }
    }
}

/// Connection lifecycle of a transport.
///
/// `Disconnected -> Connecting -> DiscoveringServices ->
/// DiscoveringCharacteristics -> EnablingNotifications -> Connected`; any
/// state may fall back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    EnablingNotifications,
    Connected,
}

impl ConnectionState {
    /// Whether requests may be written without running discovery again
    pub fn is_connected(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::DiscoveringCharacteristics => write!(f, "DiscoveringCharacteristics"),
            Self::EnablingNotifications => write!(f, "EnablingNotifications"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Receives every connection state change of a transport.
///
/// Called outside of the transport's locks, from whichever thread caused
/// the change.
pub trait ConnectionObserver: Send + Sync {
    fn transport_did_change_state(&self, state: ConnectionState);
}

/// A request/response channel to one device
pub trait McuMgrTransport: Send + Sync {
    /// Scheme this transport speaks
    fn scheme(&self) -> TransportScheme;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Establish the channel. A no-op when already connected.
    fn connect(&self) -> Result<(), TransportError>;

    /// Send one complete SMP frame and block until the complete response
    /// frame (header included) arrives.
    fn send(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Tear the channel down, failing any in-flight request with
    /// [`TransportError::Cancelled`].
    fn close(&self);
}

/// Failures reported by the underlying link
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LinkError {
    #[error("Peripheral disconnected")]
    Disconnected,

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("BLE stack error: {0}")]
    Stack(String),
}

/// Violations of the SMP-over-BLE contract
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("SMP service not found")]
    MissingService,

    #[error("SMP characteristic not found")]
    MissingCharacteristic,

    #[error("SMP characteristic does not support notifications")]
    MissingNotifyProperty,

    #[error("Missing header on first chunk")]
    MissingHeader,

    #[error("Bad header: {0}")]
    BadHeader(String),

    #[error("Length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Errors surfaced to callers of `connect`/`send`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timed out")]
    Timeout,

    #[error("Transaction queue full")]
    Busy,

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Whether the failure invalidates the link itself, not just the request
    pub fn is_link_level(&self) -> bool {
        matches!(self, TransportError::Link(_))
    }
}
