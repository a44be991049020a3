// Transport module: transport-agnostic contract and the BLE implementation

pub mod abstraction;
pub mod ble;

pub use abstraction::{
    ConnectionObserver, ConnectionState, LinkError, McuMgrTransport, ProtocolError, TransportError,
    TransportScheme,
};
pub use ble::{BleTransport, BleTransportConfig};
