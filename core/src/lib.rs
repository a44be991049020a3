// McuMgr BLE core: SMP client transport over a GATT characteristic
//
// Frames are built by the command layer, carried by a transport, and the
// transport knows nothing about what is inside them.

pub mod managers;
pub mod smp;
pub mod transport;

pub use managers::{LogManager, McuManager, McuMgrError, McuMgrResponse, McuMgrReturnCode};
pub use smp::{McuMgrGroup, McuMgrHeader, McuMgrOperation, HEADER_LENGTH};
pub use transport::ble::{
    BleTransport, BleTransportConfig, Characteristic, CharacteristicProperties, PeripheralDelegate,
    Service, SimulatedPeripheral, SmpPeripheral,
};
pub use transport::{
    ConnectionObserver, ConnectionState, LinkError, McuMgrTransport, ProtocolError, TransportError,
    TransportScheme,
};
