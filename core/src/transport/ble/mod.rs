/// BLE (Bluetooth Low Energy) SMP transport
///
/// Carries SMP frames over the SMP GATT characteristic: requests are
/// written without response in MTU-sized chunks, responses arrive as
/// notifications on the same characteristic and are reassembled using the
/// length in their header.
///
/// - **config**: endpoint UUIDs, timeouts, MTU override and queue depth
/// - **peripheral**: the BLE capability the transport drives and the
///   callbacks it expects back
/// - **gate**: blocks the caller until the callback for one stage fires
/// - **write_state**: per-transaction response reassembly
/// - **queue**: FIFO admission of concurrent callers
/// - **transport**: the `BleTransport` facade and the connection state machine
/// - **simulated**: in-process peripheral for tests and demos
///
/// Platform code (Swift/Kotlin/BlueZ) owns the radio; everything here is
/// testable without hardware.

pub mod config;
mod connection;
pub mod gate;
pub mod peripheral;
pub mod queue;
pub mod simulated;
pub mod transport;
pub mod write_state;

pub use config::{
    BleTransportConfig, DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_MAX_QUEUED_TRANSACTIONS,
    DEFAULT_TRANSACTION_TIMEOUT_MS, MIN_MTU, SMP_CHARACTERISTIC_UUID, SMP_SERVICE_UUID,
};
pub use gate::{Gate, GateError};
pub use peripheral::{Characteristic, CharacteristicProperties, PeripheralDelegate, Service, SmpPeripheral};
pub use queue::{QueueTurn, TransactionQueue};
pub use simulated::{SimulatedPeripheral, SimulatedStage};
pub use transport::BleTransport;
pub use write_state::{Progress, TransactionState, WriteCoordinator};
