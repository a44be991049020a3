/// BLE central capability consumed by the transport
///
/// The platform's BLE stack (CoreBluetooth, BlueZ, Android GATT...) is
/// wrapped by an implementation of [`SmpPeripheral`] for one remote device.
/// Every call only *requests* an operation; its result comes back later
/// through the matching [`PeripheralDelegate`] callback, on whatever thread
/// or queue the platform delivers events on.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use std::sync::Arc;
use uuid::Uuid;

use crate::transport::abstraction::LinkError;

/// A GATT service discovered on the peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub handle: u16,
}

impl Service {
    pub fn new(uuid: Uuid, handle: u16) -> Self {
        Self { uuid, handle }
    }
}

/// GATT characteristic property bits (Bluetooth Core Vol 3, Part G, 3.3.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A GATT characteristic discovered within a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub handle: u16,
    pub properties: CharacteristicProperties,
}

impl Characteristic {
    pub fn new(uuid: Uuid, service: &Service, handle: u16, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            service_uuid: service.uuid,
            handle,
            properties,
        }
    }
}

/// Requests the transport issues to the platform BLE stack
#[cfg_attr(test, mockall::automock)]
pub trait SmpPeripheral: Send + Sync {
    /// Whether the physical link is currently up
    fn is_connected(&self) -> bool;

    /// Request a physical connection; answered by `did_connect`
    fn connect(&self) -> Result<(), LinkError>;

    /// Request service discovery; answered by `did_discover_services`
    fn discover_services(&self, services: &[Uuid]) -> Result<(), LinkError>;

    /// Request characteristic discovery within `service`; answered by
    /// `did_discover_characteristics`
    fn discover_characteristics(&self, service: &Service, characteristics: &[Uuid]) -> Result<(), LinkError>;

    /// Request (un)subscription; answered by `did_update_notification_state`
    fn set_notify_value(&self, enabled: bool, characteristic: &Characteristic) -> Result<(), LinkError>;

    /// Write one chunk of at most `maximum_write_length()` bytes
    fn write(&self, value: &[u8], characteristic: &Characteristic) -> Result<(), LinkError>;

    /// Largest value accepted by a single write without response
    fn maximum_write_length(&self) -> usize;

    /// Drop the physical link
    fn disconnect(&self);
}

impl<P: SmpPeripheral + ?Sized> SmpPeripheral for Arc<P> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn connect(&self) -> Result<(), LinkError> {
        (**self).connect()
    }

    fn discover_services(&self, services: &[Uuid]) -> Result<(), LinkError> {
        (**self).discover_services(services)
    }

    fn discover_characteristics(&self, service: &Service, characteristics: &[Uuid]) -> Result<(), LinkError> {
        (**self).discover_characteristics(service, characteristics)
    }

    fn set_notify_value(&self, enabled: bool, characteristic: &Characteristic) -> Result<(), LinkError> {
        (**self).set_notify_value(enabled, characteristic)
    }

    fn write(&self, value: &[u8], characteristic: &Characteristic) -> Result<(), LinkError> {
        (**self).write(value, characteristic)
    }

    fn maximum_write_length(&self) -> usize {
        (**self).maximum_write_length()
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }
}

/// Callbacks the platform BLE stack delivers to the transport.
///
/// Implementations never block: they record state and wake the waiting
/// caller.
pub trait PeripheralDelegate: Send + Sync {
    fn did_connect(&self, result: Result<(), LinkError>);

    /// The link dropped. `error` is `None` only when the drop was requested
    /// through [`SmpPeripheral::disconnect`].
    fn did_disconnect(&self, error: Option<LinkError>);

    fn did_discover_services(&self, result: Result<Vec<Service>, LinkError>);

    fn did_discover_characteristics(&self, service: &Service, result: Result<Vec<Characteristic>, LinkError>);

    fn did_update_notification_state(&self, characteristic: &Characteristic, result: Result<(), LinkError>);

    /// A notification (or read) delivered a value
    fn did_update_value(&self, characteristic: &Characteristic, result: Result<Vec<u8>, LinkError>);
}
