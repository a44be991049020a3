/// Connection state machine
///
/// Walks the peripheral from "discovered" to "ready to transact":
/// physical connect (if needed), service discovery, characteristic
/// discovery, then notification subscription. The caller's thread issues
/// each request and waits on the gate; the platform callbacks below only
/// validate what they were given, record it and signal the stage.
///
/// The first error at any stage aborts the whole sequence and the state
/// falls back to `Disconnected`. Nothing is retried here.

use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::gate::GateError;
use super::peripheral::{Characteristic, CharacteristicProperties, Service, SmpPeripheral};
use super::transport::{Shared, TransportKey};
use crate::transport::abstraction::{ConnectionState, LinkError, ProtocolError, TransportError};

impl<P: SmpPeripheral> Shared<P> {
    /// Run the connection sequence unless the link is already up
    pub(crate) fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.state().is_connected() {
            return Ok(());
        }

        let attempt = self.begin_attempt();
        match self.run_connection_sequence(attempt) {
            Ok(()) => {
                info!("SMP characteristic ready");
                Ok(())
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                let changed = {
                    let mut inner = self.inner.lock();
                    // A close or link loss already reset everything
                    inner.attempt == attempt && inner.reset_link()
                };
                if changed {
                    self.notify_observers(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    fn begin_attempt(&self) -> u64 {
        let attempt = {
            let mut inner = self.inner.lock();
            inner.attempt += 1;
            inner.state = ConnectionState::Connecting;
            inner.attempt
        };
        self.notify_observers(ConnectionState::Connecting);
        attempt
    }

    /// Move to `state` and arm `key`, unless the attempt was superseded
    fn advance(&self, attempt: u64, state: ConnectionState, key: TransportKey) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt {
                return Err(TransportError::Cancelled);
            }
            inner.state = state;
            inner.request_issued(key);
            self.gate.arm(key);
        }
        self.notify_observers(state);
        Ok(())
    }

    /// Issue the request answering `key`
    fn request(
        &self,
        key: TransportKey,
        issue: impl FnOnce() -> Result<(), LinkError>,
    ) -> Result<(), TransportError> {
        issue().map_err(|e| {
            self.inner.lock().request_withdrawn(key);
            TransportError::from(e)
        })
    }

    fn wait_stage(&self, key: TransportKey, timeout: Duration) -> Result<(), TransportError> {
        self.gate.wait(key, timeout).map_err(|e| match e {
            GateError::TimedOut => {
                warn!("Timed out waiting for {:?}", key);
                TransportError::Timeout
            }
            GateError::Failed(e) => e,
        })
    }

    fn run_connection_sequence(&self, attempt: u64) -> Result<(), TransportError> {
        let timeout = self.config.connection_timeout();

        if !self.peripheral.is_connected() {
            info!("Connecting to peripheral...");
            {
                let mut inner = self.inner.lock();
                if inner.attempt != attempt {
                    return Err(TransportError::Cancelled);
                }
                // Discovery requests made on a previous link died with it
                inner
                    .outstanding
                    .retain(|key, _| *key == TransportKey::PeripheralConnected);
                inner.request_issued(TransportKey::PeripheralConnected);
                self.gate.arm(TransportKey::PeripheralConnected);
            }
            self.request(TransportKey::PeripheralConnected, || self.peripheral.connect())?;
            self.wait_stage(TransportKey::PeripheralConnected, timeout)?;
        }

        self.advance(attempt, ConnectionState::DiscoveringServices, TransportKey::ServicesDiscovered)?;
        debug!("Discovering services...");
        self.request(TransportKey::ServicesDiscovered, || {
            self.peripheral.discover_services(&[self.config.service_uuid])
        })?;
        self.wait_stage(TransportKey::ServicesDiscovered, timeout)?;
        let service = self
            .inner
            .lock()
            .service
            .clone()
            .ok_or(ProtocolError::MissingService)?;

        self.advance(
            attempt,
            ConnectionState::DiscoveringCharacteristics,
            TransportKey::CharacteristicsDiscovered,
        )?;
        debug!("Discovering characteristics...");
        self.request(TransportKey::CharacteristicsDiscovered, || {
            self.peripheral
                .discover_characteristics(&service, &[self.config.characteristic_uuid])
        })?;
        self.wait_stage(TransportKey::CharacteristicsDiscovered, timeout)?;
        let characteristic = self
            .inner
            .lock()
            .discovered
            .clone()
            .ok_or(ProtocolError::MissingCharacteristic)?;

        self.advance(
            attempt,
            ConnectionState::EnablingNotifications,
            TransportKey::NotificationsEnabled,
        )?;
        debug!("Enabling notifications...");
        self.request(TransportKey::NotificationsEnabled, || {
            self.peripheral.set_notify_value(true, &characteristic)
        })?;
        self.wait_stage(TransportKey::NotificationsEnabled, timeout)
    }

    pub(crate) fn on_connect(&self, result: Result<(), LinkError>) {
        {
            let mut inner = self.inner.lock();
            if !inner.answered(TransportKey::PeripheralConnected) {
                trace!("Dropping stale connect callback");
                return;
            }
            if inner.state != ConnectionState::Connecting {
                trace!("Ignoring connect callback in state {}", inner.state);
                return;
            }
        }
        match result {
            Ok(()) => {
                debug!("Peripheral connected");
                self.gate.signal(TransportKey::PeripheralConnected);
            }
            Err(e) => {
                self.gate.fail(e.into());
            }
        }
    }

    pub(crate) fn on_disconnect(&self, error: Option<LinkError>) {
        match error {
            Some(e) => {
                warn!("Peripheral disconnected: {}", e);
                self.drop_link(e.into());
            }
            // Requested by close(), which already dropped the link
            None => info!("Peripheral disconnected"),
        }
    }

    pub(crate) fn on_services_discovered(&self, result: Result<Vec<Service>, LinkError>) {
        let outcome = {
            let mut inner = self.inner.lock();
            if !inner.answered(TransportKey::ServicesDiscovered) {
                trace!("Dropping stale services callback");
                return;
            }
            if inner.state != ConnectionState::DiscoveringServices {
                trace!("Ignoring services callback in state {}", inner.state);
                return;
            }
            result.map_err(TransportError::from).and_then(|services| {
                debug!(
                    "Services discovered: {}",
                    services
                        .iter()
                        .map(|s| s.uuid.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                let service = services
                    .into_iter()
                    .find(|s| s.uuid == self.config.service_uuid)
                    .ok_or(ProtocolError::MissingService)?;
                inner.service = Some(service);
                Ok(())
            })
        };
        self.resolve(TransportKey::ServicesDiscovered, outcome);
    }

    pub(crate) fn on_characteristics_discovered(
        &self,
        service: &Service,
        result: Result<Vec<Characteristic>, LinkError>,
    ) {
        let outcome = {
            let mut inner = self.inner.lock();
            if !inner.answered(TransportKey::CharacteristicsDiscovered) {
                trace!("Dropping stale characteristics callback");
                return;
            }
            if inner.state != ConnectionState::DiscoveringCharacteristics {
                trace!("Ignoring characteristics callback in state {}", inner.state);
                return;
            }
            if inner.service.as_ref().map(|s| s.uuid) != Some(service.uuid) {
                trace!("Ignoring characteristics of service {}", service.uuid);
                return;
            }
            result.map_err(TransportError::from).and_then(|characteristics| {
                debug!(
                    "Characteristics discovered: {}",
                    characteristics
                        .iter()
                        .map(|c| c.uuid.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                let characteristic = characteristics
                    .into_iter()
                    .find(|c| c.uuid == self.config.characteristic_uuid)
                    .ok_or(ProtocolError::MissingCharacteristic)?;
                if !characteristic.properties.contains(CharacteristicProperties::NOTIFY) {
                    return Err(ProtocolError::MissingNotifyProperty.into());
                }
                inner.discovered = Some(characteristic);
                Ok(())
            })
        };
        self.resolve(TransportKey::CharacteristicsDiscovered, outcome);
    }

    pub(crate) fn on_notification_state_changed(
        &self,
        characteristic: &Characteristic,
        result: Result<(), LinkError>,
    ) {
        if characteristic.uuid != self.config.characteristic_uuid {
            return;
        }
        let outcome = {
            let mut inner = self.inner.lock();
            if !inner.answered(TransportKey::NotificationsEnabled) {
                trace!("Dropping stale notification state callback");
                return;
            }
            if inner.state != ConnectionState::EnablingNotifications {
                trace!("Ignoring notification state callback in state {}", inner.state);
                return;
            }
            match result {
                Ok(()) => {
                    debug!("Notifications enabled");
                    inner.smp_characteristic = Some(characteristic.clone());
                    inner.state = ConnectionState::Connected;
                    Ok(())
                }
                Err(e) => Err(TransportError::from(e)),
            }
        };
        if outcome.is_ok() {
            self.notify_observers(ConnectionState::Connected);
        }
        self.resolve(TransportKey::NotificationsEnabled, outcome);
    }

    fn resolve(&self, key: TransportKey, outcome: Result<(), TransportError>) {
        match outcome {
            Ok(()) => {
                self.gate.signal(key);
            }
            Err(e) => {
                self.gate.fail(e);
            }
        }
    }
}
