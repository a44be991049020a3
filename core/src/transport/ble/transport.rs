/// BLE transport facade
///
/// `BleTransport` turns the callback-driven SMP characteristic into a
/// blocking `send(request) -> response` call. Callers are admitted one at a
/// time through a FIFO queue; the connection sequence runs on demand; the
/// request is written in MTU-sized chunks; the caller then sleeps on the
/// gate until the coordinator has reassembled the response.
///
/// All mutable state sits behind one mutex. Platform callbacks only take
/// that mutex briefly and signal the gate, they never wait.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::config::{BleTransportConfig, MIN_MTU};
use super::gate::{Gate, GateError};
use super::peripheral::{Characteristic, PeripheralDelegate, Service, SmpPeripheral};
use super::queue::TransactionQueue;
use super::write_state::{Progress, WriteCoordinator};
use crate::smp::McuMgrHeader;
use crate::transport::abstraction::{
    ConnectionObserver, ConnectionState, LinkError, McuMgrTransport, ProtocolError,
    TransportError, TransportScheme,
};

/// Lifecycle stages a caller can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TransportKey {
    PeripheralConnected,
    ServicesDiscovered,
    CharacteristicsDiscovered,
    NotificationsEnabled,
    Response,
}

pub(crate) struct Inner {
    pub(crate) state: ConnectionState,
    /// Bumped by every close or link loss; a connection sequence started
    /// under an older attempt must not advance
    pub(crate) attempt: u64,
    pub(crate) service: Option<Service>,
    /// SMP characteristic found during discovery, not yet subscribed
    pub(crate) discovered: Option<Characteristic>,
    /// SMP characteristic with notifications enabled
    pub(crate) smp_characteristic: Option<Characteristic>,
    pub(crate) coordinator: WriteCoordinator,
    /// Completed response and the generation it belongs to
    pub(crate) response: Option<(u64, Vec<u8>)>,
    /// Connection-stage requests issued and not yet answered. The stack
    /// answers in request order, so a callback only belongs to the latest
    /// request once every earlier one has been answered.
    pub(crate) outstanding: HashMap<TransportKey, usize>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            service: None,
            discovered: None,
            smp_characteristic: None,
            coordinator: WriteCoordinator::new(),
            response: None,
            outstanding: HashMap::new(),
        }
    }

    /// A request whose callback will answer `key` is about to be issued
    pub(crate) fn request_issued(&mut self, key: TransportKey) {
        *self.outstanding.entry(key).or_default() += 1;
    }

    /// The request for `key` failed synchronously, no callback will come
    pub(crate) fn request_withdrawn(&mut self, key: TransportKey) {
        if let Some(count) = self.outstanding.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
    }

    /// Account for one callback of `key`. Returns true only if it answers
    /// the most recent request; answers owed to abandoned requests are
    /// consumed and return false.
    pub(crate) fn answered(&mut self, key: TransportKey) -> bool {
        match self.outstanding.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count == 0
            }
            _ => false,
        }
    }

    /// Forget the link; returns true if the state changed
    pub(crate) fn reset_link(&mut self) -> bool {
        self.service = None;
        self.discovered = None;
        self.smp_characteristic = None;
        self.response = None;
        self.coordinator.reset();
        let changed = self.state != ConnectionState::Disconnected;
        self.state = ConnectionState::Disconnected;
        changed
    }
}

pub(crate) struct Shared<P> {
    pub(crate) peripheral: P,
    pub(crate) config: BleTransportConfig,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) gate: Gate<TransportKey, TransportError>,
    queue: TransactionQueue,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
}

impl<P: SmpPeripheral> Shared<P> {
    pub(crate) fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub(crate) fn notify_observers(&self, state: ConnectionState) {
        debug!("Transport state: {}", state);
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.transport_did_change_state(state);
        }
    }

    /// Drop the link state and fail whatever is waiting with `error`
    pub(crate) fn drop_link(&self, error: TransportError) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.attempt += 1;
            // Requests on a dead link are never answered
            inner.outstanding.clear();
            inner.reset_link()
        };
        self.gate.fail(error);
        if changed {
            self.notify_observers(ConnectionState::Disconnected);
        }
    }

    fn write_length(&self) -> usize {
        let mtu = self
            .config
            .mtu
            .unwrap_or_else(|| self.peripheral.maximum_write_length());
        if mtu < MIN_MTU {
            warn!("Peripheral reports write length {}, using {}", mtu, MIN_MTU);
            return MIN_MTU;
        }
        mtu
    }

    /// Write `frame` and wait for its response. The caller holds the queue
    /// turn and the link is connected.
    fn transact(&self, request: McuMgrHeader, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (characteristic, generation, attempt) = {
            let mut inner = self.inner.lock();
            let characteristic = inner
                .smp_characteristic
                .clone()
                .ok_or(TransportError::Link(LinkError::NotConnected))?;
            inner.response = None;
            let generation = inner.coordinator.begin(request);
            // Armed under the state lock so a concurrent close cannot slip
            // between the two
            self.gate.arm(TransportKey::Response);
            (characteristic, generation, inner.attempt)
        };

        let mtu = self.write_length();
        trace!("-> [{}] {}", frame.len(), hex::encode(frame));
        for chunk in frame.chunks(mtu) {
            if self.inner.lock().attempt != attempt {
                debug!("Link dropped before request seq {} was written", request.sequence_number);
                return Err(self.dropped_reason());
            }
            if let Err(e) = self.peripheral.write(chunk, &characteristic) {
                if self.inner.lock().attempt != attempt {
                    debug!("Write on dropped link failed: {}", e);
                    return Err(self.dropped_reason());
                }
                warn!("Write failed: {}", e);
                let error = TransportError::from(e);
                self.drop_link(error.clone());
                return Err(error);
            }
        }
        debug!(
            "Request seq {} written in {} chunk(s) of up to {} bytes",
            request.sequence_number,
            frame.len().div_ceil(mtu),
            mtu
        );

        let waited = self
            .gate
            .wait(TransportKey::Response, self.config.transaction_timeout());

        let outcome = {
            let mut inner = self.inner.lock();
            let completed = match inner.response.take() {
                Some((g, bytes)) if g == generation => Some(bytes),
                _ => None,
            };
            let outcome = match (waited, completed) {
                (_, Some(bytes)) => Ok(bytes),
                (Ok(()), None) => Err(TransportError::Cancelled),
                (Err(GateError::TimedOut), None) => {
                    inner.coordinator.cancel(generation);
                    warn!("Request seq {} timed out", request.sequence_number);
                    Err(TransportError::Timeout)
                }
                (Err(GateError::Failed(e)), None) => {
                    inner.coordinator.fail(e.clone());
                    Err(e)
                }
            };
            inner.coordinator.finish(generation);
            outcome
        };

        match &outcome {
            Ok(bytes) => trace!("<- [{}] {}", bytes.len(), hex::encode(bytes)),
            Err(e) if e.is_link_level() => self.drop_link(e.clone()),
            Err(_) => {}
        }
        outcome
    }

    /// Why the link went away under an armed response wait: `Cancelled`
    /// after a close, the link error after a loss
    fn dropped_reason(&self) -> TransportError {
        match self.gate.wait(TransportKey::Response, Duration::ZERO) {
            Err(GateError::Failed(e)) => e,
            _ => TransportError::Cancelled,
        }
    }

    /// Feed a notification (or its error) to the coordinator
    pub(crate) fn on_value_update(&self, characteristic: &Characteristic, result: Result<Vec<u8>, LinkError>) {
        if characteristic.uuid != self.config.characteristic_uuid {
            trace!("Ignoring value update from {}", characteristic.uuid);
            return;
        }

        let wake = {
            let mut inner = self.inner.lock();
            let progress = match result {
                Ok(data) => {
                    trace!("<- chunk [{}]", data.len());
                    inner.coordinator.received(&data)
                }
                Err(e) => inner.coordinator.fail(e.into()),
            };
            match progress {
                Progress::Complete(bytes) => {
                    let generation = inner.coordinator.generation();
                    inner.response = Some((generation, bytes));
                    Some(Ok(()))
                }
                Progress::Failed(e) => Some(Err(e)),
                Progress::Pending | Progress::Ignored => None,
            }
        };

        match wake {
            Some(Ok(())) => {
                self.gate.signal(TransportKey::Response);
            }
            Some(Err(e)) => {
                self.gate.fail(e);
            }
            None => {}
        }
    }
}

/// Blocking SMP transport over one BLE peripheral
pub struct BleTransport<P: SmpPeripheral> {
    shared: Arc<Shared<P>>,
}

impl<P: SmpPeripheral> Clone for BleTransport<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: SmpPeripheral + 'static> BleTransport<P> {
    /// Create a transport for `peripheral`.
    ///
    /// Route the platform's callbacks for this peripheral to
    /// [`BleTransport::delegate`] before connecting.
    pub fn new(peripheral: P, config: BleTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                peripheral,
                queue: TransactionQueue::new(config.max_queued_transactions),
                config,
                inner: Mutex::new(Inner::new()),
                gate: Gate::new(),
                observers: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Callback sink for the platform BLE stack. Holds the transport weakly.
    pub fn delegate(&self) -> Arc<dyn PeripheralDelegate> {
        Arc::new(TransportDelegate {
            shared: Arc::downgrade(&self.shared),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.shared.observers.write().push(observer);
    }

    pub fn config(&self) -> &BleTransportConfig {
        &self.shared.config
    }

    pub fn peripheral(&self) -> &P {
        &self.shared.peripheral
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Run the connection sequence unless already connected
    pub fn connect(&self) -> Result<(), TransportError> {
        let _turn = self.shared.queue.enter()?;
        self.shared.ensure_connected()
    }

    /// Send one SMP frame (header + payload) and wait for the response
    /// frame. Concurrent callers are served in FIFO order.
    pub fn send(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let request = McuMgrHeader::parse(frame).ok_or_else(|| {
            TransportError::Protocol(ProtocolError::BadHeader(format!(
                "request of {} bytes has no header",
                frame.len()
            )))
        })?;
        if request.frame_length() != frame.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: request.frame_length(),
                actual: frame.len(),
            }
            .into());
        }

        let _turn = self.shared.queue.enter()?;
        self.shared.ensure_connected()?;
        self.shared.transact(request, frame)
    }

    /// Disconnect, failing any waiting caller with `Cancelled`
    pub fn close(&self) {
        info!("Closing BLE transport");
        self.shared.drop_link(TransportError::Cancelled);
        self.shared.peripheral.disconnect();
    }
}

impl<P: SmpPeripheral + 'static> BleTransport<P> {
    /// [`BleTransport::connect`] on the blocking thread pool
    pub async fn connect_async(&self) -> Result<(), TransportError> {
        let transport = self.clone();
        tokio::task::spawn_blocking(move || transport.connect())
            .await
            .map_err(|_| TransportError::Cancelled)?
    }

    /// [`BleTransport::send`] on the blocking thread pool
    pub async fn send_async(&self, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let transport = self.clone();
        tokio::task::spawn_blocking(move || transport.send(&frame))
            .await
            .map_err(|_| TransportError::Cancelled)?
    }
}

impl<P: SmpPeripheral + 'static> McuMgrTransport for BleTransport<P> {
    fn scheme(&self) -> TransportScheme {
        TransportScheme::Ble
    }

    fn state(&self) -> ConnectionState {
        BleTransport::state(self)
    }

    fn connect(&self) -> Result<(), TransportError> {
        BleTransport::connect(self)
    }

    fn send(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        BleTransport::send(self, frame)
    }

    fn close(&self) {
        BleTransport::close(self)
    }
}

/// Routes platform callbacks into the transport
struct TransportDelegate<P> {
    shared: Weak<Shared<P>>,
}

impl<P: SmpPeripheral> TransportDelegate<P> {
    fn with_shared(&self, f: impl FnOnce(&Shared<P>)) {
        match self.shared.upgrade() {
            Some(shared) => f(&shared),
            None => trace!("Callback after transport was dropped"),
        }
    }
}

impl<P: SmpPeripheral> PeripheralDelegate for TransportDelegate<P> {
    fn did_connect(&self, result: Result<(), LinkError>) {
        self.with_shared(|shared| shared.on_connect(result));
    }

    fn did_disconnect(&self, error: Option<LinkError>) {
        self.with_shared(|shared| shared.on_disconnect(error));
    }

    fn did_discover_services(&self, result: Result<Vec<Service>, LinkError>) {
        self.with_shared(|shared| shared.on_services_discovered(result));
    }

    fn did_discover_characteristics(&self, service: &Service, result: Result<Vec<Characteristic>, LinkError>) {
        self.with_shared(|shared| shared.on_characteristics_discovered(service, result));
    }

    fn did_update_notification_state(&self, characteristic: &Characteristic, result: Result<(), LinkError>) {
        self.with_shared(|shared| shared.on_notification_state_changed(characteristic, result));
    }

    fn did_update_value(&self, characteristic: &Characteristic, result: Result<Vec<u8>, LinkError>) {
        self.with_shared(|shared| shared.on_value_update(characteristic, result));
    }
}
