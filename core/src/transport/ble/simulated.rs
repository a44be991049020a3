//! In-process SMP peripheral
//!
//! A scripted [`SmpPeripheral`] that behaves like a device exposing the SMP
//! service: it answers discovery and subscription requests, reassembles
//! written requests and notifies responses chunked to its MTU. Callbacks are
//! delivered from a dedicated thread, in request order, the way a platform
//! BLE stack delivers them from its own queue.
//!
//! Individual stages can be silenced (the callback never arrives) or made to
//! fail, and responses can be held back and released later, so timeouts,
//! queueing and error paths can be exercised without hardware.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, trace};
use uuid::Uuid;

use super::config::{MIN_MTU, SMP_CHARACTERISTIC_UUID, SMP_SERVICE_UUID};
use super::peripheral::{Characteristic, CharacteristicProperties, PeripheralDelegate, Service, SmpPeripheral};
use crate::smp::McuMgrHeader;
use crate::transport::abstraction::LinkError;

/// Maps a complete request frame to the response frame, or `None` to stay
/// silent
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

type Callback = Box<dyn FnOnce(&dyn PeripheralDelegate) + Send>;

/// Request/callback pairs whose outcome can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedStage {
    Connect,
    ServiceDiscovery,
    CharacteristicDiscovery,
    Subscription,
    Response,
}

/// Answer a request with the matching response op and the same payload
pub fn echo(request: &[u8]) -> Option<Vec<u8>> {
    let header = McuMgrHeader::parse(request)?;
    let response = McuMgrHeader {
        op: header.op.response()?,
        ..header
    };
    response.serialize(request.get(crate::smp::HEADER_LENGTH..)?).ok()
}

#[derive(Default)]
struct Script {
    silent: HashSet<SimulatedStage>,
    failures: HashMap<SimulatedStage, LinkError>,
    write_error: Option<LinkError>,
    hold_responses: bool,
    held: Vec<(Characteristic, Vec<u8>)>,
}

#[derive(Default)]
struct Record {
    writes: Vec<Vec<u8>>,
    requests: Vec<Vec<u8>>,
    connect_requests: usize,
    notify_requests: usize,
    disconnect_requests: usize,
}

enum Outcome {
    Deliver,
    Fail(LinkError),
    Silent,
}

pub struct SimulatedPeripheral {
    services: Vec<Uuid>,
    characteristics: Vec<(Uuid, CharacteristicProperties)>,
    mtu: usize,
    responder: Responder,
    linked: AtomicBool,
    script: Mutex<Script>,
    record: Mutex<Record>,
    rx_buffer: Mutex<Vec<u8>>,
    delegate: Arc<Mutex<Option<Arc<dyn PeripheralDelegate>>>>,
    events: Mutex<mpsc::Sender<Callback>>,
}

impl SimulatedPeripheral {
    /// A disconnected peripheral exposing the SMP service and a
    /// notify-capable SMP characteristic, echoing every request
    pub fn new() -> Self {
        let delegate: Arc<Mutex<Option<Arc<dyn PeripheralDelegate>>>> = Arc::new(Mutex::new(None));
        let (events, callbacks) = mpsc::channel::<Callback>();

        let target = Arc::clone(&delegate);
        thread::spawn(move || {
            for callback in callbacks {
                let delegate = target.lock().clone();
                match delegate {
                    Some(delegate) => callback(delegate.as_ref()),
                    None => trace!("Simulated peripheral: no delegate attached, dropping callback"),
                }
            }
        });

        Self {
            services: vec![SMP_SERVICE_UUID],
            characteristics: vec![(
                SMP_CHARACTERISTIC_UUID,
                CharacteristicProperties::WRITE_WITHOUT_RESPONSE | CharacteristicProperties::NOTIFY,
            )],
            mtu: MIN_MTU,
            responder: Arc::new(echo),
            linked: AtomicBool::new(false),
            script: Mutex::new(Script::default()),
            record: Mutex::new(Record::default()),
            rx_buffer: Mutex::new(Vec::new()),
            delegate,
            events: Mutex::new(events),
        }
    }

    /// Services reported by discovery
    pub fn with_services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }

    /// Characteristics reported for any discovered service
    pub fn with_characteristics(mut self, characteristics: Vec<(Uuid, CharacteristicProperties)>) -> Self {
        self.characteristics = characteristics;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Start with the physical link already up
    pub fn with_link_up(self) -> Self {
        self.linked.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Route callbacks to `delegate`
    pub fn attach(&self, delegate: Arc<dyn PeripheralDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    /// Never answer `stage` (or answer it again, with `false`)
    pub fn set_silent(&self, stage: SimulatedStage, silent: bool) {
        let mut script = self.script.lock();
        if silent {
            script.silent.insert(stage);
        } else {
            script.silent.remove(&stage);
        }
    }

    /// Answer `stage` with `error` from now on
    pub fn fail_stage(&self, stage: SimulatedStage, error: LinkError) {
        self.script.lock().failures.insert(stage, error);
    }

    /// Reject writes synchronously with `error`
    pub fn fail_writes(&self, error: Option<LinkError>) {
        self.script.lock().write_error = error;
    }

    /// Queue response notifications instead of sending them
    pub fn hold_responses(&self, hold: bool) {
        self.script.lock().hold_responses = hold;
    }

    /// Send every held response notification, oldest first
    pub fn release_responses(&self) {
        self.release_chunks(usize::MAX);
    }

    /// Send the `count` oldest held response notifications
    pub fn release_chunks(&self, count: usize) {
        let released: Vec<(Characteristic, Vec<u8>)> = {
            let mut script = self.script.lock();
            let count = count.min(script.held.len());
            script.held.drain(..count).collect()
        };
        debug!("Simulated peripheral: releasing {} chunk(s)", released.len());
        for (characteristic, chunk) in released {
            self.dispatch(move |delegate| delegate.did_update_value(&characteristic, Ok(chunk)));
        }
    }

    /// Response notifications currently held back
    pub fn held_chunks(&self) -> usize {
        self.script.lock().held.len()
    }

    /// Push a raw notification on the SMP characteristic
    pub fn notify(&self, value: Vec<u8>) {
        let characteristic = self.smp_characteristic();
        self.dispatch(move |delegate| delegate.did_update_value(&characteristic, Ok(value)));
    }

    /// Drop the link from the peripheral side
    pub fn disconnect_link(&self, error: LinkError) {
        self.linked.store(false, Ordering::SeqCst);
        self.rx_buffer.lock().clear();
        self.dispatch(move |delegate| delegate.did_disconnect(Some(error)));
    }

    /// Every chunk written, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.record.lock().writes.clone()
    }

    /// Every complete request frame reassembled from the writes
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.record.lock().requests.clone()
    }

    pub fn connect_requests(&self) -> usize {
        self.record.lock().connect_requests
    }

    pub fn notify_requests(&self) -> usize {
        self.record.lock().notify_requests
    }

    pub fn disconnect_requests(&self) -> usize {
        self.record.lock().disconnect_requests
    }

    fn dispatch(&self, callback: impl FnOnce(&dyn PeripheralDelegate) + Send + 'static) {
        if self.events.lock().send(Box::new(callback)).is_err() {
            trace!("Simulated peripheral: callback thread gone");
        }
    }

    fn outcome(&self, stage: SimulatedStage) -> Outcome {
        let script = self.script.lock();
        if script.silent.contains(&stage) {
            trace!("Simulated peripheral: {:?} stays silent", stage);
            return Outcome::Silent;
        }
        match script.failures.get(&stage) {
            Some(error) => Outcome::Fail(error.clone()),
            None => Outcome::Deliver,
        }
    }

    fn smp_service(&self) -> Service {
        Service::new(SMP_SERVICE_UUID, 0x0010)
    }

    fn smp_characteristic(&self) -> Characteristic {
        let properties = self
            .characteristics
            .iter()
            .find(|(uuid, _)| *uuid == SMP_CHARACTERISTIC_UUID)
            .map(|(_, properties)| *properties)
            .unwrap_or_default();
        Characteristic::new(SMP_CHARACTERISTIC_UUID, &self.smp_service(), 0x0012, properties)
    }

    /// Take a complete request off the receive buffer, if one is there
    fn take_request(&self) -> Option<Vec<u8>> {
        let mut buffer = self.rx_buffer.lock();
        let length = McuMgrHeader::parse(&buffer)?.frame_length();
        if buffer.len() < length {
            return None;
        }
        Some(buffer.drain(..length).collect())
    }

    fn respond(&self, characteristic: &Characteristic, request: &[u8]) {
        match self.outcome(SimulatedStage::Response) {
            Outcome::Silent => {}
            Outcome::Fail(error) => {
                let characteristic = characteristic.clone();
                self.dispatch(move |delegate| delegate.did_update_value(&characteristic, Err(error)));
            }
            Outcome::Deliver => {
                let Some(response) = (self.responder)(request) else {
                    trace!("Simulated peripheral: responder has no answer");
                    return;
                };
                let chunks: Vec<Vec<u8>> = response.chunks(self.mtu.max(1)).map(<[u8]>::to_vec).collect();
                let mut script = self.script.lock();
                if script.hold_responses {
                    for chunk in chunks {
                        script.held.push((characteristic.clone(), chunk));
                    }
                    return;
                }
                drop(script);
                for chunk in chunks {
                    let characteristic = characteristic.clone();
                    self.dispatch(move |delegate| delegate.did_update_value(&characteristic, Ok(chunk)));
                }
            }
        }
    }
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SmpPeripheral for SimulatedPeripheral {
    fn is_connected(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    fn connect(&self) -> Result<(), LinkError> {
        self.record.lock().connect_requests += 1;
        match self.outcome(SimulatedStage::Connect) {
            Outcome::Silent => {}
            Outcome::Fail(error) => self.dispatch(move |delegate| delegate.did_connect(Err(error))),
            Outcome::Deliver => {
                self.linked.store(true, Ordering::SeqCst);
                self.dispatch(|delegate| delegate.did_connect(Ok(())));
            }
        }
        Ok(())
    }

    fn discover_services(&self, _services: &[Uuid]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        match self.outcome(SimulatedStage::ServiceDiscovery) {
            Outcome::Silent => {}
            Outcome::Fail(error) => self.dispatch(move |delegate| delegate.did_discover_services(Err(error))),
            Outcome::Deliver => {
                let services: Vec<Service> = self
                    .services
                    .iter()
                    .enumerate()
                    .map(|(i, uuid)| Service::new(*uuid, 0x0010 + 0x0010 * i as u16))
                    .collect();
                self.dispatch(move |delegate| delegate.did_discover_services(Ok(services)));
            }
        }
        Ok(())
    }

    fn discover_characteristics(&self, service: &Service, _characteristics: &[Uuid]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let service = service.clone();
        match self.outcome(SimulatedStage::CharacteristicDiscovery) {
            Outcome::Silent => {}
            Outcome::Fail(error) => {
                self.dispatch(move |delegate| delegate.did_discover_characteristics(&service, Err(error)))
            }
            Outcome::Deliver => {
                let found: Vec<Characteristic> = self
                    .characteristics
                    .iter()
                    .enumerate()
                    .map(|(i, (uuid, properties))| {
                        Characteristic::new(*uuid, &service, service.handle + 2 + i as u16, *properties)
                    })
                    .collect();
                self.dispatch(move |delegate| delegate.did_discover_characteristics(&service, Ok(found)));
            }
        }
        Ok(())
    }

    fn set_notify_value(&self, enabled: bool, characteristic: &Characteristic) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.record.lock().notify_requests += 1;
        trace!("Simulated peripheral: notifications {}", if enabled { "on" } else { "off" });
        let characteristic = characteristic.clone();
        match self.outcome(SimulatedStage::Subscription) {
            Outcome::Silent => {}
            Outcome::Fail(error) => {
                self.dispatch(move |delegate| delegate.did_update_notification_state(&characteristic, Err(error)))
            }
            Outcome::Deliver => {
                self.dispatch(move |delegate| delegate.did_update_notification_state(&characteristic, Ok(())))
            }
        }
        Ok(())
    }

    fn write(&self, value: &[u8], characteristic: &Characteristic) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if let Some(error) = self.script.lock().write_error.clone() {
            return Err(error);
        }
        if value.len() > self.mtu {
            return Err(LinkError::Stack(format!(
                "write of {} bytes exceeds MTU {}",
                value.len(),
                self.mtu
            )));
        }

        self.record.lock().writes.push(value.to_vec());
        self.rx_buffer.lock().extend_from_slice(value);
        while let Some(request) = self.take_request() {
            self.record.lock().requests.push(request.clone());
            self.respond(characteristic, &request);
        }
        Ok(())
    }

    fn maximum_write_length(&self) -> usize {
        self.mtu
    }

    fn disconnect(&self) {
        self.record.lock().disconnect_requests += 1;
        self.linked.store(false, Ordering::SeqCst);
        self.rx_buffer.lock().clear();
        self.dispatch(|delegate| delegate.did_disconnect(None));
    }
}
