// Integration test: BLE transport against the simulated peripheral
//
// Drives the full connect/send/close cycle through callbacks delivered from
// the peripheral's own thread:
// - connection sequence, its failure modes and late callbacks
// - request chunking and response reassembly
// - FIFO ordering, queue bound, timeouts, cancellation and link loss

use mcumgr_ble_core::transport::ble::simulated::{echo, SimulatedStage};
use mcumgr_ble_core::transport::ble::{SMP_CHARACTERISTIC_UUID, SMP_SERVICE_UUID};
use mcumgr_ble_core::{
    BleTransport, BleTransportConfig, CharacteristicProperties, ConnectionObserver, ConnectionState,
    LinkError, McuMgrHeader, McuMgrOperation, McuMgrTransport, PeripheralDelegate, ProtocolError, Service,
    SimulatedPeripheral, TransportError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180A_0000_1000_8000_00805F9B34FB);

type Transport = BleTransport<Arc<SimulatedPeripheral>>;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("mcumgr_ble_core=trace")
        .with_test_writer()
        .try_init()
        .ok();
}

fn fast_config() -> BleTransportConfig {
    BleTransportConfig::default()
        .with_connection_timeout(Duration::from_secs(2))
        .with_transaction_timeout(Duration::from_secs(2))
}

fn setup(peripheral: SimulatedPeripheral, config: BleTransportConfig) -> (Transport, Arc<SimulatedPeripheral>) {
    init_tracing();
    let peripheral = Arc::new(peripheral);
    let transport = BleTransport::new(Arc::clone(&peripheral), config).expect("valid config");
    peripheral.attach(transport.delegate());
    (transport, peripheral)
}

fn request(sequence_number: u8, payload: &[u8]) -> Vec<u8> {
    McuMgrHeader::new(McuMgrOperation::Read, 0, sequence_number, 0, 0)
        .serialize(payload)
        .expect("frame")
}

/// Poll `condition` for up to a second
fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct StateLog(Mutex<Vec<ConnectionState>>);

impl ConnectionObserver for StateLog {
    fn transport_did_change_state(&self, state: ConnectionState) {
        self.0.lock().push(state);
    }
}

#[test]
fn test_connect_discovers_and_subscribes() {
    let peripheral = SimulatedPeripheral::new().with_services(vec![DEVICE_INFORMATION_SERVICE, SMP_SERVICE_UUID]);
    let (transport, peripheral) = setup(peripheral, fast_config());
    let log = Arc::new(StateLog::default());
    transport.add_observer(log.clone());

    transport.connect().expect("connect");

    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(peripheral.connect_requests(), 1);
    assert_eq!(peripheral.notify_requests(), 1);
    assert_eq!(
        *log.0.lock(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::DiscoveringServices,
            ConnectionState::DiscoveringCharacteristics,
            ConnectionState::EnablingNotifications,
            ConnectionState::Connected,
        ]
    );

    // Second connect is a no-op
    transport.connect().expect("connect");
    assert_eq!(peripheral.connect_requests(), 1);
    assert_eq!(peripheral.notify_requests(), 1);
}

#[test]
fn test_missing_service() {
    let peripheral = SimulatedPeripheral::new().with_services(vec![DEVICE_INFORMATION_SERVICE]);
    let (transport, peripheral) = setup(peripheral, fast_config());
    let log = Arc::new(StateLog::default());
    transport.add_observer(log.clone());

    assert_eq!(
        transport.connect(),
        Err(TransportError::Protocol(ProtocolError::MissingService))
    );
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(peripheral.notify_requests(), 0);
    assert_eq!(log.0.lock().last(), Some(&ConnectionState::Disconnected));
}

#[test]
fn test_missing_characteristic() {
    let peripheral = SimulatedPeripheral::new().with_characteristics(vec![(
        Uuid::from_u128(0x1234),
        CharacteristicProperties::NOTIFY,
    )]);
    let (transport, peripheral) = setup(peripheral, fast_config());

    assert_eq!(
        transport.connect(),
        Err(TransportError::Protocol(ProtocolError::MissingCharacteristic))
    );
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(peripheral.notify_requests(), 0);
}

#[test]
fn test_characteristic_without_notify_is_never_subscribed() {
    let peripheral = SimulatedPeripheral::new().with_characteristics(vec![(
        SMP_CHARACTERISTIC_UUID,
        CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
    )]);
    let (transport, peripheral) = setup(peripheral, fast_config());

    assert_eq!(
        transport.connect(),
        Err(TransportError::Protocol(ProtocolError::MissingNotifyProperty))
    );
    assert_eq!(peripheral.notify_requests(), 0);
}

#[test]
fn test_subscription_error() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), fast_config());
    peripheral.fail_stage(SimulatedStage::Subscription, LinkError::Stack("insufficient encryption".into()));

    assert_eq!(
        transport.connect(),
        Err(TransportError::Link(LinkError::Stack("insufficient encryption".into())))
    );
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[test]
fn test_connect_timeout_ignores_late_callback() {
    let config = fast_config().with_connection_timeout(Duration::from_millis(150));
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), config);
    peripheral.set_silent(SimulatedStage::ServiceDiscovery, true);

    assert_eq!(transport.connect(), Err(TransportError::Timeout));
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    transport
        .delegate()
        .did_discover_services(Ok(vec![Service::new(SMP_SERVICE_UUID, 0x10)]));
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    peripheral.set_silent(SimulatedStage::ServiceDiscovery, false);
    transport.connect().expect("connect");
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[test]
fn test_send_connects_on_demand() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), fast_config());

    let frame = request(1, &[0xA0]);
    let response = transport.send(&frame).expect("send");

    assert_eq!(Some(response), echo(&frame));
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(peripheral.connect_requests(), 1);
}

#[test]
fn test_request_chunking_and_response_reassembly() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new().with_mtu(20), fast_config());

    let payload: Vec<u8> = (0..50).collect();
    let frame = request(2, &payload);
    let response = transport.send(&frame).expect("send");

    let chunk_sizes: Vec<usize> = peripheral.writes().iter().map(Vec::len).collect();
    assert_eq!(chunk_sizes, vec![20, 20, 18]);
    assert_eq!(peripheral.requests(), vec![frame.clone()]);
    assert_eq!(response.len(), 58);
    assert_eq!(Some(response), echo(&frame));
}

#[test]
fn test_configured_mtu_overrides_peripheral() {
    let config = fast_config().with_mtu(32);
    let (transport, peripheral) = setup(SimulatedPeripheral::new().with_mtu(64), config);

    transport.send(&request(3, &[0u8; 40])).expect("send");

    let chunk_sizes: Vec<usize> = peripheral.writes().iter().map(Vec::len).collect();
    assert_eq!(chunk_sizes, vec![32, 16]);
}

#[test]
fn test_invalid_requests_are_rejected_before_connecting() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), fast_config());

    assert!(matches!(
        transport.send(&[0x00, 0x00, 0x00]),
        Err(TransportError::Protocol(ProtocolError::BadHeader(_)))
    ));

    let mut frame = request(4, &[0xA0]);
    frame.push(0xFF);
    assert_eq!(
        transport.send(&frame),
        Err(TransportError::Protocol(ProtocolError::LengthMismatch {
            expected: 9,
            actual: 10,
        }))
    );
    assert_eq!(peripheral.connect_requests(), 0);
}

#[test]
fn test_mismatched_response_leaves_link_up() {
    let peripheral = SimulatedPeripheral::new().with_responder(|frame| {
        let request = McuMgrHeader::parse(frame)?;
        let response = McuMgrHeader {
            op: request.op.response()?,
            group: request.group + 1,
            ..request
        };
        response.serialize(&[]).ok()
    });
    let (transport, _peripheral) = setup(peripheral, fast_config());

    assert!(matches!(
        transport.send(&request(5, &[])),
        Err(TransportError::Protocol(ProtocolError::BadHeader(_)))
    ));
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[test]
fn test_stale_response_is_skipped() {
    let config = fast_config().with_mtu(64);
    let (transport, peripheral) = setup(SimulatedPeripheral::new().with_mtu(64), config);
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    let frame = request(6, &[0x01, 0x02]);
    let sender = {
        let transport = transport.clone();
        let frame = frame.clone();
        thread::spawn(move || transport.send(&frame))
    };
    wait_for(|| peripheral.requests().len() == 1);

    // A leftover answer to some earlier request arrives first
    peripheral.notify(echo(&request(99, &[0xEE; 4])).expect("stale"));
    peripheral.release_responses();

    let response = sender.join().expect("sender").expect("send");
    assert_eq!(Some(response), echo(&frame));
}

#[test]
fn test_concurrent_sends_are_served_in_order() {
    let config = fast_config().with_mtu(64);
    let (transport, peripheral) = setup(SimulatedPeripheral::new().with_mtu(64), config);
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    let mut senders = Vec::new();
    for seq in 10..13u8 {
        let transport = transport.clone();
        senders.push((seq, thread::spawn(move || transport.send(&request(seq, &[seq])))));
        if seq == 10 {
            wait_for(|| peripheral.requests().len() == 1);
        } else {
            // Let this caller take its place in line
            thread::sleep(Duration::from_millis(50));
        }
    }
    assert_eq!(peripheral.requests().len(), 1);

    peripheral.hold_responses(false);
    peripheral.release_responses();

    for (seq, sender) in senders {
        let response = sender.join().expect("sender").expect("send");
        assert_eq!(Some(response), echo(&request(seq, &[seq])));
    }
    let order: Vec<u8> = peripheral.requests().iter().map(|frame| frame[6]).collect();
    assert_eq!(order, vec![10, 11, 12]);
}

#[test]
fn test_busy_when_queue_is_full() {
    let config = fast_config().with_max_queued_transactions(1);
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), config);
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    let first = {
        let transport = transport.clone();
        thread::spawn(move || transport.send(&request(20, &[])))
    };
    wait_for(|| peripheral.requests().len() == 1);
    let second = {
        let transport = transport.clone();
        thread::spawn(move || transport.send(&request(21, &[])))
    };
    thread::sleep(Duration::from_millis(50));

    assert_eq!(transport.send(&request(22, &[])), Err(TransportError::Busy));

    peripheral.hold_responses(false);
    peripheral.release_responses();
    assert!(first.join().expect("first").is_ok());
    assert!(second.join().expect("second").is_ok());
}

#[test]
fn test_send_waits_behind_partial_response() {
    let config = fast_config().with_max_queued_transactions(1);
    let (transport, peripheral) = setup(SimulatedPeripheral::new().with_mtu(20), config);
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    // 48-byte responses arrive as 20 + 20 + 8
    let first_frame = request(90, &[0x11; 40]);
    let first = {
        let transport = transport.clone();
        let frame = first_frame.clone();
        thread::spawn(move || transport.send(&frame))
    };
    wait_for(|| peripheral.held_chunks() == 3);
    peripheral.release_chunks(1);
    thread::sleep(Duration::from_millis(50));

    let second_frame = request(91, &[0x22; 40]);
    let second = {
        let transport = transport.clone();
        let frame = second_frame.clone();
        thread::spawn(move || transport.send(&frame))
    };
    thread::sleep(Duration::from_millis(50));

    assert_eq!(transport.send(&request(92, &[])), Err(TransportError::Busy));
    assert_eq!(peripheral.requests().len(), 1);

    peripheral.release_responses();
    let response = first.join().expect("first").expect("send");
    assert_eq!(Some(response), echo(&first_frame));

    wait_for(|| peripheral.held_chunks() == 3);
    peripheral.hold_responses(false);
    peripheral.release_responses();
    let response = second.join().expect("second").expect("send");
    assert_eq!(Some(response), echo(&second_frame));

    let order: Vec<u8> = peripheral.requests().iter().map(|frame| frame[6]).collect();
    assert_eq!(order, vec![90, 91]);
}

#[test]
fn test_timeout_after_partial_response() {
    let config = fast_config().with_transaction_timeout(Duration::from_millis(200));
    let (transport, peripheral) = setup(SimulatedPeripheral::new().with_mtu(20), config);
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    let sender = {
        let transport = transport.clone();
        thread::spawn(move || transport.send(&request(93, &[0x11; 40])))
    };
    wait_for(|| peripheral.held_chunks() == 3);
    peripheral.release_chunks(1);

    assert_eq!(sender.join().expect("sender"), Err(TransportError::Timeout));
    assert_eq!(transport.state(), ConnectionState::Connected);

    // The continuation bytes of the abandoned response come in late
    peripheral.hold_responses(false);
    peripheral.release_responses();
    let frame = request(94, &[0x22; 40]);
    let response = transport.send(&frame).expect("send");
    assert_eq!(Some(response), echo(&frame));
}

#[test]
fn test_late_callback_does_not_answer_next_attempt() {
    let config = fast_config().with_connection_timeout(Duration::from_millis(300));
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), config);
    peripheral.set_silent(SimulatedStage::ServiceDiscovery, true);

    assert_eq!(transport.connect(), Err(TransportError::Timeout));

    let second = {
        let transport = transport.clone();
        thread::spawn(move || transport.connect())
    };
    wait_for(|| transport.state() == ConnectionState::DiscoveringServices);

    // Answer to the first attempt's discovery request
    transport
        .delegate()
        .did_discover_services(Err(LinkError::Stack("late answer".into())));
    assert_eq!(transport.state(), ConnectionState::DiscoveringServices);

    assert_eq!(second.join().expect("second"), Err(TransportError::Timeout));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[test]
fn test_timeout_then_late_response() {
    let config = fast_config().with_transaction_timeout(Duration::from_millis(150));
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), config);
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    assert_eq!(transport.send(&request(30, &[0x01])), Err(TransportError::Timeout));
    assert_eq!(transport.state(), ConnectionState::Connected);

    // The late answer must not satisfy the next request
    peripheral.hold_responses(false);
    peripheral.release_responses();
    let frame = request(31, &[0x02]);
    let response = transport.send(&frame).expect("send");
    assert_eq!(Some(response), echo(&frame));
}

#[test]
fn test_close_cancels_in_flight_send() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), fast_config());
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    let sender = {
        let transport = transport.clone();
        thread::spawn(move || transport.send(&request(40, &[])))
    };
    wait_for(|| peripheral.requests().len() == 1);

    transport.close();
    assert_eq!(sender.join().expect("sender"), Err(TransportError::Cancelled));
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(peripheral.disconnect_requests(), 1);

    // The transport reconnects on the next call
    peripheral.hold_responses(false);
    let frame = request(41, &[]);
    assert_eq!(transport.send(&frame).ok(), echo(&frame));
    assert_eq!(peripheral.connect_requests(), 2);
}

#[test]
fn test_link_loss_fails_in_flight_send() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), fast_config());
    let log = Arc::new(StateLog::default());
    transport.add_observer(log.clone());
    transport.connect().expect("connect");
    peripheral.hold_responses(true);

    let sender = {
        let transport = transport.clone();
        thread::spawn(move || transport.send(&request(50, &[])))
    };
    wait_for(|| peripheral.requests().len() == 1);

    peripheral.disconnect_link(LinkError::Disconnected);
    assert_eq!(
        sender.join().expect("sender"),
        Err(TransportError::Link(LinkError::Disconnected))
    );
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(log.0.lock().last(), Some(&ConnectionState::Disconnected));
}

#[test]
fn test_write_failure_drops_link() {
    let (transport, peripheral) = setup(SimulatedPeripheral::new(), fast_config());
    transport.connect().expect("connect");
    peripheral.fail_writes(Some(LinkError::Stack("write rejected".into())));

    assert_eq!(
        transport.send(&request(60, &[])),
        Err(TransportError::Link(LinkError::Stack("write rejected".into())))
    );
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[test]
fn test_generic_transport_trait() {
    let (transport, _peripheral) = setup(SimulatedPeripheral::new(), fast_config());
    let transport: Arc<dyn McuMgrTransport> = Arc::new(transport);

    let frame = request(70, &[0xA0]);
    assert_eq!(transport.send(&frame).ok(), echo(&frame));
    assert!(transport.state().is_connected());
    transport.close();
    assert_eq!(transport.state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_async() {
    let (transport, _peripheral) = setup(SimulatedPeripheral::new(), fast_config());

    transport.connect_async().await.expect("connect");
    let frame = request(80, &[0x01, 0x02, 0x03]);
    let response = transport.send_async(frame.clone()).await.expect("send");
    assert_eq!(Some(response), echo(&frame));
}
