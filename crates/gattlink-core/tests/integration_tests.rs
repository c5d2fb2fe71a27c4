//! 集成测试 - 角色任务端到端
//!
//! 中心设备和外设通过内存中的 `LoopbackAir` 连接，走完整的扫描、连接、
//! MTU 协商和双向消息流程。

use gattlink_core::ble::CentralRadioEvent;
use gattlink_core::mock::{CentralCall, LOOPBACK_PERIPHERAL, LoopbackAir, MockCentralRadio};
use gattlink_core::{
    CentralHandle, CentralPhase, EventStream, PeripheralHandle, PeripheralPhase, Role,
    ServiceDescriptor, ServiceSettings, Transport, TransportError, TransportEvent,
    TransportSettings,
};
use std::time::Duration;
use tokio::sync::mpsc;

fn service() -> ServiceDescriptor {
    ServiceSettings::default().descriptor().unwrap()
}

/// Wait for the first event matching `pred`, skipping the others.
async fn wait_for<F>(events: &mut EventStream, mut pred: F) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

struct Pair {
    central: CentralHandle,
    peripheral: PeripheralHandle,
    events: EventStream,
}

/// Spawn both roles over a loopback air and bring the link to Ready.
async fn linked_pair(air_mtu: u16) -> Pair {
    let air = LoopbackAir::new(air_mtu);
    let (transport, mut events) = Transport::new(TransportSettings::default());
    let peripheral = transport.spawn_peripheral(air.peripheral, air.peripheral_events);
    let central = transport.spawn_central(air.central, air.central_events);

    peripheral.start().await.unwrap();
    peripheral.set_service(service()).await.unwrap();
    peripheral.advertise().await.unwrap();

    central.start().await.unwrap();
    central.set_service(service()).await.unwrap();
    central.scan().await.unwrap();

    let discovered = wait_for(&mut events, |e| {
        matches!(e, TransportEvent::PeripheralDiscovered { .. })
    })
    .await;
    assert_eq!(
        discovered,
        TransportEvent::PeripheralDiscovered {
            identifier: LOOPBACK_PERIPHERAL.into()
        }
    );

    central.connect(LOOPBACK_PERIPHERAL).await.unwrap();

    let mut ready = Vec::new();
    while ready.len() < 2 {
        if let TransportEvent::LinkReady { role, mtu, .. } =
            wait_for(&mut events, |e| matches!(e, TransportEvent::LinkReady { .. })).await
        {
            ready.push((role, mtu));
        }
    }
    assert!(ready.contains(&(Role::Central, air_mtu)));
    assert!(ready.contains(&(Role::Peripheral, air_mtu)));

    Pair {
        central,
        peripheral,
        events,
    }
}

/// 测试完整的双向消息流程
#[tokio::test]
async fn test_loopback_round_trip() {
    let mut pair = linked_pair(185).await;
    assert_eq!(pair.central.phase().await.unwrap(), CentralPhase::Ready);
    assert_eq!(pair.peripheral.phase().await.unwrap(), PeripheralPhase::Ready);
    assert_eq!(pair.central.negotiated_mtu().await.unwrap(), Some(185));

    let request: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    pair.central.write(request.clone()).await.unwrap();

    let received = wait_for(&mut pair.events, |e| {
        matches!(e, TransportEvent::MessageReceivedWithoutResponse { .. })
    })
    .await;
    assert_eq!(
        received,
        TransportEvent::MessageReceivedWithoutResponse { message: request }
    );
    wait_for(&mut pair.events, |e| {
        *e == TransportEvent::MessageSent { role: Role::Central }
    })
    .await;

    pair.peripheral.indicate(b"pong".to_vec()).await.unwrap();
    let reply = wait_for(&mut pair.events, |e| {
        matches!(e, TransportEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        reply,
        TransportEvent::MessageReceived {
            message: b"pong".to_vec()
        }
    );
}

/// 测试消息内容恰好等于终止符
#[tokio::test]
async fn test_eom_payload_is_not_terminator() {
    let mut pair = linked_pair(23).await;

    pair.central.write(b"EOM".to_vec()).await.unwrap();
    let received = wait_for(&mut pair.events, |e| {
        matches!(e, TransportEvent::MessageReceivedWithoutResponse { .. })
    })
    .await;
    assert_eq!(
        received,
        TransportEvent::MessageReceivedWithoutResponse {
            message: b"EOM".to_vec()
        }
    );
}

/// 测试空消息
#[tokio::test]
async fn test_empty_message() {
    let mut pair = linked_pair(185).await;

    pair.peripheral.indicate(Vec::new()).await.unwrap();
    let received = wait_for(&mut pair.events, |e| {
        matches!(e, TransportEvent::MessageReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        TransportEvent::MessageReceived {
            message: Vec::new()
        }
    );
}

/// 测试发送中的第二条消息被拒绝
#[tokio::test]
async fn test_second_write_rejected_while_draining() {
    let mut pair = linked_pair(23).await;

    pair.central.write(vec![0x5a; 10_000]).await.unwrap();
    let err = pair.central.write(b"later".to_vec()).await.unwrap_err();
    assert!(matches!(err, TransportError::Busy));

    wait_for(&mut pair.events, |e| {
        *e == TransportEvent::MessageSent { role: Role::Central }
    })
    .await;
    pair.central.write(b"later".to_vec()).await.unwrap();
}

/// 测试断开后双方都收到事件
#[tokio::test]
async fn test_disconnect_reported_on_both_sides() {
    let mut pair = linked_pair(185).await;

    pair.central.disconnect().await.unwrap();
    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = wait_for(&mut pair.events, |e| {
            matches!(
                e,
                TransportEvent::DisconnectedPeripheral { .. }
                    | TransportEvent::DisconnectedCentral { .. }
            )
        })
        .await;
        seen.push(event.name());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec!["disconnectedCentral", "disconnectedPeripheral"]);

    assert_eq!(
        pair.central.phase().await.unwrap(),
        CentralPhase::Disconnected
    );
    assert!(matches!(
        pair.central.write(b"x".to_vec()).await,
        Err(TransportError::NotReady("disconnected"))
    ));
}

/// 测试 stop 之后回到未启动状态
#[tokio::test]
async fn test_stop_returns_to_not_started() {
    let mut pair = linked_pair(185).await;

    pair.peripheral.stop().await.unwrap();
    wait_for(&mut pair.events, |e| {
        matches!(e, TransportEvent::DisconnectedCentral { .. })
    })
    .await;
    assert_eq!(
        pair.peripheral.phase().await.unwrap(),
        PeripheralPhase::NotStarted
    );
    assert!(matches!(
        pair.peripheral.advertise().await,
        Err(TransportError::NotStarted(Role::Peripheral))
    ));
}

/// 测试协商超时（时间暂停）
#[tokio::test(start_paused = true)]
async fn test_negotiation_deadline_reports_failure() {
    let settings = TransportSettings {
        negotiation_timeout_secs: 2,
        ..Default::default()
    };
    let (transport, mut events) = Transport::new(settings);
    let (radio, mut calls) = MockCentralRadio::new();
    let (radio_tx, radio_rx) = mpsc::unbounded_channel();
    let central = transport.spawn_central(radio, radio_rx);

    central.start().await.unwrap();
    central.set_service(service()).await.unwrap();
    central.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
    assert_eq!(
        calls.recv().await,
        Some(CentralCall::Connect("AA:BB:CC:DD:EE:FF".into()))
    );

    let started = tokio::time::Instant::now();
    radio_tx
        .send(CentralRadioEvent::Connected {
            identifier: "AA:BB:CC:DD:EE:FF".into(),
        })
        .unwrap();

    let failure = wait_for(&mut events, |e| {
        matches!(e, TransportEvent::NegotiationFailed { .. })
    })
    .await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    match failure {
        TransportEvent::NegotiationFailed { role, reason, .. } => {
            assert_eq!(role, Role::Central);
            assert!(reason.contains("timed out"), "reason: {reason}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(
        central.phase().await.unwrap(),
        CentralPhase::ServicesDiscovering
    );
}

/// 测试超时为 0 时不限时
#[tokio::test(start_paused = true)]
async fn test_zero_timeout_never_fires() {
    let settings = TransportSettings {
        negotiation_timeout_secs: 0,
        ..Default::default()
    };
    let (transport, mut events) = Transport::new(settings);
    let (radio, _calls) = MockCentralRadio::new();
    let (radio_tx, radio_rx) = mpsc::unbounded_channel();
    let central = transport.spawn_central(radio, radio_rx);

    central.start().await.unwrap();
    central.set_service(service()).await.unwrap();
    central.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
    radio_tx
        .send(CentralRadioEvent::Connected {
            identifier: "AA:BB:CC:DD:EE:FF".into(),
        })
        .unwrap();

    let waited = tokio::time::timeout(Duration::from_secs(600), async {
        while let Some(event) = events.recv().await {
            if matches!(event, TransportEvent::NegotiationFailed { .. }) {
                return event;
            }
        }
        unreachable!("event stream closed");
    })
    .await;
    assert!(waited.is_err());
}
