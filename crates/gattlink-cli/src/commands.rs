//! 子命令实现

use anyhow::{Context, Result, anyhow, bail};
use gattlink_core::mock::{LOOPBACK_PERIPHERAL, LoopbackAir};
use gattlink_core::{
    BluerPeripheral, BtleplugCentral, EventStream, Role, ServiceDescriptor, ServiceSettings,
    Transport, TransportEvent, TransportSettings,
};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::output::print_event;

/// 连接并协商的最长等待
const LINK_TIMEOUT: Duration = Duration::from_secs(30);
/// 单条消息发送的最长等待
const SEND_TIMEOUT: Duration = Duration::from_secs(60);

fn resolve_service(settings: &TransportSettings) -> Result<ServiceDescriptor> {
    match settings.service_descriptor()? {
        Some(service) => Ok(service),
        None => Ok(ServiceSettings::default().descriptor()?),
    }
}

/// Print events until `decide` returns a verdict.
async fn until<T>(
    events: &mut EventStream,
    json: bool,
    limit: Duration,
    mut decide: impl FnMut(&TransportEvent) -> Option<Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, async {
        while let Some(event) = events.recv().await {
            print_event(&event, json);
            if let Some(verdict) = decide(&event) {
                return verdict;
            }
        }
        Err(anyhow!("event stream closed"))
    })
    .await
    .context("timed out waiting for transport events")?
}

pub async fn scan(settings: TransportSettings, timeout: u64, json: bool) -> Result<()> {
    let service = resolve_service(&settings)?;
    let (transport, mut events) = Transport::new(settings);
    let (radio, radio_events) = BtleplugCentral::new().await?;
    let central = transport.spawn_central(radio, radio_events);

    central.start().await?;
    central.set_service(service).await?;
    central.scan().await?;
    if !json {
        println!("🔍 扫描设备 ({}s)...", timeout);
    }

    let mut found = BTreeSet::new();
    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(TransportEvent::PeripheralDiscovered { identifier }) => {
                    if found.insert(identifier.clone()) {
                        print_event(&TransportEvent::PeripheralDiscovered { identifier }, json);
                    }
                }
                Some(other) => tracing::debug!("Ignoring {}", other.name()),
                None => break,
            },
        }
    }

    central.stop_scan().await?;
    central.stop().await?;
    if !json {
        if found.is_empty() {
            println!("   未发现设备");
        } else {
            for (i, address) in found.iter().enumerate() {
                println!("   [{}] {}", i, address);
            }
        }
    }
    Ok(())
}

pub async fn send(
    settings: TransportSettings,
    address: String,
    message: String,
    wait_reply: Option<u64>,
    json: bool,
) -> Result<()> {
    let service = resolve_service(&settings)?;
    let (transport, mut events) = Transport::new(settings);
    let (radio, radio_events) = BtleplugCentral::new().await?;
    let central = transport.spawn_central(radio, radio_events);

    central.start().await?;
    central.set_service(service).await?;
    central.connect(address.clone()).await?;

    until(&mut events, json, LINK_TIMEOUT, |event| match event {
        TransportEvent::LinkReady { .. } => Some(Ok(())),
        TransportEvent::NegotiationFailed { reason, .. } => {
            Some(Err(anyhow!("negotiation with {address} failed: {reason}")))
        }
        TransportEvent::DisconnectedPeripheral { .. } => {
            Some(Err(anyhow!("{address} disconnected before the link was ready")))
        }
        _ => None,
    })
    .await?;

    central.write(message.into_bytes()).await?;
    until(&mut events, json, SEND_TIMEOUT, |event| match event {
        TransportEvent::MessageSent { role: Role::Central } => Some(Ok(())),
        TransportEvent::SendFailed { reason, .. } => Some(Err(anyhow!("send failed: {reason}"))),
        TransportEvent::DisconnectedPeripheral { .. } => {
            Some(Err(anyhow!("link lost while sending")))
        }
        _ => None,
    })
    .await?;

    if let Some(secs) = wait_reply {
        let reply = until(&mut events, json, Duration::from_secs(secs), |event| match event {
            TransportEvent::MessageReceived { .. } => Some(Ok(())),
            TransportEvent::DisconnectedPeripheral { .. } => {
                Some(Err(anyhow!("link lost while waiting for a reply")))
            }
            _ => None,
        })
        .await;
        if let Err(e) = reply {
            tracing::warn!("No reply: {:#}", e);
        }
    }

    central.stop().await?;
    Ok(())
}

pub async fn serve(settings: TransportSettings, echo: bool, json: bool) -> Result<()> {
    let service = resolve_service(&settings)?;
    let device_name = settings.device_name.clone();
    let (transport, mut events) = Transport::new(settings);
    let (radio, radio_events) = BluerPeripheral::new(device_name.clone()).await?;
    let peripheral = transport.spawn_peripheral(radio, radio_events);

    peripheral.start().await?;
    peripheral.set_service(service).await?;
    peripheral.advertise().await?;
    tracing::info!(
        "Serving {} as '{}', echo={}",
        service.service_id,
        device_name,
        echo
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, json);
                match event {
                    TransportEvent::MessageReceivedWithoutResponse { message } if echo => {
                        if let Err(e) = peripheral.indicate(message).await {
                            tracing::warn!("Echo dropped: {}", e);
                        }
                    }
                    // 断开后继续广播，等待下一个客户端
                    TransportEvent::DisconnectedCentral { .. } => peripheral.advertise().await?,
                    _ => {}
                }
            }
        }
    }

    peripheral.stop().await?;
    Ok(())
}

/// 在内存中跑一遍完整流程：中心写入，外设原样回传
pub async fn loopback(
    settings: TransportSettings,
    message: String,
    mtu: u16,
    json: bool,
) -> Result<()> {
    let service = resolve_service(&settings)?;
    let air = LoopbackAir::new(mtu);
    let (transport, mut events) = Transport::new(settings);
    let peripheral = transport.spawn_peripheral(air.peripheral, air.peripheral_events);
    let central = transport.spawn_central(air.central, air.central_events);

    peripheral.start().await?;
    peripheral.set_service(service).await?;
    peripheral.advertise().await?;
    central.start().await?;
    central.set_service(service).await?;
    central.connect(LOOPBACK_PERIPHERAL).await?;

    let mut ready = 0;
    until(&mut events, json, LINK_TIMEOUT, |event| match event {
        TransportEvent::LinkReady { .. } => {
            ready += 1;
            (ready == 2).then_some(Ok(()))
        }
        TransportEvent::NegotiationFailed { reason, .. } => {
            Some(Err(anyhow!("negotiation failed: {reason}")))
        }
        _ => None,
    })
    .await?;

    central.write(message.into_bytes()).await?;
    let echoed = until(&mut events, json, SEND_TIMEOUT, |event| match event {
        TransportEvent::MessageReceivedWithoutResponse { message } => Some(Ok(message.clone())),
        _ => None,
    })
    .await?;

    peripheral.indicate(echoed.clone()).await?;
    let returned = until(&mut events, json, SEND_TIMEOUT, |event| match event {
        TransportEvent::MessageReceived { message } => Some(Ok(message.clone())),
        _ => None,
    })
    .await?;
    if returned != echoed {
        bail!("loopback corrupted the message");
    }

    central.stop().await?;
    peripheral.stop().await?;
    Ok(())
}

pub fn config_show(settings: &TransportSettings) -> Result<()> {
    println!("# {}", TransportSettings::config_path().display());
    print!("{}", toml::to_string_pretty(settings)?);
    Ok(())
}

pub fn config_init(force: bool) -> Result<()> {
    let path = TransportSettings::config_path();
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let settings = TransportSettings {
        service: Some(ServiceSettings::default()),
        ..Default::default()
    };
    settings.save()?;
    println!("✅ 已写入 {}", path.display());
    Ok(())
}
