//! BLE Central - btleplug 后端
//!
//! 流程:
//! 1. 扫描广播服务 UUID 的设备
//! 2. 连接并发现服务
//! 3. 订阅 indication 特征，写入 CCC 描述符
//! 4. 逐块写入消息（带响应）
//!
//! 所有 GATT 操作都在一个 worker 任务里串行执行，结果以
//! [`CentralRadioEvent`] 形式发回状态机。

use log::{debug, info, trace, warn};

use crate::ble::{CentralRadio, CentralRadioEvent, GattService, RadioError};
use crate::protocol::DEFAULT_MTU;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug)]
enum Op {
    StartScan(Option<Uuid>),
    StopScan,
    Connect(String),
    Disconnect(String),
    DiscoverServices(String),
    EnableNotifications(String, Uuid),
    RequestMtu(String, u16),
    WriteDescriptor {
        identifier: String,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Write {
        identifier: String,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
}

/// Central radio over the first btleplug adapter.
pub struct BtleplugCentral {
    ops: mpsc::UnboundedSender<Op>,
}

impl BtleplugCentral {
    /// Open the first adapter and start the worker tasks.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<CentralRadioEvent>), RadioError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(RadioError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();

        let adapter_events = adapter.events().await?;
        tokio::spawn(forward_adapter_events(
            adapter.clone(),
            adapter_events,
            events_tx.clone(),
        ));
        tokio::spawn(
            Worker {
                adapter,
                events: events_tx,
                connected: HashMap::new(),
            }
            .run(ops_rx),
        );

        Ok((Self { ops: ops_tx }, events_rx))
    }

    fn submit(&self, op: Op) -> Result<(), RadioError> {
        self.ops.send(op).map_err(|_| RadioError::Closed)
    }
}

impl CentralRadio for BtleplugCentral {
    fn start_scan(&mut self, service: Option<Uuid>) -> Result<(), RadioError> {
        self.submit(Op::StartScan(service))
    }

    fn stop_scan(&mut self) -> Result<(), RadioError> {
        self.submit(Op::StopScan)
    }

    fn connect(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.submit(Op::Connect(identifier.to_string()))
    }

    fn disconnect(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.submit(Op::Disconnect(identifier.to_string()))
    }

    fn discover_services(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.submit(Op::DiscoverServices(identifier.to_string()))
    }

    fn enable_notifications(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
    ) -> Result<(), RadioError> {
        self.submit(Op::EnableNotifications(
            identifier.to_string(),
            characteristic,
        ))
    }

    fn request_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError> {
        self.submit(Op::RequestMtu(identifier.to_string(), candidate))
    }

    fn write_descriptor(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.submit(Op::WriteDescriptor {
            identifier: identifier.to_string(),
            characteristic,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn write_characteristic(
        &mut self,
        identifier: &str,
        characteristic: Uuid,
        value: &[u8],
        response_needed: bool,
    ) -> Result<(), RadioError> {
        self.submit(Op::Write {
            identifier: identifier.to_string(),
            characteristic,
            value: value.to_vec(),
            response_needed,
        })
    }
}

/// 只转发发现和断开事件；连接结果由 worker 报告
async fn forward_adapter_events(
    adapter: Adapter,
    mut stream: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    events: mpsc::UnboundedSender<CentralRadioEvent>,
) {
    while let Some(event) = stream.next().await {
        let (id, discovered) = match event {
            CentralEvent::DeviceDiscovered(id) => (id, true),
            CentralEvent::DeviceDisconnected(id) => (id, false),
            _ => continue,
        };
        let identifier = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral.address().to_string(),
            Err(e) => {
                debug!("Peripheral {:?} vanished: {}", id, e);
                continue;
            }
        };
        let event = if discovered {
            CentralRadioEvent::Discovered { identifier }
        } else {
            CentralRadioEvent::Disconnected { identifier }
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Adapter event stream ended");
}

struct Worker {
    adapter: Adapter,
    events: mpsc::UnboundedSender<CentralRadioEvent>,
    connected: HashMap<String, PlatformPeripheral>,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            trace!("btleplug op: {:?}", op);
            if let Err(e) = self.handle(op).await {
                warn!("btleplug operation failed: {}", e);
            }
        }
        debug!("btleplug worker stopped");
    }

    fn emit(&self, event: CentralRadioEvent) {
        let _ = self.events.send(event);
    }

    async fn handle(&mut self, op: Op) -> Result<(), RadioError> {
        match op {
            Op::StartScan(service) => {
                let filter = ScanFilter {
                    services: service.into_iter().collect(),
                };
                self.adapter.start_scan(filter).await?;
            }
            Op::StopScan => self.adapter.stop_scan().await?,
            Op::Connect(identifier) => match self.connect(&identifier).await {
                Ok(()) => self.emit(CentralRadioEvent::Connected { identifier }),
                Err(e) => {
                    warn!("Connecting to {} failed: {}", identifier, e);
                    self.emit(CentralRadioEvent::Disconnected { identifier });
                }
            },
            Op::Disconnect(identifier) => {
                let peripheral = self.peripheral(&identifier)?;
                self.connected.remove(&identifier.to_uppercase());
                peripheral.disconnect().await?;
            }
            Op::DiscoverServices(identifier) => {
                let result = self.discover(&identifier).await;
                self.emit(CentralRadioEvent::ServicesDiscovered { identifier, result });
            }
            Op::EnableNotifications(identifier, uuid) => {
                if let Err(error) = self.subscribe(&identifier, uuid).await {
                    warn!("Subscribing on {} failed: {}", identifier, error);
                    self.emit(CentralRadioEvent::IndicationSetupFailed { identifier, error });
                }
            }
            Op::RequestMtu(identifier, candidate) => {
                // Note: btleplug 不直接支持 MTU 请求；BlueZ 会在连接时自行交换，
                // 但结果不可见，所以中心设备一侧始终按默认 MTU 分片
                debug!(
                    "MTU {} requested, btleplug reports the default {}",
                    candidate, DEFAULT_MTU
                );
                self.emit(CentralRadioEvent::MtuChanged {
                    identifier,
                    result: Ok(DEFAULT_MTU),
                });
            }
            Op::WriteDescriptor {
                identifier,
                characteristic,
                descriptor,
                value,
            } => {
                let result = self
                    .write_descriptor(&identifier, characteristic, descriptor, &value)
                    .await;
                if let Err(error) = result {
                    warn!("Writing descriptor {} on {} failed: {}", descriptor, identifier, error);
                    self.emit(CentralRadioEvent::IndicationSetupFailed { identifier, error });
                }
            }
            Op::Write {
                identifier,
                characteristic,
                value,
                response_needed,
            } => {
                let result = self
                    .write(&identifier, characteristic, &value, response_needed)
                    .await;
                self.emit(CentralRadioEvent::WriteCompleted { identifier, result });
            }
        }
        Ok(())
    }

    async fn connect(&mut self, identifier: &str) -> Result<(), RadioError> {
        let peripheral = self.find_device(identifier).await?;
        info!("Connecting to {}", identifier);
        peripheral.connect().await?;

        let mut notifications = peripheral.notifications().await?;
        let events = self.events.clone();
        let source = identifier.to_string();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let event = CentralRadioEvent::Notification {
                    identifier: source.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            trace!("Notification stream from {} ended", source);
        });

        self.connected.insert(identifier.to_uppercase(), peripheral);
        Ok(())
    }

    async fn discover(&self, identifier: &str) -> Result<Vec<GattService>, RadioError> {
        let peripheral = self.peripheral(identifier)?;
        info!("Discovering services...");
        peripheral.discover_services().await?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn subscribe(&self, identifier: &str, uuid: Uuid) -> Result<(), RadioError> {
        let peripheral = self.peripheral(identifier)?;
        let characteristic = find_characteristic(&peripheral, uuid)?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn write_descriptor(
        &self,
        identifier: &str,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(identifier)?;
        let characteristic = find_characteristic(&peripheral, characteristic)?;
        match characteristic.descriptors.iter().find(|d| d.uuid == descriptor) {
            Some(d) => peripheral.write_descriptor(d, value).await?,
            // BlueZ 隐藏 CCC 描述符，subscribe 已经写过
            None => debug!("Descriptor {} not exposed, skipping", descriptor),
        }
        Ok(())
    }

    async fn write(
        &self,
        identifier: &str,
        uuid: Uuid,
        value: &[u8],
        response_needed: bool,
    ) -> Result<(), RadioError> {
        let peripheral = self.peripheral(identifier)?;
        let characteristic = find_characteristic(&peripheral, uuid)?;
        let write_type = if response_needed {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral.write(&characteristic, value, write_type).await?;
        Ok(())
    }

    fn peripheral(&self, identifier: &str) -> Result<PlatformPeripheral, RadioError> {
        self.connected
            .get(&identifier.to_uppercase())
            .cloned()
            .ok_or_else(|| RadioError::UnknownDevice(identifier.to_string()))
    }

    async fn find_device(&self, address: &str) -> Result<PlatformPeripheral, RadioError> {
        let peripherals = self.adapter.peripherals().await?;

        for peripheral in peripherals {
            if let Some(props) = peripheral.properties().await? {
                if props.address.to_string().to_uppercase() == address.to_uppercase() {
                    return Ok(peripheral);
                }
            }
        }

        Err(RadioError::UnknownDevice(address.to_string()))
    }
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    uuid: Uuid,
) -> Result<Characteristic, RadioError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(RadioError::CharacteristicNotFound(uuid))
}
