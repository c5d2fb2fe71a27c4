//! GATT Server - BlueZ (bluer) 外设后端
//!
//! # 功能
//!
//! - 发布包含 write 和 indication 两个特征的 GATT 服务
//! - 广播服务 UUID（设备名称通过 local_name 传递）
//! - 把客户端写入转换为 [`PeripheralRadioEvent::WriteRequest`]，等状态机确认后再应答
//! - 通过 indication 逐块发送
//!
//! # MTU
//!
//! BlueZ 自己完成 ATT MTU 交换，结果只出现在 indication 订阅会话
//! (`CharacteristicWriter::mtu`) 和写请求里。反向链路只是确认设备可达；
//! MTU 请求会一直挂起，直到其中之一给出真实的 MTU。

use log::{debug, error, info, trace, warn};

use crate::ble::{PeripheralRadio, PeripheralRadioEvent, RadioError};
use crate::protocol::ServiceDescriptor;
use bluer::{
    Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty,
    adv::{Advertisement, AdvertisementHandle},
    gatt::{
        CharacteristicWriter, WriteOp,
        local::{
            Application, ApplicationHandle, Characteristic, CharacteristicControlEvent,
            CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicWrite,
            CharacteristicWriteMethod, ReqError, Service,
            characteristic_control,
        },
    },
};
use futures_util::{FutureExt, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// How long a write waits for the state machine to acknowledge it.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_address(identifier: &str) -> Result<Address, RadioError> {
    identifier
        .parse()
        .map_err(|_| RadioError::UnknownDevice(identifier.to_string()))
}

enum Op {
    Publish(ServiceDescriptor),
    Advertise(Uuid),
    StopAdvertising,
    Indicate { identifier: String, value: Vec<u8> },
    OpenMtuLink(String),
    RequestLinkMtu(String, u16),
    CloseMtuLink(String),
    DisconnectClient(String),
    Subscribed(CharacteristicWriter),
    MtuObserved { identifier: String, mtu: u16 },
    ClientGone(String),
}

/// 写回调、连接监视和 worker 共享的状态
struct Shared {
    events: mpsc::UnboundedSender<PeripheralRadioEvent>,
    ops: mpsc::UnboundedSender<Op>,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl Shared {
    fn emit(&self, event: PeripheralRadioEvent) {
        let _ = self.events.send(event);
    }

    fn submit(&self, op: Op) {
        let _ = self.ops.send(op);
    }
}

/// Peripheral radio over the default BlueZ adapter.
pub struct BluerPeripheral {
    ops: mpsc::UnboundedSender<Op>,
    shared: Arc<Shared>,
}

impl BluerPeripheral {
    pub async fn new(
        device_name: impl Into<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeripheralRadioEvent>), RadioError> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;

        debug!("Getting default adapter...");
        let adapter = session.default_adapter().await?;

        let adapter_name = adapter.name().to_string();
        debug!("Powering on adapter: {}", adapter_name);
        adapter.set_powered(true).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            events: events_tx,
            ops: ops_tx.clone(),
            next_request_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        });

        let watcher_adapter = adapter.clone();
        let watcher_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_clients(watcher_adapter, watcher_shared).await {
                error!("Client watcher stopped: {}", e);
            }
        });

        let worker = Worker {
            _session: session,
            adapter,
            device_name: device_name.into(),
            shared: shared.clone(),
            ops: ops_tx.clone(),
            app_handle: None,
            adv_handle: None,
            writer: None,
            session_mtu: None,
            link_mtu: HashMap::new(),
            awaiting_mtu: HashMap::new(),
        };
        tokio::spawn(worker.run(ops_rx));

        Ok((Self { ops: ops_tx, shared }, events_rx))
    }

    fn submit(&self, op: Op) -> Result<(), RadioError> {
        self.ops.send(op).map_err(|_| RadioError::Closed)
    }
}

impl PeripheralRadio for BluerPeripheral {
    fn publish_service(&mut self, service: &ServiceDescriptor) -> Result<(), RadioError> {
        self.submit(Op::Publish(*service))
    }

    fn start_advertising(&mut self, service_id: Uuid) -> Result<(), RadioError> {
        self.submit(Op::Advertise(service_id))
    }

    fn stop_advertising(&mut self) -> Result<(), RadioError> {
        self.submit(Op::StopAdvertising)
    }

    /// 应答由写回调的返回值完成，这里只是放行它
    fn send_response(
        &mut self,
        _identifier: &str,
        request_id: u32,
        _offset: u16,
        _value: &[u8],
    ) -> Result<(), RadioError> {
        if let Some(ack) = lock(&self.shared.pending).remove(&request_id) {
            let _ = ack.send(());
        }
        Ok(())
    }

    fn send_indication(
        &mut self,
        identifier: &str,
        _characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), RadioError> {
        self.submit(Op::Indicate {
            identifier: identifier.to_string(),
            value: value.to_vec(),
        })
    }

    fn open_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.submit(Op::OpenMtuLink(identifier.to_string()))
    }

    fn request_link_mtu(&mut self, identifier: &str, candidate: u16) -> Result<(), RadioError> {
        self.submit(Op::RequestLinkMtu(identifier.to_string(), candidate))
    }

    fn close_mtu_link(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.submit(Op::CloseMtuLink(identifier.to_string()))
    }

    fn disconnect_client(&mut self, identifier: &str) -> Result<(), RadioError> {
        self.submit(Op::DisconnectClient(identifier.to_string()))
    }
}

/// 监视所有已知设备的 Connected 属性
async fn watch_clients(adapter: Adapter, shared: Arc<Shared>) -> bluer::Result<()> {
    let mut adapter_events = adapter.events().await?;
    let mut watched = HashSet::new();

    for addr in adapter.device_addresses().await? {
        if watched.insert(addr) {
            watch_device(&adapter, addr, shared.clone())?;
        }
    }
    while let Some(event) = adapter_events.next().await {
        if let AdapterEvent::DeviceAdded(addr) = event {
            if watched.insert(addr) {
                watch_device(&adapter, addr, shared.clone())?;
            }
        }
    }
    Ok(())
}

fn watch_device(adapter: &Adapter, addr: Address, shared: Arc<Shared>) -> bluer::Result<()> {
    let device = adapter.device(addr)?;
    tokio::spawn(async move {
        let mut device_events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                debug!("Cannot watch {}: {}", addr, e);
                return;
            }
        };
        let identifier = addr.to_string();
        while let Some(event) = device_events.next().await {
            let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event else {
                continue;
            };
            trace!("{} connected={}", identifier, connected);
            shared.emit(if connected {
                PeripheralRadioEvent::ClientConnected {
                    identifier: identifier.clone(),
                }
            } else {
                shared.submit(Op::ClientGone(identifier.clone()));
                PeripheralRadioEvent::ClientDisconnected {
                    identifier: identifier.clone(),
                }
            });
        }
    });
    Ok(())
}

struct Worker {
    _session: bluer::Session,
    adapter: Adapter,
    device_name: String,
    shared: Arc<Shared>,
    ops: mpsc::UnboundedSender<Op>,
    app_handle: Option<ApplicationHandle>,
    adv_handle: Option<AdvertisementHandle>,
    writer: Option<CharacteristicWriter>,
    /// MTU of the current indication session
    session_mtu: Option<u16>,
    /// MTU seen on write requests, per client
    link_mtu: HashMap<String, u16>,
    /// MTU requests still waiting for a real value, with their candidate
    awaiting_mtu: HashMap<String, u16>,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op>) {
        while let Some(op) = ops.recv().await {
            if let Err(e) = self.handle(op).await {
                warn!("bluer operation failed: {}", e);
            }
        }
        debug!("bluer worker stopped");
    }

    async fn handle(&mut self, op: Op) -> Result<(), RadioError> {
        match op {
            Op::Publish(service) => self.publish(service).await?,
            Op::Advertise(service_id) => {
                // 重新广播前先释放旧的 handle
                self.adv_handle = None;
                let result = self.advertise(service_id).await;
                self.shared
                    .emit(PeripheralRadioEvent::AdvertisingStarted { result });
            }
            Op::StopAdvertising => {
                if self.adv_handle.take().is_some() {
                    debug!("Advertisement released");
                }
            }
            Op::Subscribed(writer) => {
                let mtu = u16::try_from(writer.mtu()).unwrap_or(u16::MAX);
                debug!("Client subscribed to indications, MTU {}", mtu);
                self.writer = Some(writer);
                self.session_mtu = Some(mtu);
                let waiting: Vec<String> = self.awaiting_mtu.keys().cloned().collect();
                for identifier in waiting {
                    self.resolve_mtu(&identifier);
                }
            }
            Op::MtuObserved { identifier, mtu } => {
                self.link_mtu.insert(identifier.clone(), mtu);
                self.resolve_mtu(&identifier);
            }
            Op::ClientGone(identifier) => {
                self.link_mtu.remove(&identifier);
                self.awaiting_mtu.remove(&identifier);
                self.session_mtu = None;
                self.writer = None;
            }
            Op::Indicate { identifier, value } => {
                trace!("Indicating {} bytes", value.len());
                let result = match self.writer.as_mut() {
                    Some(writer) => writer
                        .write_all(&value)
                        .await
                        .map_err(|e| RadioError::Backend(e.to_string())),
                    None => Err(RadioError::Backend(
                        "client has not subscribed to indications".to_string(),
                    )),
                };
                if result.is_err() {
                    self.writer = None;
                }
                self.shared
                    .emit(PeripheralRadioEvent::NotificationSent { identifier, result });
            }
            Op::OpenMtuLink(identifier) => match self.open_mtu_link(&identifier).await {
                Ok(()) => self
                    .shared
                    .emit(PeripheralRadioEvent::MtuLinkConnected { identifier }),
                Err(error) => {
                    warn!("MTU link to {} failed: {}", identifier, error);
                    self.shared
                        .emit(PeripheralRadioEvent::MtuLinkFailed { identifier, error });
                }
            },
            Op::RequestLinkMtu(identifier, candidate) => {
                self.awaiting_mtu.insert(identifier.clone(), candidate);
                self.resolve_mtu(&identifier);
                if self.awaiting_mtu.contains_key(&identifier) {
                    debug!("MTU {} requested from {}, waiting for the link to reveal it", candidate, identifier);
                }
            }
            Op::CloseMtuLink(identifier) => {
                // 反向链路与客户端共用同一个 ACL 连接，不能断开
                trace!("MTU link to {} released", identifier);
            }
            Op::DisconnectClient(identifier) => {
                let device = self.adapter.device(parse_address(&identifier)?)?;
                device.disconnect().await?;
            }
        }
        Ok(())
    }

    /// Answer a held-back MTU request once the link MTU is known.
    fn resolve_mtu(&mut self, identifier: &str) {
        let Some(mtu) = self.link_mtu.get(identifier).copied().or(self.session_mtu) else {
            return;
        };
        let Some(candidate) = self.awaiting_mtu.remove(identifier) else {
            return;
        };
        debug!("Link to {} reports MTU {}", identifier, mtu);
        self.shared.emit(PeripheralRadioEvent::MtuLinkChanged {
            identifier: identifier.to_string(),
            result: Ok(mtu.min(candidate)),
        });
    }

    async fn open_mtu_link(&self, identifier: &str) -> Result<(), RadioError> {
        let device = self.adapter.device(parse_address(identifier)?)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }
        Ok(())
    }

    async fn publish(&mut self, service: ServiceDescriptor) -> Result<(), RadioError> {
        let write_uuid = service.write_characteristic_id;
        let shared = self.shared.clone();
        let write_char = Characteristic {
            uuid: write_uuid,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                    let shared = shared.clone();
                    async move {
                        let identifier = req.device_address.to_string();
                        shared.submit(Op::MtuObserved {
                            identifier: identifier.clone(),
                            mtu: req.mtu,
                        });

                        let response_needed = !matches!(req.op_type, WriteOp::Command);
                        let request_id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
                        let ack = response_needed.then(|| {
                            let (tx, rx) = oneshot::channel();
                            lock(&shared.pending).insert(request_id, tx);
                            rx
                        });

                        trace!(
                            "Write from {}: {} bytes, offset={}",
                            identifier,
                            value.len(),
                            req.offset
                        );
                        shared.emit(PeripheralRadioEvent::WriteRequest {
                            identifier,
                            request_id,
                            characteristic: write_uuid,
                            offset: req.offset,
                            value,
                            response_needed,
                        });

                        let Some(ack) = ack else { return Ok(()) };
                        match tokio::time::timeout(RESPONSE_TIMEOUT, ack).await {
                            Ok(Ok(())) => Ok(()),
                            _ => {
                                lock(&shared.pending).remove(&request_id);
                                error!("Write {} was not acknowledged", request_id);
                                Err(ReqError::Failed)
                            }
                        }
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            ..Default::default()
        };

        let (control, control_handle) = characteristic_control();
        let ops = self.ops.clone();
        tokio::spawn(async move {
            let mut control = Box::pin(control);
            while let Some(event) = control.next().await {
                if let CharacteristicControlEvent::Notify(writer) = event {
                    if ops.send(Op::Subscribed(writer)).is_err() {
                        break;
                    }
                }
            }
            trace!("Indication control stream ended");
        });
        let indication_char = Characteristic {
            uuid: service.indication_characteristic_id,
            notify: Some(CharacteristicNotify {
                notify: true,
                indicate: true,
                method: CharacteristicNotifyMethod::Io,
                ..Default::default()
            }),
            control_handle,
            ..Default::default()
        };

        let app = Application {
            services: vec![Service {
                uuid: service.service_id,
                primary: true,
                characteristics: vec![write_char, indication_char],
                ..Default::default()
            }],
            ..Default::default()
        };

        debug!(
            "Registering GATT application with service_uuid={}",
            service.service_id
        );
        self.app_handle = Some(self.adapter.serve_gatt_application(app).await?);
        debug!("GATT application registered successfully");
        Ok(())
    }

    async fn advertise(&mut self, service_id: Uuid) -> Result<(), RadioError> {
        let mut service_uuids = BTreeSet::new();
        service_uuids.insert(service_id);

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids,
            local_name: Some(self.device_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        debug!(
            "Starting BLE advertisement: service_uuid={}, local_name={}",
            service_id, self.device_name
        );
        self.adv_handle = Some(self.adapter.advertise(adv).await?);
        info!(
            "GATT Server advertising, device_name='{}'",
            self.device_name
        );
        Ok(())
    }
}
