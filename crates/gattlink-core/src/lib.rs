//! Gattlink Core Library
//!
//! 基于 BLE GATT 的双向消息传输：中心设备写入，外设通过 indication 回传，
//! 任意长度的消息按协商的 MTU 分块并以 `EOM` 结尾。
//!
//! # 模块
//!
//! - **protocol**: 分块编解码、就绪门控、服务描述
//! - **link**: 中心/外设状态机
//! - **transport**: 角色任务和宿主句柄
//! - **events**: 宿主事件流
//! - **ble**: 无线接口 trait 以及 btleplug / bluer 后端
//! - **mock**: 内存无线，供测试和 loopback 演示
//!
//! # 使用示例
//!
//! ## 中心设备发送
//!
//! ```ignore
//! use gattlink_core::{BtleplugCentral, Transport, TransportSettings, TransportEvent};
//!
//! let settings = TransportSettings::load();
//! let (transport, mut events) = Transport::new(settings);
//! let (radio, radio_events) = BtleplugCentral::new().await?;
//! let central = transport.spawn_central(radio, radio_events);
//!
//! central.start().await?;
//! central.set_service(service).await?;
//! central.connect("AA:BB:CC:DD:EE:FF").await?;
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::LinkReady { .. } = event {
//!         central.write(b"hello".to_vec()).await?;
//!     }
//! }
//! ```
//!
//! ## 外设接收
//!
//! ```ignore
//! use gattlink_core::{BluerPeripheral, Transport, TransportSettings};
//!
//! let (transport, mut events) = Transport::new(TransportSettings::load());
//! let (radio, radio_events) = BluerPeripheral::new("my-device").await?;
//! let peripheral = transport.spawn_peripheral(radio, radio_events);
//!
//! peripheral.start().await?;
//! peripheral.set_service(service).await?;
//! peripheral.advertise().await?;
//! ```

pub mod ble;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod logging;
pub mod mock;
pub mod protocol;
pub mod transport;

// BLE re-exports
pub use ble::{
    BluerPeripheral, BtleplugCentral, CentralRadio, CentralRadioEvent, PeripheralRadio,
    PeripheralRadioEvent, RadioError,
};

pub use config::{ServiceSettings, TransportSettings};
pub use error::TransportError;
pub use events::{EventStream, TransportEvent};
pub use link::{CentralPhase, PeripheralPhase, Role};
pub use logging::LogLevel;
pub use protocol::{PeripheralRef, ServiceDescriptor};
pub use transport::{CentralHandle, PeripheralHandle, Transport};
