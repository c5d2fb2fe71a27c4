//! 事件输出

use gattlink_core::TransportEvent;

/// Show an event as readable text or as one JSON line.
pub fn print_event(event: &TransportEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Cannot serialize {}: {}", event.name(), e),
        }
        return;
    }

    match event {
        TransportEvent::PeripheralDiscovered { identifier } => {
            println!("🔍 发现设备: {identifier}");
        }
        TransportEvent::ConnectedPeripheral { identifier } => {
            println!("🔗 已连接外设: {identifier}");
        }
        TransportEvent::DisconnectedPeripheral { identifier } => {
            println!("⛓️‍💥 外设已断开: {identifier}");
        }
        TransportEvent::ConnectedCentral { identifier } => {
            println!("🔗 中心设备已连接: {identifier}");
        }
        TransportEvent::DisconnectedCentral { identifier } => {
            println!("⛓️‍💥 中心设备已断开: {identifier}");
        }
        TransportEvent::MessageReceived { message }
        | TransportEvent::MessageReceivedWithoutResponse { message } => {
            println!("📥 收到 {} 字节: {}", message.len(), render(message));
        }
        TransportEvent::LinkReady {
            role,
            identifier,
            mtu,
        } => {
            println!("✅ 链路就绪 ({role}, {identifier}, MTU {mtu})");
        }
        TransportEvent::NegotiationFailed {
            role,
            identifier,
            reason,
        } => {
            println!("❌ 协商失败 ({role}, {identifier}): {reason}");
        }
        TransportEvent::MessageSent { role } => println!("📤 发送完成 ({role})"),
        TransportEvent::SendFailed { role, reason } => {
            println!("❌ 发送失败 ({role}): {reason}");
        }
    }
}

/// UTF-8 text as-is, anything else as hex.
fn render(message: &[u8]) -> String {
    match std::str::from_utf8(message) {
        Ok(text) => format!("{text:?}"),
        Err(_) => message.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
