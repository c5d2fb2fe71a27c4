//! 传输配置和持久化
//!
//! 提供 MTU 候选值、协商超时、服务 UUID 等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TransportError;
use crate::logging::LogLevel;
use crate::protocol::{MTU_CANDIDATE, ServiceDescriptor};

/// 服务标识（字符串形式，便于在 TOML 中编辑）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub service_id: String,
    pub write_characteristic_id: String,
    pub indication_characteristic_id: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            service_id: "5f3c0001-8a4e-4e2b-9c4b-2f6d1a7e0b11".to_string(),
            write_characteristic_id: "5f3c0002-8a4e-4e2b-9c4b-2f6d1a7e0b11".to_string(),
            indication_characteristic_id: "5f3c0003-8a4e-4e2b-9c4b-2f6d1a7e0b11".to_string(),
        }
    }
}

impl ServiceSettings {
    pub fn descriptor(&self) -> Result<ServiceDescriptor, TransportError> {
        ServiceDescriptor::parse(
            &self.service_id,
            &self.write_characteristic_id,
            &self.indication_characteristic_id,
        )
    }
}

/// 传输设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// 设备名称（广播时显示）
    pub device_name: String,
    /// 请求的 ATT MTU
    pub mtu_candidate: u16,
    /// 服务发现和 MTU 协商的超时（秒），0 表示不限
    pub negotiation_timeout_secs: u64,
    /// 扫描时只报告广播了服务 UUID 的设备
    pub filter_scan_by_service: bool,
    /// 日志级别
    pub log_level: LogLevel,
    /// 服务 UUID，未设置时由调用方决定
    pub service: Option<ServiceSettings>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            device_name: get_default_device_name(),
            mtu_candidate: MTU_CANDIDATE,
            negotiation_timeout_secs: 10,
            filter_scan_by_service: true,
            log_level: LogLevel::default(),
            service: None,
        }
    }
}

impl TransportSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gattlink")
            .join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 协商超时，`None` 表示不限
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        (self.negotiation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.negotiation_timeout_secs))
    }

    /// 解析配置中的服务 UUID
    pub fn service_descriptor(&self) -> Result<Option<ServiceDescriptor>, TransportError> {
        self.service.as_ref().map(ServiceSettings::descriptor).transpose()
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "gattlink".to_string())
}
