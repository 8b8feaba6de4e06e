//! 应用配置和持久化
//!
//! 提供描述文件参数、元数据超时、下载目录等设置的存储和读取。

use crate::descriptor::{DEFAULT_CREATOR, DescriptorBuilder, PieceSize};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认元数据解析超时（秒）
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 30;

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropSettings {
    /// 下载时等待元数据的最长时间（秒）
    pub metadata_timeout_secs: u64,
    /// 描述文件中的创建者标签
    pub creator: String,
    /// 是否标记为私有
    pub private: bool,
    /// 分片大小策略
    pub piece_size: PieceSize,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 回环引擎状态更新间隔（毫秒）
    pub tick_interval_ms: u64,
}

impl Default for DropSettings {
    fn default() -> Self {
        Self {
            metadata_timeout_secs: DEFAULT_METADATA_TIMEOUT_SECS,
            creator: DEFAULT_CREATOR.to_string(),
            private: true,
            piece_size: PieceSize::Auto,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            tick_interval_ms: 1000,
        }
    }
}

impl DropSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hfmdrop");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// 从指定路径加载
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
    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to(&Self::config_path())
    }

    /// 保存到指定路径
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// 按设置配置的描述构建器
    pub fn descriptor_builder(&self) -> DescriptorBuilder {
        DescriptorBuilder::new()
            .with_piece_size(self.piece_size)
            .with_private(self.private)
            .with_creator(self.creator.clone())
    }
}

/// 设置保存错误
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
