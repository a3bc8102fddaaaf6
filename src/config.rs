//! 应用配置模块
//!
//! 同步设置保存在配置目录下的 `config.json` 中，与日志配置共用一个文件。
//! 核心引擎只读取设置，每次同步开始时重新获取快照。

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

pub const CONFIG_FILE: &str = "config.json";

/// 同步模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// 同步全部内容
    #[default]
    #[serde(rename = "full")]
    Full,
    /// 只同步选中的文件夹
    #[serde(rename = "selective_include", alias = "include")]
    Include,
    /// 同步除排除列表以外的全部内容
    #[serde(rename = "selective_exclude", alias = "exclude")]
    Exclude,
}

/// 超过大小阈值时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LargeSyncPolicy {
    /// 仅发出警告，然后继续传输
    #[default]
    Warn,
    /// 发出警告并等待调用方确认
    Confirm,
}

/// 同步设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// rclone 远程名称（不含冒号）
    #[serde(default)]
    pub rclone_remote: String,
    /// 本地目标目录
    #[serde(default)]
    pub local_folder: String,
    /// 启动时是否开启自动同步
    #[serde(default)]
    pub auto_sync_enabled: bool,
    /// 自动同步间隔（分钟）
    #[serde(default = "default_interval_minutes")]
    pub sync_interval_minutes: u64,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub included_folders: Vec<String>,
    #[serde(default)]
    pub excluded_folders: Vec<String>,
    /// 首次同步前先做一次 dry-run
    #[serde(default = "default_true")]
    pub dry_run_first_sync: bool,
    #[serde(default = "default_true")]
    pub confirm_large_sync: bool,
    #[serde(default = "default_large_sync_threshold_mb")]
    pub large_sync_threshold_mb: u64,
    #[serde(default)]
    pub large_sync_policy: LargeSyncPolicy,
    /// 带宽限制（KB/s），0 表示不限速
    #[serde(default)]
    pub bandwidth_limit_kbps: u64,
    /// 自定义 rclone 路径，为空时从 PATH 查找
    #[serde(default)]
    pub rclone_binary: Option<PathBuf>,
    /// 是否向用户提示同步开始和结束，由前端读取
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_large_sync_threshold_mb() -> u64 {
    1000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            rclone_remote: String::new(),
            local_folder: String::new(),
            auto_sync_enabled: false,
            sync_interval_minutes: default_interval_minutes(),
            sync_mode: SyncMode::Full,
            included_folders: Vec::new(),
            excluded_folders: Vec::new(),
            dry_run_first_sync: true,
            confirm_large_sync: true,
            large_sync_threshold_mb: default_large_sync_threshold_mb(),
            large_sync_policy: LargeSyncPolicy::Warn,
            bandwidth_limit_kbps: 0,
            rclone_binary: None,
            notifications_enabled: true,
        }
    }
}

impl SyncSettings {
    /// 远程和本地目录都已填写
    pub fn is_configured(&self) -> bool {
        !self.rclone_remote.trim().is_empty() && !self.local_folder.trim().is_empty()
    }

    /// rclone 源路径，形如 `remote:`
    pub fn source(&self) -> String {
        let remote = self.rclone_remote.trim();
        if remote.contains(':') {
            remote.to_string()
        } else {
            format!("{}:", remote)
        }
    }

    /// 不含路径的远程名称，用于 `lsd`、`config show` 等按名称操作的命令
    pub fn remote_name(&self) -> &str {
        let remote = self.rclone_remote.trim();
        remote.split_once(':').map_or(remote, |(name, _)| name)
    }

    pub fn add_included_folder(&mut self, folder: &str) {
        if !self.included_folders.iter().any(|f| f == folder) {
            self.included_folders.push(folder.to_string());
        }
    }

    pub fn remove_included_folder(&mut self, folder: &str) {
        self.included_folders.retain(|f| f != folder);
    }

    pub fn add_excluded_folder(&mut self, folder: &str) {
        if !self.excluded_folders.iter().any(|f| f == folder) {
            self.excluded_folders.push(folder.to_string());
        }
    }

    pub fn remove_excluded_folder(&mut self, folder: &str) {
        self.excluded_folders.retain(|f| f != folder);
    }

    /// 从配置文件加载，文件不存在或解析失败时返回默认值
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join(CONFIG_FILE);
        if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => match serde_json::from_str::<SyncSettings>(&content) {
                    Ok(settings) => return settings,
                    Err(e) => tracing::warn!("解析同步设置失败，使用默认值: {}", e),
                },
                Err(e) => tracing::warn!("读取配置文件失败，使用默认值: {}", e),
            }
        }
        Self::default()
    }

    /// 保存同步设置，保留文件中其它配置项（如日志配置）
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join(CONFIG_FILE);

        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };
        if !config.is_object() {
            config = serde_json::json!({});
        }

        let value = serde_json::to_value(self).map_err(io::Error::other)?;
        if let (Some(target), serde_json::Value::Object(fields)) = (config.as_object_mut(), value) {
            target.extend(fields);
        }

        let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        fs::write(&config_file, content)
    }
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    directories::ProjectDirs::from("io", "cloudsync", "cloudsync")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".cloudsync"))
}

/// 设置缓存，修改时写回磁盘
pub struct SettingsStore {
    settings: RwLock<SyncSettings>,
    config_dir: Option<PathBuf>,
}

impl SettingsStore {
    /// 从配置目录加载
    pub fn load(config_dir: &Path) -> Self {
        let settings = SyncSettings::load(config_dir);
        tracing::debug!("已加载同步设置: {:?}", config_dir.join(CONFIG_FILE));
        Self {
            settings: RwLock::new(settings),
            config_dir: Some(config_dir.to_path_buf()),
        }
    }

    /// 仅内存，不落盘
    pub fn in_memory(settings: SyncSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            config_dir: None,
        }
    }

    /// 当前设置的快照
    pub fn get(&self) -> SyncSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update(&self, new_settings: SyncSettings) -> io::Result<()> {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = new_settings;
        self.persist()
    }

    /// 原地修改并保存
    pub fn modify<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut SyncSettings),
    {
        {
            let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut settings);
        }
        self.persist()
    }

    fn persist(&self) -> io::Result<()> {
        let Some(dir) = &self.config_dir else {
            return Ok(());
        };
        let result = self.get().save(dir);
        if let Err(e) = &result {
            tracing::error!("保存同步设置失败: {}", e);
        }
        result
    }
}
