//! 日志模块 - 文件日志、大小轮转与订阅器初始化

use crate::config::CONFIG_FILE;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "cloudsync.log";

/// 日志配置，保存在 config.json 的 "log" 字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" / "warn" / "info" / "debug" / "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join(CONFIG_FILE))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value(log).ok())
            .unwrap_or_default()
    }

    /// 保存日志配置，保留其它字段
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

        config["log"] = serde_json::to_value(self).map_err(io::Error::other)?;
        let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        fs::write(&config_file, content)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock_writer(writer: &SharedWriter) -> MutexGuard<'_, Option<BufWriter<File>>> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 超过大小限制时把 cloudsync.log 轮转为 cloudsync.log.old
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedWriter,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE);
        let max_size = u64::from(max_size_mb) * 1024 * 1024;
        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        if Self::exceeds(file_path, max_size) {
            Self::rotate_log(file_path)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    fn exceeds(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path)
            .map(|metadata| metadata.len() > max_size)
            .unwrap_or(false)
    }

    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    /// 在持有锁的情况下关闭、轮转并重新打开
    fn rotate_locked(
        guard: &mut Option<BufWriter<File>>,
        file_path: &Path,
        max_size: u64,
    ) -> io::Result<()> {
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        Self::rotate_log(file_path)?;
        *guard = Some(Self::open_file(file_path, max_size)?);
        Ok(())
    }
}

/// 单次写入使用的句柄
pub struct LogWriter {
    inner: SharedWriter,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock_writer(&self.inner);
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::other("日志文件不可用"));
        };
        let written = writer.write(buf)?;
        writer.flush()?;

        if SizeRotatingWriter::exceeds(&self.file_path, self.max_size) {
            let _ = SizeRotatingWriter::rotate_locked(&mut guard, &self.file_path, self.max_size);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock_writer(&self.inner).as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 初始化全局日志订阅器
///
/// 文件日志写到 `log_dir/cloudsync.log`；`console` 为 true 或 debug 构建时同时输出到终端。
/// 已经初始化过时静默忽略。
pub fn init_logging(log_dir: &Path, console: bool) {
    let config = LogConfig::load(log_dir);
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy();
    let console = console || cfg!(debug_assertions);

    let file_layer = match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(writer) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        ),
        Err(e) => {
            eprintln!("无法创建日志文件 {:?}: {}", log_dir.join(LOG_FILE), e);
            None
        }
    };
    let console_layer = (console || file_layer.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
