use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use config::{LargeSyncPolicy, SettingsStore, SyncMode, SyncSettings};
pub use crate::core::{SyncObserver, SyncOrchestrator, SyncStatus, TransferExecutor};
pub use error::{Result, SyncError};

/// 应用上下文，持有配置和同步引擎
#[derive(Clone)]
pub struct AppContext {
    pub config_dir: PathBuf,
    pub settings: Arc<SettingsStore>,
    pub executor: TransferExecutor,
    pub orchestrator: SyncOrchestrator,
}

impl AppContext {
    /// `config_dir` 为空时使用系统默认配置目录
    pub fn new(config_dir: Option<&Path>, observer: Arc<dyn SyncObserver>) -> anyhow::Result<Self> {
        let config_dir = config_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(config::default_config_dir);
        std::fs::create_dir_all(&config_dir)?;

        let settings = Arc::new(SettingsStore::load(&config_dir));
        let executor = match settings.get().rclone_binary {
            Some(binary) => TransferExecutor::with_binary(binary),
            None => TransferExecutor::new(),
        };
        if !executor.is_installed() {
            tracing::warn!("{}", SyncError::ExecutableNotFound);
        }

        let orchestrator = SyncOrchestrator::new(settings.clone(), executor.clone(), observer);

        Ok(Self {
            config_dir,
            settings,
            executor,
            orchestrator,
        })
    }

    /// 按 `auto_sync_enabled` 启动自动同步，未开启或启动失败时返回 false
    pub fn start_auto_sync_if_enabled(&self) -> bool {
        if !self.settings.get().auto_sync_enabled {
            tracing::info!("自动同步未开启");
            return false;
        }
        self.orchestrator.start_auto_sync()
    }

    /// 停止自动同步并取消正在进行的传输（退出前调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");
        self.orchestrator.stop_auto_sync().await;
        if self.orchestrator.cancel().await {
            tracing::debug!("已取消进行中的同步");
        }
        tracing::info!("资源清理完成");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NoopObserver;

    #[tokio::test]
    async fn test_context_uses_given_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let ctx = AppContext::new(Some(&nested), Arc::new(NoopObserver)).unwrap();

        assert!(nested.is_dir());
        assert_eq!(ctx.config_dir, nested);
        assert!(!ctx.orchestrator.get_status().configured);
        ctx.cleanup().await;
    }

    #[tokio::test]
    async fn test_auto_sync_follows_setting() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(Some(dir.path()), Arc::new(NoopObserver)).unwrap();
        ctx.settings
            .modify(|s| {
                s.rclone_remote = "proton".into();
                s.local_folder = dir.path().join("local").display().to_string();
                s.rclone_binary = Some("/nonexistent/definitely-not-rclone".into());
            })
            .unwrap();

        assert!(!ctx.start_auto_sync_if_enabled());
        assert!(!ctx.orchestrator.get_status().auto_sync_running);

        ctx.settings.modify(|s| s.auto_sync_enabled = true).unwrap();
        assert!(ctx.start_auto_sync_if_enabled());
        assert!(ctx.orchestrator.get_status().auto_sync_running);

        ctx.cleanup().await;
        assert!(!ctx.orchestrator.get_status().auto_sync_running);
    }
}
