//! 错误类型

use thiserror::Error;

/// 同步过程中可能出现的错误
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("未找到 rclone 可执行文件，请先安装 rclone")]
    ExecutableNotFound,

    /// 优雅终止超时，调用方会升级为强制结束进程
    #[error("等待进程退出超时")]
    ProcessTimeout,

    #[error("同步失败，返回码 {code}")]
    TransferFailed { code: i32 },

    #[error("估算同步大小失败: {0}")]
    EstimationFailed(String),

    #[error("尚未配置远程存储或本地目录")]
    ConfigurationIncomplete,

    #[error("已有同步任务在运行")]
    AlreadyRunning,

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// 把进程启动错误映射为对应的同步错误
    pub(crate) fn from_spawn(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SyncError::ExecutableNotFound
        } else {
            SyncError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_not_found_maps_to_executable_not_found() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        assert!(matches!(SyncError::from_spawn(err), SyncError::ExecutableNotFound));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(SyncError::from_spawn(err), SyncError::Io(_)));
    }

    #[test]
    fn test_transfer_failed_message_contains_code() {
        let err = SyncError::TransferFailed { code: 3 };
        assert!(err.to_string().contains('3'));
    }
}
