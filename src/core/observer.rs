//! 同步事件观察者
//!
//! 核心只通过 [`SyncObserver`] 向外推送事件，不依赖具体的界面类型。

use crate::core::executor::SizeEstimate;
use serde::Serialize;
use tokio::sync::mpsc;

/// 警告类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    LargeSync,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::LargeSync => "large_sync",
        }
    }
}

/// 大同步警告附带的数据
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeSyncWarning {
    pub size_bytes: u64,
    pub size_mb: f64,
    pub size_gb: f64,
    pub file_count: u64,
}

impl From<SizeEstimate> for LargeSyncWarning {
    fn from(estimate: SizeEstimate) -> Self {
        Self {
            size_bytes: estimate.bytes,
            size_mb: estimate.size_mb(),
            size_gb: estimate.size_gb(),
            file_count: estimate.count,
        }
    }
}

/// 同步生命周期回调，全部为推送，不需要返回值
///
/// 回调在同步任务内同步调用，实现方不应阻塞。
pub trait SyncObserver: Send + Sync {
    fn on_sync_start(&self) {}

    fn on_sync_progress(&self, _line: &str) {}

    fn on_sync_complete(&self, _success: bool, _message: &str) {}

    fn on_sync_warning(&self, _kind: WarningKind, _data: &LargeSyncWarning) {}
}

/// 忽略所有事件
#[derive(Debug, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

/// 事件的可序列化形式
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Start,
    Progress { line: String },
    Complete { success: bool, message: String },
    Warning { kind: WarningKind, data: LargeSyncWarning },
}

/// 把事件转发到 channel，供界面层或日志任务消费
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SyncEvent) {
        // 接收端已关闭时直接丢弃
        let _ = self.tx.send(event);
    }
}

impl SyncObserver for ChannelObserver {
    fn on_sync_start(&self) {
        self.send(SyncEvent::Start);
    }

    fn on_sync_progress(&self, line: &str) {
        self.send(SyncEvent::Progress {
            line: line.to_string(),
        });
    }

    fn on_sync_complete(&self, success: bool, message: &str) {
        self.send(SyncEvent::Complete {
            success,
            message: message.to_string(),
        });
    }

    fn on_sync_warning(&self, kind: WarningKind, data: &LargeSyncWarning) {
        self.send(SyncEvent::Warning {
            kind,
            data: data.clone(),
        });
    }
}
