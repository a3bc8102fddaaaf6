//! 测试辅助：用 shell 脚本冒充 rclone，并记录每次调用的参数

#![allow(dead_code)]

use cloudsync_lib::core::{ChannelObserver, SyncEvent, TransferExecutor};
use cloudsync_lib::{SettingsStore, SyncOrchestrator, SyncSettings};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

/// 假 rclone 的行为
pub struct FakeRclone {
    /// 在记录调用和任何输出之前执行的 shell 片段
    pub preamble: String,
    /// `size --json` 报告的字节数
    pub size_bytes: u64,
    /// 替换 `size` 的整段输出
    pub size_output: Option<String>,
    /// `sync` 打印完进度后执行的 shell 片段
    pub sync_tail: String,
}

impl Default for FakeRclone {
    fn default() -> Self {
        Self {
            preamble: String::new(),
            size_bytes: 10 * 1024 * 1024,
            size_output: None,
            sync_tail: "exit 0".to_string(),
        }
    }
}

impl FakeRclone {
    /// 打印进度后一直运行，直到被信号结束
    pub fn long_running() -> Self {
        Self {
            sync_tail: "exec sleep 30".to_string(),
            ..Default::default()
        }
    }

    /// 忽略 SIGTERM，只能被强制结束
    pub fn ignoring_term() -> Self {
        Self {
            preamble: "trap '' TERM".to_string(),
            ..Self::long_running()
        }
    }

    /// `size` 输出无法解析的内容
    pub fn unparsable_size() -> Self {
        Self {
            size_output: Some("echo 'garbage'".to_string()),
            ..Default::default()
        }
    }

    pub fn failing(code: i32) -> Self {
        Self {
            sync_tail: format!("echo 'ERROR : failed to sync' >&2\nexit {}", code),
            ..Default::default()
        }
    }
}

pub struct Sandbox {
    pub dir: TempDir,
    pub binary: PathBuf,
    pub calls: PathBuf,
    pub local: PathBuf,
}

impl Sandbox {
    pub fn new(fake: FakeRclone) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("rclone");
        let calls = dir.path().join("calls.log");
        let local = dir.path().join("local");
        fs::create_dir_all(&local).unwrap();

        let size = fake.size_output.unwrap_or_else(|| {
            format!(
                r#"echo '{{"count":3,"bytes":{},"sizeless":0}}'"#,
                fake.size_bytes
            )
        });
        let script = format!(
            r#"#!/bin/sh
{preamble}
echo "$*" >> "{calls}"
case "$1" in
  version)
    echo "rclone v1.66.0"
    echo "- os/version: test"
    ;;
  listremotes)
    printf 'proton:\n\nbackup:\n'
    ;;
  lsf)
    case "$2" in
      *:) printf 'Work/\nPhotos/\n' ;;
      *:Work) printf 'Projects/\n' ;;
      *:Work/Projects) printf 'Archive/\n' ;;
    esac
    ;;
  config)
    if [ "$2" = "show" ] && [ "$3" = "proton" ]; then
      printf '[proton]\ntype = protondrive\nusername = me@example.com\n'
    else
      echo "remote not found" >&2
      exit 1
    fi
    ;;
  lsd)
    if [ "$2" = "missing:" ]; then
      echo "didn't find section in config file" >&2
      exit 1
    fi
    ;;
  size)
    {size}
    ;;
  sync)
    echo "Transferred:   0 B / 1 KiB, 0%"
    printf '  Transferred: 1 / 2\r  Transferred: 2 / 2  \n'
    echo ""
    {tail}
    ;;
esac
exit 0
"#,
            preamble = fake.preamble,
            calls = calls.display(),
            size = size,
            tail = fake.sync_tail,
        );
        fs::write(&binary, script).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            dir,
            binary,
            calls,
            local,
        }
    }

    pub fn executor(&self) -> TransferExecutor {
        TransferExecutor::with_binary(&self.binary)
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            rclone_remote: "proton".into(),
            local_folder: self.local.display().to_string(),
            rclone_binary: Some(self.binary.clone()),
            ..Default::default()
        }
    }

    pub fn orchestrator(
        &self,
        settings: SyncSettings,
    ) -> (SyncOrchestrator, UnboundedReceiver<SyncEvent>) {
        let (observer, rx) = ChannelObserver::new();
        let engine = SyncOrchestrator::new(
            Arc::new(SettingsStore::in_memory(settings)),
            self.executor(),
            Arc::new(observer),
        );
        (engine, rx)
    }

    /// 所有调用记录，每次一行
    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(&self.calls)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// `rclone sync` 的调用记录
    pub fn sync_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|line| line.starts_with("sync "))
            .collect()
    }
}

pub async fn next_event(rx: &mut UnboundedReceiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for sync event")
        .expect("observer channel closed")
}

/// 读取事件直到完成，返回完成结果和之前的全部事件
pub async fn until_complete(
    rx: &mut UnboundedReceiver<SyncEvent>,
) -> (bool, String, Vec<SyncEvent>) {
    let mut seen = Vec::new();
    loop {
        match next_event(rx).await {
            SyncEvent::Complete { success, message } => return (success, message, seen),
            event => seen.push(event),
        }
    }
}

/// 等待第一条进度输出，说明传输进程已经在运行
pub async fn until_progress(rx: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, SyncEvent::Progress { .. });
        seen.push(event);
        if done {
            return seen;
        }
    }
}
