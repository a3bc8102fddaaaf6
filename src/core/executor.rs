//! rclone 进程管理 - 启动、读取输出、等待、取消
//!
//! 同一时间只监管一个传输进程。stdout 和 stderr 合并成一个按行读取的流，
//! 每行在读取时立即交给调用方，不做额外缓冲。

use crate::core::filter::{to_args, FilterRule};
use crate::error::{Result, SyncError};
use crate::utils::{bytes_to_gb, bytes_to_mb};
use futures::future::BoxFuture;
use futures::Stream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// 默认可执行文件名
pub const RCLONE_BINARY: &str = "rclone";

/// 优雅终止后等待进程退出的时间，超时则强制结束
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

const ESTIMATE_TIMEOUT: Duration = Duration::from_secs(60);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const LIST_REMOTES_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// 一次传输调用的参数
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub source: String,
    pub destination: String,
    pub filters: Vec<FilterRule>,
    pub dry_run: bool,
    /// KB/s，0 表示不限速
    pub bandwidth_limit_kbps: u64,
}

impl TransferRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_filters(mut self, filters: Vec<FilterRule>) -> Self {
        self.filters = filters;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn bandwidth_limit(mut self, kbps: u64) -> Self {
        self.bandwidth_limit_kbps = kbps;
        self
    }

    /// rclone sync 命令行参数（不含可执行文件本身）
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "sync".to_string(),
            self.source.clone(),
            self.destination.clone(),
            "--progress".to_string(),
            "--stats".to_string(),
            "1s".to_string(),
            "-v".to_string(),
        ];
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args.extend(to_args(&self.filters));
        if self.bandwidth_limit_kbps > 0 {
            args.push("--bwlimit".to_string());
            args.push(format!("{}k", self.bandwidth_limit_kbps));
        }
        args
    }
}

/// 一次传输的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub success: bool,
    pub message: String,
    /// 被信号终止时为 -1
    pub exit_code: i32,
}

/// 同步大小估算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeEstimate {
    pub bytes: u64,
    pub count: u64,
}

impl SizeEstimate {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.bytes)
    }

    pub fn size_gb(&self) -> f64 {
        bytes_to_gb(self.bytes)
    }
}

/// `rclone size --json` 的输出
#[derive(Debug, Deserialize)]
struct RcloneSizeOutput {
    #[serde(default)]
    count: i64,
    #[serde(default)]
    bytes: i64,
}

/// 解析 `rclone size --json` 输出
pub fn parse_size_output(stdout: &str) -> Result<SizeEstimate> {
    let raw: RcloneSizeOutput = serde_json::from_str(stdout.trim())
        .map_err(|e| SyncError::EstimationFailed(format!("无法解析输出: {}", e)))?;
    if raw.bytes < 0 || raw.count < 0 {
        return Err(SyncError::EstimationFailed("远程未报告大小".to_string()));
    }
    Ok(SizeEstimate {
        bytes: raw.bytes as u64,
        count: raw.count as u64,
    })
}

/// 从 `rclone version` 的第一行提取版本号
pub fn parse_version(stdout: &str) -> Option<String> {
    let first_line = stdout.lines().next()?;
    let re = Regex::new(r"v(\d+(?:\.\d+)*)").ok()?;
    re.captures(first_line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// 解析 `rclone listremotes` 输出，去掉末尾冒号
pub fn parse_remotes(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.trim_end_matches(':').to_string())
        .collect()
}

/// 远程目录项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFolder {
    pub name: String,
    pub path: String,
    pub full_path: String,
}

/// 解析 `rclone lsf --dirs-only` 输出
pub fn parse_folders(remote: &str, parent: &str, stdout: &str) -> Vec<RemoteFolder> {
    let parent = parent.trim_matches('/');
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let name = line.trim_end_matches('/').to_string();
            let path = if parent.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", parent, name)
            };
            RemoteFolder {
                full_path: format!("{}:{}", remote, path),
                name,
                path,
            }
        })
        .collect()
}

/// 文件夹树节点，供选择性同步界面构建包含/排除列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub name: String,
    pub path: String,
    pub full_path: String,
    pub children: Vec<FolderNode>,
}

impl FolderNode {
    fn leaf(folder: RemoteFolder) -> Self {
        Self {
            name: folder.name,
            path: folder.path,
            full_path: folder.full_path,
            children: Vec::new(),
        }
    }

    /// 深度优先展开为相对路径列表
    pub fn flatten(nodes: &[FolderNode]) -> Vec<String> {
        let mut paths = Vec::new();
        for node in nodes {
            paths.push(node.path.clone());
            paths.extend(Self::flatten(&node.children));
        }
        paths
    }
}

/// 从 `rclone config show <remote>` 输出中取出 `type = ...`
pub fn parse_remote_type(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        (key.trim() == "type")
            .then(|| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

type OutputStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;

/// 正在运行的传输进程
pub struct TransferHandle {
    child: Child,
    lines: Option<OutputStream>,
    pending: VecDeque<String>,
    pid: Option<u32>,
    suspended: bool,
    dry_run: bool,
    started_at: Instant,
}

impl TransferHandle {
    fn new(mut child: Child, dry_run: bool) -> Self {
        let pid = child.id();
        let stdout = child.stdout.take().map(|out| {
            Box::pin(SplitStream::new(BufReader::new(out).split(b'\n'))) as OutputStream
        });
        let stderr = child.stderr.take().map(|err| {
            Box::pin(SplitStream::new(BufReader::new(err).split(b'\n'))) as OutputStream
        });
        let lines = match (stdout, stderr) {
            (Some(out), Some(err)) => Some(Box::pin(out.merge(err)) as OutputStream),
            (out, err) => out.or(err),
        };

        Self {
            child,
            lines,
            pending: VecDeque::new(),
            pid,
            suspended: false,
            dry_run,
            started_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// 读取下一行输出，进程关闭输出后返回 None，读完后不可重读
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            let stream = self.lines.as_mut()?;
            match stream.next().await {
                Some(Ok(chunk)) => {
                    // --progress 会用 \r 原地刷新，拆成独立的行
                    let text = String::from_utf8_lossy(&chunk);
                    for part in text.split('\r') {
                        let part = part.trim();
                        if !part.is_empty() {
                            debug!("{}", part);
                            self.pending.push_back(part.to_string());
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("读取 rclone 输出失败: {}", e);
                    self.lines = None;
                }
                None => {
                    self.lines = None;
                }
            }
        }
    }

    /// 等待进程退出，未读取的输出会被丢弃
    pub async fn wait(&mut self) -> Result<TransferResult> {
        while self.next_line().await.is_some() {}

        let status = self.child.wait().await?;
        let elapsed = self.started_at.elapsed();
        let kind = if self.dry_run { "dry-run" } else { "同步" };

        match status.code() {
            Some(0) => {
                info!("rclone {}完成，耗时 {:.1}s", kind, elapsed.as_secs_f64());
                Ok(TransferResult {
                    success: true,
                    message: if self.dry_run {
                        "Dry run 完成".to_string()
                    } else {
                        "同步成功完成".to_string()
                    },
                    exit_code: 0,
                })
            }
            code => {
                let code = code.unwrap_or(-1);
                error!("rclone {}失败，返回码 {}", kind, code);
                Err(SyncError::TransferFailed { code })
            }
        }
    }

    /// 发送终止信号，宽限期内未退出则强制结束
    ///
    /// 没有运行中的进程时返回 false。
    pub async fn cancel(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => {}
            Ok(Some(_)) => return false,
            Err(e) => {
                warn!("查询 rclone 进程状态失败: {}", e);
                return false;
            }
        }

        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                send_signal(pid, "TERM").await;
                // 被暂停的进程收不到 TERM，需要先恢复
                if self.suspended {
                    send_signal(pid, "CONT").await;
                    self.suspended = false;
                }

                match tokio::time::timeout(GRACE_PERIOD, self.child.wait()).await {
                    Ok(_) => {
                        info!(pid, "同步已取消");
                        return true;
                    }
                    Err(_) => warn!(pid, "{}，强制结束进程", SyncError::ProcessTimeout),
                }
            }
        }

        match self.child.kill().await {
            Ok(()) => {
                warn!("rclone 进程已被强制结束");
                true
            }
            Err(e) => {
                error!("结束 rclone 进程失败: {}", e);
                false
            }
        }
    }

    /// 挂起进程（仅 Unix）
    pub async fn suspend(&mut self) -> bool {
        if self.suspended {
            return false;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                if send_signal(pid, "STOP").await {
                    self.suspended = true;
                    return true;
                }
            }
        }
        false
    }

    /// 恢复被挂起的进程
    pub async fn resume(&mut self) -> bool {
        if !self.suspended {
            return false;
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                if send_signal(pid, "CONT").await {
                    self.suspended = false;
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(unix)]
async fn send_signal(pid: u32, signal: &str) -> bool {
    match Command::new("kill")
        .arg(format!("-{}", signal))
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("发送 SIG{} 到进程 {} 失败: {}", signal, pid, e);
            false
        }
    }
}

/// rclone 调用入口
#[derive(Debug, Clone, Default)]
pub struct TransferExecutor {
    /// 为空时从 PATH 查找
    binary: Option<PathBuf>,
}

impl TransferExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    /// 定位可执行文件
    pub fn locate(&self) -> Result<PathBuf> {
        let target = self
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(RCLONE_BINARY));
        which::which(&target).map_err(|e| {
            debug!("查找 {:?} 失败: {}", target, e);
            SyncError::ExecutableNotFound
        })
    }

    pub fn is_installed(&self) -> bool {
        self.locate().is_ok()
    }

    fn command(&self, args: &[String]) -> Result<Command> {
        let binary = self.locate()?;
        let mut cmd = Command::new(binary);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        Ok(cmd)
    }

    /// 启动传输进程
    pub async fn start(&self, request: &TransferRequest) -> Result<TransferHandle> {
        let args = request.args();
        let mut cmd = self.command(&args)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        info!(
            "开始同步: {} -> {}{}",
            request.source,
            request.destination,
            if request.dry_run { " (dry-run)" } else { "" }
        );
        debug!("rclone 参数: {:?}", args);

        let child = cmd.spawn().map_err(SyncError::from_spawn)?;
        Ok(TransferHandle::new(child, request.dry_run))
    }

    /// 运行一个短命令并收集输出
    async fn output(&self, args: &[String], limit: Duration) -> Result<Output> {
        let mut cmd = self.command(args)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result.map_err(SyncError::from_spawn),
            Err(_) => Err(SyncError::ProcessTimeout),
        }
    }

    /// 估算源路径在当前过滤规则下的大小
    pub async fn estimate_size(&self, source: &str, filters: &[FilterRule]) -> Result<SizeEstimate> {
        let mut args = vec!["size".to_string(), source.to_string(), "--json".to_string()];
        args.extend(to_args(filters));

        let output = match self.output(&args, ESTIMATE_TIMEOUT).await {
            Ok(output) => output,
            Err(SyncError::ExecutableNotFound) => return Err(SyncError::ExecutableNotFound),
            Err(e) => return Err(SyncError::EstimationFailed(e.to_string())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::EstimationFailed(format!(
                "返回码 {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let estimate = parse_size_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!("估算大小: {} 字节, {} 个文件", estimate.bytes, estimate.count);
        Ok(estimate)
    }

    /// rclone 版本号
    pub async fn version(&self) -> Option<String> {
        match self.output(&["version".to_string()], VERSION_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                parse_version(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => None,
            Err(e) => {
                error!("获取 rclone 版本失败: {}", e);
                None
            }
        }
    }

    /// 已配置的远程列表
    pub async fn list_remotes(&self) -> Result<Vec<String>> {
        let output = self
            .output(&["listremotes".to_string()], LIST_REMOTES_TIMEOUT)
            .await?;
        if !output.status.success() {
            error!("列出远程失败: {}", String::from_utf8_lossy(&output.stderr).trim());
            return Err(SyncError::TransferFailed {
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(parse_remotes(&String::from_utf8_lossy(&output.stdout)))
    }

    /// 列出远程某路径下的子目录
    pub async fn list_folders(&self, remote: &str, path: &str) -> Result<Vec<RemoteFolder>> {
        let args = vec![
            "lsf".to_string(),
            format!("{}:{}", remote, path),
            "--dirs-only".to_string(),
            "--format".to_string(),
            "p".to_string(),
        ];
        let output = self.output(&args, LIST_TIMEOUT).await?;
        if !output.status.success() {
            error!("列出目录失败: {}", String::from_utf8_lossy(&output.stderr).trim());
            return Err(SyncError::TransferFailed {
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(parse_folders(
            remote,
            path,
            &String::from_utf8_lossy(&output.stdout),
        ))
    }

    /// 远程是否已配置
    pub async fn remote_exists(&self, remote: &str) -> Result<bool> {
        Ok(self.list_remotes().await?.iter().any(|r| r == remote))
    }

    /// 远程类型，例如 `protondrive`、`s3`
    pub async fn remote_type(&self, remote: &str) -> Option<String> {
        let args = vec!["config".to_string(), "show".to_string(), remote.to_string()];
        match self.output(&args, LIST_REMOTES_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                parse_remote_type(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                debug!(
                    "读取远程 {} 配置失败: {}",
                    remote,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                error!("获取远程类型失败: {}", e);
                None
            }
        }
    }

    /// 递归列出远程文件夹，最多 `max_depth` 层
    pub async fn folder_tree(&self, remote: &str, max_depth: usize) -> Result<Vec<FolderNode>> {
        self.folder_subtree(remote, String::new(), 0, max_depth).await
    }

    fn folder_subtree<'a>(
        &'a self,
        remote: &'a str,
        path: String,
        depth: usize,
        max_depth: usize,
    ) -> BoxFuture<'a, Result<Vec<FolderNode>>> {
        Box::pin(async move {
            if depth >= max_depth {
                return Ok(Vec::new());
            }
            let mut nodes = Vec::new();
            for folder in self.list_folders(remote, &path).await? {
                let mut node = FolderNode::leaf(folder);
                node.children = self
                    .folder_subtree(remote, node.path.clone(), depth + 1, max_depth)
                    .await?;
                nodes.push(node);
            }
            Ok(nodes)
        })
    }

    /// 测试远程是否可访问
    pub async fn test_remote(&self, remote: &str) -> (bool, String) {
        let args = vec![
            "lsd".to_string(),
            format!("{}:", remote),
            "--max-depth".to_string(),
            "1".to_string(),
        ];
        match self.output(&args, LIST_TIMEOUT).await {
            Ok(output) if output.status.success() => (true, "远程可访问".to_string()),
            Ok(output) => (
                false,
                format!("错误: {}", String::from_utf8_lossy(&output.stderr).trim()),
            ),
            Err(SyncError::ProcessTimeout) => (false, "测试远程超时".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }
}
