//! 同步引擎 - 状态机、预检流程与自动同步调度
//!
//! 引擎内只有一份可变状态 `SyncState`，放在一把互斥锁里。
//! 手动触发和定时触发都通过同一个临界区完成“检查并占用”，同一时间最多一个同步任务。

use crate::config::{LargeSyncPolicy, SettingsStore, SyncSettings};
use crate::core::executor::{TransferExecutor, TransferRequest, TransferResult, GRACE_PERIOD};
use crate::core::filter::{self, FilterRule};
use crate::core::observer::{SyncObserver, WarningKind};
use crate::error::SyncError;
use crate::utils::format_bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// 停止自动同步时等待调度任务退出的时间
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// 取消时等待同步任务结束的时间：宽限期加上强制结束的余量
const CANCEL_TIMEOUT: Duration = Duration::from_secs(GRACE_PERIOD.as_secs() + 1);

const CANCELLED_MESSAGE: &str = "同步已取消";

/// 引擎所处阶段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    PreflightDryRun,
    PreflightSizeCheck,
    Transferring,
    Paused,
    Cancelling,
}

/// 引擎状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub auto_sync_running: bool,
    pub transfer_in_progress: bool,
    pub paused: bool,
    /// ISO-8601，尚未成功同步时为空
    pub last_sync_time: Option<String>,
    pub configured: bool,
    pub first_sync_completed: bool,
    pub phase: SyncPhase,
}

/// 发给传输任务的进程控制指令
#[derive(Debug, Clone, Copy)]
enum ProcessControl {
    Suspend,
    Resume,
}

/// 当前同步任务的控制端
struct RunControl {
    id: Uuid,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<ProcessControl>,
    done: watch::Receiver<bool>,
    confirm: Option<oneshot::Sender<bool>>,
}

/// 同步任务持有的一端
struct RunContext {
    id: Uuid,
    cancel: CancellationToken,
    control: mpsc::UnboundedReceiver<ProcessControl>,
}

#[derive(Default)]
struct SyncState {
    phase: SyncPhase,
    auto_sync_running: bool,
    transfer_in_progress: bool,
    paused: bool,
    first_sync_completed: bool,
    last_sync: Option<DateTime<Local>>,
    run: Option<RunControl>,
}

struct Scheduler {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// 同步任务提前结束的原因
enum Abort {
    Cancelled,
    Failed(String),
}

struct Inner {
    settings: Arc<SettingsStore>,
    executor: TransferExecutor,
    observer: Arc<dyn SyncObserver>,
    state: Mutex<SyncState>,
    scheduler: Mutex<Option<Scheduler>>,
}

/// 同步编排器，克隆后共享同一个引擎
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        settings: Arc<SettingsStore>,
        executor: TransferExecutor,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                executor,
                observer,
                state: Mutex::new(SyncState::default()),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// 由前端恢复持久化的首次同步标记
    pub fn with_first_sync_completed(self, completed: bool) -> Self {
        self.lock_state().first_sync_completed = completed;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, Option<Scheduler>> {
        self.inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 获取状态快照
    pub fn get_status(&self) -> SyncStatus {
        let configured = self.inner.settings.get().is_configured();
        let state = self.lock_state();
        SyncStatus {
            auto_sync_running: state.auto_sync_running,
            transfer_in_progress: state.transfer_in_progress,
            paused: state.paused,
            last_sync_time: state.last_sync.map(|t| t.to_rfc3339()),
            configured,
            first_sync_completed: state.first_sync_completed,
            phase: state.phase,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.lock_state().phase
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Local>> {
        self.lock_state().last_sync
    }

    // ============ 自动同步 ============

    /// 启动自动同步，已在运行或未配置时返回 false
    pub fn start_auto_sync(&self) -> bool {
        if !self.inner.settings.get().is_configured() {
            error!("无法启动自动同步: {}", SyncError::ConfigurationIncomplete);
            return false;
        }

        let mut scheduler = self.lock_scheduler();
        if scheduler.is_some() {
            warn!("自动同步已在运行");
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                error!("无法启动自动同步：没有可用的运行时: {}", e);
                return false;
            }
        };

        let stop = CancellationToken::new();
        let handle = runtime.spawn(Self::auto_sync_loop(
            Arc::downgrade(&self.inner),
            stop.clone(),
        ));
        *scheduler = Some(Scheduler { stop, handle });
        self.lock_state().auto_sync_running = true;

        info!("自动同步已启动");
        true
    }

    /// 停止自动同步并等待调度任务退出
    ///
    /// 已经开始的同步任务不受影响，需要停止时调用 [`cancel`](Self::cancel)。
    pub async fn stop_auto_sync(&self) {
        let Some(scheduler) = self.lock_scheduler().take() else {
            return;
        };
        self.lock_state().auto_sync_running = false;
        scheduler.stop.cancel();

        match tokio::time::timeout(STOP_TIMEOUT, scheduler.handle).await {
            Ok(_) => info!("自动同步已停止"),
            Err(_) => warn!("等待自动同步任务退出超时"),
        }
    }

    async fn auto_sync_loop(inner: Weak<Inner>, stop: CancellationToken) {
        loop {
            // 每次触发前都检查停止信号，包括第一次
            if stop.is_cancelled() {
                break;
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let engine = SyncOrchestrator { inner };
            if !engine.sync_now() {
                debug!("本轮自动同步未启动");
            }

            // 每轮重新读取间隔，修改后从下一轮开始生效
            let interval = Self::interval(&engine.inner.settings.get());
            drop(engine);

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("自动同步循环已退出");
    }

    fn interval(settings: &SyncSettings) -> Duration {
        Duration::from_secs(settings.sync_interval_minutes.max(1) * 60)
    }

    // ============ 手动同步 ============

    /// 立即在后台开始一次同步
    ///
    /// 已有同步在运行或未配置时返回 false，不会启动新进程。
    pub fn sync_now(&self) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt,
            Err(e) => {
                error!("无法同步：没有可用的运行时: {}", e);
                return false;
            }
        };
        let Some((settings, ctx, done)) = self.try_begin() else {
            return false;
        };

        let span = tracing::info_span!("sync", run = %ctx.id);
        let engine = self.clone();
        runtime.spawn(async move { engine.perform(settings, ctx, done).await }.instrument(span));
        true
    }

    /// 在当前任务中执行一次完整同步，结束后返回
    pub async fn sync_now_blocking(&self) -> bool {
        let Some((settings, ctx, done)) = self.try_begin() else {
            return false;
        };
        let span = tracing::info_span!("sync", run = %ctx.id);
        self.perform(settings, ctx, done).instrument(span).await;
        true
    }

    /// 检查并占用同步槽位
    fn try_begin(&self) -> Option<(SyncSettings, RunContext, watch::Sender<bool>)> {
        let settings = self.inner.settings.get();
        if !settings.is_configured() {
            error!("无法同步: {}", SyncError::ConfigurationIncomplete);
            return None;
        }

        let mut state = self.lock_state();
        if state.transfer_in_progress {
            warn!("{}", SyncError::AlreadyRunning);
            return None;
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        state.transfer_in_progress = true;
        state.paused = false;
        state.run = Some(RunControl {
            id,
            cancel: cancel.clone(),
            control: control_tx,
            done: done_rx,
            confirm: None,
        });

        Some((
            settings,
            RunContext {
                id,
                cancel,
                control: control_rx,
            },
            done_tx,
        ))
    }

    /// 释放同步槽位，成功时记录同步时间
    fn release(inner: &Inner, id: Uuid, success: bool) {
        let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.run.as_ref().map(|run| run.id) != Some(id) {
            return;
        }
        state.run = None;
        state.transfer_in_progress = false;
        state.paused = false;
        state.phase = SyncPhase::Idle;
        if success {
            state.last_sync = Some(Local::now());
            state.first_sync_completed = true;
        }
    }

    async fn perform(&self, settings: SyncSettings, mut ctx: RunContext, done: watch::Sender<bool>) {
        let id = ctx.id;
        let inner = self.inner.clone();

        // 任何退出路径（包括 panic 和任务被丢弃）都要释放槽位
        let guard = scopeguard::guard(done, move |done| {
            Self::release(&inner, id, false);
            let _ = done.send(true);
        });

        self.inner.observer.on_sync_start();
        let outcome = self.run_pipeline(&settings, &mut ctx).await;

        let done = scopeguard::ScopeGuard::into_inner(guard);
        let (success, message) = match outcome {
            Ok(result) => (true, result.message),
            Err(Abort::Cancelled) => (false, CANCELLED_MESSAGE.to_string()),
            Err(Abort::Failed(message)) => (false, message),
        };
        Self::release(&self.inner, id, success);
        let _ = done.send(true);

        if success {
            info!("同步成功完成");
        } else {
            error!("同步失败: {}", message);
        }
        self.inner.observer.on_sync_complete(success, &message);
    }

    /// 切换阶段，取消中时返回 false
    fn enter_phase(&self, phase: SyncPhase, ctx: &RunContext) -> bool {
        let mut state = self.lock_state();
        if ctx.cancel.is_cancelled() || state.phase == SyncPhase::Cancelling {
            return false;
        }
        state.phase = phase;
        true
    }

    fn executor_for(&self, settings: &SyncSettings) -> TransferExecutor {
        match &settings.rclone_binary {
            Some(binary) => TransferExecutor::with_binary(binary),
            None => self.inner.executor.clone(),
        }
    }

    async fn run_pipeline(
        &self,
        settings: &SyncSettings,
        ctx: &mut RunContext,
    ) -> Result<TransferResult, Abort> {
        let executor = self.executor_for(settings);
        let source = settings.source();
        let destination = settings.local_folder.clone();
        let filters = filter::compile_for(settings);
        if !filters.is_empty() {
            debug!("过滤规则: {:?}", filter::to_args(&filters));
        }

        let first_sync = !self.lock_state().first_sync_completed;
        if first_sync {
            if settings.dry_run_first_sync {
                if !self.enter_phase(SyncPhase::PreflightDryRun, ctx) {
                    return Err(Abort::Cancelled);
                }
                info!("首次同步，先执行 dry-run");
                let request = TransferRequest::new(source.as_str(), destination.as_str())
                    .with_filters(filters.clone())
                    .dry_run(true);
                match self.run_transfer(&executor, &request, ctx).await {
                    Ok(_) => {}
                    Err(Abort::Failed(message)) => {
                        return Err(Abort::Failed(format!("Dry run 失败: {}", message)))
                    }
                    Err(abort) => return Err(abort),
                }
            }
            self.check_size(&executor, settings, &source, &filters, ctx)
                .await?;
        }

        if !self.enter_phase(SyncPhase::Transferring, ctx) {
            return Err(Abort::Cancelled);
        }
        let request = TransferRequest::new(source, destination)
            .with_filters(filters)
            .bandwidth_limit(settings.bandwidth_limit_kbps);
        self.run_transfer(&executor, &request, ctx).await
    }

    /// 首次同步前估算大小，超过阈值时发出警告
    async fn check_size(
        &self,
        executor: &TransferExecutor,
        settings: &SyncSettings,
        source: &str,
        filters: &[FilterRule],
        ctx: &RunContext,
    ) -> Result<(), Abort> {
        if !self.enter_phase(SyncPhase::PreflightSizeCheck, ctx) {
            return Err(Abort::Cancelled);
        }

        let estimate = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Abort::Cancelled),
            result = executor.estimate_size(source, filters) => result,
        };
        let estimate = match estimate {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!("无法估算同步大小，跳过检查: {}", e);
                return Ok(());
            }
        };

        info!(
            "预计同步 {}，共 {} 个文件",
            format_bytes(estimate.bytes),
            estimate.count
        );
        if !settings.confirm_large_sync
            || estimate.size_mb() <= settings.large_sync_threshold_mb as f64
        {
            return Ok(());
        }

        warn!(
            "同步大小 {} 超过阈值 {} MB",
            format_bytes(estimate.bytes),
            settings.large_sync_threshold_mb
        );

        if settings.large_sync_policy == LargeSyncPolicy::Warn {
            self.inner
                .observer
                .on_sync_warning(WarningKind::LargeSync, &estimate.into());
            return Ok(());
        }

        // 先登记确认通道再发警告，保证观察者收到警告时就能确认
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock_state();
            match state.run.as_mut() {
                Some(run) if run.id == ctx.id => run.confirm = Some(tx),
                _ => return Err(Abort::Cancelled),
            }
        }
        self.inner
            .observer
            .on_sync_warning(WarningKind::LargeSync, &estimate.into());
        info!("等待确认大同步");

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Abort::Cancelled),
            decision = rx => match decision {
                Ok(true) => {
                    info!("已确认大同步，继续传输");
                    Ok(())
                }
                _ => Err(Abort::Failed("大同步未获确认，已放弃".to_string())),
            },
        }
    }

    /// 运行一次 rclone sync，转发输出并响应取消和暂停
    async fn run_transfer(
        &self,
        executor: &TransferExecutor,
        request: &TransferRequest,
        ctx: &mut RunContext,
    ) -> Result<TransferResult, Abort> {
        if ctx.cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        let mut handle = executor
            .start(request)
            .await
            .map_err(|e| Abort::Failed(e.to_string()))?;
        debug!(pid = ?handle.pid(), "rclone 已启动");

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    handle.cancel().await;
                    let _ = handle.wait().await;
                    return Err(Abort::Cancelled);
                }
                Some(command) = ctx.control.recv() => match command {
                    ProcessControl::Suspend => {
                        if handle.suspend().await {
                            info!("同步进程已挂起");
                        } else {
                            warn!("无法挂起同步进程，仅标记为暂停");
                        }
                    }
                    ProcessControl::Resume => {
                        if handle.resume().await {
                            info!("同步进程已恢复");
                        }
                    }
                },
                line = handle.next_line() => match line {
                    Some(line) => self.inner.observer.on_sync_progress(&line),
                    None => break,
                },
            }
        }

        match handle.wait().await {
            Ok(result) => Ok(result),
            Err(_) if ctx.cancel.is_cancelled() => Err(Abort::Cancelled),
            Err(e) => Err(Abort::Failed(e.to_string())),
        }
    }

    // ============ 控制 ============

    /// 取消当前同步，等待进程退出后返回
    ///
    /// 没有同步在运行，或超时后同步任务仍未结束时返回 false。
    pub async fn cancel(&self) -> bool {
        let mut done = {
            let mut state = self.lock_state();
            if !state.transfer_in_progress || state.run.is_none() {
                return false;
            }
            state.phase = SyncPhase::Cancelling;
            state.paused = false;
            match state.run.as_ref() {
                Some(run) => {
                    run.cancel.cancel();
                    run.done.clone()
                }
                None => return false,
            }
        };

        info!("正在取消同步");
        let finished = match tokio::time::timeout(CANCEL_TIMEOUT, done.wait_for(|finished| *finished)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => {
                warn!("同步任务未正常结束");
                false
            }
            Err(_) => {
                warn!("等待同步任务结束超时");
                false
            }
        };
        finished
    }

    /// 暂停正在传输的同步
    ///
    /// Unix 上会挂起 rclone 进程，其它平台只标记暂停状态。
    pub fn pause(&self) -> bool {
        let mut state = self.lock_state();
        if state.phase != SyncPhase::Transferring {
            return false;
        }
        let sent = state
            .run
            .as_ref()
            .is_some_and(|run| run.control.send(ProcessControl::Suspend).is_ok());
        if sent {
            state.paused = true;
            state.phase = SyncPhase::Paused;
            info!("同步已暂停");
        }
        sent
    }

    pub fn resume(&self) -> bool {
        let mut state = self.lock_state();
        if state.phase != SyncPhase::Paused {
            return false;
        }
        let sent = state
            .run
            .as_ref()
            .is_some_and(|run| run.control.send(ProcessControl::Resume).is_ok());
        if sent {
            state.paused = false;
            state.phase = SyncPhase::Transferring;
            info!("同步已恢复");
        }
        sent
    }

    /// 回应大同步确认，没有等待中的确认时返回 false
    pub fn confirm_large_sync(&self, proceed: bool) -> bool {
        let sender = self
            .lock_state()
            .run
            .as_mut()
            .and_then(|run| run.confirm.take());
        match sender {
            Some(tx) => tx.send(proceed).is_ok(),
            None => false,
        }
    }
}
