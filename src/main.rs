use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cloudsync_lib::config::default_config_dir;
use cloudsync_lib::core::{filter, ChannelObserver, FolderNode, SyncEvent};
use cloudsync_lib::logging::init_logging;
use cloudsync_lib::utils::format_bytes;
use cloudsync_lib::{AppContext, LargeSyncPolicy, SyncOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "cloudsync")]
#[command(about = "基于 rclone 的无人值守目录同步", long_about = None)]
struct Cli {
    /// 配置目录，默认使用系统配置目录
    #[arg(long, global = true, env = "CLOUDSYNC_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// 同时把日志输出到终端
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 立即同步一次
    Sync {
        /// 超过大小阈值时不询问，直接继续
        #[arg(short, long)]
        yes: bool,
    },
    /// 按配置的间隔自动同步，Ctrl-C 退出
    Daemon {
        #[arg(short, long)]
        yes: bool,
    },
    /// 以 JSON 输出当前状态
    Status,
    /// 检查 rclone 安装情况和远程连接
    Check,
    /// 列出已配置的 rclone 远程
    Remotes,
    /// 列出远程目录下的文件夹
    Folders {
        remote: String,
        #[arg(default_value = "")]
        path: String,
        /// 递归列出文件夹树，最多 N 层（从远程根目录开始）
        #[arg(long, value_name = "N")]
        depth: Option<usize>,
    },
    /// 输出当前设置生成的过滤参数
    Filters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("无法创建配置目录 {:?}", config_dir))?;
    init_logging(&config_dir, cli.verbose);

    let (observer, events) = ChannelObserver::new();
    let ctx = AppContext::new(Some(&config_dir), Arc::new(observer))?;

    match cli.command {
        Commands::Sync { yes } => run_once(&ctx, events, yes).await,
        Commands::Daemon { yes } => run_daemon(&ctx, events, yes).await,
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&ctx.orchestrator.get_status())?);
            Ok(())
        }
        Commands::Check => check(&ctx).await,
        Commands::Remotes => {
            for remote in ctx.executor.list_remotes().await? {
                println!("{}", remote);
            }
            Ok(())
        }
        Commands::Folders {
            remote,
            path,
            depth: Some(depth),
        } => {
            if !path.is_empty() {
                bail!("--depth 只能从远程根目录开始列出");
            }
            print_tree(&ctx.executor.folder_tree(&remote, depth).await?, 0);
            Ok(())
        }
        Commands::Folders { remote, path, .. } => {
            for folder in ctx.executor.list_folders(&remote, &path).await? {
                println!("{}", folder.path);
            }
            Ok(())
        }
        Commands::Filters => {
            for arg in filter::to_args(&filter::compile_for(&ctx.settings.get())) {
                println!("{}", arg);
            }
            Ok(())
        }
    }
}

async fn run_once(
    ctx: &AppContext,
    events: UnboundedReceiver<SyncEvent>,
    auto_confirm: bool,
) -> anyhow::Result<()> {
    let printer = EventPrinter {
        engine: ctx.orchestrator.clone(),
        auto_confirm,
        until_complete: true,
        notify: true,
    };
    let printer = tokio::spawn(printer.run(events));

    if !ctx.orchestrator.sync_now_blocking().await {
        printer.abort();
        bail!("无法开始同步：未完成配置或已有同步在运行");
    }

    match printer.await? {
        Some(true) => Ok(()),
        _ => bail!("同步未成功完成"),
    }
}

async fn run_daemon(
    ctx: &AppContext,
    events: UnboundedReceiver<SyncEvent>,
    auto_confirm: bool,
) -> anyhow::Result<()> {
    let settings = ctx.settings.get();
    if !settings.auto_sync_enabled {
        bail!("自动同步未开启，请在 config.json 中设置 auto_sync_enabled = true");
    }

    let printer = EventPrinter {
        engine: ctx.orchestrator.clone(),
        auto_confirm,
        until_complete: false,
        notify: settings.notifications_enabled,
    };
    let printer = tokio::spawn(printer.run(events));

    if !ctx.start_auto_sync_if_enabled() {
        printer.abort();
        bail!("无法启动自动同步：请先配置远程和本地目录");
    }
    let interval = ctx.settings.get().sync_interval_minutes.max(1);
    println!("自动同步已启动，每 {} 分钟一次，按 Ctrl-C 退出", interval);

    tokio::signal::ctrl_c().await?;
    println!("正在退出...");
    ctx.cleanup().await;
    printer.abort();
    Ok(())
}

/// 打印同步事件
struct EventPrinter {
    engine: SyncOrchestrator,
    auto_confirm: bool,
    /// 第一次完成事件后返回结果
    until_complete: bool,
    /// 是否提示开始和结束
    notify: bool,
}

impl EventPrinter {
    async fn run(self, mut events: UnboundedReceiver<SyncEvent>) -> Option<bool> {
        while let Some(event) = events.recv().await {
            if let Some(success) = self.handle(event) {
                if self.until_complete {
                    return Some(success);
                }
            }
        }
        None
    }

    /// 返回完成事件的结果
    fn handle(&self, event: SyncEvent) -> Option<bool> {
        match event {
            SyncEvent::Start => {
                if self.notify {
                    println!("开始同步");
                }
            }
            SyncEvent::Progress { line } => println!("{}", line),
            SyncEvent::Warning { kind, data } => {
                println!(
                    "警告 [{}]: 本次同步约 {}，共 {} 个文件",
                    kind.as_str(),
                    format_bytes(data.size_bytes),
                    data.file_count
                );
                // 只有 confirm 策略会等待确认
                if self.engine.confirm_large_sync(self.auto_confirm) {
                    if self.auto_confirm {
                        println!("已自动确认，继续同步");
                    } else {
                        println!("需要确认大同步，使用 --yes 继续");
                    }
                }
            }
            SyncEvent::Complete { success, message } => {
                if success {
                    if self.notify {
                        println!("完成: {}", message);
                    }
                } else {
                    eprintln!("失败: {}", message);
                }
                return Some(success);
            }
        }
        None
    }
}

fn print_tree(nodes: &[FolderNode], level: usize) {
    for node in nodes {
        println!("{}{}", "  ".repeat(level), node.name);
        print_tree(&node.children, level + 1);
    }
}

async fn check(ctx: &AppContext) -> anyhow::Result<()> {
    match ctx.executor.version().await {
        Some(version) => println!("rclone 版本: {}", version),
        None => bail!("{}", cloudsync_lib::SyncError::ExecutableNotFound),
    }

    let settings = ctx.settings.get();
    if !settings.is_configured() {
        println!("尚未配置远程和本地目录");
        return Ok(());
    }
    if settings.large_sync_policy == LargeSyncPolicy::Confirm {
        println!("大同步需要确认（阈值 {} MB）", settings.large_sync_threshold_mb);
    }

    let remote = settings.remote_name();
    if !ctx.executor.remote_exists(remote).await? {
        bail!("rclone 中没有名为 {} 的远程", remote);
    }
    match ctx.executor.remote_type(remote).await {
        Some(kind) => println!("远程 {} 类型: {}", remote, kind),
        None => println!("无法读取远程 {} 的类型", remote),
    }

    let (ok, message) = ctx.executor.test_remote(remote).await;
    println!("{}", message);
    if !ok {
        bail!("远程 {} 不可用", remote);
    }
    Ok(())
}
