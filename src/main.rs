//! Chips Runtime 命令行入口
//!
//! # 命令概览
//!
//! - `run` - 扫描模块目录、安装并启动全部模块，Ctrl+C 关闭
//! - `list-modules` - 安装并解析模块目录中的模块，打印状态，不启动
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 使用默认配置运行
//! chips-runtime run
//!
//! # 使用自定义配置文件
//! chips-runtime -c my-config.yaml run
//!
//! # 查看模块解析结果
//! chips-runtime -c config.yaml list-modules
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use chips_runtime::{
    LifecycleState, LogGuard, Logger, LoggerConfig, ModuleInfo, ModuleRuntime, RuntimeConfig,
};

/// Chips Runtime - 薯片模块运行时
#[derive(Parser)]
#[command(name = "chips-runtime")]
#[command(version, about = "可插拔模块的运行时", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 开发模式（更详细的日志）
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 运行模块
    ///
    /// 扫描配置的模块目录，安装并启动全部模块。按 Ctrl+C 关闭。
    Run,

    /// 列出模块
    ///
    /// 安装并解析模块目录中的模块，打印每个模块的状态和缺失依赖，不启动任何模块。
    ListModules,

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

fn init_logging(config: &RuntimeConfig, level: Option<&str>) -> chips_runtime::Result<LogGuard> {
    let mut logger_config = LoggerConfig::from_log_config(&config.logging);
    if let Some(level) = level {
        logger_config.level = level.to_string();
    }
    if config.dev_mode {
        logger_config.show_thread_ids = true;
        logger_config.show_file_line = true;
        if level.is_none() {
            logger_config.level = "debug".to_string();
        }
    }
    Logger::init(logger_config)
}

/// 加载配置文件，文件不存在时使用默认配置
async fn load_config(path: &Path, dev_mode: bool) -> chips_runtime::Result<RuntimeConfig> {
    let mut config = if path.exists() {
        RuntimeConfig::from_file(path).await?
    } else {
        RuntimeConfig::default()
    };
    if dev_mode {
        config.dev_mode = true;
    }
    Ok(config)
}

async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = ModuleRuntime::new(config)?;
    let installed = runtime.install_configured_dirs().await?;
    let report = runtime.start_all().await?;

    for (id, error) in &report.failures {
        warn!(module_id = %id, error = %error, "模块启动失败");
    }
    for info in runtime.modules()? {
        if info.state == LifecycleState::Installed {
            warn!(module_id = %info.identity, missing = ?info.missing, "模块未解析");
        }
    }

    println!();
    println!("模块运行时已启动 (Chips Runtime {})", chips_runtime::VERSION);
    println!("  已安装: {}", installed.len());
    println!("  已启动: {}", report.completed.len());
    println!("  失败:   {}", report.failures.len());
    println!("按 Ctrl+C 关闭");
    println!();

    signal::ctrl_c().await?;

    info!("收到关闭信号，正在关闭...");
    let report = runtime.shutdown().await?;
    for (id, error) in &report.failures {
        warn!(module_id = %id, error = %error, "模块未能正常停止");
    }
    Ok(())
}

async fn list_modules(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = ModuleRuntime::new(config)?;
    runtime.install_configured_dirs().await?;
    let modules = runtime.modules()?;
    let start_order = runtime.start_order().await?;
    let pending = runtime.pending_contributions()?;

    println!();
    println!("模块列表");
    println!("═══════════════════════════════════════");
    if modules.is_empty() {
        println!("  （没有找到模块）");
    }
    for info in &modules {
        print_module(info);
    }
    if !start_order.is_empty() {
        println!();
        println!("启动顺序:");
        for (index, id) in start_order.iter().enumerate() {
            println!("  {:>3}. {}", index + 1, id);
        }
    }
    if !pending.is_empty() {
        println!();
        println!("等待目标的贡献:");
        for (target, extensions) in &pending {
            for extension in extensions {
                println!("  {} -> {} ({})", extension.contributor, target, extension.point);
            }
        }
    }
    println!("═══════════════════════════════════════");
    println!();

    runtime.shutdown().await?;
    Ok(())
}

fn print_module(info: &ModuleInfo) {
    println!("  {:<32} {}", info.identity.to_string(), info.state);
    if let Some(ref host) = info.fragment_host {
        println!("      片段宿主: {}", host);
    }
    if !info.missing.is_empty() {
        let missing: Vec<String> = info.missing.iter().map(ToString::to_string).collect();
        println!("      缺失依赖: {}", missing.join(", "));
    }
    if let Some(ref location) = info.location {
        println!("      位置:     {}", location);
    }
}

async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&RuntimeConfig::default());
        return Ok(());
    }

    match RuntimeConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {} ({})", e, e.error_code());
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &RuntimeConfig) {
    let yes_no = |flag: bool| if flag { "是" } else { "否" };
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [生命周期]");
    println!("    钩子超时:       {} ms", config.lifecycle.hook_timeout_ms);
    println!("    关闭截止时间:   {} ms", config.lifecycle.shutdown_timeout_ms);
    println!();
    println!("  [事件]");
    println!("    监听器队列:     {}", config.events.listener_queue_size);
    println!("    回调超时:       {} ms", config.events.handler_timeout_ms);
    println!();
    println!("  [编排循环]");
    println!("    命令队列:       {}", config.kernel.command_queue_size);
    println!();
    println!("  [模块]");
    println!("    模块目录:       {:?}", config.modules.module_dirs);
    println!("    黑名单:         {:?}", config.modules.blacklist);
    println!("    自动启动:       {}", yes_no(config.modules.auto_start));
    println!();
    println!("  [日志]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", yes_no(config.logging.file_output));
    println!("    JSON 格式:      {}", yes_no(config.logging.json_format));
    println!();
    println!("  开发模式:         {}", yes_no(config.dev_mode));
    println!("────────────────────────────────────────");
}

fn print_version() {
    println!();
    println!("Chips Runtime - 薯片模块运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_runtime::VERSION);
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => print_version(),
        Some(Commands::CheckConfig { config }) => {
            let path = config.unwrap_or(cli.config);
            check_config(&path).await?;
        }
        Some(Commands::ListModules) => {
            let config = load_config(&cli.config, cli.dev).await?;
            let _guard = init_logging(&config, cli.log_level.as_deref())?;
            list_modules(config).await?;
        }
        Some(Commands::Run) | None => {
            let config = load_config(&cli.config, cli.dev).await?;
            let _guard = init_logging(&config, cli.log_level.as_deref())?;
            info!(config = %cli.config.display(), "启动模块运行时");
            run(config).await?;
        }
    }

    Ok(())
}
