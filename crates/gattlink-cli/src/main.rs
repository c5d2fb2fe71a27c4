//! Gattlink CLI
//!
//! 命令行宿主程序：扫描、发送、作为外设提供服务，或在内存中演示完整流程

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gattlink_core::{LogLevel, TransportSettings};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gattlink", version, about = "BLE GATT 双向消息传输")]
struct Cli {
    /// 以 JSON 行输出事件
    #[arg(long, global = true)]
    json: bool,

    /// 更详细的日志 (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描广播服务 UUID 的设备
    Scan {
        /// 扫描超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// 连接外设并发送一条消息
    Send {
        /// 目标设备地址
        address: String,
        /// 消息内容
        message: String,
        /// 等待回复的时间 (秒)
        #[arg(short, long)]
        wait_reply: Option<u64>,
    },
    /// 作为外设广播并接收消息
    Serve {
        /// 把收到的消息原样 indication 回去
        #[arg(long)]
        echo: bool,
    },
    /// 不使用硬件，在内存中连接两个角色
    Loopback {
        /// 消息内容
        message: String,
        /// 模拟链路支持的最大 MTU
        #[arg(long, default_value = "185")]
        mtu: u16,
    },
    /// 查看或初始化配置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印当前生效的配置
    Show,
    /// 写入默认配置文件
    Init {
        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(level: LogLevel) {
    // 桥接 log crate（gattlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = TransportSettings::load();

    let level = (0..cli.verbose).fold(settings.log_level, |level, _| level.more_verbose());
    init_logging(level);
    tracing::debug!("Settings: {:?}", settings);

    match cli.command {
        Commands::Scan { timeout } => commands::scan(settings, timeout, cli.json).await?,
        Commands::Send {
            address,
            message,
            wait_reply,
        } => commands::send(settings, address, message, wait_reply, cli.json).await?,
        Commands::Serve { echo } => commands::serve(settings, echo, cli.json).await?,
        Commands::Loopback { message, mtu } => {
            commands::loopback(settings, message, mtu, cli.json).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&settings)?,
            ConfigAction::Init { force } => commands::config_init(force)?,
        },
    }

    Ok(())
}
