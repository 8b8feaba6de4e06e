//! HFM Drop CLI
//!
//! 命令行工具: 查看描述文件、在进程内回环演示一次完整传输

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hfmdrop_core::{
    ChannelSink, DropSettings, MemoryEngine, SessionSlot, Swarm, TransferController,
    TransferNotification,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hfmdrop", version, about = "HFM Drop - P2P 文件互传")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 生成描述并以 JSON 输出
    Inspect {
        /// 文件路径
        file: PathBuf,
    },
    /// 在本进程内做种并下载同一文件
    Loopback {
        /// 要发送的文件路径
        file: PathBuf,
        /// 保存目录 (默认: 设置中的下载目录)
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// 请求 ID (默认随机生成)
        #[arg(long)]
        id: Option<String>,
    },
    /// 查看设置
    Config {
        /// 写入默认设置文件
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（hfmdrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hfmdrop_core=debug")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let settings = DropSettings::load();
    tracing::debug!("Settings: {:?}", settings);

    match cli.command {
        Commands::Inspect { file } => inspect(&settings, &file)?,
        Commands::Loopback { file, out, id } => {
            let out = out.unwrap_or_else(|| settings.download_dir.clone());
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            loopback(&settings, &file, &out, &id).await?;
        }
        Commands::Config { init } => {
            if init {
                DropSettings::default().save()?;
                println!("💾 已写入默认设置");
            }
            println!("📄 {}", DropSettings::config_path().display());
            println!("{settings:#?}");
        }
    }

    Ok(())
}

fn inspect(settings: &DropSettings, file: &Path) -> Result<()> {
    let descriptor = settings
        .descriptor_builder()
        .describe(file)
        .with_context(|| format!("cannot describe {}", file.display()))?;

    let summary = serde_json::json!({
        "name": descriptor.name,
        "length": descriptor.length,
        "pieceLength": descriptor.piece_length,
        "pieceCount": descriptor.piece_count(),
        "private": descriptor.private,
        "createdBy": descriptor.created_by,
        "contentId": descriptor.content_id(),
        "locator": descriptor.locator(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn loopback(settings: &DropSettings, file: &Path, out: &Path, id: &str) -> Result<()> {
    if let Some(name) = file.file_name()
        && out.join(name).exists()
    {
        bail!("{} already exists", out.join(name).display());
    }

    let swarm = Swarm::new();
    let tick = settings.tick_interval();

    // 发送端通过槽位创建，演示组合根用法
    let slot = SessionSlot::new();
    let (sender_sink, _sender_events) = ChannelSink::new();
    let sender = slot.get_or_start(|| {
        TransferController::start(
            Arc::new(MemoryEngine::with_tick_interval(swarm.clone(), tick)),
            Arc::new(sender_sink),
            settings,
        )
    })?;

    let (receiver_sink, mut events) = ChannelSink::new();
    let receiver = TransferController::start(
        Arc::new(MemoryEngine::with_tick_interval(swarm.clone(), tick)),
        Arc::new(receiver_sink),
        settings,
    )?;

    println!("📤 发送文件: {}", file.display());
    let locator = sender.start_seeding(file, &format!("{id}-send")).await?;
    println!("🔗 {locator}");

    println!("📥 接收到: {}", out.display());
    receiver.start_download(&locator, out, id).await?;

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TransferNotification::Progress(p)) => {
                    println!("   {} {:>3}% ({})", p.phase_label, p.percent, p.detail_label);
                }
                Some(TransferNotification::Completed(_)) => break Ok(()),
                Some(TransferNotification::Error(e)) => break Err(e.message),
                None => break Err("notification channel closed".to_string()),
            },
            _ = tokio::signal::ctrl_c() => {
                println!("⏹️  已取消");
                receiver.cancel_transfer(id);
                break Ok(());
            }
        }
    };

    receiver.stop_session();
    slot.stop_session();

    match outcome {
        Ok(()) => {
            println!("✅ 传输完成");
            Ok(())
        }
        Err(message) => bail!("❌ 传输失败: {message}"),
    }
}
