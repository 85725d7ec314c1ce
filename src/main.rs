use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tg_relay::client::{channel_id_variants, parse_chat_ref};
use tg_relay::{logging, AppConfig, ProgressKey, ProgressStore};
use tracing::info;

/// tg-relay 维护工具
#[derive(Debug, Parser)]
#[command(name = "tg-relay", version, about = "频道转发进度与配置维护工具")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 进度管理
    Progress {
        #[command(subcommand)]
        action: ProgressAction,
    },
    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// 解析会话链接 / ID / 用户名
    Link {
        reference: String,
    },
}

#[derive(Debug, Subcommand)]
enum ProgressAction {
    /// 列出所有进度
    List,
    /// 查看指定源/目标的进度
    Show {
        #[arg(allow_negative_numbers = true)]
        source: i64,
        #[arg(allow_negative_numbers = true)]
        target: i64,
    },
    /// 清除指定源/目标的进度
    Clear {
        #[arg(allow_negative_numbers = true)]
        source: i64,
        #[arg(allow_negative_numbers = true)]
        target: i64,
    },
    /// 删除长时间未更新的进度
    Cleanup {
        /// 天数（默认取配置 persistence.retention_days）
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// 写入默认配置
    Init {
        /// 覆盖已有配置
        #[arg(long)]
        force: bool,
    },
    /// 打印当前配置
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        return init_config(&cli.config, *force).await;
    }

    let config = AppConfig::load_or_default(&cli.config).await;
    let _log_guard = logging::init_logging(&config.log);
    info!("使用配置文件: {:?}", cli.config);

    match cli.command {
        Commands::Progress { action } => run_progress(&config, action).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let content = toml::to_string_pretty(&config).context("序列化配置失败")?;
                println!("{}", content);
                Ok(())
            }
            ConfigAction::Init { .. } => Ok(()),
        },
        Commands::Link { reference } => {
            match parse_chat_ref(&reference) {
                Some(chat_ref) => {
                    let normalized = chat_ref.to_string();
                    println!("{}", normalized);
                    for variant in channel_id_variants(&normalized).into_iter().skip(1) {
                        println!("  变体: {}", variant);
                    }
                }
                None => anyhow::bail!("无法解析会话引用: {}", reference),
            }
            Ok(())
        }
    }
}

async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("配置文件已存在: {:?}（使用 --force 覆盖）", path);
    }
    AppConfig::default()
        .save_to_file(path)
        .await
        .with_context(|| format!("写入默认配置失败: {:?}", path))?;
    println!("已写入默认配置: {}", path.display());
    Ok(())
}

async fn run_progress(config: &AppConfig, action: ProgressAction) -> Result<()> {
    let store = ProgressStore::with_max_items(
        &config.persistence.progress_dir,
        config.persistence.max_progress_items,
    );

    match action {
        ProgressAction::List => {
            let records = store.list_all().context("读取进度目录失败")?;
            if records.is_empty() {
                println!("暂无进度记录");
            }
            for (name, record) in records {
                println!(
                    "{:<40} 已发送 {:>6}  跳过 {:>6}  游标 {:>8}  更新于 {}",
                    name,
                    record.total_sent,
                    record.total_skipped,
                    record.last_message_id,
                    record
                        .last_updated
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        ProgressAction::Show { source, target } => {
            let key = ProgressKey::pair(source, target);
            let record = store.load(&key).await;
            let json = serde_json::to_string_pretty(&record).context("序列化进度失败")?;
            println!("{}", json);
        }
        ProgressAction::Clear { source, target } => {
            let key = ProgressKey::pair(source, target);
            if store.clear(&key).await? {
                println!("已清除进度: {}", key);
            } else {
                println!("进度不存在: {}", key);
            }
        }
        ProgressAction::Cleanup { days } => {
            let days = days.unwrap_or(config.persistence.retention_days);
            let removed = store.cleanup_older_than(days)?;
            println!("已删除 {} 个超过 {} 天未更新的进度文件", removed, days);
        }
    }
    Ok(())
}
