use std::io::{Read, SeekFrom, Write};
use std::path::PathBuf;
use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use mirrorfs::config::{MirrorConfig, DEFAULT_DIRS};
use mirrorfs::fs::{Context, OpenFlags};
use mirrorfs::lock::BackendLock;
use mirrorfs::mirror::MirrorFs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, error};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Apply filesystem changes to a set of mirrored directories", long_about = None)]
struct Args {
    /// 逗号分隔的后端目录，第一个为主目录
    #[arg(short, long, default_value = DEFAULT_DIRS)]
    dirs: String,

    /// JSON 配置文件，优先于 --dirs
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 运行前强制清理已有的锁文件
    #[arg(long, default_value = "false")]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 在所有后端创建目录
    Mkdir {
        path: PathBuf,
        /// 八进制权限位
        #[arg(short, long, default_value = "755")]
        mode: String,
    },
    /// 从所有后端删除文件或目录树
    Rm { path: PathBuf },
    /// 在所有后端重命名
    Mv { from: PathBuf, to: PathBuf },
    /// 将 --input 或标准输入写入所有后端
    Put {
        path: PathBuf,
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// 从主目录输出文件内容
    Cat { path: PathBuf },
    /// 显示主目录中的元数据
    Stat { path: PathBuf },
    /// 列出主目录中的目录项
    Ls {
        #[arg(default_value = "/")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    // 初始化日志系统
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => MirrorConfig::load(path)?,
        None => MirrorConfig::from_dirs(&args.dirs)?,
    };
    info!("主目录: {:?}", config.backends[0]);
    info!("镜像目录: {:?}", &config.backends[1..]);

    let fs = config.open()?;
    let mut lock = BackendLock::new(&config.backends);
    if args.force {
        lock.force_lock()?;
    } else {
        lock.try_lock()?;
    }

    // 中断信号取消当前请求，已完成的后端仍会被回滚
    let token = CancellationToken::new();
    let ctx = Context::with_token(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("接收到中断信号，取消当前操作...");
            token.cancel();
        }
    });

    let result = execute(&fs, &ctx, args.command).await;
    lock.unlock()?;
    result
}

async fn execute(fs: &MirrorFs, ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Mkdir { path, mode } => {
            let permissions = u32::from_str_radix(&mode, 8)
                .with_context(|| format!("invalid mode {:?}", mode))?;
            fs.create_directory(ctx, &path, permissions).await?;
            info!("已创建目录: {:?}", path);
        }
        Command::Rm { path } => {
            fs.remove_all(ctx, &path).await?;
            info!("已删除: {:?}", path);
        }
        Command::Mv { from, to } => {
            fs.rename(ctx, &from, &to).await?;
            info!("已重命名: {:?} -> {:?}", from, to);
        }
        Command::Put { path, input } => {
            let data = match input {
                Some(input) => std::fs::read(&input).with_context(|| format!("reading {:?}", input))?,
                None => {
                    let mut data = Vec::new();
                    std::io::stdin().read_to_end(&mut data)?;
                    data
                }
            };
            let flags = OpenFlags::write_only().create().truncate();
            let file = fs.open_file(ctx, &path, flags, 0o644).await?;
            let written = write_all(&file, &data).await;
            let closed = file.close().await;
            written?;
            closed?;
            info!("已写入 {} 字节到 {:?}", data.len(), path);
        }
        Command::Cat { path } => {
            let file = fs.open_file(ctx, &path, OpenFlags::read_only(), 0).await?;
            let mut stdout = std::io::stdout().lock();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
            }
            file.close().await?;
        }
        Command::Stat { path } => {
            let meta = fs.stat(ctx, &path).await?;
            println!(
                "{}\t{}\t{:o}\t{}",
                meta.name,
                if meta.is_dir { "dir" } else { "file" },
                meta.permissions,
                meta.size
            );
        }
        Command::Ls { path } => {
            let dir = fs.open_file(ctx, &path, OpenFlags::read_only(), 0).await?;
            if !dir.stat().await?.is_dir {
                dir.close().await?;
                bail!("{:?} is not a directory", path);
            }
            for entry in dir.read_dir(0).await? {
                let suffix = if entry.is_dir { "/" } else { "" };
                println!("{}{}", entry.name, suffix);
            }
            dir.close().await?;
        }
    }
    Ok(())
}

async fn write_all(file: &mirrorfs::MirrorFile, mut data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(0)).await?;
    while !data.is_empty() {
        let n = file.write(data).await?;
        data = &data[n..];
    }
    Ok(())
}
