use anyhow::Result;
use clap::Parser;
use csopesy::{build_kernel_run_blocking, Args};
use tracing::{info, Level};
use tracing_subscriber::{self, EnvFilter};

fn main() -> Result<()> {
    // 初始化日志；写到stderr避免与shell交互输出混在一起
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false) // 不显示目标模块
        .with_thread_names(true) // 显示线程名称
        .with_writer(std::io::stderr)
        .init();

    // 解析命令行参数
    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "启动CSOPESY操作系统模拟器");
    info!(config = %args.config, "配置文件路径");

    build_kernel_run_blocking(args)
}
