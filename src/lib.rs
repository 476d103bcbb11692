//! CSOPESY 操作系统模拟器库
//!
//! 模拟一颗多核CPU在可配置调度器下运行若干合成用户进程，
//! 带分页虚拟内存子系统和小型进程指令集。

pub mod config;
pub mod kernel;
pub mod shell;
pub mod utils;

use anyhow::Result;
use clap::Parser;
use kernel::{Kernel, KernelOptions};
use std::sync::Arc;
use std::thread;

/// CSOPESY 操作系统模拟器
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.txt")]
    pub config: String,

    /// RR抢占时释放进程页框（默认保留到进程终止）
    #[arg(long)]
    pub release_frames_on_preempt: bool,

    /// 进程生成器随机种子（默认从系统熵获取）
    #[arg(long)]
    pub seed: Option<u64>,
}

/// 创建内核、启动内核线程并在当前线程运行shell，直到退出
pub fn build_kernel_run_blocking(args: Args) -> Result<()> {
    let kernel = Arc::new(Kernel::new(KernelOptions {
        release_frames_on_preempt: args.release_frames_on_preempt,
        seed: args.seed,
    }));

    // 内核线程拥有tick主循环；shell在当前线程与用户交互
    let kernel_thread = {
        let kernel = Arc::clone(&kernel);
        thread::Builder::new()
            .name("kernel".to_string())
            .spawn(move || kernel.run())?
    };

    let shell_result = shell::Shell::new(Arc::clone(&kernel), args.config).run_interactive();

    // shell退出（exit命令或EOF）即请求关机并等待内核线程结束
    kernel.shutdown();
    kernel_thread
        .join()
        .map_err(|_| anyhow::anyhow!("内核线程异常退出"))?;

    shell_result
}
