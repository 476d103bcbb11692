//! 系统配置模块
//!
//! 配置文件为空白分隔的 `键 值` 文本（原版 `config.txt` 格式）。
//! 无法识别的键发出警告并跳过其值；非法的值发出警告并回退到该字段的默认值，
//! 启动过程永不因配置错误而中止。

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

/// 调度算法类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerType {
    Fcfs,
    RoundRobin,
}

impl SchedulerType {
    /// 解析 `fcfs` / `rr`，容忍包裹的引号
    fn parse(value: &str) -> Option<SchedulerType> {
        match value.trim_matches('"') {
            "fcfs" => Some(SchedulerType::Fcfs),
            "rr" => Some(SchedulerType::RoundRobin),
            _ => None,
        }
    }
}

/// 系统配置参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// CPU核心数
    pub num_cpus: u32,
    /// 调度算法
    pub scheduler: SchedulerType,
    /// RR时间片长度（tick数）
    pub quantum_cycles: u32,
    /// 每多少个tick生成一个虚拟进程
    pub batch_process_freq: u64,
    /// 虚拟进程最少指令数
    pub min_instructions: u32,
    /// 虚拟进程最多指令数
    pub max_instructions: u32,
    /// 相邻两次指令执行之间的延迟tick数
    pub delays_per_exec: u64,
    /// 物理内存总量（字节）
    pub max_overall_mem: u32,
    /// 每个页框的大小（字节）
    pub mem_per_frame: u32,
    /// 进程内存需求下限（字节）
    pub min_mem_per_proc: u32,
    /// 进程内存需求上限（字节）
    pub max_mem_per_proc: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            scheduler: SchedulerType::RoundRobin,
            quantum_cycles: 5,
            batch_process_freq: 1,
            min_instructions: 1000,
            max_instructions: 2000,
            delays_per_exec: 0,
            max_overall_mem: 16384,
            mem_per_frame: 16,
            min_mem_per_proc: 64,
            max_mem_per_proc: 128,
        }
    }
}

/// 内存容量参数的合法区间：2的幂且在 [64, 65536] 内
fn is_valid_mem_size(value: u32) -> bool {
    value.is_power_of_two() && (64..=65536).contains(&value)
}

/// 页框大小的合法区间：2的幂且在 [16, 65536] 内
fn is_valid_frame_size(value: u32) -> bool {
    value.is_power_of_two() && (16..=65536).contains(&value)
}

impl SystemConfig {
    /// 从配置文件读取配置
    pub fn load(path: impl AsRef<Path>) -> Result<SystemConfig> {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Ok(Self::parse(&text))
    }

    /// 解析配置文本，逐字段校验并回退默认值
    pub fn parse(text: &str) -> SystemConfig {
        let defaults = SystemConfig::default();
        let mut config = defaults.clone();
        let mut tokens = text.split_whitespace();

        while let Some(key) = tokens.next() {
            let Some(value) = tokens.next() else {
                warn!(key, "配置键缺少对应的值");
                break;
            };
            match key {
                "num-cpu" => match value.parse::<u32>() {
                    Ok(n) if n > 0 => config.num_cpus = n,
                    _ => warn!(key, value, "无效的CPU数量，保留默认值"),
                },
                "scheduler" => match SchedulerType::parse(value) {
                    Some(s) => config.scheduler = s,
                    None => warn!(key, value, "未知的调度算法，保留默认值"),
                },
                "quantum-cycles" => match value.parse::<u32>() {
                    Ok(n) if n >= 1 => config.quantum_cycles = n,
                    _ => warn!(key, value, "无效的时间片长度，保留默认值"),
                },
                "batch-process-freq" => match value.parse::<u64>() {
                    Ok(n) if n >= 1 => config.batch_process_freq = n,
                    _ => warn!(key, value, "无效的进程生成频率，保留默认值"),
                },
                "min-ins" => match value.parse::<u32>() {
                    Ok(n) if n >= 1 => config.min_instructions = n,
                    _ => warn!(key, value, "无效的最少指令数，保留默认值"),
                },
                "max-ins" => match value.parse::<u32>() {
                    Ok(n) if n >= 1 => config.max_instructions = n,
                    _ => warn!(key, value, "无效的最多指令数，保留默认值"),
                },
                "delay-per-exec" => match value.parse::<u64>() {
                    Ok(n) => config.delays_per_exec = n,
                    _ => warn!(key, value, "无效的执行延迟，保留默认值"),
                },
                "max-overall-mem" => match value.parse::<u32>() {
                    Ok(n) if is_valid_mem_size(n) => config.max_overall_mem = n,
                    _ => warn!(key, value, "无效的物理内存总量，保留默认值"),
                },
                "mem-per-frame" => match value.parse::<u32>() {
                    Ok(n) if is_valid_frame_size(n) => config.mem_per_frame = n,
                    _ => warn!(key, value, "无效的页框大小，保留默认值"),
                },
                "min-mem-per-proc" => match value.parse::<u32>() {
                    Ok(n) if is_valid_mem_size(n) => config.min_mem_per_proc = n,
                    _ => warn!(key, value, "无效的进程内存下限，保留默认值"),
                },
                "max-mem-per-proc" => match value.parse::<u32>() {
                    Ok(n) if is_valid_mem_size(n) => config.max_mem_per_proc = n,
                    _ => warn!(key, value, "无效的进程内存上限，保留默认值"),
                },
                _ => {
                    warn!(key, value, "未知的配置项，已跳过");
                }
            }
        }

        // 跨字段约束：违反时该组字段整体回退默认值
        if config.min_instructions > config.max_instructions {
            warn!(
                min = config.min_instructions,
                max = config.max_instructions,
                "指令数区间无效，回退默认区间"
            );
            config.min_instructions = defaults.min_instructions;
            config.max_instructions = defaults.max_instructions;
        }
        if config.min_mem_per_proc > config.max_mem_per_proc {
            warn!(
                min = config.min_mem_per_proc,
                max = config.max_mem_per_proc,
                "进程内存区间无效，回退默认区间"
            );
            config.min_mem_per_proc = defaults.min_mem_per_proc;
            config.max_mem_per_proc = defaults.max_mem_per_proc;
        }
        if config.mem_per_frame > config.max_overall_mem {
            warn!(
                frame = config.mem_per_frame,
                total = config.max_overall_mem,
                "页框大于物理内存总量，回退默认页框大小"
            );
            config.mem_per_frame = defaults.mem_per_frame;
        }

        config
    }
}
