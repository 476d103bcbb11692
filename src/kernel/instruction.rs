//! 进程指令模块
//!
//! 指令是封闭的和类型，统一通过 `execute(process, memory)` 作用于进程与
//! 模拟内存。指令不推进程序计数器，那是执行器的职责。

use super::memory::MemoryManager;
use super::process::{Process, ProcessState};
use crate::utils;

/// 算术操作数：变量名或十进制字面量
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Variable(String),
    /// 字面量按u64保存，执行时超出u16范围的值终止进程
    Literal(u64),
}

/// 进程指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// 声明变量并初始化
    Declare { name: String, value: u16 },
    /// dst = a + b，饱和到 [0, 65535]
    Add { dst: String, a: Operand, b: Operand },
    /// dst = a - b，负值饱和到 0
    Sub { dst: String, a: Operand, b: Operand },
    /// 追加一条日志，支持 `+变量名` 插值
    Print { message: String },
    /// 设置睡眠计数，进程转入 WAITING
    Sleep { ticks: u8 },
}

impl Instruction {
    /// 执行指令
    ///
    /// 可能 (a) 修改进程变量，(b) 通过内存管理器读写内存并触发缺页处理，
    /// (c) 追加进程日志，(d) 设置睡眠计数。
    pub fn execute(&self, process: &mut Process, memory: &mut MemoryManager) {
        match self {
            Instruction::Declare { name, value } => {
                write_variable(process, memory, name, *value);
            }
            Instruction::Add { dst, a, b } => {
                let Some(a) = resolve_operand(process, memory, a) else {
                    return;
                };
                let Some(b) = resolve_operand(process, memory, b) else {
                    return;
                };
                let sum = i32::from(a) + i32::from(b);
                write_variable(process, memory, dst, clamp_u16(sum));
            }
            Instruction::Sub { dst, a, b } => {
                let Some(a) = resolve_operand(process, memory, a) else {
                    return;
                };
                let Some(b) = resolve_operand(process, memory, b) else {
                    return;
                };
                let difference = i32::from(a) - i32::from(b);
                write_variable(process, memory, dst, clamp_u16(difference));
            }
            Instruction::Print { message } => {
                let rendered = interpolate(message, process, memory);
                let line = format!(
                    "  [{}] [Core: {}] {}",
                    utils::log_timestamp(),
                    process.current_core().unwrap_or_default(),
                    rendered
                );
                process.push_log(line);
            }
            Instruction::Sleep { ticks } => {
                if *ticks > 0 {
                    process.set_sleep_ticks(*ticks);
                }
            }
        }
    }
}

/// 饱和转换到u16范围
fn clamp_u16(value: i32) -> u16 {
    value.clamp(0, i32::from(u16::MAX)) as u16
}

/// 写入变量：分配虚拟地址（空间耗尽时静默失败）并写穿到模拟内存
fn write_variable(process: &mut Process, memory: &mut MemoryManager, name: &str, value: u16) {
    let Some(address) = process.ensure_variable_address(name) else {
        return;
    };
    process.cache_variable(name, value);
    memory.write(process, address, value);
}

/// 读取变量：未声明的变量自动声明为0
fn read_variable(process: &mut Process, memory: &mut MemoryManager, name: &str) -> u16 {
    if !process.has_variable(name) {
        write_variable(process, memory, name, 0);
    }
    match process.variable_address(name) {
        Some(address) => memory.read(process, address),
        // 变量空间耗尽，按0处理
        None => 0,
    }
}

/// 解析操作数；返回 None 表示进程已被终止
fn resolve_operand(
    process: &mut Process,
    memory: &mut MemoryManager,
    operand: &Operand,
) -> Option<u16> {
    match operand {
        Operand::Literal(value) => {
            if *value > u64::from(u16::MAX) {
                process.push_log(format!("Operand fault: literal {value} out of range"));
                process.terminate();
                return None;
            }
            Some(*value as u16)
        }
        Operand::Variable(name) => {
            let value = read_variable(process, memory, name);
            if process.state() == ProcessState::Terminated {
                return None;
            }
            Some(value)
        }
    }
}

/// `+变量名` 插值：把消息中的 `+name` 片段替换为变量当前值
fn interpolate(message: &str, process: &mut Process, memory: &mut MemoryManager) -> String {
    let chars: Vec<char> = message.chars().collect();
    let mut out = String::with_capacity(message.len());
    let mut i = 0;
    while i < chars.len() {
        let starts_name = i + 1 < chars.len()
            && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_');
        if chars[i] == '+' && starts_name {
            let mut end = i + 1;
            while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
                end += 1;
            }
            let name: String = chars[i + 1..end].iter().collect();
            out.push_str(&read_variable(process, memory, &name).to_string());
            i = end;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}
