//! 虚拟进程生成模块
//!
//! 生成器负责为批量生成的虚拟进程合成随机指令流；
//! `parse_program` 负责把 `screen -c` 提交的原始指令文本解析成指令流。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use super::instruction::{Instruction, Operand};

/// 虚拟进程操作数的固定变量名池
const VARIABLE_NAME_POOL: [&str; 7] = ["a", "b", "c", "x", "y", "counter", "temp"];

/// 虚拟进程指令流生成器
#[derive(Debug)]
pub struct ProcessGenerator {
    rng: StdRng,
}

impl ProcessGenerator {
    /// 创建生成器；给定种子时生成序列完全确定
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// 在 [min, max] 内均匀抽取指令条数
    pub fn instruction_count(&mut self, min: u32, max: u32) -> u32 {
        self.rng.gen_range(min..=max)
    }

    /// 在 [min, max] 内均匀抽取进程内存需求
    pub fn memory_required(&mut self, min: u32, max: u32) -> u32 {
        self.rng.gen_range(min..=max)
    }

    /// 合成指定条数的随机指令流
    pub fn instructions(&mut self, count: u32, process_name: &str) -> Vec<Instruction> {
        (0..count).map(|_| self.instruction(process_name)).collect()
    }

    /// 每个指令槽位独立均匀抽取指令种类
    fn instruction(&mut self, process_name: &str) -> Instruction {
        match self.rng.gen_range(0..5) {
            0 => Instruction::Add {
                dst: self.variable_name(),
                a: self.operand(),
                b: self.operand(),
            },
            1 => Instruction::Print {
                message: format!("Hello world from {process_name}!"),
            },
            2 => Instruction::Declare {
                name: self.variable_name(),
                value: self.rng.gen(),
            },
            3 => Instruction::Sub {
                dst: self.variable_name(),
                a: self.operand(),
                b: self.operand(),
            },
            _ => Instruction::Sleep {
                ticks: self.rng.gen_range(1u8..=255),
            },
        }
    }

    fn variable_name(&mut self) -> String {
        VARIABLE_NAME_POOL[self.rng.gen_range(0..VARIABLE_NAME_POOL.len())].to_string()
    }

    /// 操作数各以1/2概率为变量名或字面量
    fn operand(&mut self) -> Operand {
        if self.rng.gen_bool(0.5) {
            Operand::Variable(self.variable_name())
        } else {
            Operand::Literal(u64::from(self.rng.gen::<u16>()))
        }
    }
}

/// 原始指令文本解析错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("指令流为空")]
    EmptyProgram,
    #[error("未知指令: {0}")]
    UnknownInstruction(String),
    #[error("指令 {0} 的参数数量错误")]
    WrongArity(String),
    #[error("无效的数值参数: {0}")]
    InvalidValue(String),
}

/// 解析分号分隔的原始指令文本
///
/// 任何一行解析失败都使整个程序被拒绝，不会创建只执行了一半校验的进程。
pub fn parse_program(raw: &str) -> Result<Vec<Instruction>, ParseError> {
    let mut instructions = Vec::new();
    for segment in raw.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        instructions.push(parse_line(segment)?);
    }
    if instructions.is_empty() {
        return Err(ParseError::EmptyProgram);
    }
    Ok(instructions)
}

fn parse_line(line: &str) -> Result<Instruction, ParseError> {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next().ok_or(ParseError::EmptyProgram)?;
    match keyword {
        "DECLARE" => {
            let (name, value) = two_args(tokens, "DECLARE")?;
            let value = value
                .parse::<u16>()
                .map_err(|_| ParseError::InvalidValue(value))?;
            Ok(Instruction::Declare { name, value })
        }
        "ADD" => {
            let (dst, a, b) = three_args(tokens, "ADD")?;
            Ok(Instruction::Add { dst, a: parse_operand(&a), b: parse_operand(&b) })
        }
        "SUBTRACT" => {
            let (dst, a, b) = three_args(tokens, "SUBTRACT")?;
            Ok(Instruction::Sub { dst, a: parse_operand(&a), b: parse_operand(&b) })
        }
        "SLEEP" => {
            let ticks = tokens
                .next()
                .ok_or_else(|| ParseError::WrongArity("SLEEP".to_string()))?;
            if tokens.next().is_some() {
                return Err(ParseError::WrongArity("SLEEP".to_string()));
            }
            let ticks = ticks
                .parse::<u8>()
                .map_err(|_| ParseError::InvalidValue(ticks.to_string()))?;
            Ok(Instruction::Sleep { ticks })
        }
        "PRINT" => {
            let message: Vec<&str> = tokens.collect();
            if message.is_empty() {
                return Err(ParseError::WrongArity("PRINT".to_string()));
            }
            // 引号只是字面量定界符，插值在执行期针对 `+变量名` 片段进行
            let message = message.join(" ").replace('"', "");
            Ok(Instruction::Print { message })
        }
        other => Err(ParseError::UnknownInstruction(other.to_string())),
    }
}

/// 全数字token按十进制字面量处理，其余按变量名处理；
/// 超出u64的数字串折叠为越界字面量，由执行期终止语义处理
fn parse_operand(token: &str) -> Operand {
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        Operand::Literal(token.parse::<u64>().unwrap_or(u64::MAX))
    } else {
        Operand::Variable(token.to_string())
    }
}

fn two_args<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
    keyword: &str,
) -> Result<(String, String), ParseError> {
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(a), Some(b), None) => Ok((a.to_string(), b.to_string())),
        _ => Err(ParseError::WrongArity(keyword.to_string())),
    }
}

fn three_args<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
    keyword: &str,
) -> Result<(String, String, String), ParseError> {
    match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
        (Some(a), Some(b), Some(c), None) => Ok((a.to_string(), b.to_string(), c.to_string())),
        _ => Err(ParseError::WrongArity(keyword.to_string())),
    }
}
