//! 进程与地址空间模块

use rustc_hash::FxHashMap;
use std::fmt;

use super::instruction::Instruction;
use super::memory::{MemoryManager, PageTable};
use crate::utils;

/// 每个进程的变量空间上限（字节）
pub const VARIABLE_SPACE_BYTES: u32 = 64;
/// 每个变量占用的字节数
pub const VARIABLE_STRIDE: u32 = 2;

/// 进程生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Waiting,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::New => "NEW",
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Waiting => "WAITING",
            ProcessState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// 进程控制块
///
/// 进程由内核的进程表按下标持有；页框只以索引形式出现在页表中，
/// 不保存任何指向内存管理器内部的引用。
#[derive(Debug)]
pub struct Process {
    pid: u32,
    name: String,
    memory_required: u32,
    creation_time: String,
    state: ProcessState,
    program_counter: usize,
    instructions: Vec<Instruction>,
    /// 变量名 → 当前值（随每次写入同步，便于展示）
    variables: FxHashMap<String, u16>,
    /// 变量名 → 虚拟地址
    variable_addresses: FxHashMap<String, u32>,
    /// 下一个可分配的变量偏移
    next_variable_offset: u32,
    /// 虚拟页号 → 物理页框号
    page_table: PageTable,
    log_buffer: Vec<String>,
    sleep_ticks_remaining: u8,
    /// 当前占用本进程的核心编号
    current_core: Option<u32>,
}

impl Process {
    pub fn new(pid: u32, name: String, memory_required: u32, instructions: Vec<Instruction>) -> Self {
        Self {
            pid,
            name,
            memory_required,
            creation_time: utils::creation_timestamp(),
            state: ProcessState::New,
            program_counter: 0,
            instructions,
            variables: FxHashMap::default(),
            variable_addresses: FxHashMap::default(),
            next_variable_offset: 0,
            page_table: PageTable::default(),
            log_buffer: Vec::new(),
            sleep_ticks_remaining: 0,
            current_core: None,
        }
    }

    /// 执行程序计数器处的指令并前进一格
    ///
    /// 前置条件：状态为 RUNNING。指令本身不推进程序计数器；
    /// 到达末尾的进程清除未决的睡眠计数（正在终止的进程不再睡眠）。
    pub fn execute_next_instruction(&mut self, core_id: u32, memory: &mut MemoryManager) {
        debug_assert_eq!(self.state, ProcessState::Running);
        self.current_core = Some(core_id);

        let Some(instruction) = self.instructions.get(self.program_counter).cloned() else {
            return;
        };
        instruction.execute(self, memory);

        if self.state == ProcessState::Terminated {
            // 指令执行中发生致命错误，terminate() 已将计数器推到末尾
            return;
        }
        self.program_counter += 1;
        if self.program_counter >= self.instructions.len() {
            self.sleep_ticks_remaining = 0;
        }
    }

    /// 立即终止进程（内存故障、非法操作数）
    ///
    /// 程序计数器被推到指令末尾，与正常执行完毕的进程保持同一不变式。
    pub fn terminate(&mut self) {
        self.state = ProcessState::Terminated;
        self.program_counter = self.instructions.len();
        self.sleep_ticks_remaining = 0;
    }

    pub fn is_finished(&self) -> bool {
        self.program_counter >= self.instructions.len()
    }

    // ------ 变量表 ------

    pub fn has_variable(&self, name: &str) -> bool {
        self.variable_addresses.contains_key(name)
    }

    pub fn variable_address(&self, name: &str) -> Option<u32> {
        self.variable_addresses.get(name).copied()
    }

    /// 为变量分配虚拟地址；变量空间耗尽时返回 None
    pub fn ensure_variable_address(&mut self, name: &str) -> Option<u32> {
        if let Some(addr) = self.variable_addresses.get(name) {
            return Some(*addr);
        }
        if self.next_variable_offset >= VARIABLE_SPACE_BYTES {
            return None;
        }
        let addr = self.next_variable_offset;
        self.next_variable_offset += VARIABLE_STRIDE;
        self.variable_addresses.insert(name.to_string(), addr);
        Some(addr)
    }

    /// 同步变量值缓存（权威值存放在模拟内存中）
    pub fn cache_variable(&mut self, name: &str, value: u16) {
        self.variables.insert(name.to_string(), value);
    }

    /// 变量名 → 最近写入的值
    pub fn variables(&self) -> &FxHashMap<String, u16> {
        &self.variables
    }

    // ------ 睡眠 ------

    pub fn set_sleep_ticks(&mut self, ticks: u8) {
        self.sleep_ticks_remaining = ticks;
    }

    /// 睡眠计数减一；调度器每tick对所有等待中的进程调用一次
    pub fn decrement_sleep_ticks(&mut self) {
        if self.sleep_ticks_remaining > 0 {
            self.sleep_ticks_remaining -= 1;
        }
    }

    pub fn sleep_ticks_remaining(&self) -> u8 {
        self.sleep_ticks_remaining
    }

    // ------ 日志 ------

    pub fn push_log(&mut self, line: String) {
        self.log_buffer.push(line);
    }

    pub fn log_buffer(&self) -> &[String] {
        &self.log_buffer
    }

    // ------ 访问器 ------

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creation_time(&self) -> &str {
        &self.creation_time
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn current_instruction_line(&self) -> usize {
        self.program_counter
    }

    pub fn total_instruction_lines(&self) -> usize {
        self.instructions.len()
    }

    pub fn memory_required(&self) -> u32 {
        self.memory_required
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// 内存管理器通过进程句柄修改页表
    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub fn current_core(&self) -> Option<u32> {
        self.current_core
    }

    pub fn set_current_core(&mut self, core: Option<u32>) {
        self.current_core = core;
    }
}
