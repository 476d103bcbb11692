//! 内核核心模块
//!
//! 单个调度线程拥有tick主循环并持有全部调度状态；shell线程通过命令API
//! 竞争同一把内核锁。离散时间由 [`Kernel::tick`] 推进，`run()` 只是
//! “空闲挂起 → tick → 节拍睡眠”的线程外壳，因此调度顺序可以在测试中
//! 逐tick观察。

pub mod generator;
pub mod instruction;
pub mod memory;
pub mod process;

pub use instruction::{Instruction, Operand};
pub use memory::{MemoryError, MemoryManager, PageTable};
pub use process::{Process, ProcessState};

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{SchedulerType, SystemConfig};
use generator::ProcessGenerator;

/// 主循环每次迭代后的节拍间隔
const TICK_PACE: Duration = Duration::from_millis(20);

/// 报表中的水平分隔线
const HORIZONTAL_RULE: &str = "----------------------------------------";

/// 显式启动的进程的最小内存需求（字节）
const MIN_PROCESS_MEMORY: u32 = 64;

/// 内核命令错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("内核尚未初始化，请先执行 initialize")]
    NotInitialized,
    #[error("找不到进程: {0}")]
    ProcessNotFound(String),
    #[error("进程 {0} 已终止，无法重新连接")]
    ProcessTerminated(String),
    #[error("内存需求无效: {0} 字节（最小 64 字节）")]
    InvalidMemorySize(u32),
}

/// 内核构造选项（配置文件键集合之外的策略开关）
#[derive(Debug, Clone, Default)]
pub struct KernelOptions {
    /// RR抢占时是否释放进程页框；默认保留到进程终止
    pub release_frames_on_preempt: bool,
    /// 进程生成器随机种子
    pub seed: Option<u64>,
}

/// CPU核心
#[derive(Debug)]
pub struct CpuCore {
    pub id: u32,
    /// 进程表下标
    pub current_process: Option<usize>,
    pub is_busy: bool,
    pub quantum_ticks_used: u32,
}

impl CpuCore {
    fn new(id: u32) -> Self {
        Self {
            id,
            current_process: None,
            is_busy: false,
            quantum_ticks_used: 0,
        }
    }

    fn assign(&mut self, index: usize) {
        self.current_process = Some(index);
        self.is_busy = true;
        self.quantum_ticks_used = 0;
    }

    fn release(&mut self) {
        self.current_process = None;
        self.is_busy = false;
        self.quantum_ticks_used = 0;
    }
}

/// 内核锁保护的可变状态
struct KernelState {
    config: SystemConfig,
    /// 进程表；下标是进程在整个生命周期内的句柄
    processes: Vec<Process>,
    next_pid: u32,
    cpu_cores: Vec<CpuCore>,
    /// FIFO就绪队列，存进程表下标
    ready_queue: VecDeque<usize>,
    /// 等待队列，无顺序约定
    waiting_queue: Vec<usize>,
    memory: MemoryManager,
    generator: ProcessGenerator,
}

impl KernelState {
    fn new(seed: Option<u64>) -> Self {
        let config = SystemConfig::default();
        let memory = MemoryManager::new(config.max_overall_mem, config.mem_per_frame);
        Self {
            config,
            processes: Vec::new(),
            next_pid: 1,
            cpu_cores: Vec::new(),
            ready_queue: VecDeque::new(),
            waiting_queue: Vec::new(),
            memory,
            generator: ProcessGenerator::new(seed),
        }
    }
}

/// 操作系统内核
pub struct Kernel {
    state: Mutex<KernelState>,
    cv: Condvar,
    initialized: AtomicBool,
    running_generation: AtomicBool,
    shutdown_requested: AtomicBool,
    cpu_ticks: AtomicU64,
    active_ticks: AtomicU64,
    options: KernelOptions,
}

impl Kernel {
    pub fn new(options: KernelOptions) -> Self {
        Self {
            state: Mutex::new(KernelState::new(options.seed)),
            cv: Condvar::new(),
            initialized: AtomicBool::new(false),
            running_generation: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            cpu_ticks: AtomicU64::new(0),
            active_ticks: AtomicU64::new(0),
            options,
        }
    }

    // ------ 生命周期 ------

    /// 应用配置并初始化核心与物理内存
    pub fn initialize(&self, config: &SystemConfig) {
        {
            let mut st = self.state.lock().unwrap();
            st.config = config.clone();
            if st.config.batch_process_freq == 0 {
                // tick主循环按 tick % freq 判定生成时机
                warn!("进程生成频率为0，按1处理");
                st.config.batch_process_freq = 1;
            }
            st.cpu_cores = (0..config.num_cpus).map(CpuCore::new).collect();
            st.memory = MemoryManager::new(config.max_overall_mem, config.mem_per_frame);
            self.initialized.store(true, Ordering::SeqCst);
            info!(
                num_cpus = config.num_cpus,
                total_frames = st.memory.total_frames(),
                "内核初始化完成"
            );
        }
        self.cv.notify_one();
    }

    /// 内核线程主循环
    ///
    /// 初始化前在条件变量上等待；无事可做时挂起；每次迭代执行一个tick
    /// 后释放锁做节拍睡眠。循环顶部观察关机标志，执行中的指令总是完整
    /// 结束后才退出。
    pub fn run(&self) {
        let mut st = self.state.lock().unwrap();
        while !self.initialized.load(Ordering::SeqCst)
            && !self.shutdown_requested.load(Ordering::SeqCst)
        {
            st = self.cv.wait(st).unwrap();
        }

        loop {
            while !self.shutdown_requested.load(Ordering::SeqCst) && !self.has_work_locked(&st) {
                st = self.cv.wait(st).unwrap();
            }
            if self.shutdown_requested.load(Ordering::SeqCst) {
                break;
            }
            self.tick_locked(&mut st);

            drop(st);
            thread::sleep(TICK_PACE);
            st = self.state.lock().unwrap();
        }
        info!("内核主循环退出");
    }

    /// 请求关机：停止生成、清空核心占用并唤醒内核线程
    pub fn shutdown(&self) {
        self.running_generation.store(false, Ordering::SeqCst);
        self.shutdown_requested.store(true, Ordering::SeqCst);
        {
            let mut st = self.state.lock().unwrap();
            let st = &mut *st;
            for core in st.cpu_cores.iter_mut() {
                if let Some(index) = core.current_process.take() {
                    let process = &mut st.processes[index];
                    if process.state() == ProcessState::Running {
                        process.set_state(ProcessState::Ready);
                    }
                    process.set_current_core(None);
                }
                core.is_busy = false;
                core.quantum_ticks_used = 0;
            }
            info!("系统关闭，所有核心已释放");
        }
        self.cv.notify_all();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn generation_active(&self) -> bool {
        self.running_generation.load(Ordering::SeqCst)
    }

    pub fn cpu_ticks(&self) -> u64 {
        self.cpu_ticks.load(Ordering::SeqCst)
    }

    pub fn active_ticks(&self) -> u64 {
        self.active_ticks.load(Ordering::SeqCst)
    }

    // ------ tick主循环体 ------

    /// 执行一次主循环体：生成、唤醒、调度、按延迟执行、推进时间
    ///
    /// `run()` 与测试共用此入口，离散时间因此可被逐tick驱动。
    pub fn tick(&self) {
        let mut st = self.state.lock().unwrap();
        self.tick_locked(&mut st);
    }

    fn tick_locked(&self, st: &mut KernelState) {
        let tick = self.cpu_ticks.load(Ordering::SeqCst);

        if self.running_generation.load(Ordering::SeqCst)
            && tick % st.config.batch_process_freq == 0
        {
            let name = format!("process{}", st.next_pid);
            self.spawn_process_locked(st, name, 0, None);
        }

        self.update_waiting_queue_locked(st);
        self.schedule_processes_locked(st);

        if tick % (st.config.delays_per_exec + 1) == 0 && self.execute_all_cores_locked(st) {
            self.active_ticks.fetch_add(1, Ordering::SeqCst);
        }
        self.cpu_ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn has_work_locked(&self, st: &KernelState) -> bool {
        self.running_generation.load(Ordering::SeqCst)
            || !st.ready_queue.is_empty()
            || !st.waiting_queue.is_empty()
            || st.cpu_cores.iter().any(|core| core.is_busy)
    }

    /// 推进等待队列：睡眠计数减一，归零的进程被唤醒
    ///
    /// RR下唤醒的进程回到就绪队列；FCFS下进程不曾让出核心，原地恢复运行。
    fn update_waiting_queue_locked(&self, st: &mut KernelState) {
        let mut woken = Vec::new();
        let processes = &mut st.processes;
        st.waiting_queue.retain(|&index| {
            let process = &mut processes[index];
            process.decrement_sleep_ticks();
            if process.sleep_ticks_remaining() == 0 {
                woken.push(index);
                false
            } else {
                true
            }
        });

        for index in woken {
            let process = &mut st.processes[index];
            match st.config.scheduler {
                SchedulerType::RoundRobin => {
                    process.set_state(ProcessState::Ready);
                    st.ready_queue.push_back(index);
                }
                SchedulerType::Fcfs => {
                    process.set_state(ProcessState::Running);
                }
            }
        }
    }

    /// 按核心编号升序把就绪队列头部的进程分配给空闲核心
    fn schedule_processes_locked(&self, st: &mut KernelState) {
        for core in st.cpu_cores.iter_mut() {
            if core.is_busy {
                continue;
            }
            let Some(index) = st.ready_queue.pop_front() else {
                return;
            };
            core.assign(index);
            let process = &mut st.processes[index];
            process.set_state(ProcessState::Running);
            process.set_current_core(Some(core.id));
        }
    }

    /// 在每个忙碌核心上执行一条指令，返回是否有核心实际执行
    fn execute_all_cores_locked(&self, st: &mut KernelState) -> bool {
        let round_robin = st.config.scheduler == SchedulerType::RoundRobin;
        let quantum = st.config.quantum_cycles;
        let release_on_preempt = self.options.release_frames_on_preempt;
        let mut executed = false;

        for core in st.cpu_cores.iter_mut() {
            if !core.is_busy {
                continue;
            }
            let Some(index) = core.current_process else {
                continue;
            };
            if st.processes[index].state() != ProcessState::Running {
                // FCFS下睡眠中的进程占着核心等待唤醒
                continue;
            }

            let process = &mut st.processes[index];
            process.execute_next_instruction(core.id, &mut st.memory);
            executed = true;
            if round_robin {
                core.quantum_ticks_used += 1;
            }

            let process = &mut st.processes[index];
            if process.state() == ProcessState::Terminated {
                // 指令执行中发生内存故障或非法操作数
                st.memory.release(process);
                process.set_current_core(None);
                core.release();
            } else if process.sleep_ticks_remaining() > 0 {
                process.set_state(ProcessState::Waiting);
                st.waiting_queue.push(index);
                if round_robin {
                    if release_on_preempt {
                        st.memory.release(process);
                    }
                    process.set_current_core(None);
                    core.release();
                }
            } else if process.is_finished() {
                process.set_state(ProcessState::Terminated);
                debug!(pid = process.pid(), name = process.name(), "进程执行完毕");
                st.memory.release(process);
                process.set_current_core(None);
                core.release();
            } else if round_robin && core.quantum_ticks_used >= quantum {
                // 时间片耗尽，抢占
                process.set_state(ProcessState::Ready);
                if release_on_preempt {
                    st.memory.release(process);
                }
                process.set_current_core(None);
                st.ready_queue.push_back(index);
                core.release();
            }
        }
        executed
    }

    /// 创建进程并入队
    ///
    /// `instructions` 为 None 时合成随机指令流；`memory_required` 为 0 时
    /// 在配置区间内随机抽取。
    fn spawn_process_locked(
        &self,
        st: &mut KernelState,
        name: String,
        memory_required: u32,
        instructions: Option<Vec<Instruction>>,
    ) -> usize {
        let (min_ins, max_ins) = (st.config.min_instructions, st.config.max_instructions);
        let (min_mem, max_mem) = (st.config.min_mem_per_proc, st.config.max_mem_per_proc);

        let instructions = match instructions {
            Some(list) => list,
            None => {
                let count = st.generator.instruction_count(min_ins, max_ins);
                st.generator.instructions(count, &name)
            }
        };
        let memory_required = if memory_required == 0 {
            st.generator.memory_required(min_mem, max_mem)
        } else {
            memory_required
        };

        let pid = st.next_pid;
        st.next_pid += 1;
        let mut process = Process::new(pid, name, memory_required, instructions);
        process.set_state(ProcessState::Ready);
        debug!(pid, name = process.name(), memory_required, "创建进程");

        let index = st.processes.len();
        st.processes.push(process);
        st.ready_queue.push_back(index);
        index
    }

    // ------ 命令API（shell线程调用） ------

    fn ensure_initialized(&self) -> std::result::Result<(), KernelError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(KernelError::NotInitialized)
        }
    }

    /// scheduler-start：激活批量进程生成
    pub fn start_process_generation(&self) {
        if self.running_generation.swap(true, Ordering::SeqCst) {
            info!("进程生成已经处于激活状态");
            return;
        }
        info!("进程生成已激活");
        self.cv.notify_one();
    }

    /// scheduler-stop：停止生成；已入队的进程照常执行完毕
    pub fn stop_process_generation(&self) {
        if !self.running_generation.swap(false, Ordering::SeqCst) {
            info!("进程生成已经处于停止状态");
            return;
        }
        info!("进程生成已停止");
    }

    /// screen -s：按名称和内存需求启动一个随机指令流进程
    pub fn start_process(
        &self,
        name: &str,
        memory_required: u32,
    ) -> std::result::Result<u32, KernelError> {
        self.ensure_initialized()?;
        if memory_required < MIN_PROCESS_MEMORY {
            return Err(KernelError::InvalidMemorySize(memory_required));
        }
        let pid = {
            let mut st = self.state.lock().unwrap();
            let index = self.spawn_process_locked(&mut st, name.to_string(), memory_required, None);
            st.processes[index].pid()
        };
        self.cv.notify_one();
        Ok(pid)
    }

    /// screen -c：按用户给定的指令流启动进程
    ///
    /// `memory_required` 为 0 时在配置区间内随机抽取。
    pub fn create_custom_process(
        &self,
        name: &str,
        memory_required: u32,
        instructions: Vec<Instruction>,
    ) -> std::result::Result<u32, KernelError> {
        self.ensure_initialized()?;
        if memory_required != 0 && memory_required < MIN_PROCESS_MEMORY {
            return Err(KernelError::InvalidMemorySize(memory_required));
        }
        let pid = {
            let mut st = self.state.lock().unwrap();
            let index = self.spawn_process_locked(
                &mut st,
                name.to_string(),
                memory_required,
                Some(instructions),
            );
            st.processes[index].pid()
        };
        self.cv.notify_one();
        Ok(pid)
    }

    /// screen -r：按名称重新连接；名称未知或进程已终止时失败
    pub fn reattach(&self, name: &str) -> std::result::Result<ProcessScreen, KernelError> {
        self.ensure_initialized()?;
        let st = self.state.lock().unwrap();
        let process = st
            .processes
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| KernelError::ProcessNotFound(name.to_string()))?;
        if process.state() == ProcessState::Terminated {
            return Err(KernelError::ProcessTerminated(name.to_string()));
        }
        Ok(ProcessScreen::capture(process))
    }

    /// screen内的 process-smi：进程画面快照（终止的进程也可查看）
    pub fn process_screen(&self, name: &str) -> std::result::Result<ProcessScreen, KernelError> {
        self.ensure_initialized()?;
        let st = self.state.lock().unwrap();
        let process = st
            .processes
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| KernelError::ProcessNotFound(name.to_string()))?;
        Ok(ProcessScreen::capture(process))
    }

    /// screen -ls / report-util：系统状态快照
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let st = self.state.lock().unwrap();
        let cores_total = st.cpu_cores.len() as u32;
        let cores_used = st.cpu_cores.iter().filter(|core| core.is_busy).count() as u32;

        let mut active = Vec::new();
        let mut terminated = Vec::new();
        for process in &st.processes {
            let row = ProcessRow {
                pid: process.pid(),
                name: process.name().to_string(),
                creation_time: process.creation_time().to_string(),
                state: process.state(),
                current_line: process.current_instruction_line(),
                total_lines: process.total_instruction_lines(),
                sleep_ticks_remaining: process.sleep_ticks_remaining(),
                core: if process.state() == ProcessState::Running {
                    process.current_core()
                } else {
                    None
                },
            };
            if process.state() == ProcessState::Terminated {
                terminated.push(row);
            } else {
                active.push(row);
            }
        }
        StatusSnapshot {
            cpu_utilization: percentage(cores_used, cores_total),
            cores_used,
            cores_total,
            active,
            terminated,
        }
    }

    /// 顶层 process-smi：内存利用率报表快照
    pub fn memory_snapshot(&self) -> MemorySnapshot {
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;

        // 报表前回收终止进程残留的页框
        let (processes, memory) = (&mut st.processes, &mut st.memory);
        for process in processes.iter_mut() {
            if process.state() == ProcessState::Terminated {
                memory.release(process);
            }
        }

        let mut frames: Vec<Option<u32>> = vec![None; memory.total_frames() as usize];
        for process in processes.iter() {
            for (_vpn, frame) in process.page_table() {
                frames[*frame as usize] = Some(process.pid());
            }
        }

        let cores_total = st.cpu_cores.len() as u32;
        let cores_used = st.cpu_cores.iter().filter(|core| core.is_busy).count() as u32;
        MemorySnapshot {
            cpu_utilization: percentage(cores_used, cores_total),
            used_bytes: memory.used_bytes(),
            total_bytes: memory.total_bytes(),
            mem_per_frame: memory.mem_per_frame(),
            frames,
        }
    }

    /// vmstat：内存与tick统计快照
    pub fn vmstat_snapshot(&self) -> VmStat {
        let st = self.state.lock().unwrap();
        let cpu_ticks = self.cpu_ticks.load(Ordering::SeqCst);
        let active_ticks = self.active_ticks.load(Ordering::SeqCst);
        VmStat {
            total_bytes: st.memory.total_bytes(),
            used_bytes: st.memory.used_bytes(),
            available_bytes: st.memory.total_bytes() - st.memory.used_bytes(),
            mem_per_frame: st.memory.mem_per_frame(),
            cpu_ticks,
            active_ticks,
            idle_ticks: cpu_ticks - active_ticks,
            paged_in: st.memory.paged_in(),
            paged_out: st.memory.paged_out(),
        }
    }

    /// report-util：把状态报表写入文件
    pub fn export_status_report(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.status_snapshot();
        std::fs::write(&path, snapshot.to_string())
            .with_context(|| format!("无法写入报表文件: {:?}", path.as_ref()))?;
        info!(path = ?path.as_ref(), "状态报表已导出");
        Ok(())
    }
}

fn percentage(part: u32, whole: u32) -> f32 {
    if whole == 0 {
        0.0
    } else {
        part as f32 / whole as f32 * 100.0
    }
}

// ------ 快照类型 ------

/// 状态列表中的一行进程信息
#[derive(Debug, Clone)]
pub struct ProcessRow {
    pub pid: u32,
    pub name: String,
    pub creation_time: String,
    pub state: ProcessState,
    pub current_line: usize,
    pub total_lines: usize,
    pub sleep_ticks_remaining: u8,
    /// 进程RUNNING时所在的核心
    pub core: Option<u32>,
}

impl fmt::Display for ProcessRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  {} (PID {}) ({}) State: {} Inst: {}/{}",
            self.name, self.pid, self.creation_time, self.state, self.current_line, self.total_lines
        )?;
        if self.sleep_ticks_remaining > 0 {
            write!(f, " (Sleeping {} ticks)", self.sleep_ticks_remaining)?;
        }
        if let Some(core) = self.core {
            write!(f, " (Core: {core})")?;
        }
        Ok(())
    }
}

/// screen -ls 的完整快照
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub cpu_utilization: f32,
    pub cores_used: u32,
    pub cores_total: u32,
    pub active: Vec<ProcessRow>,
    pub terminated: Vec<ProcessRow>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPU Utilization: {:.2}%", self.cpu_utilization)?;
        writeln!(f, "Cores used: {}", self.cores_used)?;
        writeln!(f, "Cores available: {}", self.cores_total - self.cores_used)?;
        writeln!(f, "{HORIZONTAL_RULE}")?;
        if self.active.is_empty() && self.terminated.is_empty() {
            writeln!(f, "No processes found.")?;
            writeln!(f, "{HORIZONTAL_RULE}")?;
            return Ok(());
        }
        writeln!(f, "Active Processes:")?;
        for row in &self.active {
            writeln!(f, "{row}")?;
        }
        writeln!(f)?;
        writeln!(f, "Terminated Processes:")?;
        for row in &self.terminated {
            writeln!(f, "{row}")?;
        }
        writeln!(f, "{HORIZONTAL_RULE}")?;
        Ok(())
    }
}

/// 进程画面（screen -r / process-smi）
#[derive(Debug, Clone)]
pub struct ProcessScreen {
    pub name: String,
    pub pid: u32,
    pub logs: Vec<String>,
    pub current_line: usize,
    pub total_lines: usize,
    pub memory_required: u32,
}

impl ProcessScreen {
    fn capture(process: &Process) -> Self {
        Self {
            name: process.name().to_string(),
            pid: process.pid(),
            logs: process.log_buffer().to_vec(),
            current_line: process.current_instruction_line(),
            total_lines: process.total_instruction_lines(),
            memory_required: process.memory_required(),
        }
    }
}

impl fmt::Display for ProcessScreen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Process Name: {}", self.name)?;
        writeln!(f, "ID: {}", self.pid)?;
        writeln!(f, "Logs:")?;
        if self.logs.is_empty() {
            writeln!(f, "Process log is empty.")?;
        } else {
            for line in &self.logs {
                writeln!(f, "{line}")?;
            }
        }
        writeln!(f, "--- End of process log ---")?;
        writeln!(f, "Current instruction line: {}", self.current_line)?;
        writeln!(f, "Lines of code: {}", self.total_lines)?;
        writeln!(f, "Memory Required: {}", self.memory_required)?;
        Ok(())
    }
}

/// 顶层 process-smi 的内存利用率快照
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub cpu_utilization: f32,
    pub used_bytes: u32,
    pub total_bytes: u32,
    pub mem_per_frame: u32,
    /// 每个页框的占用者PID
    pub frames: Vec<Option<u32>>,
}

impl fmt::Display for MemorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPU Utilization: {:.2}%", self.cpu_utilization)?;
        writeln!(f, "Memory Usage: {}B/{}B", self.used_bytes, self.total_bytes)?;
        let utilization = percentage(self.used_bytes, self.total_bytes);
        writeln!(f, "Memory Utilization: {utilization:.2}%")?;
        writeln!(f, "Memory per frame: {}B", self.mem_per_frame)?;
        writeln!(f, "{HORIZONTAL_RULE}")?;
        for (index, owner) in self.frames.iter().enumerate() {
            match owner {
                Some(pid) => writeln!(f, "Frame {index}: Process {pid}")?,
                None => writeln!(f, "Frame {index}: Unoccupied")?,
            }
        }
        writeln!(f, "{HORIZONTAL_RULE}")?;
        Ok(())
    }
}

/// vmstat 的统计快照
#[derive(Debug, Clone, Copy)]
pub struct VmStat {
    pub total_bytes: u32,
    pub used_bytes: u32,
    pub available_bytes: u32,
    pub mem_per_frame: u32,
    pub cpu_ticks: u64,
    pub active_ticks: u64,
    pub idle_ticks: u64,
    pub paged_in: u64,
    pub paged_out: u64,
}

impl fmt::Display for VmStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total Memory: {}B", self.total_bytes)?;
        writeln!(f, "Used Memory: {}B", self.used_bytes)?;
        writeln!(f, "Available Memory: {}B", self.available_bytes)?;
        writeln!(f, "Memory per frame: {}B", self.mem_per_frame)?;
        writeln!(f, "Total CPU Ticks: {}", self.cpu_ticks)?;
        writeln!(f, "Active CPU Ticks: {}", self.active_ticks)?;
        writeln!(f, "Idle CPU Ticks: {}", self.idle_ticks)?;
        writeln!(f, "Pages swapped in: {}", self.paged_in)?;
        writeln!(f, "Pages swapped out: {}", self.paged_out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_config(num_cpus: u32, scheduler: SchedulerType) -> SystemConfig {
        SystemConfig {
            num_cpus,
            scheduler,
            quantum_cycles: 4,
            batch_process_freq: 1,
            min_instructions: 3,
            max_instructions: 3,
            delays_per_exec: 0,
            max_overall_mem: 256,
            mem_per_frame: 16,
            min_mem_per_proc: 64,
            max_mem_per_proc: 64,
        }
    }

    fn boot(config: SystemConfig) -> Kernel {
        let kernel = Kernel::new(KernelOptions {
            seed: Some(42),
            ..KernelOptions::default()
        });
        kernel.initialize(&config);
        kernel
    }

    fn tick_n(kernel: &Kernel, n: usize) {
        for _ in 0..n {
            kernel.tick();
        }
    }

    fn state_of(kernel: &Kernel, pid: u32) -> ProcessState {
        let st = kernel.state.lock().unwrap();
        st.processes
            .iter()
            .find(|p| p.pid() == pid)
            .expect("unknown pid")
            .state()
    }

    fn logs_of(kernel: &Kernel, pid: u32) -> Vec<String> {
        let st = kernel.state.lock().unwrap();
        st.processes
            .iter()
            .find(|p| p.pid() == pid)
            .expect("unknown pid")
            .log_buffer()
            .to_vec()
    }

    fn print_instruction(message: &str) -> Instruction {
        Instruction::Print {
            message: message.to_string(),
        }
    }

    #[test]
    fn test_saturation_on_subtract() {
        // DECLARE x 5; SUBTRACT x x 10; PRINT x=+x → 负值饱和，末尾日志 x=0
        let mut config = test_config(1, SchedulerType::Fcfs);
        config.max_overall_mem = 64;
        let kernel = boot(config);
        let pid = kernel
            .create_custom_process(
                "p1",
                64,
                vec![
                    Instruction::Declare { name: "x".to_string(), value: 5 },
                    Instruction::Sub {
                        dst: "x".to_string(),
                        a: Operand::Variable("x".to_string()),
                        b: Operand::Literal(10),
                    },
                    print_instruction("x=+x"),
                ],
            )
            .unwrap();
        tick_n(&kernel, 10);
        assert_eq!(state_of(&kernel, pid), ProcessState::Terminated);
        let logs = logs_of(&kernel, pid);
        assert!(logs.last().unwrap().ends_with("x=0"), "logs: {logs:?}");
    }

    #[test]
    fn test_add_with_literals_auto_declares() {
        // ADD y 3 4; PRINT y=+y → y=7，目标变量自动声明，执行后页表大小为1
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        let pid = kernel
            .create_custom_process(
                "p1",
                64,
                vec![
                    Instruction::Add {
                        dst: "y".to_string(),
                        a: Operand::Literal(3),
                        b: Operand::Literal(4),
                    },
                    print_instruction("y=+y"),
                ],
            )
            .unwrap();
        kernel.tick();
        {
            let st = kernel.state.lock().unwrap();
            assert_eq!(st.processes[0].page_table().len(), 1);
        }
        tick_n(&kernel, 5);
        assert_eq!(state_of(&kernel, pid), ProcessState::Terminated);
        assert!(logs_of(&kernel, pid).last().unwrap().ends_with("y=7"));
    }

    #[test]
    fn test_sleep_and_wake_under_rr() {
        // 单核RR下两个 [PRINT a; SLEEP 2; PRINT b] 进程交错推进
        let kernel = boot(test_config(1, SchedulerType::RoundRobin));
        let program = || {
            vec![
                print_instruction("a"),
                Instruction::Sleep { ticks: 2 },
                print_instruction("b"),
            ]
        };
        let a = kernel.create_custom_process("A", 64, program()).unwrap();
        let b = kernel.create_custom_process("B", 64, program()).unwrap();

        kernel.tick(); // t0: A打印a
        assert_eq!(logs_of(&kernel, a).len(), 1);
        assert_eq!(logs_of(&kernel, b).len(), 0);

        kernel.tick(); // t1: A睡眠并让出核心
        assert_eq!(state_of(&kernel, a), ProcessState::Waiting);

        kernel.tick(); // t2: B打印a
        assert_eq!(logs_of(&kernel, b).len(), 1);

        kernel.tick(); // t3: B睡眠；A的计数归零回到就绪队列
        assert_eq!(state_of(&kernel, b), ProcessState::Waiting);
        assert_eq!(state_of(&kernel, a), ProcessState::Ready);

        kernel.tick(); // t4: A打印b并结束
        assert_eq!(logs_of(&kernel, a).len(), 2);
        assert_eq!(state_of(&kernel, a), ProcessState::Terminated);

        kernel.tick(); // t5: B的计数归零
        kernel.tick(); // t6: B打印b并结束
        assert_eq!(logs_of(&kernel, b).len(), 2);
        assert_eq!(state_of(&kernel, b), ProcessState::Terminated);

        assert!(logs_of(&kernel, a)[0].ends_with('a'));
        assert!(logs_of(&kernel, a)[1].ends_with('b'));
        assert!(logs_of(&kernel, b)[0].ends_with('a'));
        assert!(logs_of(&kernel, b)[1].ends_with('b'));
    }

    #[test]
    fn test_quantum_preemption() {
        // quantum=2，6条PRINT；时间片计数不超过2，重新上核至少3次
        let mut config = test_config(1, SchedulerType::RoundRobin);
        config.quantum_cycles = 2;
        let kernel = boot(config);
        let pid = kernel
            .create_custom_process(
                "p1",
                64,
                (0..6).map(|i| print_instruction(&format!("line{i}"))).collect(),
            )
            .unwrap();

        let mut transitions = 0;
        for _ in 0..30 {
            let before = state_of(&kernel, pid);
            kernel.tick();
            let after = state_of(&kernel, pid);
            if before != ProcessState::Running && after == ProcessState::Running {
                transitions += 1;
            }
            {
                let st = kernel.state.lock().unwrap();
                assert!(st.cpu_cores[0].quantum_ticks_used <= 2);
            }
            if after == ProcessState::Terminated {
                break;
            }
        }
        assert_eq!(state_of(&kernel, pid), ProcessState::Terminated);
        assert!(transitions >= 3, "transitions = {transitions}");
        assert_eq!(logs_of(&kernel, pid).len(), 6);
    }

    #[test]
    fn test_memory_exhaustion_terminates_second_process() {
        // 只有1个页框；后访问内存的进程被终止，先占者执行完毕
        let mut config = test_config(2, SchedulerType::Fcfs);
        config.max_overall_mem = 64;
        config.mem_per_frame = 64;
        let kernel = boot(config);
        let first = kernel
            .create_custom_process(
                "first",
                64,
                vec![
                    Instruction::Declare { name: "a".to_string(), value: 1 },
                    Instruction::Add {
                        dst: "a".to_string(),
                        a: Operand::Variable("a".to_string()),
                        b: Operand::Literal(1),
                    },
                    print_instruction("done"),
                ],
            )
            .unwrap();
        let second = kernel
            .create_custom_process(
                "second",
                64,
                vec![Instruction::Declare { name: "b".to_string(), value: 1 }],
            )
            .unwrap();

        kernel.tick();
        // 核心0上的first拿到唯一页框；核心1上的second缺页失败
        assert_eq!(state_of(&kernel, second), ProcessState::Terminated);
        assert!(logs_of(&kernel, second)
            .last()
            .unwrap()
            .contains("Memory fault"));

        tick_n(&kernel, 5);
        assert_eq!(state_of(&kernel, first), ProcessState::Terminated);
        assert!(logs_of(&kernel, first).last().unwrap().ends_with("done"));

        let st = kernel.state.lock().unwrap();
        assert_eq!(st.memory.paged_in(), 1);
        assert_eq!(st.memory.paged_out(), 1);
        assert_eq!(st.memory.occupied_frames(), 0);
        // 终止的进程程序计数器与指令数一致
        for process in &st.processes {
            assert_eq!(
                process.current_instruction_line(),
                process.total_instruction_lines()
            );
        }
    }

    #[test]
    fn test_shutdown_is_prompt() {
        // 生成激活、队列有积压时，关机后主循环退出且没有进程占核
        let kernel = Arc::new(boot(test_config(2, SchedulerType::RoundRobin)));
        let worker = {
            let kernel = Arc::clone(&kernel);
            thread::Builder::new()
                .name("kernel".into())
                .spawn(move || kernel.run())
                .unwrap()
        };
        kernel.start_process_generation();
        thread::sleep(Duration::from_millis(80));
        kernel.shutdown();
        worker.join().unwrap();

        let st = kernel.state.lock().unwrap();
        assert!(st.cpu_cores.iter().all(|core| !core.is_busy));
        assert!(st
            .processes
            .iter()
            .all(|p| p.state() != ProcessState::Running));
    }

    #[test]
    fn test_generation_toggle_is_idempotent() {
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        kernel.start_process_generation();
        kernel.start_process_generation();
        assert!(kernel.generation_active());
        kernel.stop_process_generation();
        kernel.stop_process_generation();
        assert!(!kernel.generation_active());
    }

    #[test]
    fn test_generation_spawns_every_freq_ticks() {
        let mut config = test_config(1, SchedulerType::RoundRobin);
        config.batch_process_freq = 2;
        let kernel = boot(config);
        kernel.start_process_generation();
        tick_n(&kernel, 6);
        kernel.stop_process_generation();
        let st = kernel.state.lock().unwrap();
        // tick 0、2、4 各生成一个
        assert_eq!(st.processes.len(), 3);
        assert_eq!(
            st.processes.iter().map(Process::pid).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_fcfs_process_keeps_core_across_sleep() {
        // FCFS下进程睡眠不让出核心，唤醒后仍在原核心
        let kernel = boot(test_config(2, SchedulerType::Fcfs));
        let pid = kernel
            .create_custom_process(
                "keeper",
                64,
                vec![
                    print_instruction("before"),
                    Instruction::Sleep { ticks: 2 },
                    print_instruction("after"),
                ],
            )
            .unwrap();
        kernel.tick();
        kernel.tick(); // 执行SLEEP
        assert_eq!(state_of(&kernel, pid), ProcessState::Waiting);
        {
            let st = kernel.state.lock().unwrap();
            assert!(st.cpu_cores[0].is_busy);
            assert_eq!(st.cpu_cores[0].current_process, Some(0));
        }
        tick_n(&kernel, 4);
        assert_eq!(state_of(&kernel, pid), ProcessState::Terminated);
        let logs = logs_of(&kernel, pid);
        // 两条日志都来自核心0
        assert!(logs.iter().all(|line| line.contains("[Core: 0]")));
    }

    #[test]
    fn test_wake_window_is_exact() {
        // 睡眠k个tick的进程恰好在k个tick后回到就绪
        let kernel = boot(test_config(1, SchedulerType::RoundRobin));
        let pid = kernel
            .create_custom_process(
                "sleeper",
                64,
                vec![
                    Instruction::Sleep { ticks: 3 },
                    print_instruction("up"),
                    print_instruction("and running"),
                ],
            )
            .unwrap();
        kernel.tick(); // t0: 执行SLEEP
        assert_eq!(state_of(&kernel, pid), ProcessState::Waiting);
        kernel.tick(); // t1: 计数 3→2
        assert_eq!(state_of(&kernel, pid), ProcessState::Waiting);
        kernel.tick(); // t2: 计数 2→1
        assert_eq!(state_of(&kernel, pid), ProcessState::Waiting);
        kernel.tick(); // t3: 计数 1→0，唤醒并在本tick重新上核
        assert_eq!(state_of(&kernel, pid), ProcessState::Running);
        assert_eq!(logs_of(&kernel, pid).len(), 1);
    }

    #[test]
    fn test_ready_queue_is_fifo_lowest_core_first() {
        let kernel = boot(test_config(2, SchedulerType::Fcfs));
        for name in ["p1", "p2", "p3"] {
            kernel
                .create_custom_process(name, 64, vec![print_instruction("x")])
                .unwrap();
        }
        kernel.tick();
        let st = kernel.state.lock().unwrap();
        // 最早入队的进程被分到编号最小的核心
        assert_eq!(st.cpu_cores[0].current_process, Some(0));
        assert_eq!(st.cpu_cores[1].current_process, Some(1));
        assert_eq!(st.ready_queue.front(), Some(&2));
    }

    #[test]
    fn test_delay_per_exec_gates_execution() {
        let mut config = test_config(1, SchedulerType::Fcfs);
        config.delays_per_exec = 2;
        let kernel = boot(config);
        let pid = kernel
            .create_custom_process(
                "slow",
                64,
                vec![print_instruction("one"), print_instruction("two")],
            )
            .unwrap();
        // 执行只发生在 tick % 3 == 0 的tick上
        kernel.tick(); // t0: 执行
        assert_eq!(logs_of(&kernel, pid).len(), 1);
        kernel.tick(); // t1: 空转
        kernel.tick(); // t2: 空转
        assert_eq!(logs_of(&kernel, pid).len(), 1);
        kernel.tick(); // t3: 执行
        assert_eq!(logs_of(&kernel, pid).len(), 2);
        assert_eq!(kernel.active_ticks(), 2);
        assert_eq!(kernel.cpu_ticks(), 4);
    }

    #[test]
    fn test_frames_survive_preemption_by_default() {
        let mut config = test_config(1, SchedulerType::RoundRobin);
        config.quantum_cycles = 1;
        config.max_overall_mem = 128;
        config.mem_per_frame = 64;
        let kernel = boot(config);
        let program = |tag: &str| {
            vec![
                Instruction::Declare { name: "v".to_string(), value: 1 },
                Instruction::Add {
                    dst: "v".to_string(),
                    a: Operand::Variable("v".to_string()),
                    b: Operand::Literal(1),
                },
                print_instruction(tag),
            ]
        };
        kernel.create_custom_process("one", 64, program("one")).unwrap();
        kernel.create_custom_process("two", 64, program("two")).unwrap();
        tick_n(&kernel, 2);
        {
            let st = kernel.state.lock().unwrap();
            // 默认策略：被抢占的进程保留页框
            let preempted = st
                .processes
                .iter()
                .find(|p| p.state() == ProcessState::Ready)
                .expect("expected a preempted process");
            assert_eq!(preempted.page_table().len(), 1);
        }
        tick_n(&kernel, 10);
        let st = kernel.state.lock().unwrap();
        assert_eq!(st.memory.paged_in(), 2);
        assert_eq!(st.memory.paged_out(), 2);
    }

    #[test]
    fn test_release_frames_on_preempt_policy() {
        let kernel = Kernel::new(KernelOptions {
            release_frames_on_preempt: true,
            seed: Some(42),
        });
        let mut config = test_config(1, SchedulerType::RoundRobin);
        config.quantum_cycles = 1;
        config.max_overall_mem = 128;
        config.mem_per_frame = 64;
        kernel.initialize(&config);
        kernel
            .create_custom_process(
                "one",
                64,
                vec![
                    Instruction::Declare { name: "v".to_string(), value: 1 },
                    print_instruction("bye"),
                ],
            )
            .unwrap();
        kernel.tick();
        let st = kernel.state.lock().unwrap();
        // 抢占即释放：页表被清空，换出计数随之增加
        assert_eq!(st.processes[0].state(), ProcessState::Ready);
        assert!(st.processes[0].page_table().is_empty());
        assert_eq!(st.memory.paged_out(), 1);
    }

    #[test]
    fn test_command_api_requires_initialization() {
        let kernel = Kernel::new(KernelOptions::default());
        assert_eq!(
            kernel.start_process("p", 64).unwrap_err(),
            KernelError::NotInitialized
        );
        assert_eq!(
            kernel.reattach("p").unwrap_err(),
            KernelError::NotInitialized
        );
    }

    #[test]
    fn test_start_process_rejects_small_memory() {
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        assert_eq!(
            kernel.start_process("tiny", 32).unwrap_err(),
            KernelError::InvalidMemorySize(32)
        );
    }

    #[test]
    fn test_reattach_unknown_and_terminated() {
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        assert_eq!(
            kernel.reattach("ghost").unwrap_err(),
            KernelError::ProcessNotFound("ghost".to_string())
        );
        kernel
            .create_custom_process("done", 64, vec![print_instruction("x")])
            .unwrap();
        tick_n(&kernel, 3);
        assert_eq!(
            kernel.reattach("done").unwrap_err(),
            KernelError::ProcessTerminated("done".to_string())
        );
        // process-smi 仍可查看已终止的进程
        let screen = kernel.process_screen("done").unwrap();
        assert_eq!(screen.current_line, screen.total_lines);
    }

    #[test]
    fn test_status_snapshot_reports_cores_and_rows() {
        let kernel = boot(test_config(2, SchedulerType::Fcfs));
        kernel
            .create_custom_process("worker", 64, vec![print_instruction("x"); 5])
            .unwrap();
        kernel.tick();
        let snapshot = kernel.status_snapshot();
        assert_eq!(snapshot.cores_total, 2);
        assert_eq!(snapshot.cores_used, 1);
        assert!((snapshot.cpu_utilization - 50.0).abs() < f32::EPSILON);
        assert_eq!(snapshot.active.len(), 1);
        assert_eq!(snapshot.active[0].core, Some(0));
        let rendered = snapshot.to_string();
        assert!(rendered.contains("worker (PID 1)"));
        assert!(rendered.contains("(Core: 0)"));
    }

    #[test]
    fn test_memory_snapshot_lists_frame_owners() {
        let mut config = test_config(1, SchedulerType::Fcfs);
        config.max_overall_mem = 64;
        let kernel = boot(config);
        kernel
            .create_custom_process(
                "owner",
                64,
                vec![
                    Instruction::Declare { name: "x".to_string(), value: 1 },
                    Instruction::Sleep { ticks: 20 },
                ],
            )
            .unwrap();
        tick_n(&kernel, 2);
        let snapshot = kernel.memory_snapshot();
        assert_eq!(snapshot.total_bytes, 64);
        assert_eq!(snapshot.used_bytes, 16);
        assert_eq!(snapshot.frames.iter().flatten().count(), 1);
        assert!(snapshot.to_string().contains("Frame 0: Process 1"));
    }

    #[test]
    fn test_vmstat_snapshot_counts_ticks() {
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        kernel
            .create_custom_process("p", 64, vec![print_instruction("x")])
            .unwrap();
        tick_n(&kernel, 4);
        let stats = kernel.vmstat_snapshot();
        assert_eq!(stats.cpu_ticks, 4);
        assert_eq!(stats.active_ticks + stats.idle_ticks, stats.cpu_ticks);
        assert_eq!(stats.total_bytes, 256);
        assert_eq!(stats.available_bytes, stats.total_bytes - stats.used_bytes);
    }

    #[test]
    fn test_export_status_report_writes_file() {
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        let path = std::env::temp_dir().join("csopesy-report-test.txt");
        kernel.export_status_report(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("CPU Utilization"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_soak_run_preserves_invariants() {
        // 长时间随机负载下的调度与内存不变式
        let mut config = test_config(4, SchedulerType::RoundRobin);
        config.min_instructions = 3;
        config.max_instructions = 8;
        config.batch_process_freq = 2;
        let kernel = boot(config);
        kernel.start_process_generation();

        for round in 0..200u32 {
            kernel.tick();
            if round % 10 != 0 {
                continue;
            }
            let st = kernel.state.lock().unwrap();

            // 忙碌核心数不超过CPU数，RUNNING进程与忙碌核心一一对应
            let busy: Vec<usize> = st
                .cpu_cores
                .iter()
                .filter(|core| core.is_busy)
                .map(|core| core.current_process.expect("busy core without process"))
                .collect();
            assert!(busy.len() <= st.cpu_cores.len());
            let running: Vec<usize> = st
                .processes
                .iter()
                .enumerate()
                .filter(|(_, p)| p.state() == ProcessState::Running)
                .map(|(i, _)| i)
                .collect();
            let mut busy_sorted = busy.clone();
            busy_sorted.sort_unstable();
            assert_eq!(busy_sorted, running);

            // 程序计数器不越界，到达末尾当且仅当终止
            for process in &st.processes {
                assert!(process.current_instruction_line() <= process.total_instruction_lines());
                assert_eq!(
                    process.current_instruction_line() == process.total_instruction_lines(),
                    process.state() == ProcessState::Terminated
                );
            }

            // 每个被占用页框恰好属于一个进程
            let mut owners = vec![0u32; st.memory.total_frames() as usize];
            for process in &st.processes {
                for (_vpn, frame) in process.page_table() {
                    owners[*frame as usize] += 1;
                }
            }
            for (frame, count) in owners.iter().enumerate() {
                let occupied = !st.memory.frame_is_free(frame as u32);
                assert_eq!(*count, u32::from(occupied), "frame {frame}");
            }

            // 换入换出计数与驻留页数一致
            let resident: u64 = st
                .processes
                .iter()
                .map(|p| p.page_table().len() as u64)
                .sum();
            assert!(st.memory.paged_in() >= st.memory.paged_out());
            assert_eq!(st.memory.paged_in() - st.memory.paged_out(), resident);
        }
        kernel.stop_process_generation();
    }

    #[test]
    fn test_pids_are_monotone() {
        let kernel = boot(test_config(1, SchedulerType::Fcfs));
        let first = kernel.start_process("one", 64).unwrap();
        let second = kernel.start_process("two", 64).unwrap();
        let third = kernel.start_process("three", 256).unwrap();
        assert_eq!((first, second, third), (1, 2, 3));
    }
}
