//! 交互式shell模块
//!
//! 内核命令API的薄封装：读取命令行、分发到内核、把快照格式化到终端。
//! shell线程与内核线程竞争同一把内核锁，所有列表输出都是锁内一致的快照。

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use crate::config::SystemConfig;
use crate::kernel::{generator, Kernel, KernelError};

const MAIN_PROMPT: &str = "root:\\> ";
const REPORT_FILE: &str = "csopesy-log.txt";
const ANSI_CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// 解析后的shell命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Initialize,
    Exit,
    Help,
    Clear,
    SchedulerStart,
    SchedulerStop,
    ScreenList,
    ScreenReattach { name: String },
    ScreenStart { memory: u32, name: String },
    ScreenCustom { name: String, program: String },
    ProcessSmi,
    VmStat,
    ReportUtil,
    /// 结构正确但参数非法的命令
    Invalid(String),
    Unknown(String),
}

/// 解析一行命令
pub fn parse_command(line: &str) -> Command {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["initialize"] => Command::Initialize,
        ["exit"] => Command::Exit,
        ["help"] => Command::Help,
        ["clear"] => Command::Clear,
        ["scheduler-start"] => Command::SchedulerStart,
        ["scheduler-stop"] => Command::SchedulerStop,
        ["screen", "-ls"] => Command::ScreenList,
        ["screen", "-r", name] => Command::ScreenReattach { name: name.to_string() },
        ["screen", "-s", memory, name] => match memory.parse::<u32>() {
            Ok(memory) => Command::ScreenStart { memory, name: name.to_string() },
            Err(_) => Command::Invalid(format!("无法解析内存大小: '{memory}'")),
        },
        ["screen", "-c", name, program @ ..] if !program.is_empty() => Command::ScreenCustom {
            name: name.to_string(),
            program: program.join(" "),
        },
        ["screen", ..] => {
            Command::Invalid("用法: screen -ls | -r <name> | -s <memory> <name> | -c <name> <instructions>".to_string())
        }
        ["process-smi"] => Command::ProcessSmi,
        ["vmstat"] => Command::VmStat,
        ["report-util"] => Command::ReportUtil,
        _ => Command::Unknown(line.to_string()),
    }
}

/// 交互式shell
pub struct Shell {
    kernel: Arc<Kernel>,
    config_path: String,
}

impl Shell {
    pub fn new(kernel: Arc<Kernel>, config_path: String) -> Self {
        Self { kernel, config_path }
    }

    /// 在当前线程运行REPL直到 `exit` 或输入流结束
    pub fn run_interactive(&self) -> Result<()> {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();

        println!("Hello! Welcome to the CSOPESY commandline!");
        println!();
        println!("Type 'initialize' to start the main shell. Type 'exit' to quit.");

        loop {
            let Some(line) = prompt_line(&mut lines, MAIN_PROMPT)? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                println!("Please enter a command.");
                continue;
            }
            match parse_command(line) {
                Command::Exit => {
                    println!("Shutting down main shell...");
                    break;
                }
                command => self.dispatch(command, &mut lines)?,
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        command: Command,
        lines: &mut impl Iterator<Item = io::Result<String>>,
    ) -> Result<()> {
        // 初始化之前只接受 initialize / help / clear
        if !self.kernel.is_initialized()
            && !matches!(&command, Command::Initialize | Command::Help | Command::Clear)
        {
            println!("{}", KernelError::NotInitialized);
            return Ok(());
        }

        match command {
            Command::Initialize => {
                if self.kernel.is_initialized() {
                    println!("Kernel is already initialized.");
                    return Ok(());
                }
                match SystemConfig::load(&self.config_path) {
                    Ok(config) => {
                        self.kernel.initialize(&config);
                        println!("Main shell active. Type 'help' for available commands, or 'exit' to quit.");
                    }
                    Err(error) => println!("initialize failed: {error:#}"),
                }
            }
            Command::Exit => unreachable!("exit handled by the caller"),
            Command::Help => print_help(),
            Command::Clear => print!("{ANSI_CLEAR_SCREEN}"),
            Command::SchedulerStart => {
                self.kernel.start_process_generation();
                println!("Process generation started.");
            }
            Command::SchedulerStop => {
                self.kernel.stop_process_generation();
                println!("Process generation stopped.");
            }
            Command::ScreenList => print!("{}", self.kernel.status_snapshot()),
            Command::ScreenReattach { name } => match self.kernel.reattach(&name) {
                Ok(_) => self.attached_screen(&name, lines)?,
                Err(error) => println!("{error}"),
            },
            Command::ScreenStart { memory, name } => {
                match self.kernel.start_process(&name, memory) {
                    Ok(_) => self.attached_screen(&name, lines)?,
                    Err(error) => println!("{error}"),
                }
            }
            Command::ScreenCustom { name, program } => match generator::parse_program(&program) {
                Ok(instructions) => match self.kernel.create_custom_process(&name, 0, instructions)
                {
                    Ok(_) => self.attached_screen(&name, lines)?,
                    Err(error) => println!("{error}"),
                },
                Err(error) => println!("无法解析指令流: {error}"),
            },
            Command::ProcessSmi => print!("{}", self.kernel.memory_snapshot()),
            Command::VmStat => print!("{}", self.kernel.vmstat_snapshot()),
            Command::ReportUtil => match self.kernel.export_status_report(REPORT_FILE) {
                Ok(()) => println!("Report generated at {REPORT_FILE}"),
                Err(error) => println!("report-util failed: {error:#}"),
            },
            Command::Invalid(message) => println!("{message}"),
            Command::Unknown(line) => {
                println!("Unknown command: '{line}'. Type 'help' for assistance.")
            }
        }
        Ok(())
    }

    /// 连接到进程画面后的子REPL，支持 process-smi 与 exit
    fn attached_screen(
        &self,
        name: &str,
        lines: &mut impl Iterator<Item = io::Result<String>>,
    ) -> Result<()> {
        print!("{ANSI_CLEAR_SCREEN}");
        match self.kernel.process_screen(name) {
            Ok(screen) => print!("{screen}"),
            Err(error) => {
                println!("{error}");
                return Ok(());
            }
        }
        let prompt = format!("{name}:\\> ");
        loop {
            let Some(line) = prompt_line(lines, &prompt)? else {
                return Ok(());
            };
            match line.trim() {
                "exit" => {
                    print!("{ANSI_CLEAR_SCREEN}");
                    return Ok(());
                }
                "process-smi" => match self.kernel.process_screen(name) {
                    Ok(screen) => print!("{screen}"),
                    Err(error) => println!("{error}"),
                },
                "" => {}
                other => println!("Unknown screen command: '{other}'. Available: process-smi, exit"),
            }
        }
    }
}

/// 打印提示符并读取下一行；输入流结束时返回 None
fn prompt_line(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    prompt: &str,
) -> Result<Option<String>> {
    print!("{prompt}");
    io::stdout().flush().context("无法刷新标准输出")?;
    match lines.next() {
        Some(line) => Ok(Some(line.context("无法读取标准输入")?)),
        None => Ok(None),
    }
}

fn print_help() {
    println!();
    println!("--- Available Commands ---");
    println!("initialize            - Load the configuration and start the kernel.");
    println!("scheduler-start       - Start generating dummy processes.");
    println!("scheduler-stop        - Stop generating dummy processes.");
    println!("screen -ls            - List system status and processes.");
    println!("screen -r <name>      - Reattach to a running process screen.");
    println!("screen -s <mem> <name> - Start a process with the given memory.");
    println!("screen -c <name> <ins> - Start a process from raw instructions.");
    println!("process-smi           - Memory utilization report.");
    println!("vmstat                - Memory and CPU tick statistics.");
    println!("report-util           - Export the status listing to a file.");
    println!("clear                 - Clear the terminal screen.");
    println!("exit                  - Shut down and quit.");
    println!("--------------------------");
    println!();
}
