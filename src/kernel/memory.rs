//! 分页内存管理模块
//!
//! 物理内存是固定数量的页框，每个页框存放 `mem_per_frame / 2` 个u16字。
//! 页框由空闲位图统一管理；每个进程持有自己的页表（虚拟页号 → 页框号），
//! 页框不在进程之间共享。没有页面置换：空闲页框耗尽即终止故障进程。

use nohash_hasher::BuildNoHashHasher;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use super::process::{Process, ProcessState};

/// 每进程页表：虚拟页号 → 物理页框号
pub type PageTable = HashMap<u32, u32, BuildNoHashHasher<u32>>;

/// 内存错误类型
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("物理内存越界: 页框 {frame}, 字偏移 {word_offset}")]
    OutOfBounds { frame: u32, word_offset: u32 },
    #[error("空闲页框耗尽: 进程 {pid} 访问虚拟地址 {addr:#x}")]
    OutOfFrames { pid: u32, addr: u32 },
    #[error("虚拟地址未映射: 进程 {pid} 的虚拟页 {vpn}")]
    Unmapped { pid: u32, vpn: u32 },
}

/// 内存管理器
#[derive(Debug)]
pub struct MemoryManager {
    /// 每个页框的大小（字节）
    mem_per_frame: u32,
    /// 页框总数
    total_frames: u32,
    /// 模拟物理内存，按u16字存储
    physical_memory: Vec<u16>,
    /// 空闲页框位图，true 表示空闲
    free_frames: Vec<bool>,
    /// 累计换入页数
    paged_in: u64,
    /// 累计换出页数
    paged_out: u64,
}

impl MemoryManager {
    pub fn new(max_overall_mem: u32, mem_per_frame: u32) -> Self {
        let total_frames = max_overall_mem / mem_per_frame;
        let total_words = (total_frames * mem_per_frame / 2) as usize;
        Self {
            mem_per_frame,
            total_frames,
            physical_memory: vec![0; total_words],
            free_frames: vec![true; total_frames as usize],
            paged_in: 0,
            paged_out: 0,
        }
    }

    fn words_per_frame(&self) -> u32 {
        self.mem_per_frame / 2
    }

    /// 线性扫描空闲位图
    fn find_free_frame(&self) -> Option<u32> {
        self.free_frames.iter().position(|&free| free).map(|i| i as u32)
    }

    /// 处理一次虚拟地址访问
    ///
    /// 所在虚拟页已驻留时什么都不做；否则分配一个空闲页框并记入页表。
    /// 空闲页框耗尽时终止故障进程，空闲计数保持不变。
    pub fn handle_access(&mut self, process: &mut Process, virtual_address: u32) {
        let vpn = virtual_address / self.mem_per_frame;
        if process.page_table().contains_key(&vpn) {
            return;
        }
        match self.find_free_frame() {
            Some(frame) => {
                self.free_frames[frame as usize] = false;
                process.page_table_mut().insert(vpn, frame);
                self.paged_in += 1;
            }
            None => {
                let fault = MemoryError::OutOfFrames {
                    pid: process.pid(),
                    addr: virtual_address,
                };
                warn!(pid = process.pid(), addr = virtual_address, "空闲页框耗尽，终止进程");
                process.push_log(format!("Memory fault: {fault}"));
                process.terminate();
            }
        }
    }

    /// 读取虚拟地址处的u16字
    ///
    /// 进程在访问中被终止时返回0；越界访问记录错误日志并返回0。
    pub fn read(&mut self, process: &mut Process, virtual_address: u32) -> u16 {
        self.handle_access(process, virtual_address);
        if process.state() == ProcessState::Terminated {
            return 0;
        }
        match self.translate(process, virtual_address) {
            Ok(index) => self.physical_memory[index],
            Err(error) => {
                process.push_log(format!("Memory fault: {error}"));
                0
            }
        }
    }

    /// 写入u16字到虚拟地址
    pub fn write(&mut self, process: &mut Process, virtual_address: u32, value: u16) {
        self.handle_access(process, virtual_address);
        if process.state() == ProcessState::Terminated {
            return;
        }
        match self.translate(process, virtual_address) {
            Ok(index) => self.physical_memory[index] = value,
            Err(error) => {
                process.push_log(format!("Memory fault: {error}"));
            }
        }
    }

    /// 虚拟地址 → 物理字下标
    fn translate(&self, process: &Process, virtual_address: u32) -> Result<usize, MemoryError> {
        let vpn = virtual_address / self.mem_per_frame;
        let frame = *process
            .page_table()
            .get(&vpn)
            .ok_or(MemoryError::Unmapped { pid: process.pid(), vpn })?;
        let word_offset = (virtual_address % self.mem_per_frame) / 2;
        let index = frame * self.words_per_frame() + word_offset;
        if index as usize >= self.physical_memory.len() {
            return Err(MemoryError::OutOfBounds { frame, word_offset });
        }
        Ok(index as usize)
    }

    /// 释放进程持有的全部页框并清空其页表
    ///
    /// 进程终止时调用；对已经释放过的进程是无害的空操作。
    pub fn release(&mut self, process: &mut Process) {
        for (_vpn, frame) in process.page_table_mut().drain() {
            if !self.free_frames[frame as usize] {
                self.free_frames[frame as usize] = true;
                self.paged_out += 1;
            }
        }
    }

    // ------ 统计 ------

    pub fn mem_per_frame(&self) -> u32 {
        self.mem_per_frame
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_frames * self.mem_per_frame
    }

    pub fn occupied_frames(&self) -> u32 {
        self.free_frames.iter().filter(|&&free| !free).count() as u32
    }

    pub fn used_bytes(&self) -> u32 {
        self.occupied_frames() * self.mem_per_frame
    }

    pub fn frame_is_free(&self, frame: u32) -> bool {
        self.free_frames
            .get(frame as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn paged_in(&self) -> u64 {
        self.paged_in
    }

    pub fn paged_out(&self) -> u64 {
        self.paged_out
    }
}
