//! 工具模块

use chrono::Local;

/// 进程创建时间戳，例如 `08/02/2026 09:15:42 PM`
pub fn creation_timestamp() -> String {
    Local::now().format("%m/%d/%Y %I:%M:%S %p").to_string()
}

/// PRINT日志行时间戳，微秒精度，例如 `2026-08-02 21:15:42.123456`
pub fn log_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}
