//! 通用工具函数

const KIB: f64 = 1024.0;

/// 字节数转换为 MB
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (KIB * KIB)
}

/// 字节数转换为 GB
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / (KIB * KIB * KIB)
}

/// 格式化为人类可读的大小，例如 "1.50 MB"
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < KIB {
            return format!("{:.2} {}", value, unit);
        }
        value /= KIB;
    }
    format!("{:.2} PB", value)
}
