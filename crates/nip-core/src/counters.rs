//! 进程内观测计数器。
//!
//! 对应原生实现的 MIB 统计项：这里只保留与本引擎丢弃/复位路径直接相关
//! 的几项，全部为宽松序原子计数，供测试与运维读取。

use core::sync::atomic::{AtomicU64, Ordering};

/// 栈级计数器集合。
///
/// - **契约 (What)**：所有递增都发生在对应的丢弃/复位动作之后；计数只
///   增不减，读取使用宽松序即可；
/// - **风险 (Trade-offs)**：不区分连接，按栈聚合；需要按连接细分时应
///   在上层自行拆分。
#[derive(Debug, Default)]
pub struct StackCounters {
    /// 监听队列满导致的握手丢弃。
    pub listen_overflows: AtomicU64,
    /// 连接背压队列超限导致的丢弃。
    pub backlog_drops: AtomicU64,
    /// 校验和失败丢弃。
    pub checksum_failures: AtomicU64,
    /// 未找到归属连接的报文段丢弃。
    pub no_socket_drops: AtomicU64,
    /// 主动发出的 RST 计数。
    pub resets_sent: AtomicU64,
    /// 记账被拒导致的入队失败。
    pub memory_pressure_drops: AtomicU64,
}

impl StackCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
