//! 协议栈可调参数。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 原生实现通过一组全局可调参数（缓冲区、RTO、延迟 ACK 批量因子、
//!   保活覆盖值等）控制协议行为；这里收敛为一个按栈实例持有的配置
//!   结构，测试可以为单个栈定制参数而不影响进程内其他实例；
//! - 默认值保持与原生参数一致的量级，时间单位统一为毫秒。
//!
//! ## 契约 (What)
//! - 配置在栈构建后只读；运行期按连接可变的仅有保活参数
//!   （经 `set_keepalive` / 保活适配器修改）；
//! - [`StackConfig::backlog_limit`] 给出连接背压队列的内存上限：
//!   `rcvbuf + sndbuf + 64KiB` 固定余量。

/// 保活参数的协议上限（时间单位：保活时基）。
pub const MAX_KEEPALIVE_IDLE: u32 = 32767;
/// 保活探测间隔上限。
pub const MAX_KEEPALIVE_INTERVAL: u32 = 32767;
/// 保活探测次数上限。
pub const MAX_KEEPALIVE_PROBES: u32 = 255;

/// 小包流判定阈值：单次写入总长度低于该值按小包流处理。
pub const SMALL_PAYLOAD_BOUNDARY: u32 = 100_000;

/// 协议栈配置。
#[derive(Clone, Debug)]
pub struct StackConfig {
    /// 发送缓冲字节上限。
    pub sndbuf: usize,
    /// 接收缓冲字节上限。
    pub rcvbuf: usize,
    /// 基准 MSS（未协商时的默认值）。
    pub base_mss: u16,
    /// 本端允许通告的 MSS 上限（0 表示不钳制）。
    pub user_mss: u16,
    /// 初始重传超时（毫秒）。
    pub initial_rto_ms: u64,
    /// 延迟 ACK 定时器上限（毫秒）。
    pub delack_ms: u64,
    /// 立即 ACK 的批量因子：未确认字节超过
    /// `ack_batch * rcv_mss` 即触发（对应原生 `g_ack_num` 档位）。
    pub ack_batch: u32,
    /// 重传放弃前的最大次数，超限强制关闭连接。
    pub max_retries: u32,
    /// 慢启动阈值默认值（字节积分，由外部拥塞策略消费）。
    pub default_ssthresh: u32,
    /// 保活覆盖：小包流的空闲阈值（时间单位）。
    pub keepalive_idle_short: u32,
    /// 保活覆盖：大包流的空闲阈值（时间单位）。
    pub keepalive_idle_long: u32,
    /// 保活覆盖：探测间隔（时间单位）。
    pub keepalive_interval: u32,
    /// 保活覆盖：无响应探测次数上限。
    pub keepalive_probes: u32,
    /// 覆盖期内允许的空闲探测数，达到后恢复基线参数。
    pub idle_probes_before_restore: u32,
    /// 保活时基：一个保活时间单位对应的毫秒数。
    pub keepalive_tick_ms: u64,
}

impl StackConfig {
    /// 连接背压队列内存上限：收发缓冲之和加固定余量。
    pub fn backlog_limit(&self) -> usize {
        self.rcvbuf + self.sndbuf + 64 * 1024
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            sndbuf: 1 << 20,
            rcvbuf: 1 << 20,
            base_mss: 1220,
            user_mss: 0,
            initial_rto_ms: 1000,
            delack_ms: 40,
            ack_batch: 2,
            max_retries: 15,
            default_ssthresh: 10 * 1460,
            keepalive_idle_short: 30,
            keepalive_idle_long: 600,
            keepalive_interval: 25,
            keepalive_probes: 255,
            idle_probes_before_restore: 20,
            keepalive_tick_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_limit_includes_fixed_slack() {
        let cfg = StackConfig {
            sndbuf: 1000,
            rcvbuf: 2000,
            ..StackConfig::default()
        };
        assert_eq!(cfg.backlog_limit(), 3000 + 64 * 1024);
    }
}
