//! 传输引擎错误域。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 每个应用可见操作拥有独立的错误枚举，调用方按操作面精确匹配，
//!   避免“大一统错误”在 API 边界丢失语义；
//! - 分类与恢复策略对齐整体错误设计：协议违例静默丢弃、资源耗尽
//!   计数后丢弃、地址冲突与参数越界原样返回调用方、重传超限与对端
//!   复位以连接级错误终结连接，任何失败都不会波及进程。
//!
//! ## 契约 (What)
//! - 全部类型实现 [`thiserror::Error`]，`Send + Sync + 'static`；
//! - `WouldBlock`/`TimedOut` 只在无任何字节完成传输时返回——部分
//!   成果优先于错误（见并发模型：确定性部分结果）。

use thiserror::Error;

/// 关闭方向（`shutdown` 的参数）。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownHow {
    /// 仅关闭发送方向（触发 FIN 流程）。
    Send,
    /// 仅关闭接收方向。
    Receive,
    /// 双向关闭。
    Both,
}

impl ShutdownHow {
    pub fn closes_send(self) -> bool {
        matches!(self, ShutdownHow::Send | ShutdownHow::Both)
    }

    pub fn closes_receive(self) -> bool {
        matches!(self, ShutdownHow::Receive | ShutdownHow::Both)
    }
}

/// `connect()` 的失败形态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// 目的地址为通配/非法地址。
    #[error("destination address is unspecified or invalid")]
    InvalidAddress,
    /// 路由协作方未能给出到对端的路径。
    #[error("no route to destination")]
    NoRoute,
    /// 四元组已被占用。
    #[error("address already in use")]
    AddressInUse,
    /// 临时端口空间耗尽。
    #[error("ephemeral port space exhausted")]
    PortExhausted,
    /// 握手重传预算耗尽。
    #[error("connection attempt timed out")]
    Timeout,
    /// 对端以 RST 拒绝握手。
    #[error("connection reset by peer")]
    ConnectionReset,
    /// 连接已不在可发起握手的状态。
    #[error("socket is not in a connectable state")]
    InvalidState,
    /// 挂起等待期间被外部信号中断。
    #[error("operation interrupted")]
    Interrupted,
}

/// `listen()` 的失败形态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ListenError {
    /// 存在不兼容（未启用端口复用）的同地址监听者。
    #[error("listen address already in use")]
    AddressInUse,
    /// 连接已脱离可监听状态。
    #[error("socket is not in a listenable state")]
    InvalidState,
}

/// `accept()` 的失败形态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AcceptError {
    /// 监听者已关闭。
    #[error("listener closed")]
    Closed,
    /// 非阻塞模式下接受队列为空。
    #[error("operation would block")]
    WouldBlock,
    /// 等待完成握手的连接超时。
    #[error("accept timed out")]
    TimedOut,
    /// 挂起等待期间被外部信号中断。
    #[error("operation interrupted")]
    Interrupted,
}

/// `send()` 的失败形态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// 连接未建立或已脱离可发送状态。
    #[error("socket is not connected")]
    NotConnected,
    /// 发送方向已被本端关闭。
    #[error("send direction already shut down")]
    Shutdown,
    /// 非阻塞模式下发送缓冲不足。
    #[error("operation would block")]
    WouldBlock,
    /// 写入中存在无论等待多久都放不进发送缓冲的分片。
    #[error("message can never fit into the send buffer")]
    MessageTooLarge,
    /// 对端复位了连接。
    #[error("connection reset by peer")]
    ConnectionReset,
    /// 重传预算耗尽，连接已被强制关闭。
    #[error("connection aborted")]
    ConnectionAborted,
    /// 挂起等待期间被外部信号中断（且无字节完成传输）。
    #[error("operation interrupted")]
    Interrupted,
}

/// `recv()` 的失败形态。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    /// 从未建立过连接的套接字上读取。
    #[error("socket is not connected")]
    NotConnected,
    /// 非阻塞模式下暂无就绪数据。
    #[error("operation would block")]
    WouldBlock,
    /// 等待数据超时。
    #[error("receive timed out")]
    TimedOut,
    /// 对端复位了连接。
    #[error("connection reset by peer")]
    ConnectionReset,
    /// 重传预算耗尽，连接已被强制关闭。
    #[error("connection aborted")]
    ConnectionAborted,
    /// 挂起等待期间被外部信号中断（且无字节完成传输）。
    #[error("operation interrupted")]
    Interrupted,
}

/// 保活参数配置的失败形态。
///
/// - **契约 (What)**：任何一项越界都整体拒绝，三项参数均不得部分生效。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum KeepaliveError {
    #[error("keepalive parameter out of range: {field} = {value}")]
    InvalidArgument {
        /// 越界的参数名（`idle` / `interval` / `probes`）。
        field: &'static str,
        value: u32,
    },
}
