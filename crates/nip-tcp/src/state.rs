//! 连接状态与静态迁移表。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 拆除旧实现中“位掩码当前态 → 新态|动作标志”的静态数组，改用
//!   枚举匹配返回 `(下一状态, 是否发 FIN)`，迁移语义逐项保持一致；
//! - 关闭方向的状态迁移是单调的：任何从 CLOSED 出发的回退都不存在，
//!   调用方据此可以安全地在无锁读路径上缓存“已关闭”判定。
//!
//! ## 契约 (What)
//! - [`close_transition`] 精确复刻关闭迁移表；
//! - [`needs_reset_on_abort`] 给出 RFC793 要求在强制中止时发 RST 的
//!   状态集合；
//! - `LISTEN` 不是流状态：它只会派生 SYN_RECEIVED 子连接，自身关闭
//!   直接落到 CLOSED。

/// 传输连接状态。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

impl TcpState {
    /// 是否处于可收发应用数据的状态。
    pub fn can_send_data(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// 是否已经进入任一关闭流程（含完全关闭）。
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::TimeWait
                | TcpState::LastAck
                | TcpState::Closed
        )
    }
}

/// 本端主动关闭时的状态迁移：返回 `(下一状态, 是否需要发送 FIN)`。
///
/// 与旧实现的 `new_state[]` 表逐项对应：
///
/// | 当前状态      | 下一状态      | FIN |
/// |---------------|---------------|-----|
/// | ESTABLISHED   | FIN_WAIT1     | 是  |
/// | SYN_SENT      | CLOSED        | 否  |
/// | SYN_RECEIVED  | FIN_WAIT1     | 是  |
/// | FIN_WAIT1/2   | 原地不动      | 否  |
/// | TIME_WAIT     | CLOSED        | 否  |
/// | CLOSE_WAIT    | LAST_ACK      | 是  |
/// | LAST_ACK      | 原地不动      | 否  |
/// | LISTEN        | CLOSED        | 否  |
/// | CLOSING       | 原地不动      | 否  |
/// | CLOSED        | CLOSED        | 否  |
pub fn close_transition(state: TcpState) -> (TcpState, bool) {
    match state {
        TcpState::Established => (TcpState::FinWait1, true),
        TcpState::SynSent => (TcpState::Closed, false),
        TcpState::SynReceived => (TcpState::FinWait1, true),
        TcpState::FinWait1 => (TcpState::FinWait1, false),
        TcpState::FinWait2 => (TcpState::FinWait2, false),
        TcpState::TimeWait => (TcpState::Closed, false),
        TcpState::Closed => (TcpState::Closed, false),
        TcpState::CloseWait => (TcpState::LastAck, true),
        TcpState::LastAck => (TcpState::LastAck, false),
        TcpState::Listen => (TcpState::Closed, false),
        TcpState::Closing => (TcpState::Closing, false),
    }
}

/// 强制中止（disconnect）时按 RFC793 需要发送 RST 的状态。
pub fn needs_reset_on_abort(state: TcpState) -> bool {
    matches!(
        state,
        TcpState::Established
            | TcpState::CloseWait
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::SynReceived
    )
}
