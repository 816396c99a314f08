//! 入站路径：按连接状态处理报文段。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 入站处理是协议正确性的重心：确认号推进、乱序重组、FIN/RST 的
//!   状态迁移全部集中在本模块，调用方（所有权入口）只负责串行化；
//! - ESTABLISHED 走独立快路径 [`Connection::rcv_established`]，其余
//!   状态共享 [`Connection::rcv_state_process`]，与旧实现的
//!   “快/慢路径”划分一致。
//!
//! ## 契约 (What)
//! - 所有函数都在连接所有权之下调用（持有 `ConnCore` 独占引用）；
//! - ACK 合法区间为 `snd_una < ack <= snd_nxt`；区间之外的 ACK 在
//!   SYN_SENT 会触发复位回击，其余状态静默忽略；
//! - 乱序段触发立即 ACK；按序段走批量/延迟 ACK 判定；
//! - TIME_WAIT 不驻留：两端 FIN 交换完成即落 CLOSED，迟到报文段由
//!   无状态复位路径兜底。
//!
//! ## 风险 (Trade-offs)
//! - 不做 PAWS/时间戳校验（线上格式无时间戳选项），序号回绕防护完全
//!   依赖 ISN 推导中的时钟项。

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use nip_core::counters::StackCounters;
use nip_core::segment::{
    seq_before, seq_before_eq, seq_in_ack_range, Segment, SegmentCb, SegmentFlags, SegmentOptions,
};

use crate::conn::{ConnCore, ConnFailure, Connection};
use crate::state::TcpState;

/// 按序入队的结果。
#[derive(Default)]
struct QueueOutcome {
    /// 本次新交付给接收队列的载荷字节数。
    accepted: usize,
    /// 对端 FIN 在本次处理中按序就位。
    fin: bool,
    /// 携带 PSH 标志的数据就位。
    pushed: bool,
    /// 纯重复段（全部载荷都已收过）。
    dup: bool,
}

impl Connection {
    /// 所有权之下的统一入站入口。
    ///
    /// 应用侧 `close` 之后连接仍要继续消化对端报文段直到收敛到
    /// CLOSED（孤儿连接的 FIN/ACK 交换），因此这里只按状态拦截。
    pub(crate) fn process_segment(self: &Arc<Self>, core: &mut ConnCore, seg: Segment) {
        if core.state == TcpState::Closed {
            return;
        }
        core.segs_in += 1;
        match core.state {
            TcpState::Established => self.rcv_established(core, seg),
            // 监听连接的握手由分发层经半开请求表处理。
            TcpState::Listen => {}
            _ => self.rcv_state_process(core, seg),
        }
    }

    /// ESTABLISHED 快路径。
    fn rcv_established(self: &Arc<Self>, core: &mut ConnCore, seg: Segment) {
        let cb = seg.cb;
        if cb.flags.rst {
            self.handle_reset(core);
            return;
        }
        if cb.flags.syn {
            trace!("stray SYN in established, drop");
            return;
        }
        if !cb.flags.ack {
            return;
        }
        if !self.process_ack(core, &cb) {
            return;
        }
        core.probes_out = 0;
        core.ka.probes_out = 0;
        // 对端活跃即重置保活空闲计时。
        self.arm_keepalive_if_enabled(core);

        let outcome = self.queue_data(core, cb);
        if outcome.fin {
            core.fin_seen = true;
            core.state = TcpState::CloseWait;
            self.send_ack(core);
            self.recv_notify.notify_waiters();
            self.state_notify.notify_waiters();
        } else if outcome.accepted > 0 || outcome.dup {
            self.ack_snd_check(core, outcome.pushed, outcome.dup);
            if outcome.accepted > 0 {
                self.recv_notify.notify_waiters();
            }
        }
    }

    /// 非 ESTABLISHED 的慢路径。
    fn rcv_state_process(self: &Arc<Self>, core: &mut ConnCore, seg: Segment) {
        let cb = seg.cb;
        if core.state == TcpState::SynSent {
            self.rcv_syn_sent(core, cb);
            return;
        }
        if cb.flags.rst {
            self.handle_reset(core);
            return;
        }
        if cb.flags.syn {
            // 同步已完成后再现 SYN：按 RFC793 复位本连接。
            self.send_active_reset(core);
            self.enter_closed(core, Some(ConnFailure::Reset));
            return;
        }
        if !cb.flags.ack {
            return;
        }
        if !self.process_ack(core, &cb) {
            return;
        }
        let our_fin_acked = core.packets_out == 0 && core.snd_una == core.write_seq;

        match core.state {
            TcpState::SynReceived => {
                // 同时打开的收尾：我方 SYN 被确认即进入 ESTABLISHED。
                core.state = TcpState::Established;
                core.retries = 0;
                core.backoff = 0;
                self.state_notify.notify_waiters();
                self.send_notify.notify_waiters();
            }
            TcpState::FinWait1 => {
                let outcome = self.queue_data(core, cb);
                if our_fin_acked {
                    core.state = TcpState::FinWait2;
                }
                if outcome.fin {
                    core.fin_seen = true;
                    self.send_ack(core);
                    if our_fin_acked {
                        self.enter_time_wait(core);
                    } else {
                        core.state = TcpState::Closing;
                    }
                    self.recv_notify.notify_waiters();
                    self.state_notify.notify_waiters();
                } else if outcome.accepted > 0 || outcome.dup {
                    self.ack_snd_check(core, outcome.pushed, outcome.dup);
                    if outcome.accepted > 0 {
                        self.recv_notify.notify_waiters();
                    }
                }
            }
            TcpState::FinWait2 => {
                let outcome = self.queue_data(core, cb);
                if outcome.fin {
                    core.fin_seen = true;
                    self.send_ack(core);
                    self.enter_time_wait(core);
                    self.recv_notify.notify_waiters();
                } else if outcome.accepted > 0 || outcome.dup {
                    self.ack_snd_check(core, outcome.pushed, outcome.dup);
                    if outcome.accepted > 0 {
                        self.recv_notify.notify_waiters();
                    }
                }
            }
            TcpState::Closing => {
                if our_fin_acked {
                    self.enter_time_wait(core);
                }
            }
            TcpState::LastAck => {
                if our_fin_acked {
                    self.enter_closed(core, None);
                } else if cb.flags.fin {
                    // 对端重传 FIN，补 ACK。
                    self.send_ack(core);
                }
            }
            TcpState::CloseWait => {
                if cb.flags.fin {
                    self.send_ack(core);
                }
            }
            TcpState::TimeWait
            | TcpState::Closed
            | TcpState::Listen
            | TcpState::Established
            | TcpState::SynSent => {}
        }
    }

    /// SYN_SENT：主动打开方等待 SYN+ACK。
    fn rcv_syn_sent(self: &Arc<Self>, core: &mut ConnCore, cb: SegmentCb) {
        if cb.flags.ack {
            if !seq_in_ack_range(cb.ack_seq, core.snd_una, core.snd_nxt) {
                if cb.flags.rst {
                    return;
                }
                // 确认号越界：以其为序号回击 RST（对 RST 永不回击）。
                let seq = cb.ack_seq;
                if self.transmit_control(
                    core,
                    SegmentFlags::rst(),
                    seq,
                    Bytes::new(),
                    0,
                    SegmentOptions::default(),
                ) {
                    StackCounters::bump(&self.ctx.counters.resets_sent);
                }
                return;
            }
            if cb.flags.rst {
                self.handle_reset(core);
                return;
            }
        } else if cb.flags.rst {
            // 无 ACK 的 RST 在 SYN_SENT 不可验证，忽略。
            return;
        }

        if !cb.flags.syn {
            return;
        }

        core.rcv_nxt = cb.seq.wrapping_add(1);
        core.copied_seq = core.rcv_nxt;
        core.rcv_wup = core.rcv_nxt;
        core.snd_wnd = u32::from(cb.window);
        core.max_window = core.max_window.max(core.snd_wnd);
        if let Some(mss) = cb.options.mss {
            core.mss = core.mss.min(mss);
        }

        if cb.flags.ack {
            core.snd_una = cb.ack_seq;
            self.release_acked(core, cb.ack_seq);
            core.state = TcpState::Established;
            core.retries = 0;
            core.backoff = 0;
            core.dup_ack_cnt = 0;
            core.timers.retransmit = None;
            self.send_ack(core);
            self.arm_keepalive_if_enabled(core);
            debug!(local = %core.local, remote = %core.remote, "active open established");
            self.state_notify.notify_waiters();
            self.send_notify.notify_waiters();
        } else {
            // 同时打开：以本端 ISN 重发为 SYN+ACK。
            core.state = TcpState::SynReceived;
            let seq = core.snd_una;
            let mss = core.mss;
            self.transmit_control(
                core,
                SegmentFlags::syn_ack(),
                seq,
                Bytes::new(),
                0,
                SegmentOptions { mss: Some(mss) },
            );
        }
    }

    /// 确认号处理：窗口更新、重复 ACK 计数与在途单元释放。
    ///
    /// 返回 `false` 表示确认号指向未发送的数据，报文段整体丢弃。
    fn process_ack(self: &Arc<Self>, core: &mut ConnCore, cb: &SegmentCb) -> bool {
        let ack = cb.ack_seq;
        core.snd_wnd = u32::from(cb.window);
        core.max_window = core.max_window.max(core.snd_wnd);
        if core.snd_wnd > 0 && core.timers.probe0.is_some() {
            core.timers.probe0 = None;
            core.probes_out = 0;
            self.flush_pending(core, false);
        }

        if seq_before(core.snd_nxt, ack) {
            trace!(ack, snd_nxt = core.snd_nxt, "ack beyond snd_nxt, drop");
            return false;
        }
        if seq_before_eq(ack, core.snd_una) {
            if ack == core.snd_una
                && core.packets_out > 0
                && cb.payload.is_empty()
                && !cb.flags.fin
            {
                core.dup_ack_cnt += 1;
                if core.dup_ack_cnt == 3 {
                    debug!(ack, "triple duplicate ack, fast retransmit");
                    self.retransmit_head(core);
                }
            }
            return true;
        }

        // 新确认。
        self.release_acked(core, ack);
        core.snd_una = ack;
        core.retries = 0;
        core.backoff = 0;
        core.dup_ack_cnt = 0;
        if core.packets_out == 0 {
            core.timers.retransmit = None;
        } else {
            self.arm_retransmit(core);
        }
        self.flush_pending(core, false);
        self.send_notify.notify_waiters();
        true
    }

    /// 释放发送队列中已被整段确认的在途单元。
    fn release_acked(&self, core: &mut ConnCore, ack: u32) {
        while let Some(front) = core.write_queue.front() {
            if !seq_before_eq(front.end_seq, ack) {
                break;
            }
            let seg = core.write_queue.pop_front().expect("front checked");
            core.bytes_acked += u64::from(seg.seq_len());
            core.wmem = core.wmem.saturating_sub(seg.charged);
            self.ctx.memory.uncharge(seg.charged);
            if core.send_head > 0 {
                core.send_head -= 1;
                core.packets_out = core.packets_out.saturating_sub(1);
            }
        }
    }

    /// 载荷与 FIN 的入队：按序交付、乱序暂存、重复修剪。
    fn queue_data(self: &Arc<Self>, core: &mut ConnCore, mut cb: SegmentCb) -> QueueOutcome {
        let mut outcome = QueueOutcome::default();
        if cb.payload.is_empty() && !cb.flags.fin {
            return outcome;
        }

        // 修剪已交付的前缀。
        if seq_before(cb.seq, core.rcv_nxt) {
            let skip = core.rcv_nxt.wrapping_sub(cb.seq);
            if skip >= cb.seq_len() {
                // 纯重传：立即重申当前确认号。
                outcome.dup = true;
                return outcome;
            }
            let drop = (skip as usize).min(cb.payload.len());
            cb.payload = cb.payload.slice(drop..);
            cb.seq = core.rcv_nxt;
        }

        if cb.seq != core.rcv_nxt {
            // 乱序：暂存并立即 ACK 促使对端重传缺口。
            // 暂存字节与接收队列共享 rcvbuf 预算，超出即丢弃整段。
            let len = cb.payload.len();
            if core.ofo_queue.contains_key(&cb.seq) {
                self.send_ack(core);
                return outcome;
            }
            if core.rmem + core.ofo_bytes + len > self.ctx.config.rcvbuf
                || !self.ctx.memory.charge(len)
            {
                StackCounters::bump(&self.ctx.counters.memory_pressure_drops);
                debug!(len, "out-of-order stash refused, drop segment");
                return outcome;
            }
            trace!(seq = cb.seq, expect = core.rcv_nxt, "out of order, stash");
            core.ofo_bytes += len;
            core.ofo_queue.insert(cb.seq, cb);
            self.send_ack(core);
            return outcome;
        }

        if !self.deliver(core, cb, &mut outcome) {
            return outcome;
        }

        // 拉取乱序暂存中已接续的段。
        while let Some((&seq, _)) = core.ofo_queue.first_key_value() {
            if seq_before(core.rcv_nxt, seq) {
                break;
            }
            let mut cb = core
                .ofo_queue
                .pop_first()
                .map(|(_, cb)| cb)
                .expect("first checked");
            // 暂存记账在出队时整段归还，交付路径会对存活部分重新记账。
            let stashed = cb.payload.len();
            core.ofo_bytes = core.ofo_bytes.saturating_sub(stashed);
            self.ctx.memory.uncharge(stashed);
            if seq_before(cb.seq, core.rcv_nxt) {
                let skip = core.rcv_nxt.wrapping_sub(cb.seq);
                if skip >= cb.seq_len() {
                    continue;
                }
                let drop = (skip as usize).min(cb.payload.len());
                cb.payload = cb.payload.slice(drop..);
                cb.seq = core.rcv_nxt;
            }
            if !self.deliver(core, cb, &mut outcome) {
                break;
            }
        }
        outcome
    }

    /// 把一个按序段交付到接收队列（含记账）。
    fn deliver(&self, core: &mut ConnCore, cb: SegmentCb, outcome: &mut QueueOutcome) -> bool {
        let len = cb.payload.len();
        if len > 0 {
            if core.recv_shutdown {
                // 读方向已关闭：吞掉数据只推进序号。
                core.rcv_nxt = cb.seq.wrapping_add(len as u32);
                core.copied_seq = core.rcv_nxt;
            } else {
                if !self.ctx.memory.charge(len) {
                    StackCounters::bump(&self.ctx.counters.memory_pressure_drops);
                    debug!(len, "receive charge refused, drop segment");
                    return false;
                }
                core.rmem += len;
                core.rcv_nxt = cb.seq.wrapping_add(len as u32);
                core.bytes_received += len as u64;
                outcome.accepted += len;
                outcome.pushed |= cb.flags.psh;
            }
        }
        if cb.flags.fin {
            core.rcv_nxt = core.rcv_nxt.wrapping_add(1);
            outcome.fin = true;
        }
        if len > 0 && !core.recv_shutdown {
            core.receive_queue.push_back(cb);
        }
        true
    }

    /// 按序数据就位后的 ACK 即时性判定。
    fn ack_snd_check(&self, core: &mut ConnCore, pushed: bool, dup: bool) {
        if dup {
            // 重复段需要立即重申确认号，否则对端持续重传。
            self.send_ack(core);
            return;
        }
        let pending = core.rcv_nxt.wrapping_sub(core.rcv_wup);
        if pending > self.ctx.config.ack_batch * u32::from(core.rcv_mss) {
            self.send_ack(core);
        } else {
            self.schedule_ack(core, pushed);
        }
    }

    /// 对端复位：挂起调用全部以 `ConnectionReset` 失败。
    pub(crate) fn handle_reset(self: &Arc<Self>, core: &mut ConnCore) {
        debug!(state = ?core.state, "connection reset by peer");
        self.enter_closed(core, Some(ConnFailure::Reset));
    }

    /// TIME_WAIT 不驻留：记录后直接落 CLOSED，迟到段交无状态复位兜底。
    fn enter_time_wait(self: &Arc<Self>, core: &mut ConnCore) {
        core.state = TcpState::TimeWait;
        trace!("enter time-wait, discard immediately");
        self.enter_closed(core, None);
    }

    /// 终态收敛：摘除表项、清定时器、释放发送侧记账并唤醒所有等待者。
    ///
    /// 失败关闭（RST/中止）同时丢弃未读数据；有序关闭保留接收队列供
    /// 应用继续读完。
    pub(crate) fn enter_closed(
        self: &Arc<Self>,
        core: &mut ConnCore,
        failure: Option<ConnFailure>,
    ) {
        if let Some(f) = failure {
            core.failure.get_or_insert(f);
        }
        core.state = TcpState::Closed;
        core.timers.clear();
        self.unhash(core);
        for seg in core.write_queue.drain(..) {
            self.ctx.memory.uncharge(seg.charged);
        }
        core.wmem = 0;
        core.send_head = 0;
        core.packets_out = 0;
        if core.failure.is_some() || core.dead {
            // 失败关闭或应用已 close 的孤儿连接不再有读者，未读数据
            // 连同记账一并释放；有序关闭保留接收队列供应用读完。
            self.purge_receive_queues(core);
        }
        self.wake_all();
    }
}
