//! 出站路径：报文段构造、窗口通告、ACK 调度与待发队列冲刷。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 所有出站报文段集中经由 [`Connection::transmit_control`] /
//!   [`Connection::flush_pending`] 构造：统一填充序号、通告窗口与
//!   校验和，状态机各分支只声明“要发什么”，不重复拼装细节；
//! - ACK 调度拆成“登记待发”（`schedule_ack`）与“判定即时性”
//!   （`maybe_send_ack`）两层，延迟 ACK 定时器只消费登记结果。
//!
//! ## 契约 (What)
//! - 即时 ACK 的三个触发条件：
//!   (a) 自上次通告以来新收字节超过批量阈值且已有 ACK 待发；
//!   (b) 应用刚清空接收缓冲且无紧迫 ACK 积压；
//!   (c) 通告窗口可增长到上次值的两倍以上，且已腾出至少半个钳制值；
//!   其余情况一律交给延迟 ACK 定时器；
//! - 零窗口与重传定时器互斥：无在途数据时武装探测定时器，有在途
//!   数据时只武装重传定时器。

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use nip_core::counters::StackCounters;
use nip_core::segment::{Segment, SegmentCb, SegmentFlags, SegmentOptions};

use crate::conn::{ConnCore, Connection, StackCtx};

/// 通告窗口上限（无窗口缩放）。
pub(crate) const WINDOW_MAX: u32 = 65_535;

impl Connection {
    /// 计算当前可通告的接收窗口。
    pub(crate) fn select_window(&self, core: &ConnCore) -> u16 {
        let free = self
            .ctx
            .config
            .rcvbuf
            .saturating_sub(core.rmem)
            .min(WINDOW_MAX as usize) as u32;
        let clamped = if core.window_clamp > 0 {
            free.min(core.window_clamp)
        } else {
            free
        };
        clamped as u16
    }

    /// 构造并发送一个控制报文段（SYN/ACK/FIN/RST 或携带数据的单元）。
    ///
    /// 返回 `false` 表示路由未解析、报文段被放弃（调用方自行决定重试）。
    pub(crate) fn transmit_control(
        &self,
        core: &mut ConnCore,
        flags: SegmentFlags,
        seq: u32,
        payload: Bytes,
        pkt_total_len: u32,
        options: SegmentOptions,
    ) -> bool {
        let Some(dest) = core.dest else {
            debug!("no destination resolved, drop outbound segment");
            return false;
        };
        let ack_seq = if flags.ack { core.rcv_nxt } else { 0 };
        let window = self.select_window(core);
        let cb = SegmentCb::new(seq, ack_seq, flags, window, options, payload);
        let mut seg = Segment {
            src_addr: core.local.addr,
            src_port: core.local.port,
            dst_addr: core.remote.addr,
            dst_port: core.remote.port,
            cb,
            pkt_total_len,
            checksum: 0,
        };
        seg.checksum = self.ctx.checksum.compute(&seg);
        if flags.ack {
            core.rcv_wup = core.rcv_nxt;
            core.rcv_window = u32::from(window);
            core.ack_scheduled = false;
            core.ack_pushed = false;
            core.ack_pushed2 = false;
            core.timers.delack = None;
        }
        core.segs_out += 1;
        self.ctx.tx.transmit(seg, &dest);
        true
    }

    /// 发送一个纯 ACK。
    pub(crate) fn send_ack(&self, core: &mut ConnCore) {
        let seq = core.snd_nxt;
        self.transmit_control(
            core,
            SegmentFlags::ack(),
            seq,
            Bytes::new(),
            0,
            SegmentOptions::default(),
        );
    }

    /// 登记一个待发 ACK（延迟 ACK 定时器兜底）。
    pub(crate) fn schedule_ack(&self, core: &mut ConnCore, pushed: bool) {
        core.ack_scheduled = true;
        if pushed {
            if core.ack_pushed {
                core.ack_pushed2 = true;
            }
            core.ack_pushed = true;
        }
        if core.timers.delack.is_none() {
            core.timers.delack =
                Some(Instant::now() + Duration::from_millis(self.ctx.config.delack_ms));
            self.timer_notify.notify_waiters();
        }
    }

    /// 应用取走 `copied` 字节后的 ACK 即时性判定（清理接收缓冲路径）。
    pub(crate) fn maybe_send_ack(&self, core: &mut ConnCore, copied: usize) {
        let mut time_to_ack = false;

        if core.ack_scheduled {
            let batch = self.ctx.config.ack_batch * core.rcv_mss as u32;
            let pending_bytes = core.rcv_nxt.wrapping_sub(core.rcv_wup);
            if pending_bytes > batch
                || (copied > 0
                    && (core.ack_pushed2 || core.ack_pushed)
                    && core.rmem == 0)
            {
                time_to_ack = true;
            }
        }

        // 窗口显著扩大：上次通告窗口不足钳制值一半，且新窗口至少翻倍。
        if copied > 0 && !time_to_ack && !core.recv_shutdown {
            let last = core.rcv_window;
            if 2 * last <= core.window_clamp {
                let new_window = u32::from(self.select_window(core));
                if new_window > 0 && new_window >= 2 * last {
                    time_to_ack = true;
                }
            }
        }

        if time_to_ack {
            self.send_ack(core);
        }
    }

    /// 把 FIN 追加到发送队列末尾并冲刷。
    pub(crate) fn send_fin(&self, core: &mut ConnCore) {
        let seq = core.write_seq;
        core.write_queue.push_back(crate::conn::TxSeg {
            seq,
            end_seq: seq.wrapping_add(1),
            syn: false,
            fin: true,
            psh: false,
            payload: Bytes::new(),
            pkt_total_len: 0,
            charged: 0,
        });
        core.write_seq = core.write_seq.wrapping_add(1);
        self.flush_pending(core, true);
    }

    /// 主动复位：RST 序号取当前发送序号。
    pub(crate) fn send_active_reset(&self, core: &mut ConnCore) {
        let seq = core.snd_nxt;
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
    }

    /// 冲刷待发队列。
    ///
    /// `push` 为真时绕过 Nagle 合并；零窗口时停止发送并转入探测定时。
    pub(crate) fn flush_pending(&self, core: &mut ConnCore, push: bool) {
        while core.send_head < core.write_queue.len() {
            let (seq, end_seq, syn, fin, psh, payload, pkt_total_len) = {
                let seg = &core.write_queue[core.send_head];
                (
                    seg.seq,
                    seg.end_seq,
                    seg.syn,
                    seg.fin,
                    seg.psh,
                    seg.payload.clone(),
                    seg.pkt_total_len,
                )
            };

            if !syn && !payload.is_empty() && core.snd_wnd == 0 {
                trace!("zero window, defer flush");
                break;
            }

            // Nagle：未要求立即推送且有在途数据时，小于 MSS 的尾单元等待合并。
            if !push
                && !syn
                && !fin
                && payload.len() < core.mss as usize
                && core.packets_out > 0
            {
                break;
            }

            let flags = SegmentFlags {
                syn,
                fin,
                psh: psh || (push && !syn),
                ack: !syn,
                rst: false,
            };
            let options = if syn {
                SegmentOptions {
                    mss: Some(core.mss),
                }
            } else {
                SegmentOptions::default()
            };
            if !self.transmit_control(core, flags, seq, payload, pkt_total_len, options) {
                break;
            }
            core.snd_nxt = end_seq;
            core.send_head += 1;
            core.packets_out += 1;
            if core.timers.retransmit.is_none() {
                self.arm_retransmit(core);
            }
        }

        if core.send_head < core.write_queue.len() {
            self.check_probe_timer(core);
        }
    }

    /// 重传队首在途单元（超时重传与快速重传共用）。
    pub(crate) fn retransmit_head(&self, core: &mut ConnCore) {
        if core.send_head == 0 || core.write_queue.is_empty() {
            return;
        }
        let (seq, syn, fin, psh, payload, pkt_total_len) = {
            let seg = &core.write_queue[0];
            (
                seg.seq,
                seg.syn,
                seg.fin,
                seg.psh,
                seg.payload.clone(),
                seg.pkt_total_len,
            )
        };
        let flags = SegmentFlags {
            syn,
            fin,
            psh,
            ack: !syn,
            rst: false,
        };
        let options = if syn {
            SegmentOptions {
                mss: Some(core.mss),
            }
        } else {
            SegmentOptions::default()
        };
        trace!(seq, "retransmit head segment");
        self.transmit_control(core, flags, seq, payload, pkt_total_len, options);
    }

    /// 零窗口探测：发送一个序号落在窗口左沿之前的轻量段促使对端重报窗口。
    pub(crate) fn send_probe0(&self, core: &mut ConnCore) {
        let seq = core.snd_una.wrapping_sub(1);
        self.transmit_control(
            core,
            SegmentFlags::ack(),
            seq,
            Bytes::new(),
            0,
            SegmentOptions::default(),
        );
        core.probes_out += 1;
    }
}

/// 针对无归属连接报文段的无状态复位。
///
/// 复刻旧实现规则：对 RST 永不回 RST；入站带 ACK 时以其确认号为序号，
/// 否则以入站序号空间右端为确认号回 RST+ACK。
pub(crate) fn send_reset_for(ctx: &Arc<StackCtx>, inbound: &Segment) {
    if inbound.cb.flags.rst {
        return;
    }
    let (seq, ack_seq, with_ack) = if inbound.cb.flags.ack {
        (inbound.cb.ack_seq, 0, false)
    } else {
        (0, inbound.cb.end_seq, true)
    };
    let Some(dest) = ctx
        .router
        .resolve_route(&inbound.dst_addr, &inbound.src_addr)
    else {
        return;
    };
    let flags = SegmentFlags {
        rst: true,
        ack: with_ack,
        ..SegmentFlags::default()
    };
    let cb = SegmentCb::new(seq, ack_seq, flags, 0, SegmentOptions::default(), Bytes::new());
    let mut seg = Segment {
        src_addr: inbound.dst_addr,
        src_port: inbound.dst_port,
        dst_addr: inbound.src_addr,
        dst_port: inbound.src_port,
        cb,
        pkt_total_len: 0,
        checksum: 0,
    };
    seg.checksum = ctx.checksum.compute(&seg);
    StackCounters::bump(&ctx.counters.resets_sent);
    debug!("send stateless reset");
    ctx.tx.transmit(seg, &dest);
}
