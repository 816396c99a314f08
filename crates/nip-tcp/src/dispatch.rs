//! 分发层：入站报文段到归属连接的路由。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 分发层只做归属判定，不做协议处理：四元组命中交连接自身的
//!   所有权入口；半开请求与监听者的握手在此完成（此时尚无可串行化
//!   的连接对象）；两者都未命中则走无状态复位兜底；
//! - 被动打开以半开请求（[`HandshakeRequest`]）占住四元组表项，
//!   第三次握手原子地把它晋升为完全体子连接，并发竞争由表层的
//!   条件替换裁决，只有一个胜者。
//!
//! ## 契约 (What)
//! - 非本机单播一律丢弃；校验失败计数后丢弃；
//! - 重复 SYN 幂等：命中半开请求时仅重发 SYN+ACK，不生成新请求；
//! - 第三次握手的合法条件：`ack == isn + 1` 且 `seq == peer_isn + 1`；
//!   不合法时以入站确认号为序号回击 RST；
//! - 接受队列满时 SYN 静默丢弃并计 `listen_overflows`（对端重传
//!   SYN 时队列可能已有空位）。

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use nip_core::addr::SocketAddrNip;
use nip_core::counters::StackCounters;
use nip_core::segment::{PacketClass, Segment, SegmentCb, SegmentFlags, SegmentOptions};

use crate::conn::{Connection, HandshakeRequest, StackCtx};
use crate::output::send_reset_for;
use crate::state::TcpState;
use crate::table::{FourTuple, LookupCtx, TableEntry};
use crate::timer::spawn_timer_driver;

/// 入站报文段的统一入口。
pub(crate) fn dispatch_segment(
    ctx: &Arc<StackCtx>,
    seg: Segment,
    class: PacketClass,
    lctx: LookupCtx,
) {
    if class != PacketClass::Host {
        trace!("non-host packet class, drop");
        return;
    }
    if !ctx.checksum.verify(&seg) {
        StackCounters::bump(&ctx.counters.checksum_failures);
        debug!("checksum verification failed, drop");
        return;
    }

    match ctx.table.lookup_established(
        ctx.net,
        seg.dst_addr,
        seg.dst_port,
        seg.src_addr,
        seg.src_port,
    ) {
        Some(TableEntry::Established(conn)) => conn.receive_segment(seg),
        Some(TableEntry::Pending(req)) => handle_pending(ctx, req, seg),
        None => {
            if seg.cb.flags.syn && !seg.cb.flags.ack {
                let flow_src = SocketAddrNip::new(seg.src_addr, seg.src_port);
                if let Some(entry) =
                    ctx.table
                        .lookup_listener(ctx.net, seg.dst_addr, seg.dst_port, flow_src, lctx)
                {
                    if let Some(listener) = entry.conn.upgrade() {
                        conn_request(ctx, &listener, &seg);
                        return;
                    }
                }
            }
            StackCounters::bump(&ctx.counters.no_socket_drops);
            send_reset_for(ctx, &seg);
        }
    }
}

/// 被动打开：为入站 SYN 建立半开请求并应答 SYN+ACK。
fn conn_request(ctx: &Arc<StackCtx>, listener: &Arc<Connection>, seg: &Segment) {
    let accept_ok = listener.with_owner(|core| {
        core.state == TcpState::Listen && core.listen.as_ref().is_some_and(|l| !l.is_full())
    });
    if !accept_ok {
        StackCounters::bump(&ctx.counters.listen_overflows);
        debug!("accept queue full, drop SYN");
        return;
    }
    let Some(dest) = ctx.router.resolve_route(&seg.dst_addr, &seg.src_addr) else {
        debug!("no route back to SYN source, drop");
        return;
    };

    let tuple = FourTuple {
        net: ctx.net,
        local: SocketAddrNip::new(seg.dst_addr, seg.dst_port),
        remote: SocketAddrNip::new(seg.src_addr, seg.src_port),
    };
    let isn = ctx
        .seqgen
        .sequence_number(&seg.dst_addr, &seg.src_addr, seg.dst_port, seg.src_port);
    let mut mss = ctx.config.base_mss.min(dest.advertised_mss);
    if let Some(peer_mss) = seg.cb.options.mss {
        mss = mss.min(peer_mss);
    }
    if ctx.config.user_mss != 0 {
        mss = mss.min(ctx.config.user_mss);
    }

    let req = Arc::new(HandshakeRequest {
        tuple,
        isn,
        peer_isn: seg.cb.seq,
        mss,
        dest,
        listener: Arc::downgrade(listener),
    });
    if ctx
        .table
        .insert_established(tuple, TableEntry::Pending(req.clone()))
        .is_err()
    {
        // 并发重复 SYN：已有占位者，由其路径应答。
        return;
    }
    send_synack(ctx, &req);
}

/// 以半开请求的参数发送（或重发）SYN+ACK。
fn send_synack(ctx: &Arc<StackCtx>, req: &HandshakeRequest) {
    let window = ctx.config.rcvbuf.min(65_535) as u16;
    let cb = SegmentCb::new(
        req.isn,
        req.peer_isn.wrapping_add(1),
        SegmentFlags::syn_ack(),
        window,
        SegmentOptions { mss: Some(req.mss) },
        Bytes::new(),
    );
    let mut out = Segment {
        src_addr: req.tuple.local.addr,
        src_port: req.tuple.local.port,
        dst_addr: req.tuple.remote.addr,
        dst_port: req.tuple.remote.port,
        cb,
        pkt_total_len: 0,
        checksum: 0,
    };
    out.checksum = ctx.checksum.compute(&out);
    ctx.tx.transmit(out, &req.dest);
}

/// 半开请求上的后续报文段：重复 SYN、RST 或第三次握手。
fn handle_pending(ctx: &Arc<StackCtx>, req: Arc<HandshakeRequest>, seg: Segment) {
    if seg.cb.flags.rst {
        ctx.table
            .remove_established(&req.tuple, &TableEntry::Pending(req.clone()));
        return;
    }
    if seg.cb.flags.syn && !seg.cb.flags.ack {
        trace!("duplicate SYN, resend SYN+ACK");
        send_synack(ctx, &req);
        return;
    }
    if !seg.cb.flags.ack {
        return;
    }
    if seg.cb.ack_seq != req.isn.wrapping_add(1)
        || seg.cb.seq != req.peer_isn.wrapping_add(1)
    {
        debug!("invalid third handshake ack, reset");
        send_reset_for(ctx, &seg);
        return;
    }

    let Some(listener) = req.listener.upgrade() else {
        ctx.table
            .remove_established(&req.tuple, &TableEntry::Pending(req.clone()));
        send_reset_for(ctx, &seg);
        return;
    };

    let child = Connection::new(ctx.clone());
    {
        let mut core = child.core.lock();
        core.state = TcpState::Established;
        core.local = req.tuple.local;
        core.remote = req.tuple.remote;
        core.tuple = Some(req.tuple);
        core.dest = Some(req.dest);
        core.mss = req.mss;
        core.rcv_mss = req.mss;
        let snd = req.isn.wrapping_add(1);
        core.write_seq = snd;
        core.snd_nxt = snd;
        core.snd_una = snd;
        core.rcv_nxt = req.peer_isn.wrapping_add(1);
        core.copied_seq = core.rcv_nxt;
        core.rcv_wup = core.rcv_nxt;
        core.snd_wnd = u32::from(seg.cb.window);
        core.max_window = core.snd_wnd;
    }

    if ctx
        .table
        .promote_pending(&req.tuple, &req, child.clone())
        .is_err()
    {
        // 并发晋升竞争失败：本子连接未入表，直接丢弃。
        return;
    }

    let queued = listener.with_owner(|core| {
        if core.state != TcpState::Listen {
            return false;
        }
        let Some(listen) = core.listen.as_mut() else {
            return false;
        };
        if listen.is_full() {
            StackCounters::bump(&ctx.counters.listen_overflows);
            return false;
        }
        listen.queue.push_back(child.clone());
        true
    });
    if !queued {
        debug!("listener gone or full at promotion, abort child");
        child.abort();
        return;
    }
    listener.accept_notify.notify_waiters();
    spawn_timer_driver(&child);
    debug!(local = %req.tuple.local, remote = %req.tuple.remote, "passive open established");
    // 第三次握手可能捎带数据，交子连接继续处理。
    child.receive_segment(seg);
}
