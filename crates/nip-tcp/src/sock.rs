//! 应用可见操作面：连接建立、数据收发与关闭。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 所有阻塞式操作遵循同一等待模式：先创建 `notified()` 未来、再在
//!   所有权之下检查状态，两步之间的任何状态变更都不会丢失唤醒；
//! - 非阻塞模式不挂起：无法立即完成时返回 `WouldBlock`（`connect`
//!   例外，SYN 发出即返回，调用方轮询状态）。
//!
//! ## 契约 (What)
//! - `send` 按当前 MSS 把写入拆成若干在途单元；缓冲耗尽时已入队的
//!   字节数作为部分成果返回，只有一个字节都没写进去才报错或挂起；
//! - `recv` 的部分成果优先于错误：只要有字节交付就返回字节数；
//! - `set_recv_timeout` 约束 `recv` 与 `accept` 的挂起时长；
//!   `interrupt` 打断下一次挂起等待，一次性生效；
//! - `close` 在仍有未读数据时直接以 RST 终结（避免对端误以为数据
//!   已被完整消费）；接受队列中未取走的子连接随监听者关闭一并中止；
//! - `disconnect` 把连接打回可复用的 CLOSED：发送序号在旧值上前跳
//!   `max_window + 2`（回绕到 0 时取 1），传输状态整体再初始化。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, info};

use nip_core::addr::{NipAddr, SocketAddrNip};
use nip_core::error::{
    AcceptError, ConnectError, ListenError, RecvError, SendError, ShutdownHow,
};

use crate::conn::{ConnFailure, Connection, ListenState, TxSeg};
use crate::state::{close_transition, needs_reset_on_abort, TcpState};
use crate::table::{FourTuple, ListenerEntry, TableEntry};
use crate::timer::spawn_timer_driver;

enum Step<T, E> {
    Ready(Result<T, E>),
    Wait,
}

/// 带可选期限的挂起等待；超时返回 `false`。
async fn wait_until(notified: Notified<'_>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, notified).await.is_ok(),
        None => {
            notified.await;
            true
        }
    }
}

impl Connection {
    /// 绑定本端地址（通配地址用于监听端；端口 0 由连接阶段分配）。
    pub fn bind(&self, addr: SocketAddrNip) -> Result<(), ConnectError> {
        let mut core = self.core.lock();
        if core.state != TcpState::Closed || core.tuple.is_some() {
            return Err(ConnectError::InvalidState);
        }
        core.local = addr;
        Ok(())
    }

    pub fn set_nonblocking(&self, on: bool) {
        self.core.lock().nonblocking = on;
    }

    /// 设置接收类操作（`recv`/`accept`）的阻塞等待上限；`None` 为无限期。
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.core.lock().rcv_timeout = timeout;
    }

    /// 打断下一次挂起等待。
    ///
    /// 一次性标志，被打断的调用消费后自动清除；已有部分成果的调用
    /// 返回成果而非 `Interrupted`。
    pub fn interrupt(&self) {
        self.core.lock().interrupt_pending = true;
        self.wake_all();
    }

    /// 端口复用开关；需在 `listen` 之前设置。
    pub fn set_reuseport(&self, on: bool) {
        self.core.lock().reuseport = on;
    }

    /// 绑定设备索引（监听评分的淘汰项）。
    pub fn bind_device(&self, dev: Option<u32>) {
        self.core.lock().bound_dev = dev;
    }

    /// 处理单元亲和提示（监听评分的加分项）。
    pub fn set_cpu_affinity(&self, cpu: Option<usize>) {
        self.core.lock().cpu_hint = cpu;
    }

    pub fn local_addr(&self) -> SocketAddrNip {
        self.core.lock().local
    }

    pub fn peer_addr(&self) -> Option<SocketAddrNip> {
        let core = self.core.lock();
        core.tuple.map(|t| t.remote)
    }

    /// 主动打开：解析路由、绑定端口、发送 SYN 并等待握手完成。
    ///
    /// 非阻塞模式下 SYN 发出即返回 `Ok(())`，调用方经 `state()` 轮询。
    pub async fn connect(self: &Arc<Self>, remote: SocketAddrNip) -> Result<(), ConnectError> {
        if remote.addr.is_any() || !remote.addr.is_valid() || remote.port == 0 {
            return Err(ConnectError::InvalidAddress);
        }

        let nonblocking = self.with_owner(|core| {
            if core.state != TcpState::Closed || core.tuple.is_some() {
                return Err(ConnectError::InvalidState);
            }
            let dest = self
                .ctx
                .router
                .resolve_route(&core.local.addr, &remote.addr)
                .ok_or(ConnectError::NoRoute)?;
            let local_addr = if core.local.addr.is_any() {
                dest.src_addr
            } else {
                core.local.addr
            };

            let (port, tuple) = if core.local.port == 0 {
                let offset =
                    self.ctx
                        .seqgen
                        .ephemeral_port_offset(&local_addr, &remote.addr, remote.port);
                self.ctx
                    .table
                    .bind_ephemeral(self.ctx.net, local_addr, remote, offset, |_| {
                        TableEntry::Established(self.clone())
                    })
                    .ok_or(ConnectError::PortExhausted)?
            } else {
                let tuple = FourTuple {
                    net: self.ctx.net,
                    local: SocketAddrNip::new(local_addr, core.local.port),
                    remote,
                };
                self.ctx
                    .table
                    .insert_established(tuple, TableEntry::Established(self.clone()))
                    .map_err(|_| ConnectError::AddressInUse)?;
                (core.local.port, tuple)
            };

            core.local = SocketAddrNip::new(local_addr, port);
            core.remote = remote;
            core.tuple = Some(tuple);
            let mut mss = self.ctx.config.base_mss.min(dest.advertised_mss);
            if self.ctx.config.user_mss != 0 {
                mss = mss.min(self.ctx.config.user_mss);
            }
            core.mss = mss;
            core.dest = Some(dest);

            // 断开后的复用沿用前跳过的 write_seq 作为 ISN；全新套接字
            // 才走安全推导。
            let isn = if core.write_seq == 0 {
                self.ctx
                    .seqgen
                    .sequence_number(&local_addr, &remote.addr, port, remote.port)
            } else {
                core.write_seq
            };
            core.snd_una = isn;
            core.snd_nxt = isn;
            core.write_seq = isn.wrapping_add(1);
            core.write_queue.push_back(TxSeg {
                seq: isn,
                end_seq: isn.wrapping_add(1),
                syn: true,
                fin: false,
                psh: false,
                payload: Bytes::new(),
                pkt_total_len: 0,
                charged: 0,
            });
            core.state = TcpState::SynSent;
            debug!(local = %core.local, remote = %core.remote, "active open");
            self.flush_pending(core, true);
            Ok(core.nonblocking)
        })?;

        spawn_timer_driver(self);
        if nonblocking {
            return Ok(());
        }

        loop {
            let notified = self.state_notify.notified();
            let step = self.with_owner(|core| match core.state {
                TcpState::Established => Step::Ready(Ok(())),
                TcpState::Closed => Step::Ready(Err(core
                    .failure
                    .map(ConnFailure::as_connect_error)
                    .unwrap_or(ConnectError::Timeout))),
                _ => {
                    if core.interrupt_pending {
                        core.interrupt_pending = false;
                        Step::Ready(Err(ConnectError::Interrupted))
                    } else {
                        Step::Wait
                    }
                }
            });
            match step {
                Step::Ready(result) => return result,
                Step::Wait => notified.await,
            }
        }
    }

    /// 进入监听态；重复调用仅调整接受队列上限。
    pub fn listen(self: &Arc<Self>, backlog: usize) -> Result<(), ListenError> {
        self.with_owner(|core| {
            if core.state == TcpState::Listen {
                if let Some(listen) = core.listen.as_mut() {
                    listen.max_backlog = backlog.max(1);
                }
                return Ok(());
            }
            if core.state != TcpState::Closed || core.local.port == 0 {
                return Err(ListenError::InvalidState);
            }
            let entry = Arc::new(ListenerEntry {
                net: self.ctx.net,
                addr: core.local.addr,
                port: core.local.port,
                bound_dev: core.bound_dev,
                cpu_hint: core.cpu_hint,
                reuseport: core.reuseport,
                conn: Arc::downgrade(self),
            });
            self.ctx
                .table
                .insert_listener(entry.clone())
                .map_err(|_| ListenError::AddressInUse)?;
            core.state = TcpState::Listen;
            core.listen = Some(ListenState {
                max_backlog: backlog.max(1),
                queue: VecDeque::new(),
                entry: Some(entry),
            });
            info!(local = %core.local, "listening");
            Ok(())
        })
    }

    /// 取出一条完成三次握手的子连接。
    pub async fn accept(self: &Arc<Self>) -> Result<Arc<Connection>, AcceptError> {
        let deadline = self.core.lock().rcv_timeout.map(|d| Instant::now() + d);
        loop {
            let notified = self.accept_notify.notified();
            let step = self.with_owner(|core| {
                if core.state != TcpState::Listen {
                    return Step::Ready(Err(AcceptError::Closed));
                }
                let listen = core.listen.as_mut().expect("listen state present in Listen");
                if let Some(child) = listen.queue.pop_front() {
                    return Step::Ready(Ok(child));
                }
                if core.interrupt_pending {
                    core.interrupt_pending = false;
                    return Step::Ready(Err(AcceptError::Interrupted));
                }
                if core.nonblocking {
                    return Step::Ready(Err(AcceptError::WouldBlock));
                }
                Step::Wait
            });
            match step {
                Step::Ready(result) => return result,
                Step::Wait => {
                    if !wait_until(notified, deadline).await {
                        return Err(AcceptError::TimedOut);
                    }
                }
            }
        }
    }

    /// 写入字节流：按当前 MSS 拆成若干在途单元依次入队。
    ///
    /// 发送缓冲容不下全部分片时遵循部分成果优先：已入队的字节数直接
    /// 返回；一个字节都没写进去才挂起（非阻塞返回 `WouldBlock`）。
    /// `MessageTooLarge` 仅在某个分片无论等待多久都放不进发送缓冲且
    /// 尚无任何成果时返回。
    pub async fn send(self: &Arc<Self>, buf: &[u8]) -> Result<usize, SendError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        loop {
            let notified = self.send_notify.notified();
            let step = self.with_owner(|core| {
                if let Some(f) = core.failure {
                    return Step::Ready(if written == 0 {
                        Err(f.as_send_error())
                    } else {
                        Ok(written)
                    });
                }
                if core.send_shutdown {
                    return Step::Ready(if written == 0 {
                        Err(SendError::Shutdown)
                    } else {
                        Ok(written)
                    });
                }
                if core.interrupt_pending && written == 0 {
                    core.interrupt_pending = false;
                    return Step::Ready(Err(SendError::Interrupted));
                }
                if core.state == TcpState::SynSent || core.state == TcpState::SynReceived {
                    // 握手中：等待建连完成。
                    return if core.nonblocking {
                        Step::Ready(Err(SendError::WouldBlock))
                    } else {
                        Step::Wait
                    };
                }
                if !core.state.can_send_data() {
                    return Step::Ready(Err(SendError::NotConnected));
                }

                let round_start = written;
                while written < buf.len() {
                    let chunk = (buf.len() - written).min(core.mss as usize);
                    if chunk > self.ctx.config.sndbuf {
                        // 该分片任何等待都无法使其放入发送缓冲。
                        return Step::Ready(if written == 0 {
                            Err(SendError::MessageTooLarge)
                        } else {
                            Ok(written)
                        });
                    }
                    if !core.memory_free(&self.ctx.config, chunk)
                        || !self.ctx.memory.charge(chunk)
                    {
                        break;
                    }
                    let seq = core.write_seq;
                    let end = written + chunk;
                    core.write_queue.push_back(TxSeg {
                        seq,
                        end_seq: seq.wrapping_add(chunk as u32),
                        syn: false,
                        fin: false,
                        // PSH 只落在本次写入的最后一个分片上。
                        psh: end == buf.len(),
                        payload: Bytes::copy_from_slice(&buf[written..end]),
                        // 每个分片都携带本次写入的总长度（流量画像输入）。
                        pkt_total_len: buf.len() as u32,
                        charged: chunk,
                    });
                    core.write_seq = core.write_seq.wrapping_add(chunk as u32);
                    core.wmem += chunk;
                    written = end;
                }
                if written > round_start {
                    self.flush_pending(core, true);
                    self.keepalive_override_engage(core, buf.len() as u32);
                }
                if written == buf.len() {
                    return Step::Ready(Ok(written));
                }
                if core.nonblocking {
                    return Step::Ready(if written == 0 {
                        Err(SendError::WouldBlock)
                    } else {
                        Ok(written)
                    });
                }
                Step::Wait
            });
            match step {
                Step::Ready(result) => return result,
                Step::Wait => notified.await,
            }
        }
    }

    /// 读取已按序就绪的字节；对端 FIN 之后返回 `Ok(0)`。
    pub async fn recv(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize, RecvError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.core.lock().rcv_timeout.map(|d| Instant::now() + d);
        loop {
            let notified = self.recv_notify.notified();
            let step = self.with_owner(|core| {
                let mut copied = 0usize;
                while copied < buf.len() {
                    let Some(front) = core.receive_queue.front_mut() else {
                        break;
                    };
                    // 读游标越过队首段起点说明发生了重复交付。
                    debug_assert_eq!(
                        front
                            .end_seq
                            .wrapping_sub(front.payload.len() as u32)
                            .wrapping_sub(u32::from(front.flags.fin)),
                        core.copied_seq.wrapping_add(copied as u32),
                        "read cursor overran queued segment start"
                    );
                    let n = front.payload.len().min(buf.len() - copied);
                    buf[copied..copied + n].copy_from_slice(&front.payload[..n]);
                    front.payload = front.payload.slice(n..);
                    copied += n;
                    if front.payload.is_empty() {
                        core.receive_queue.pop_front();
                    }
                }
                if copied > 0 {
                    core.copied_seq = core.copied_seq.wrapping_add(copied as u32);
                    core.rmem = core.rmem.saturating_sub(copied);
                    self.ctx.memory.uncharge(copied);
                    self.maybe_send_ack(core, copied);
                    return Step::Ready(Ok(copied));
                }
                if let Some(f) = core.failure {
                    return Step::Ready(Err(f.as_recv_error()));
                }
                if core.fin_seen || core.recv_shutdown {
                    return Step::Ready(Ok(0));
                }
                if core.state == TcpState::Closed || core.state == TcpState::Listen {
                    return Step::Ready(Err(RecvError::NotConnected));
                }
                if core.interrupt_pending {
                    core.interrupt_pending = false;
                    return Step::Ready(Err(RecvError::Interrupted));
                }
                if core.nonblocking {
                    return Step::Ready(Err(RecvError::WouldBlock));
                }
                Step::Wait
            });
            match step {
                Step::Ready(result) => return result,
                Step::Wait => {
                    if !wait_until(notified, deadline).await {
                        return Err(RecvError::TimedOut);
                    }
                }
            }
        }
    }

    /// 单方向关闭。关闭发送方向触发 FIN 流程；关闭接收方向丢弃未读
    /// 数据并在后续静默吞掉对端数据。
    pub fn shutdown(self: &Arc<Self>, how: ShutdownHow) -> Result<(), SendError> {
        self.with_owner(|core| {
            if core.state == TcpState::Closed || core.state == TcpState::Listen {
                return Err(SendError::NotConnected);
            }
            if how.closes_receive() && !core.recv_shutdown {
                core.recv_shutdown = true;
                self.purge_receive_queues(core);
                self.recv_notify.notify_waiters();
            }
            if how.closes_send() && !core.send_shutdown {
                core.send_shutdown = true;
                let (next, send_fin) = close_transition(core.state);
                core.state = next;
                if send_fin {
                    self.send_fin(core);
                }
                if next == TcpState::Closed {
                    self.enter_closed(core, None);
                }
                self.state_notify.notify_waiters();
                self.send_notify.notify_waiters();
            }
            Ok(())
        })
    }

    /// 关闭连接（或监听者）。
    ///
    /// 幂等；仍有未读数据时直接以 RST 终结而非 FIN。
    pub fn close(self: &Arc<Self>) {
        self.with_owner(|core| {
            core.dead = true;
            match core.state {
                TcpState::Closed => {
                    // 有序关闭后仍滞留的未读数据随 close 一并退账。
                    self.purge_receive_queues(core);
                    self.wake_all();
                }
                TcpState::Listen => {
                    if let Some(listen) = core.listen.take() {
                        if let Some(entry) = listen.entry {
                            self.ctx.table.remove_listener(&entry);
                        }
                        // 未被取走的子连接随监听者一并中止。
                        for child in listen.queue {
                            child.abort();
                        }
                    }
                    core.state = TcpState::Closed;
                    info!(local = %core.local, "listener closed");
                    self.wake_all();
                }
                _ => {
                    core.send_shutdown = true;
                    core.recv_shutdown = true;
                    if core.unread_bytes() > 0 {
                        debug!(unread = core.unread_bytes(), "close with unread data, reset");
                        self.send_active_reset(core);
                        self.enter_closed(core, None);
                        return;
                    }
                    let (next, send_fin) = close_transition(core.state);
                    core.state = next;
                    if send_fin {
                        self.send_fin(core);
                    }
                    if next == TcpState::Closed {
                        self.enter_closed(core, None);
                    } else {
                        self.wake_all();
                    }
                }
            }
        });
    }

    /// 强制中止：该发 RST 的状态发 RST，之后立即收敛到 CLOSED。
    pub(crate) fn abort(self: &Arc<Self>) {
        self.with_owner(|core| {
            core.dead = true;
            if needs_reset_on_abort(core.state) {
                self.send_active_reset(core);
            }
            self.enter_closed(core, Some(ConnFailure::Aborted));
        });
    }

    /// 断开并复位到可复用的 CLOSED 状态。
    ///
    /// 发送序号在旧值上前跳 `max_window + 2`，回绕到 0 时取 1，保证
    /// 同四元组立即复用时新旧序号空间不重叠。
    pub fn disconnect(self: &Arc<Self>) {
        self.with_owner(|core| {
            if core.state == TcpState::Listen {
                if let Some(listen) = core.listen.take() {
                    if let Some(entry) = listen.entry {
                        self.ctx.table.remove_listener(&entry);
                    }
                    for child in listen.queue {
                        child.abort();
                    }
                }
            } else if needs_reset_on_abort(core.state)
                || (matches!(core.state, TcpState::Closing | TcpState::LastAck)
                    && core.snd_nxt != core.write_seq)
            {
                // CLOSING/LAST_ACK 仍有未送达的序号空间：对端需要 RST
                // 才能放弃等待。
                self.send_active_reset(core);
            }
            self.unhash(core);
            core.timers.clear();

            for seg in core.write_queue.drain(..) {
                self.ctx.memory.uncharge(seg.charged);
            }
            core.send_head = 0;
            core.wmem = 0;
            self.purge_receive_queues(core);

            core.write_seq = core.write_seq.wrapping_add(core.max_window.wrapping_add(2));
            core.reinit_transfer_state(&self.ctx.config);
            if core.write_seq == 0 {
                core.write_seq = 1;
            }
            core.state = TcpState::Closed;
            core.failure = None;
            core.send_shutdown = false;
            core.recv_shutdown = false;
            core.remote = SocketAddrNip::new(NipAddr::ANY, 0);
            core.dest = None;
            debug!(write_seq = core.write_seq, "disconnected, socket reusable");
            self.wake_all();
        });
    }
}
