//! 连接对象与其串行化核心。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 同一连接上的所有工作必须串行：入站处理、应用调用与定时器回调都
//!   先取得连接所有权再改状态。这里以 `parking_lot::Mutex<ConnCore>`
//!   充当所有权标志，以显式背压队列承接争用失败的入站报文段，复刻
//!   内核套接字锁 + backlog 的语义而不依赖可重入调用栈；
//! - 连接的拥有引用是 `Arc<Connection>` 的克隆（显式引用计数），
//!   请求→监听者之类的回指是 `Weak`，目标释放后升级失败即优雅退化。
//!
//! ## 并发契约 (What)
//! - **快路径**：`receive_segment` 以 `try_lock` 竞争所有权；失败则
//!   入背压队列立即返回，由当前所有者在释放前负责清空；
//! - **背压上限**：`rcvbuf + sndbuf + 64KiB`，超限静默丢弃并计数，
//!   已入队报文段不受影响；
//! - **释放竞态**：入队后二次 `try_lock`，若此刻所有者已离开则由
//!   本任务补排空，保证队列不滞留；
//! - 持有 `core` 锁期间绝不 `await`。
//!
//! ## 风险 (Trade-offs)
//! - 所有者在锁内同步处理背压队列，极端情况下会拉长单次持锁时间；
//!   上限由背压字节数约束，与旧实现的取舍一致。

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use nip_core::addr::{NipAddr, SocketAddrNip};
use nip_core::config::StackConfig;
use nip_core::counters::StackCounters;
use nip_core::error::{ConnectError, RecvError, SendError};
use nip_core::external::{
    ChecksumEngine, Destination, MemoryAccountant, RouteResolver, SegmentTransmitter,
};
use nip_core::segment::{Segment, SegmentCb};

use crate::seq::SeqGenerator;
use crate::state::TcpState;
use crate::table::{ConnectionTable, FourTuple, ListenerEntry, NetNs};

/// 栈级共享环境：配置、协作方与连接表。
pub struct StackCtx {
    pub net: NetNs,
    pub config: StackConfig,
    pub counters: StackCounters,
    pub router: Arc<dyn RouteResolver>,
    pub checksum: Arc<dyn ChecksumEngine>,
    pub tx: Arc<dyn SegmentTransmitter>,
    pub memory: Arc<dyn MemoryAccountant>,
    pub seqgen: SeqGenerator,
    pub table: ConnectionTable,
}

/// 连接级失败原因，挂起中的调用按操作面映射为对外错误。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnFailure {
    /// 对端复位。
    Reset,
    /// 重传/探测预算耗尽，本端强制关闭。
    Aborted,
}

impl ConnFailure {
    pub fn as_send_error(self) -> SendError {
        match self {
            ConnFailure::Reset => SendError::ConnectionReset,
            ConnFailure::Aborted => SendError::ConnectionAborted,
        }
    }

    pub fn as_recv_error(self) -> RecvError {
        match self {
            ConnFailure::Reset => RecvError::ConnectionReset,
            ConnFailure::Aborted => RecvError::ConnectionAborted,
        }
    }

    pub fn as_connect_error(self) -> ConnectError {
        match self {
            ConnFailure::Reset => ConnectError::ConnectionReset,
            ConnFailure::Aborted => ConnectError::Timeout,
        }
    }
}

/// 发送队列中的一个在途单元。
#[derive(Debug)]
pub(crate) struct TxSeg {
    pub seq: u32,
    pub end_seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub psh: bool,
    pub payload: Bytes,
    /// 本次应用写入的总长度（保活策略的小包流判定输入）。
    pub pkt_total_len: u32,
    /// 已向记账协作方登记的字节数。
    pub charged: usize,
}

impl TxSeg {
    pub fn seq_len(&self) -> u32 {
        self.end_seq.wrapping_sub(self.seq)
    }
}

/// 四个协议定时器的到期时刻；`None` 表示未武装。
#[derive(Default, Debug)]
pub(crate) struct Timers {
    pub retransmit: Option<Instant>,
    pub delack: Option<Instant>,
    pub keepalive: Option<Instant>,
    pub probe0: Option<Instant>,
}

impl Timers {
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.retransmit, self.delack, self.keepalive, self.probe0]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn clear(&mut self) {
        *self = Timers::default();
    }
}

/// 保活参数与适配器影子状态。
///
/// 不变量：`*_bak` 三项非零当且仅当适配器覆盖处于激活且覆盖前存在
/// 用户配置；恢复触发时三项一并清零，不存在部分提交。
#[derive(Default, Debug)]
pub(crate) struct KeepaliveState {
    /// 用户层保活（SO_KEEPALIVE 等价物）是否开启。
    pub enabled: bool,
    pub idle: u32,
    pub interval: u32,
    pub probes: u32,
    pub idle_bak: u32,
    pub interval_bak: u32,
    pub probes_bak: u32,
    /// 协议侧覆盖是否激活。
    pub override_active: bool,
    /// 覆盖激活后用户又重新配置过参数（需要重新备份再覆盖）。
    pub user_dirty: bool,
    /// 覆盖期内已发出的空闲探测数。
    pub idle_probes_out: u32,
    /// 连续无响应探测数（超过 `probes` 上限即中止连接）。
    pub probes_out: u32,
}

/// 监听态专属状态。
pub(crate) struct ListenState {
    pub max_backlog: usize,
    pub queue: VecDeque<Arc<Connection>>,
    pub entry: Option<Arc<ListenerEntry>>,
}

impl ListenState {
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_backlog
    }
}

/// 连接的串行化核心：所有可变协议状态。
pub(crate) struct ConnCore {
    pub state: TcpState,
    pub local: SocketAddrNip,
    pub remote: SocketAddrNip,
    pub tuple: Option<FourTuple>,
    pub dest: Option<Destination>,
    pub nonblocking: bool,
    pub reuseport: bool,
    pub bound_dev: Option<u32>,
    pub cpu_hint: Option<usize>,
    /// 阻塞式 `recv`/`accept` 的等待上限；`None` 表示无限等待。
    pub rcv_timeout: Option<std::time::Duration>,
    /// 外部中断信号待决（下一个挂起调用以 `Interrupted` 返回并消费它）。
    pub interrupt_pending: bool,
    pub send_shutdown: bool,
    pub recv_shutdown: bool,
    /// 对端 FIN 已按序收到（读到末尾返回 EOF 的依据）。
    pub fin_seen: bool,
    pub failure: Option<ConnFailure>,
    pub dead: bool,

    // 序号空间。不变量：snd_una <= snd_nxt <= write_seq（模回绕）。
    pub write_seq: u32,
    pub snd_nxt: u32,
    pub snd_una: u32,
    pub rcv_nxt: u32,
    pub copied_seq: u32,
    /// 最近一次通告窗口/ACK 的右端（窗口更新判定基准）。
    pub rcv_wup: u32,
    /// 最近一次对外通告的接收窗口。
    pub rcv_window: u32,
    pub snd_wnd: u32,
    pub max_window: u32,
    pub window_clamp: u32,
    pub mss: u16,
    pub rcv_mss: u16,

    pub write_queue: VecDeque<TxSeg>,
    /// `write_queue` 中下一个未发送单元的下标。
    pub send_head: usize,
    /// 有序接收队列（按序号连续）。
    pub receive_queue: VecDeque<SegmentCb>,
    /// 乱序暂存，按起始序号索引。
    pub ofo_queue: BTreeMap<u32, SegmentCb>,
    /// 乱序暂存占用的已记账字节数。
    pub ofo_bytes: usize,
    pub rmem: usize,
    pub wmem: usize,

    pub ack_scheduled: bool,
    pub ack_pushed: bool,
    pub ack_pushed2: bool,

    pub packets_out: u32,
    pub retries: u32,
    pub backoff: u32,
    pub dup_ack_cnt: u32,
    pub rto_ms: u64,
    pub srtt_ms: u64,
    pub snd_cwnd: u32,
    pub ssthresh: u32,
    pub probes_out: u32,

    pub segs_in: u64,
    pub segs_out: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,

    pub ka: KeepaliveState,
    pub timers: Timers,
    pub listen: Option<ListenState>,
}

impl ConnCore {
    fn new(config: &StackConfig) -> Self {
        ConnCore {
            state: TcpState::Closed,
            local: SocketAddrNip::new(NipAddr::ANY, 0),
            remote: SocketAddrNip::new(NipAddr::ANY, 0),
            tuple: None,
            dest: None,
            nonblocking: false,
            reuseport: false,
            bound_dev: None,
            cpu_hint: None,
            rcv_timeout: None,
            interrupt_pending: false,
            send_shutdown: false,
            recv_shutdown: false,
            fin_seen: false,
            failure: None,
            dead: false,
            write_seq: 0,
            snd_nxt: 0,
            snd_una: 0,
            rcv_nxt: 0,
            copied_seq: 0,
            rcv_wup: 0,
            rcv_window: 0,
            snd_wnd: 0,
            max_window: 0,
            window_clamp: config.rcvbuf.min(u32::MAX as usize) as u32,
            mss: config.base_mss,
            rcv_mss: config.base_mss,
            write_queue: VecDeque::new(),
            send_head: 0,
            receive_queue: VecDeque::new(),
            ofo_queue: BTreeMap::new(),
            ofo_bytes: 0,
            rmem: 0,
            wmem: 0,
            ack_scheduled: false,
            ack_pushed: false,
            ack_pushed2: false,
            packets_out: 0,
            retries: 0,
            backoff: 0,
            dup_ack_cnt: 0,
            rto_ms: config.initial_rto_ms,
            srtt_ms: 0,
            snd_cwnd: 10,
            ssthresh: config.default_ssthresh,
            probes_out: 0,
            segs_in: 0,
            segs_out: 0,
            bytes_acked: 0,
            bytes_received: 0,
            ka: KeepaliveState::default(),
            timers: Timers::default(),
            listen: None,
        }
    }

    /// 接收队列中尚未被应用取走的字节数（不含 FIN 占位）。
    ///
    /// 对端 FIN 占用一个序号但不对应任何可读字节，按序收到 FIN 后
    /// `rcv_nxt` 恒比可读数据多一。
    pub fn unread_bytes(&self) -> u32 {
        let mut unread = self.rcv_nxt.wrapping_sub(self.copied_seq);
        if self.fin_seen && unread > 0 {
            unread -= 1;
        }
        unread
    }

    /// 发送缓冲剩余空间是否允许再排队 `len` 字节。
    pub fn memory_free(&self, config: &StackConfig, len: usize) -> bool {
        self.wmem + len <= config.sndbuf
    }

    /// 重置序号/窗口/RTT/重传/保活状态（断开与复用前的再初始化）。
    ///
    /// `write_seq` 不在此处清零：disconnect 按“旧值 + 最大窗口”前跳。
    pub fn reinit_transfer_state(&mut self, config: &StackConfig) {
        self.snd_nxt = 0;
        self.snd_una = 0;
        self.rcv_nxt = 0;
        self.copied_seq = 0;
        self.rcv_wup = 0;
        self.rcv_window = 0;
        self.snd_wnd = 0;
        // 复用的套接字与全新套接字拿到同一个窗口钳制基线。
        self.window_clamp = config.rcvbuf.min(u32::MAX as usize) as u32;
        self.packets_out = 0;
        self.retries = 0;
        self.backoff = 0;
        self.dup_ack_cnt = 0;
        self.srtt_ms = 0;
        self.rto_ms = config.initial_rto_ms;
        self.snd_cwnd = 2;
        self.ssthresh = u32::MAX;
        self.probes_out = 0;
        self.segs_in = 0;
        self.segs_out = 0;
        self.bytes_acked = 0;
        self.bytes_received = 0;
        self.ack_scheduled = false;
        self.ack_pushed = false;
        self.ack_pushed2 = false;
        self.fin_seen = false;
        self.ka = KeepaliveState::default();
    }
}

/// 背压队列：争用失败的入站报文段在此等待所有者排空。
#[derive(Default)]
struct Backlog {
    queue: VecDeque<Segment>,
    bytes: usize,
}

/// 一条 NewIP 传输连接（或监听者）。
///
/// 拥有引用为 `Arc<Connection>`；分发层、接收队列与定时器驱动各持一
/// 份。最后一个引用释放时队列随 `ConnCore` 一起析构，表项在进入
/// CLOSED 时已显式移除。
pub struct Connection {
    pub(crate) ctx: Arc<StackCtx>,
    pub(crate) core: Mutex<ConnCore>,
    backlog: Mutex<Backlog>,
    pub(crate) recv_notify: Notify,
    pub(crate) send_notify: Notify,
    pub(crate) state_notify: Notify,
    pub(crate) accept_notify: Notify,
    pub(crate) timer_notify: Notify,
}

impl Connection {
    pub(crate) fn new(ctx: Arc<StackCtx>) -> Arc<Self> {
        let core = ConnCore::new(&ctx.config);
        Arc::new(Connection {
            ctx,
            core: Mutex::new(core),
            backlog: Mutex::new(Backlog::default()),
            recv_notify: Notify::new(),
            send_notify: Notify::new(),
            state_notify: Notify::new(),
            accept_notify: Notify::new(),
            timer_notify: Notify::new(),
        })
    }

    /// 当前状态快照（仅诊断/测试用途）。
    pub fn state(&self) -> TcpState {
        self.core.lock().state
    }

    /// 以所有者身份执行 `f`，释放前排空背压队列。
    ///
    /// 应用调用与定时器回调的统一入口：阻塞式取锁。
    pub(crate) fn with_owner<R>(self: &Arc<Self>, f: impl FnOnce(&mut ConnCore) -> R) -> R {
        let mut core = self.core.lock();
        let ret = f(&mut core);
        self.drain_backlog(&mut core);
        ret
    }

    /// 入站快路径：竞争所有权，失败则入背压队列。
    pub(crate) fn receive_segment(self: &Arc<Self>, seg: Segment) {
        if let Some(mut core) = self.core.try_lock() {
            self.process_segment(&mut core, seg);
            self.drain_backlog(&mut core);
            return;
        }

        let limit = self.ctx.config.backlog_limit();
        {
            let mut backlog = self.backlog.lock();
            let size = seg.charge_size();
            if backlog.bytes + size > limit {
                StackCounters::bump(&self.ctx.counters.backlog_drops);
                debug!(bytes = backlog.bytes, limit, "backlog full, drop segment");
                return;
            }
            backlog.bytes += size;
            backlog.queue.push_back(seg);
            trace!(bytes = backlog.bytes, "segment deferred to backlog");
        }

        // 入队与所有者释放之间存在窗口：此刻所有者可能已经离开，
        // 补一次竞争保证队列不滞留。
        if let Some(mut core) = self.core.try_lock() {
            self.drain_backlog(&mut core);
        }
    }

    /// 排空背压队列；调用方必须是当前所有者。
    pub(crate) fn drain_backlog(self: &Arc<Self>, core: &mut ConnCore) {
        loop {
            let seg = {
                let mut backlog = self.backlog.lock();
                match backlog.queue.pop_front() {
                    Some(seg) => {
                        backlog.bytes = backlog.bytes.saturating_sub(seg.charge_size());
                        seg
                    }
                    None => break,
                }
            };
            self.process_segment(core, seg);
        }
    }

    /// 唤醒所有等待面（状态变化、可读、可写、可接受）。
    pub(crate) fn wake_all(&self) {
        self.state_notify.notify_waiters();
        self.recv_notify.notify_waiters();
        self.send_notify.notify_waiters();
        self.accept_notify.notify_waiters();
        self.timer_notify.notify_waiters();
    }

    /// 清空接收方向的全部队列并退还其记账（幂等）。
    ///
    /// 有序队列与乱序暂存分别以 `rmem`/`ofo_bytes` 记账，两者都在此
    /// 一并退还。
    pub(crate) fn purge_receive_queues(&self, core: &mut ConnCore) {
        let charged = core.rmem + core.ofo_bytes;
        core.receive_queue.clear();
        core.ofo_queue.clear();
        core.rmem = 0;
        core.ofo_bytes = 0;
        if charged > 0 {
            self.ctx.memory.uncharge(charged);
        }
    }

    /// 从连接表移除本连接的表项（幂等）。
    pub(crate) fn unhash(self: &Arc<Self>, core: &mut ConnCore) {
        if let Some(tuple) = core.tuple.take() {
            self.ctx
                .table
                .remove_established(&tuple, &crate::table::TableEntry::Established(self.clone()));
        }
        if let Some(listen) = core.listen.as_mut() {
            if let Some(entry) = listen.entry.take() {
                self.ctx.table.remove_listener(&entry);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use nip_core::external::{
        ChecksumEngine, Destination, RouteResolver, SegmentTransmitter, UnlimitedAccountant,
    };
    use nip_core::segment::{SegmentFlags, SegmentOptions};

    use crate::seq::{SeqGenerator, SeqSecret};
    use crate::table::NetNs;

    struct NoRoute;

    impl RouteResolver for NoRoute {
        fn resolve_route(&self, _local: &NipAddr, _remote: &NipAddr) -> Option<Destination> {
            None
        }
    }

    struct PassChecksum;

    impl ChecksumEngine for PassChecksum {
        fn verify(&self, _segment: &Segment) -> bool {
            true
        }

        fn compute(&self, _segment: &Segment) -> u16 {
            0
        }
    }

    struct Sink;

    impl SegmentTransmitter for Sink {
        fn transmit(&self, _segment: Segment, _destination: &Destination) {}
    }

    fn ctx(config: StackConfig) -> Arc<StackCtx> {
        Arc::new(StackCtx {
            net: NetNs(0),
            config,
            counters: StackCounters::default(),
            router: Arc::new(NoRoute),
            checksum: Arc::new(PassChecksum),
            tx: Arc::new(Sink),
            memory: Arc::new(UnlimitedAccountant),
            seqgen: SeqGenerator::with_secret(SeqSecret::from_bytes([3u8; 32])),
            table: ConnectionTable::new(),
        })
    }

    fn data_segment(payload: &'static [u8]) -> Segment {
        let cb = SegmentCb::new(
            1,
            1,
            SegmentFlags::ack(),
            1024,
            SegmentOptions::default(),
            Bytes::from_static(payload),
        );
        Segment {
            src_addr: NipAddr::new(&[0x11]).unwrap(),
            src_port: 5000,
            dst_addr: NipAddr::new(&[0x22]).unwrap(),
            dst_port: 80,
            cb,
            pkt_total_len: payload.len() as u32,
            checksum: 0,
        }
    }

    #[test]
    fn backlog_is_bounded_and_preserved_until_drained() {
        // 收发缓冲都取 0：背压上限只剩 64KiB 固定余量。
        let conn = Connection::new(ctx(StackConfig {
            sndbuf: 0,
            rcvbuf: 0,
            ..StackConfig::default()
        }));

        // 持锁模拟另一个在途所有者：所有入站都只能走背压队列。
        let guard = conn.core.lock();
        static PAYLOAD: [u8; 16 * 1024] = [0u8; 16 * 1024];
        for _ in 0..8 {
            conn.receive_segment(data_segment(&PAYLOAD));
        }
        let queued = conn.backlog_len();
        assert!(queued >= 1, "上限内的报文段必须入队");
        assert!(queued < 8, "超限后不得继续入队");
        assert_eq!(
            StackCounters::read(&conn.ctx.counters.backlog_drops),
            8 - queued as u64,
            "超限丢弃必须逐一计数"
        );

        // 已入队的报文段保持完好，所有者释放后由下一个获得者排空。
        drop(guard);
        conn.with_owner(|_| {});
        assert_eq!(conn.backlog_len(), 0, "释放所有权后背压队列必须排空");
    }

    #[test]
    fn unread_bytes_excludes_fin_placeholder() {
        let mut core = ConnCore::new(&StackConfig::default());
        core.rcv_nxt = 101;
        core.copied_seq = 100;
        assert_eq!(core.unread_bytes(), 1);
        // 对端 FIN 占一个序号但没有可读字节。
        core.fin_seen = true;
        assert_eq!(core.unread_bytes(), 0);
    }

    #[test]
    fn reinit_restores_window_clamp_baseline() {
        let config = StackConfig::default();
        let mut core = ConnCore::new(&config);
        let baseline = core.window_clamp;
        assert!(baseline > 0);
        core.window_clamp = 0;
        core.reinit_transfer_state(&config);
        assert_eq!(core.window_clamp, baseline, "复用套接字必须拿回窗口钳制基线");
    }
}

/// 握手完成前的半开请求（SYN_RECEIVED 的具象）。
///
/// 对监听者只保留弱回指：监听者先于请求销毁时，第三次握手按“监听者
/// 已消失”丢弃，不访问悬垂对象。
pub struct HandshakeRequest {
    pub tuple: FourTuple,
    /// 本端（服务端）初始序号。
    pub isn: u32,
    /// 对端初始序号。
    pub peer_isn: u32,
    /// SYN 协商出的 MSS。
    pub mss: u16,
    pub dest: Destination,
    pub listener: Weak<Connection>,
}
