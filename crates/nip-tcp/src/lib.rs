#![doc = r#"
# nip-tcp

## 设计动机（Why）
- **定位**：NewIP 变长地址族上的面向连接可靠字节流传输引擎：三次握手、
  按序交付、重传/保活/零窗口探测定时器、四元组连接表与监听评分。
- **架构角色**：引擎消费 [`nip_core`] 的协作方 trait（路由、校验和、
  发送、记账），自身不触碰线上编码与网卡；上层以 [`NipTcpStack`]
  注入协作方并从 [`Connection`] 获得套接字式操作面。
- **并发模型**：同一连接上的全部工作经 `parking_lot` 互斥核心串行化，
  入站争用失败的报文段落入有界背压队列由当前所有者代为排空；跨连接
  查找走 `DashMap` 分片表；定时器由每连接一个的 tokio 驱动任务轮询。

## 核心契约（What）
- [`Connection`]：connect/listen/accept/send/recv/shutdown/close/
  disconnect/set_keepalive 的完整操作面；
- [`NipTcpStack::on_segment`]：入站报文段统一入口（分类过滤 → 校验 →
  四元组/半开/监听三级归属）；
- [`state::close_transition`]：主动关闭的显式迁移表；
- [`seq::SeqGenerator`]：带密钥散列 + 粗粒度时钟的初始序号与临时端口
  偏移推导。

## 注意事项（Trade-offs）
- TIME_WAIT 不驻留，迟到报文段由无状态复位兜底；
- 一次 `send` 对应一个在途单元，超过 MSS 返回 `MessageTooLarge`；
- 持有连接核心锁期间从不 `await`。
"#]

mod conn;
mod dispatch;
mod input;
mod keepalive;
mod output;
pub mod seq;
mod sock;
pub mod state;
pub mod table;
mod timer;

use std::sync::Arc;

use nip_core::config::StackConfig;
use nip_core::counters::StackCounters;
use nip_core::external::{ChecksumEngine, MemoryAccountant, RouteResolver, SegmentTransmitter};
use nip_core::segment::{PacketClass, Segment};

pub use conn::{ConnFailure, Connection, HandshakeRequest};
pub use seq::{SeqGenerator, SeqSecret};
pub use state::TcpState;
pub use table::{FourTuple, ListenerEntry, LookupCtx, NetNs};

use conn::StackCtx;
use table::ConnectionTable;

/// 一个传输引擎实例：配置 + 协作方 + 连接表。
///
/// 多实例互不共享状态（进程级只读密钥除外），测试可以在同一进程内
/// 搭建两个栈对发报文段。
pub struct NipTcpStack {
    ctx: Arc<StackCtx>,
}

impl NipTcpStack {
    pub fn new(
        net: NetNs,
        config: StackConfig,
        router: Arc<dyn RouteResolver>,
        checksum: Arc<dyn ChecksumEngine>,
        tx: Arc<dyn SegmentTransmitter>,
        memory: Arc<dyn MemoryAccountant>,
    ) -> Self {
        Self::with_seqgen(net, config, router, checksum, tx, memory, SeqGenerator::process_wide())
    }

    /// 注入固定序号密钥的构造入口（测试用）。
    pub fn with_seqgen(
        net: NetNs,
        config: StackConfig,
        router: Arc<dyn RouteResolver>,
        checksum: Arc<dyn ChecksumEngine>,
        tx: Arc<dyn SegmentTransmitter>,
        memory: Arc<dyn MemoryAccountant>,
        seqgen: SeqGenerator,
    ) -> Self {
        NipTcpStack {
            ctx: Arc::new(StackCtx {
                net,
                config,
                counters: StackCounters::default(),
                router,
                checksum,
                tx,
                memory,
                seqgen,
                table: ConnectionTable::new(),
            }),
        }
    }

    /// 创建一个未绑定的套接字式连接对象。
    pub fn socket(&self) -> Arc<Connection> {
        Connection::new(self.ctx.clone())
    }

    /// 入站报文段统一入口。
    pub fn on_segment(&self, seg: Segment, class: PacketClass, lctx: LookupCtx) {
        dispatch::dispatch_segment(&self.ctx, seg, class, lctx);
    }

    /// 栈级丢弃/复位计数器。
    pub fn counters(&self) -> &StackCounters {
        &self.ctx.counters
    }

    /// 连接表中非监听条目数（诊断用途）。
    pub fn established_count(&self) -> usize {
        self.ctx.table.established_len()
    }
}
