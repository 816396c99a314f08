//! 外部协作方接口。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 传输引擎的“硬核”在状态机与并发查找；路由解析、地址族校验和、
//!   裸包发送与内存记账都是地址族/宿主环境相关的外围能力，以 trait
//!   形式注入，引擎不持有任何网卡或路由表细节；
//! - 测试环境以内存实现替换全部协作方，使握手、背压、保活路径可在
//!   单进程内确定性回放。
//!
//! ## 契约 (What)
//! - 所有 trait 要求 `Send + Sync`，实现内部自行处理并发；
//! - [`SegmentTransmitter::transmit`] 不得阻塞调用方：引擎在持有连接
//!   所有权时调用它，长时间停顿会拖垮同连接的背压队列。

use crate::addr::NipAddr;
use crate::segment::Segment;

/// 路由解析结果：下一跳与路径属性。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destination {
    /// 路由确定的源地址（本端未绑定具体地址时由路径决定）。
    pub src_addr: NipAddr,
    /// 路径建议的通告 MSS。
    pub advertised_mss: u16,
}

/// 路由/目的解析协作方。
pub trait RouteResolver: Send + Sync {
    /// 解析本端到 `remote` 的路径；无路由时返回 `None`。
    ///
    /// `local` 为通配地址时，由实现选定实际源地址。
    fn resolve_route(&self, local: &NipAddr, remote: &NipAddr) -> Option<Destination>;
}

/// 地址族校验和协作方。
///
/// 伪头由实现按地址族布局构造；引擎只传入两端地址与报文段本体。
pub trait ChecksumEngine: Send + Sync {
    /// 校验入站报文段；失败的报文段在分发层静默丢弃。
    fn verify(&self, segment: &Segment) -> bool;

    /// 计算出站报文段校验和（网络序 16 位值）。
    fn compute(&self, segment: &Segment) -> u16;
}

/// 出站发送协作方：把报文段递交给网络接口层。
pub trait SegmentTransmitter: Send + Sync {
    fn transmit(&self, segment: Segment, destination: &Destination);
}

/// 缓冲内存记账协作方。
///
/// - **契约 (What)**：`charge` 返回 `false` 表示记账被拒，调用方必须
///   放弃本次入队并走资源耗尽路径；`uncharge` 与成功的 `charge` 一一
///   配对；
/// - **风险 (Trade-offs)**：记账粒度为字节，实现可按页取整，引擎不
///   关心舍入方向。
pub trait MemoryAccountant: Send + Sync {
    fn charge(&self, bytes: usize) -> bool;
    fn uncharge(&self, bytes: usize);
}

/// 不设限的记账实现，供测试与无配额宿主使用。
#[derive(Debug, Default)]
pub struct UnlimitedAccountant;

impl MemoryAccountant for UnlimitedAccountant {
    fn charge(&self, _bytes: usize) -> bool {
        true
    }

    fn uncharge(&self, _bytes: usize) {}
}
