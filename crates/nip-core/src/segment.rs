//! 规范化报文段模型。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 网络层交付的报文段头是网络序的；引擎内部的序号运算、状态机判定都
//!   以主机序进行。本模块一次性完成规范化（对应原生实现的
//!   “填充 TCP 控制块”步骤），之后所有路径只读控制块字段；
//! - 选项协商（如 MSS）由外部解析器完成，这里只消费解析结果。
//!
//! ## 契约 (What)
//! - [`SegmentCb::end_seq`] = `seq + SYN占位 + FIN占位 + 载荷长度`，
//!   SYN/FIN 各占一个序号；
//! - 入站方向必须携带 [`PacketClass`]，非本机单播一律在分发层丢弃；
//! - 载荷使用 [`bytes::Bytes`]，入队/重传共享底层存储，不做深拷贝。

use crate::addr::NipAddr;
use bytes::Bytes;

/// 链路层递交的包类别；引擎只处理发往本机的单播包。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketClass {
    /// 目的地为本机。
    Host,
    /// 广播/组播/混杂模式捕获等其他类别。
    Other,
}

/// 报文段标志位，已从线上布局解码为布尔字段。
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SegmentFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl SegmentFlags {
    pub const SYN: SegmentFlags = SegmentFlags {
        syn: true,
        ack: false,
        fin: false,
        rst: false,
        psh: false,
    };

    pub fn syn_ack() -> SegmentFlags {
        SegmentFlags {
            syn: true,
            ack: true,
            ..SegmentFlags::default()
        }
    }

    pub fn ack() -> SegmentFlags {
        SegmentFlags {
            ack: true,
            ..SegmentFlags::default()
        }
    }

    pub fn rst() -> SegmentFlags {
        SegmentFlags {
            rst: true,
            ..SegmentFlags::default()
        }
    }
}

/// 外部选项解析器交付的协商结果。
///
/// 线上选项编码不在引擎职责内；当前只消费最大报文段长度。
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct SegmentOptions {
    /// 对端通告的 MSS；缺省表示未携带该选项。
    pub mss: Option<u16>,
}

/// 主机序报文段控制块。
///
/// # 教案式注释
/// - **意图 (Why)**：把状态机需要的全部头字段集中为一个可廉价克隆的
///   结构，入站只填一次，之后在背压队列、握手路径间传递；
/// - **契约 (What)**：`seq`/`ack_seq`/`window` 均为主机序；`end_seq`
///   由 [`SegmentCb::new`] 计算并保持与载荷一致；
/// - **风险 (Trade-offs)**：控制块冗余存储 `end_seq` 换取热路径上免
///   重复计算，构造后不应再修改载荷长度。
#[derive(Clone, Debug)]
pub struct SegmentCb {
    pub seq: u32,
    pub end_seq: u32,
    pub ack_seq: u32,
    pub flags: SegmentFlags,
    pub window: u16,
    pub options: SegmentOptions,
    pub payload: Bytes,
}

impl SegmentCb {
    /// 由主机序头字段与载荷构造控制块，补全 `end_seq`。
    pub fn new(
        seq: u32,
        ack_seq: u32,
        flags: SegmentFlags,
        window: u16,
        options: SegmentOptions,
        payload: Bytes,
    ) -> Self {
        let virtual_len = payload.len() as u32
            + u32::from(flags.syn)
            + u32::from(flags.fin);
        SegmentCb {
            seq,
            end_seq: seq.wrapping_add(virtual_len),
            ack_seq,
            flags,
            window,
            options,
            payload,
        }
    }

    /// 占用的序号空间长度（含 SYN/FIN 占位）。
    pub fn seq_len(&self) -> u32 {
        self.end_seq.wrapping_sub(self.seq)
    }
}

/// 一个完整的传输层报文段：端点标识 + 控制块。
#[derive(Clone, Debug)]
pub struct Segment {
    pub src_addr: NipAddr,
    pub src_port: u16,
    pub dst_addr: NipAddr,
    pub dst_port: u16,
    pub cb: SegmentCb,
    /// 本次应用写入的总长度；保活策略据此区分小包流与大包流。
    pub pkt_total_len: u32,
    /// 出站方向由引擎填写（经校验和协作方计算）；入站方向为线上原值。
    pub checksum: u16,
}

impl Segment {
    /// 估算报文段占用的缓冲内存，用于背压上限判定。
    pub fn charge_size(&self) -> usize {
        self.cb.payload.len() + core::mem::size_of::<Segment>()
    }
}

/// 序号比较：`a` 是否严格早于 `b`（模 2^32 回绕语义）。
#[inline]
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// 序号比较：`a` 是否不晚于 `b`。
#[inline]
pub fn seq_before_eq(a: u32, b: u32) -> bool {
    a == b || seq_before(a, b)
}

/// 序号区间判定：`lo < x <= hi`（ACK 合法性检查使用的半开区间）。
#[inline]
pub fn seq_in_ack_range(x: u32, lo: u32, hi: u32) -> bool {
    seq_before(lo, x) && seq_before_eq(x, hi)
}
