//! 连接查找表：四元组索引与监听索引。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 入站报文段必须在 O(1) 期望时间内找到归属连接，且查找不得被无关
//!   连接的处理阻塞。底层选用 `DashMap`（分片锁哈希表），读写只争用
//!   同分片，与“细粒度分桶同步”的要求一致；
//! - 监听索引独立于四元组索引：先按 (地址, 端口) 精确匹配，再退回
//!   仅按端口散列的通配桶，保证“精确地址优先于通配”的语义。
//!
//! ## 契约 (What)
//! - 非监听连接的四元组全表唯一：并发竞争同一键时，后到者收到
//!   `AddressInUse`；
//! - [`ConnectionTable::remove_established`] 幂等，且只移除身份相符的
//!   条目（避免误删竞态下插入的新连接）；
//! - 端口复用（reuse-port）监听者并列时由流散列加权随机挑选，同一
//!   流在监听集合不变期间的选择可复现。
//!
//! ## 注意事项 (Trade-offs)
//! - 表不设容量上限（与旧实现一致），容量治理交给上层记账；
//! - 监听桶内是小向量线性扫描：监听者数量远小于连接数，评分扫描的
//!   常数成本可接受。

use std::hash::{BuildHasher, Hasher};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::debug;

use nip_core::addr::{NipAddr, SocketAddrNip};

use crate::conn::{Connection, HandshakeRequest};

/// 网络命名空间标识。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NetNs(pub u32);

/// 已建立连接的查找键。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FourTuple {
    pub net: NetNs,
    pub local: SocketAddrNip,
    pub remote: SocketAddrNip,
}

/// 四元组索引的条目：完全体连接，或握手完成前的半开请求。
#[derive(Clone)]
pub enum TableEntry {
    Established(Arc<Connection>),
    Pending(Arc<HandshakeRequest>),
}

impl TableEntry {
    fn same_identity(&self, other: &TableEntry) -> bool {
        match (self, other) {
            (TableEntry::Established(a), TableEntry::Established(b)) => Arc::ptr_eq(a, b),
            (TableEntry::Pending(a), TableEntry::Pending(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// 监听条目。
///
/// `conn` 为弱引用：监听连接销毁后，查找方升级失败按“无监听者”处理，
/// 不会访问已释放对象。
pub struct ListenerEntry {
    pub net: NetNs,
    pub addr: NipAddr,
    pub port: u16,
    /// 绑定的设备索引；`None` 表示不限设备。
    pub bound_dev: Option<u32>,
    /// 处理单元亲和提示；与当前处理单元一致时评分加一。
    pub cpu_hint: Option<usize>,
    pub reuseport: bool,
    pub conn: Weak<Connection>,
}

/// 入站报文段携带的查找上下文（设备与处理单元）。
#[derive(Clone, Copy, Default, Debug)]
pub struct LookupCtx {
    pub dev: Option<u32>,
    pub cpu: Option<usize>,
}

/// 插入失败：键已被占用。
#[derive(Debug, PartialEq, Eq, Error)]
#[error("connection table key already in use")]
pub struct AddressInUse;

/// 四元组/监听双索引连接表。
pub struct ConnectionTable {
    established: DashMap<FourTuple, TableEntry>,
    /// 精确地址监听桶：(net, addr, port) → 并列监听者。
    listeners_specific: DashMap<(NetNs, NipAddr, u16), Vec<Arc<ListenerEntry>>>,
    /// 通配地址监听桶：(net, port) → 并列监听者。
    listeners_wildcard: DashMap<(NetNs, u16), Vec<Arc<ListenerEntry>>>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        ConnectionTable {
            established: DashMap::new(),
            listeners_specific: DashMap::new(),
            listeners_wildcard: DashMap::new(),
        }
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册非监听连接；四元组冲突时后到者失败。
    pub fn insert_established(
        &self,
        tuple: FourTuple,
        entry: TableEntry,
    ) -> Result<(), AddressInUse> {
        match self.established.entry(tuple) {
            Entry::Occupied(_) => Err(AddressInUse),
            Entry::Vacant(v) => {
                v.insert(entry);
                Ok(())
            }
        }
    }

    /// 幂等移除：仅当条目身份与 `entry` 相符时移除。
    pub fn remove_established(&self, tuple: &FourTuple, entry: &TableEntry) {
        self.established
            .remove_if(tuple, |_, cur| cur.same_identity(entry));
    }

    /// 以新条目替换半开请求（第三次握手完成时的原子晋升）。
    ///
    /// 旧条目已不在表中（被并发移除）或已被他人替换时返回 `AddressInUse`，
    /// 调用方丢弃子连接。
    pub fn promote_pending(
        &self,
        tuple: &FourTuple,
        pending: &Arc<HandshakeRequest>,
        child: Arc<Connection>,
    ) -> Result<(), AddressInUse> {
        let mut replaced = false;
        self.established.remove_if(tuple, |_, cur| {
            let hit = matches!(cur, TableEntry::Pending(p) if Arc::ptr_eq(p, pending));
            replaced |= hit;
            hit
        });
        if !replaced {
            return Err(AddressInUse);
        }
        self.insert_established(*tuple, TableEntry::Established(child))
    }

    /// 四元组查找；O(1) 期望，读路径只争用同分片。
    pub fn lookup_established(
        &self,
        net: NetNs,
        local_addr: NipAddr,
        local_port: u16,
        remote_addr: NipAddr,
        remote_port: u16,
    ) -> Option<TableEntry> {
        let tuple = FourTuple {
            net,
            local: SocketAddrNip::new(local_addr, local_port),
            remote: SocketAddrNip::new(remote_addr, remote_port),
        };
        self.established.get(&tuple).map(|e| e.clone())
    }

    /// 注册监听者。
    ///
    /// 同 (net, addr, port) 已有监听者且任一方未启用端口复用时，返回
    /// `AddressInUse`。
    pub fn insert_listener(&self, entry: Arc<ListenerEntry>) -> Result<(), AddressInUse> {
        let check = |bucket: &Vec<Arc<ListenerEntry>>| {
            bucket
                .iter()
                .all(|cur| cur.reuseport && entry.reuseport)
        };
        if entry.addr.is_any() {
            let mut bucket = self
                .listeners_wildcard
                .entry((entry.net, entry.port))
                .or_default();
            if !check(&bucket) {
                return Err(AddressInUse);
            }
            bucket.push(entry);
        } else {
            let mut bucket = self
                .listeners_specific
                .entry((entry.net, entry.addr, entry.port))
                .or_default();
            if !check(&bucket) {
                return Err(AddressInUse);
            }
            bucket.push(entry);
        }
        Ok(())
    }

    /// 幂等注销监听者。
    pub fn remove_listener(&self, entry: &Arc<ListenerEntry>) {
        if entry.addr.is_any() {
            if let Some(mut bucket) = self.listeners_wildcard.get_mut(&(entry.net, entry.port)) {
                bucket.retain(|cur| !Arc::ptr_eq(cur, entry));
            }
        } else if let Some(mut bucket) = self
            .listeners_specific
            .get_mut(&(entry.net, entry.addr, entry.port))
        {
            bucket.retain(|cur| !Arc::ptr_eq(cur, entry));
        }
    }

    /// 两阶段监听查找：精确地址桶优先，失败后回退通配桶。
    ///
    /// `flow` 为入站报文段两端端点，用于端口复用并列时的流散列挑选。
    pub fn lookup_listener(
        &self,
        net: NetNs,
        dst_addr: NipAddr,
        dst_port: u16,
        flow_src: SocketAddrNip,
        ctx: LookupCtx,
    ) -> Option<Arc<ListenerEntry>> {
        if let Some(bucket) = self.listeners_specific.get(&(net, dst_addr, dst_port)) {
            if let Some(hit) =
                score_bucket(&bucket, net, dst_addr, dst_port, flow_src, ctx)
            {
                return Some(hit);
            }
        }
        let bucket = self.listeners_wildcard.get(&(net, dst_port))?;
        score_bucket(&bucket, net, dst_addr, dst_port, flow_src, ctx)
    }

    /// 以推导偏移为起点搜索并绑定临时端口。
    ///
    /// 逐个候选端口尝试插入四元组条目；全部被占用时返回 `None`。
    pub fn bind_ephemeral(
        &self,
        net: NetNs,
        local_addr: NipAddr,
        remote: SocketAddrNip,
        offset: u64,
        entry_for: impl Fn(u16) -> TableEntry,
    ) -> Option<(u16, FourTuple)> {
        const PORT_LOW: u32 = 32768;
        const PORT_SPAN: u32 = 28232;
        for i in 0..PORT_SPAN {
            let port = (PORT_LOW + ((offset as u32).wrapping_add(i) % PORT_SPAN)) as u16;
            let tuple = FourTuple {
                net,
                local: SocketAddrNip::new(local_addr, port),
                remote,
            };
            if self.insert_established(tuple, entry_for(port)).is_ok() {
                return Some((port, tuple));
            }
        }
        debug!("ephemeral port space exhausted");
        None
    }

    /// 非监听条目数（诊断用途）。
    pub fn established_len(&self) -> usize {
        self.established.len()
    }
}

/// 候选监听者评分；`-1` 表示不合格。
///
/// 基础合格条件：端口与命名空间一致（入桶时已保证）。在此之上：
/// 地址项加一（精确绑定但不匹配则淘汰，通配与精确命中同分）；
/// 绑定设备且匹配加一（绑定但不匹配则淘汰）；处理单元亲和命中加一。
fn compute_score(
    entry: &ListenerEntry,
    net: NetNs,
    dst_addr: NipAddr,
    dst_port: u16,
    ctx: LookupCtx,
) -> i32 {
    if entry.port != dst_port || entry.net != net {
        return -1;
    }
    let mut score = 1;
    if !entry.addr.is_any() && entry.addr != dst_addr {
        return -1;
    }
    score += 1;
    if let Some(dev) = entry.bound_dev {
        if ctx.dev != Some(dev) {
            return -1;
        }
        score += 1;
    }
    if entry.cpu_hint.is_some() && entry.cpu_hint == ctx.cpu {
        score += 1;
    }
    score
}

/// 桶内评分扫描 + 端口复用加权随机决胜。
///
/// 增量扫描与旧实现一致：遇到更高分则重置候选；与最高分并列且启用
/// 端口复用时，以流散列对“已见并列数”取模决定是否替换候选，散列值
/// 经伪随机序列前进。同一流在监听集合不变期间的结果可复现。
fn score_bucket(
    bucket: &[Arc<ListenerEntry>],
    net: NetNs,
    dst_addr: NipAddr,
    dst_port: u16,
    flow_src: SocketAddrNip,
    ctx: LookupCtx,
) -> Option<Arc<ListenerEntry>> {
    let mut result: Option<Arc<ListenerEntry>> = None;
    let mut hiscore = 0;
    let mut matches = 0u32;
    let mut reuseport = false;
    let mut phash = 0u32;

    for entry in bucket {
        let score = compute_score(entry, net, dst_addr, dst_port, ctx);
        if score > hiscore {
            result = Some(entry.clone());
            hiscore = score;
            reuseport = entry.reuseport;
            if reuseport {
                phash = flow_hash(net, dst_addr, dst_port, flow_src);
                matches = 1;
            }
        } else if score == hiscore && reuseport {
            matches += 1;
            if reciprocal_scale(phash, matches) == 0 {
                result = Some(entry.clone());
            }
            phash = next_pseudo_random32(phash);
        }
    }
    result
}

/// 入站流散列：本端端点与对端端点混合进程级密钥。
///
/// 密钥惰性初始化一次、此后只读；同一流在一个进程生命周期内散列稳定。
pub fn flow_hash(net: NetNs, dst_addr: NipAddr, dst_port: u16, src: SocketAddrNip) -> u32 {
    static FLOW_SECRET: OnceLock<std::collections::hash_map::RandomState> = OnceLock::new();
    let rs = FLOW_SECRET.get_or_init(std::collections::hash_map::RandomState::new);
    let mut h = rs.build_hasher();
    h.write_u32(net.0);
    h.write(dst_addr.as_bytes());
    h.write_u16(dst_port);
    h.write(src.addr.as_bytes());
    h.write_u16(src.port);
    h.finish() as u32
}

/// 将散列值等比缩放到 `[0, n)`，避免取模偏差。
fn reciprocal_scale(val: u32, n: u32) -> u32 {
    ((u64::from(val) * u64::from(n)) >> 32) as u32
}

/// 线性同余伪随机前进，用于并列候选间的散列再分配。
fn next_pseudo_random32(seed: u32) -> u32 {
    seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}
