//! 双栈回环测试环境。
//!
//! - **意图 (Why)**：用内存协作方替换路由/校验/发送/记账，把两个栈的
//!   出站队列互为对方的入站，使握手、传输与关闭路径可以在单线程内
//!   确定性回放；
//! - **契约 (What)**：[`Loopback::pump`] 双向泵送至线静默并返回递送
//!   过的报文段副本，测试据此断言线上的序号与标志位。

// 各测试二进制只用到环境的一部分。
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nip_core::addr::NipAddr;
use nip_core::config::StackConfig;
use nip_core::external::{
    ChecksumEngine, Destination, MemoryAccountant, RouteResolver, SegmentTransmitter,
    UnlimitedAccountant,
};
use nip_core::segment::{PacketClass, Segment};
use nip_tcp::{LookupCtx, NetNs, NipTcpStack, SeqGenerator, SeqSecret};

pub const MSS_HINT: u16 = 1400;

pub fn addr_a() -> NipAddr {
    NipAddr::new(&[0x11]).unwrap()
}

pub fn addr_b() -> NipAddr {
    NipAddr::new(&[0x22, 0x01]).unwrap()
}

pub struct StaticRouter {
    pub src: NipAddr,
}

impl RouteResolver for StaticRouter {
    fn resolve_route(&self, _local: &NipAddr, _remote: &NipAddr) -> Option<Destination> {
        Some(Destination {
            src_addr: self.src,
            advertised_mss: MSS_HINT,
        })
    }
}

pub struct NullChecksum;

impl ChecksumEngine for NullChecksum {
    fn verify(&self, _segment: &Segment) -> bool {
        true
    }

    fn compute(&self, _segment: &Segment) -> u16 {
        0
    }
}

/// 拒绝一切入站校验的协作方（丢弃路径测试用）。
pub struct RejectChecksum;

impl ChecksumEngine for RejectChecksum {
    fn verify(&self, _segment: &Segment) -> bool {
        false
    }

    fn compute(&self, _segment: &Segment) -> u16 {
        0
    }
}

/// 记流水账的记账协作方：余额归零断言用来发现记账泄漏。
#[derive(Default)]
pub struct MeteredAccountant {
    balance: AtomicIsize,
}

impl MeteredAccountant {
    /// 当前未归还的记账字节数。
    pub fn balance(&self) -> isize {
        self.balance.load(Ordering::SeqCst)
    }
}

impl MemoryAccountant for MeteredAccountant {
    fn charge(&self, bytes: usize) -> bool {
        self.balance.fetch_add(bytes as isize, Ordering::SeqCst);
        true
    }

    fn uncharge(&self, bytes: usize) {
        self.balance.fetch_sub(bytes as isize, Ordering::SeqCst);
    }
}

/// 出站报文段收集队列（“线”的一半）。
#[derive(Default)]
pub struct Wire {
    queue: Mutex<VecDeque<Segment>>,
}

impl Wire {
    pub fn drain(&self) -> Vec<Segment> {
        self.queue.lock().drain(..).collect()
    }
}

impl SegmentTransmitter for Wire {
    fn transmit(&self, segment: Segment, _destination: &Destination) {
        self.queue.lock().push_back(segment);
    }
}

pub struct Loopback {
    pub a: NipTcpStack,
    pub b: NipTcpStack,
    pub a_wire: Arc<Wire>,
    pub b_wire: Arc<Wire>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::custom(
            StackConfig::default(),
            StackConfig::default(),
            Arc::new(NullChecksum),
        )
    }

    pub fn with_configs(cfg_a: StackConfig, cfg_b: StackConfig) -> Self {
        Self::custom(cfg_a, cfg_b, Arc::new(NullChecksum))
    }

    /// 两个栈都挂上流水记账，返回环境与两侧账本。
    pub fn metered(
        cfg_a: StackConfig,
        cfg_b: StackConfig,
    ) -> (Self, Arc<MeteredAccountant>, Arc<MeteredAccountant>) {
        let mem_a = Arc::new(MeteredAccountant::default());
        let mem_b = Arc::new(MeteredAccountant::default());
        let env = Self::build(
            cfg_a,
            cfg_b,
            Arc::new(NullChecksum),
            mem_a.clone(),
            mem_b.clone(),
        );
        (env, mem_a, mem_b)
    }

    pub fn custom(
        cfg_a: StackConfig,
        cfg_b: StackConfig,
        checksum_b: Arc<dyn ChecksumEngine>,
    ) -> Self {
        Self::build(
            cfg_a,
            cfg_b,
            checksum_b,
            Arc::new(UnlimitedAccountant),
            Arc::new(UnlimitedAccountant),
        )
    }

    fn build(
        cfg_a: StackConfig,
        cfg_b: StackConfig,
        checksum_b: Arc<dyn ChecksumEngine>,
        mem_a: Arc<dyn MemoryAccountant>,
        mem_b: Arc<dyn MemoryAccountant>,
    ) -> Self {
        // 失败时保留协议事件轨迹；重复初始化静默忽略。
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
        let a_wire = Arc::new(Wire::default());
        let b_wire = Arc::new(Wire::default());
        let a = NipTcpStack::with_seqgen(
            NetNs(0),
            cfg_a,
            Arc::new(StaticRouter { src: addr_a() }),
            Arc::new(NullChecksum),
            a_wire.clone(),
            mem_a,
            SeqGenerator::with_secret(SeqSecret::from_bytes([0xA5; 32])),
        );
        let b = NipTcpStack::with_seqgen(
            NetNs(0),
            cfg_b,
            Arc::new(StaticRouter { src: addr_b() }),
            checksum_b,
            b_wire.clone(),
            mem_b,
            SeqGenerator::with_secret(SeqSecret::from_bytes([0x5A; 32])),
        );
        Loopback {
            a,
            b,
            a_wire,
            b_wire,
        }
    }

    /// 双向泵送至线静默，返回按递送顺序排列的报文段副本。
    pub fn pump(&self) -> Vec<Segment> {
        let mut delivered = Vec::new();
        for _ in 0..64 {
            let mut quiet = true;
            for seg in self.a_wire.drain() {
                delivered.push(seg.clone());
                self.b.on_segment(seg, PacketClass::Host, LookupCtx::default());
                quiet = false;
            }
            for seg in self.b_wire.drain() {
                delivered.push(seg.clone());
                self.a.on_segment(seg, PacketClass::Host, LookupCtx::default());
                quiet = false;
            }
            if quiet {
                break;
            }
        }
        delivered
    }

    /// 推进虚拟时钟并持续泵送（配合 `start_paused` 的定时器测试）。
    pub async fn run_for_ms(&self, total_ms: u64) {
        let step = tokio::time::Duration::from_millis(50);
        let mut elapsed = 0;
        while elapsed < total_ms {
            tokio::time::sleep(step).await;
            self.pump();
            elapsed += 50;
        }
    }
}
