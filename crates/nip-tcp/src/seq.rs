//! 初始序号与临时端口偏移的安全推导。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 初始序号（ISN）与临时端口偏移必须对外不可预测，否则盲注入攻击
//!   可以伪造握手；两者都由进程级密钥对四元组做带密钥散列得到；
//! - 密钥在首次使用时惰性初始化一次，此后只读——对应“进程级不可变
//!   全局态”的建模要求，不存在初始化竞态之外的任何写入。
//!
//! ## 逻辑 (How)
//! - 散列采用 SHA-256 截断：输入为 `(saddr, daddr, sport, dport, 密钥)`
//!   的定长编码，取摘要前 4/8 字节为结果，替代内核的 siphash；
//! - ISN 在散列值之上叠加粗粒度单调时钟项（64ns 周期，`now >> 6`），
//!   保证同四元组复用时序号空间随时间前进；
//! - 密钥熵取自 [`std::collections::hash_map::RandomState`] 的随机键，
//!   不引入额外依赖。
//!
//! ## 契约 (What)
//! - [`SeqGenerator::raw_sequence_number`] 对固定密钥是四元组的纯函数
//!   （黄金向量测试依赖该性质）；[`sequence_number`] 在其上叠加时钟；
//! - [`ephemeral_port_offset`] 不含时钟项，可重复推导。

use std::hash::{BuildHasher, Hasher};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use nip_core::addr::NipAddr;
use sha2::{Digest, Sha256};

/// 进程级散列密钥（32 字节）。
#[derive(Clone, Copy)]
pub struct SeqSecret([u8; 32]);

impl SeqSecret {
    /// 由宿主随机源构造密钥。
    fn from_entropy() -> Self {
        let rs = std::collections::hash_map::RandomState::new();
        let mut secret = [0u8; 32];
        for (i, chunk) in secret.chunks_mut(8).enumerate() {
            let mut h = rs.build_hasher();
            h.write_usize(i);
            chunk.copy_from_slice(&h.finish().to_le_bytes());
        }
        SeqSecret(secret)
    }

    /// 测试用：固定密钥。
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SeqSecret(bytes)
    }
}

static PROCESS_SECRET: OnceLock<SeqSecret> = OnceLock::new();

/// ISN / 端口偏移生成器。
///
/// 默认实例绑定进程级密钥；测试可注入固定密钥获得确定性输出。
#[derive(Clone, Copy)]
pub struct SeqGenerator {
    secret: SeqSecret,
}

impl SeqGenerator {
    /// 绑定进程级密钥（惰性初始化，之后不可变）。
    pub fn process_wide() -> Self {
        SeqGenerator {
            secret: *PROCESS_SECRET.get_or_init(SeqSecret::from_entropy),
        }
    }

    /// 绑定给定密钥（测试入口）。
    pub fn with_secret(secret: SeqSecret) -> Self {
        SeqGenerator { secret }
    }

    fn digest(&self, saddr: &NipAddr, daddr: &NipAddr, sport: u16, dport: u16, tag: u8) -> [u8; 32] {
        let mut hasher = Sha256::new();
        let (s_lo, s_hi) = saddr.fold_u32();
        let (d_lo, d_hi) = daddr.fold_u32();
        hasher.update(s_lo.to_le_bytes());
        hasher.update(s_hi.to_le_bytes());
        hasher.update(d_lo.to_le_bytes());
        hasher.update(d_hi.to_le_bytes());
        hasher.update(sport.to_le_bytes());
        hasher.update(dport.to_le_bytes());
        hasher.update([tag]);
        hasher.update(self.secret.0);
        hasher.finalize().into()
    }

    /// 四元组的带密钥散列（未叠加时钟项），固定密钥下可复现。
    pub fn raw_sequence_number(
        &self,
        saddr: &NipAddr,
        daddr: &NipAddr,
        sport: u16,
        dport: u16,
    ) -> u32 {
        let d = self.digest(saddr, daddr, sport, dport, 0);
        u32::from_le_bytes([d[0], d[1], d[2], d[3]])
    }

    /// 连接初始序号：散列值叠加粗粒度时钟，保证序号空间随时间前进。
    pub fn sequence_number(
        &self,
        saddr: &NipAddr,
        daddr: &NipAddr,
        sport: u16,
        dport: u16,
    ) -> u32 {
        self.raw_sequence_number(saddr, daddr, sport, dport)
            .wrapping_add(seq_scale_tick())
    }

    /// 临时端口搜索的起始偏移，对固定密钥可复现。
    pub fn ephemeral_port_offset(&self, saddr: &NipAddr, daddr: &NipAddr, dport: u16) -> u64 {
        let d = self.digest(saddr, daddr, 0, dport, 1);
        u64::from_le_bytes([d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7]])
    }
}

/// 64ns 周期的时钟项：约 274 秒回绕一轮序号空间。
fn seq_scale_tick() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_nanos() >> 6) as u32
}
