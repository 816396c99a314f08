//! NewIP 变长地址族。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - NewIP 地址不是定长的：线上编码携带 1–8 字节不等的地址体。引擎只需要
//!   比较、哈希与“通配/非法”判定三种能力，因此这里以定长数组加长度字段
//!   建模，避免堆分配；
//! - 连接四元组、监听索引与 ISN 推导全部以该类型为键，要求 `Eq + Hash`
//!   的语义与字节序无关分歧。
//!
//! ## 契约 (What)
//! - [`NipAddr::ANY`] 是通配地址（长度 0），仅允许出现在监听侧本地地址；
//! - [`NipAddr::is_valid`] 拒绝超长地址与长度/内容不一致的值；
//! - [`SocketAddrNip`] 将地址与主机序端口捆绑为一个可哈希端点。

use core::fmt;

/// NewIP 地址体的最大字节数。
pub const NIP_ADDR_MAX_LEN: usize = 8;

/// 变长 NewIP 地址。
///
/// - **意图 (Why)**：以 `(len, bytes)` 定长结构承载 1–8 字节的地址体，
///   复制成本固定且可直接作为哈希键；
/// - **契约 (What)**：`bytes[len..]` 必须为 0，构造函数负责维持该不变量，
///   使 `Eq`/`Hash` 可以直接逐字节比较。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NipAddr {
    len: u8,
    bytes: [u8; NIP_ADDR_MAX_LEN],
}

impl NipAddr {
    /// 通配地址：长度为 0，仅用于未绑定具体地址的监听端。
    pub const ANY: NipAddr = NipAddr {
        len: 0,
        bytes: [0; NIP_ADDR_MAX_LEN],
    };

    /// 从字节切片构造地址；超长时返回 `None`。
    pub fn new(addr: &[u8]) -> Option<Self> {
        if addr.len() > NIP_ADDR_MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; NIP_ADDR_MAX_LEN];
        bytes[..addr.len()].copy_from_slice(addr);
        Some(NipAddr {
            len: addr.len() as u8,
            bytes,
        })
    }

    /// 地址体字节视图。
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// 地址体长度（字节）。
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// 是否为通配地址。
    pub fn is_any(&self) -> bool {
        self.len == 0
    }

    /// 是否为可作为通信端点的合法地址。
    ///
    /// 通配地址不是合法的对端地址；长度越界在构造期已被拒绝。
    pub fn is_valid(&self) -> bool {
        self.len > 0 && self.len as usize <= NIP_ADDR_MAX_LEN
    }

    /// 将地址体折叠为两个 32 位字，供哈希与 ISN 推导混合使用。
    ///
    /// 与原生实现保持一致：不足 8 字节的部分按 0 参与折叠。
    pub fn fold_u32(&self) -> (u32, u32) {
        let lo = u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]);
        let hi = u32::from_le_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]]);
        (lo, hi)
    }
}

impl fmt::Debug for NipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "nip:*");
        }
        write!(f, "nip:")?;
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for NipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// NewIP 端点：地址 + 主机序端口。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SocketAddrNip {
    pub addr: NipAddr,
    pub port: u16,
}

impl SocketAddrNip {
    pub fn new(addr: NipAddr, port: u16) -> Self {
        SocketAddrNip { addr, port }
    }
}

impl fmt::Display for SocketAddrNip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_is_not_a_valid_peer() {
        assert!(NipAddr::ANY.is_any());
        assert!(!NipAddr::ANY.is_valid());
    }

    #[test]
    fn oversized_address_is_rejected() {
        assert!(NipAddr::new(&[0u8; 9]).is_none());
        assert!(NipAddr::new(&[0u8; 8]).is_some());
    }

    #[test]
    fn equality_ignores_trailing_padding() {
        let a = NipAddr::new(&[0xde, 0xad]).unwrap();
        let b = NipAddr::new(&[0xde, 0xad]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fold_u32(), b.fold_u32());
    }

    #[test]
    fn fold_covers_both_halves() {
        let a = NipAddr::new(&[1, 0, 0, 0, 2, 0, 0, 0]).unwrap();
        assert_eq!(a.fold_u32(), (1, 2));
    }
}
