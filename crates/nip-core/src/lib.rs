#![doc = r#"
# nip-core

## 设计动机（Why）
- **定位**：为 NewIP 面向连接的可靠字节流传输引擎提供跨 crate 共享的
  基础契约：变长地址族、规范化报文段模型、外部协作方接口与稳定错误域。
- **架构角色**：`nip-tcp`（协议引擎）只依赖本 crate 暴露的类型与 trait，
  地址族校验和、路由解析、裸包发送等实现细节全部留在协作方一侧，
  保证引擎可在仿真环境中脱离真实网卡运行与测试。
- **设计理念**：错误按“调用面”拆分为细粒度枚举，全部实现
  [`thiserror::Error`]；所有数值字段在进入引擎前统一换算为主机序。

## 核心契约（What）
- [`addr::NipAddr`]：1–8 字节的变长地址，含通配地址与合法性判定；
- [`segment`]：报文段控制块（seq/ack/flags/window/options）与方向元数据；
- [`external`]：路由、校验和、发送、内存记账四个协作方 trait；
- [`error`]：connect/listen/accept/send/recv/keepalive 六个操作的错误域；
- [`config::StackConfig`]：缓冲区、定时器与保活策略的可调参数及默认值；
- [`counters::StackCounters`]：进程内丢包/溢出/复位计数器。

## 注意事项（Trade-offs）
- 本 crate 不依赖异步运行时，可被同步测试工具直接复用；
- 地址族的线上编码不在此定义，引擎只消费解析完成的主机序字段。
"#]

pub mod addr;
pub mod config;
pub mod counters;
pub mod error;
pub mod external;
pub mod segment;

pub use addr::{NipAddr, SocketAddrNip};
pub use config::StackConfig;
pub use counters::StackCounters;
pub use error::{
    AcceptError, ConnectError, KeepaliveError, ListenError, RecvError, SendError, ShutdownHow,
};
pub use external::{ChecksumEngine, Destination, MemoryAccountant, RouteResolver, SegmentTransmitter};
pub use segment::{PacketClass, Segment, SegmentCb, SegmentFlags, SegmentOptions};
