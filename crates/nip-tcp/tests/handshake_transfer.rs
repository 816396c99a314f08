//! 握手、传输与关闭路径的端到端验证。
//!
//! # 教案式注释
//!
//! - **意图 (Why)**：在双栈回环环境里走完真实的三次握手 → 数据交换 →
//!   有序/强制关闭全流程，断言线上报文段的序号与标志位、连接两端的
//!   状态迁移、以及各丢弃/复位计数器的变化；
//! - **手法 (How)**：全部套接字置非阻塞，报文段经 [`support::Loopback`]
//!   手工泵送，测试对每一步的中间状态都有确定性观测点；
//! - **契约 (What)**：覆盖正常建连、数据往返与 EOF、未读数据关闭立即
//!   复位、四元组冲突、断开后序号前跳、接受队列溢出、监听评分优先级
//!   与无归属报文段的无状态复位。

mod support;

use bytes::Bytes;
use nip_core::addr::{NipAddr, SocketAddrNip};
use nip_core::config::StackConfig;
use nip_core::counters::StackCounters;
use nip_core::error::{AcceptError, ConnectError, RecvError, ShutdownHow};
use nip_core::segment::{PacketClass, Segment, SegmentCb, SegmentFlags, SegmentOptions};
use nip_tcp::{LookupCtx, TcpState};

use support::{addr_a, addr_b, Loopback};

fn server_at(port: u16) -> SocketAddrNip {
    SocketAddrNip::new(addr_b(), port)
}

#[tokio::test]
async fn three_way_handshake_establishes_both_ends() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4600)).expect("绑定监听地址");
    listener.listen(4).expect("进入监听态");

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4600)).await.expect("发出 SYN");
    assert_eq!(client.state(), TcpState::SynSent);

    let delivered = lo.pump();
    let syn = delivered
        .iter()
        .find(|s| s.cb.flags.syn && !s.cb.flags.ack)
        .expect("线上应有 SYN");
    let synack = delivered
        .iter()
        .find(|s| s.cb.flags.syn && s.cb.flags.ack)
        .expect("线上应有 SYN+ACK");
    // SYN 占一个序号：应答的确认号必须是 SYN 序号加一。
    assert_eq!(synack.cb.ack_seq, syn.cb.seq.wrapping_add(1));
    assert!(synack.cb.options.mss.is_some(), "SYN+ACK 应携带 MSS 选项");

    assert_eq!(client.state(), TcpState::Established);
    let child = listener.accept().await.expect("接受队列应有子连接");
    assert_eq!(child.state(), TcpState::Established);
    assert_eq!(child.peer_addr(), Some(client.local_addr()));

    assert_eq!(StackCounters::read(&lo.a.counters().resets_sent), 0);
    assert_eq!(StackCounters::read(&lo.b.counters().resets_sent), 0);
    assert_eq!(StackCounters::read(&lo.b.counters().no_socket_drops), 0);
}

#[tokio::test]
async fn data_roundtrip_then_orderly_close() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4601)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4601)).await.unwrap();
    lo.pump();
    let child = listener.accept().await.unwrap();

    assert_eq!(client.send(b"hello").await.unwrap(), 5);
    lo.pump();
    let mut buf = [0u8; 16];
    assert_eq!(child.recv(&mut buf).await.unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    assert_eq!(child.send(b"world").await.unwrap(), 5);
    lo.pump();
    assert_eq!(client.recv(&mut buf).await.unwrap(), 5);
    assert_eq!(&buf[..5], b"world");

    // 客户端关闭发送方向：对端读到 EOF，两端经 FIN 交换收敛到 CLOSED。
    client.shutdown(ShutdownHow::Send).unwrap();
    assert_eq!(client.state(), TcpState::FinWait1);
    lo.pump();
    assert_eq!(child.recv(&mut buf).await.unwrap(), 0, "对端 FIN 后应读到 EOF");
    assert_eq!(child.state(), TcpState::CloseWait);

    // 数据已读尽：关闭必须走 FIN 交换，任何一端都不得出现 RST。
    child.close();
    let delivered = lo.pump();
    assert!(
        delivered.iter().any(|s| s.cb.flags.fin),
        "读尽数据后的关闭应发出 FIN"
    );
    assert!(
        delivered.iter().all(|s| !s.cb.flags.rst),
        "有序关闭不得出现 RST"
    );
    assert_eq!(child.state(), TcpState::Closed);
    assert_eq!(client.state(), TcpState::Closed);
    assert_eq!(StackCounters::read(&lo.a.counters().resets_sent), 0);
    assert_eq!(StackCounters::read(&lo.b.counters().resets_sent), 0);
    assert_eq!(client.recv(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn close_in_established_completes_fin_handshake() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4607)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4607)).await.unwrap();
    lo.pump();
    let child = listener.accept().await.unwrap();

    // 应用 close 之后连接仍要消化对端报文段，FIN 交换才能走完。
    client.close();
    assert_eq!(client.state(), TcpState::FinWait1);
    let delivered = lo.pump();
    assert!(delivered.iter().any(|s| s.cb.flags.fin), "close 应发出 FIN");
    assert_eq!(child.state(), TcpState::CloseWait);
    assert_eq!(
        client.state(),
        TcpState::FinWait2,
        "对端 ACK 必须推进已关闭套接字的状态"
    );

    child.close();
    lo.pump();
    assert_eq!(child.state(), TcpState::Closed, "LAST_ACK 端应收到最终 ACK");
    assert_eq!(client.state(), TcpState::Closed);
    assert_eq!(StackCounters::read(&lo.a.counters().resets_sent), 0);
    assert_eq!(StackCounters::read(&lo.b.counters().resets_sent), 0);
}

#[tokio::test]
async fn large_write_is_segmented_by_mss() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4608)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4608)).await.unwrap();
    lo.pump();
    let child = listener.accept().await.unwrap();

    // 3000 字节按协商 MSS(1220) 拆成 1220 + 1220 + 560。
    let payload = vec![0x5Au8; 3000];
    assert_eq!(client.send(&payload).await.unwrap(), 3000);
    let delivered = lo.pump();
    let data: Vec<_> = delivered
        .iter()
        .filter(|s| !s.cb.payload.is_empty())
        .collect();
    assert_eq!(
        data.iter().map(|s| s.cb.payload.len()).collect::<Vec<_>>(),
        vec![1220, 1220, 560],
        "写入应按 MSS 切分在途单元"
    );
    // 相邻分片的序号必须首尾相接。
    assert_eq!(data[1].cb.seq, data[0].cb.end_seq);
    assert_eq!(data[2].cb.seq, data[1].cb.end_seq);

    let mut buf = vec![0u8; 4096];
    assert_eq!(child.recv(&mut buf).await.unwrap(), 3000);
    assert!(buf[..3000].iter().all(|&b| b == 0x5A));
}

#[tokio::test]
async fn out_of_order_stash_is_bounded_and_replayed_in_order() {
    let cfg_b = StackConfig {
        rcvbuf: 1024,
        ..StackConfig::default()
    };
    let lo = Loopback::with_configs(Default::default(), cfg_b);
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4609)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4609)).await.unwrap();
    let delivered = lo.pump();
    let child = listener.accept().await.unwrap();
    let isn = delivered
        .iter()
        .find(|s| s.cb.flags.syn && !s.cb.flags.ack)
        .map(|s| s.cb.seq)
        .expect("客户端 SYN");
    let peer_isn = delivered
        .iter()
        .find(|s| s.cb.flags.syn && s.cb.flags.ack)
        .map(|s| s.cb.seq)
        .expect("服务端 SYN+ACK");

    // 以客户端身份手工构造 512 字节数据段，按乱序注入服务端。
    let from = client.local_addr();
    let to = server_at(4609);
    let base = isn.wrapping_add(1);
    let ack_seq = peer_isn.wrapping_add(1);
    let seg = |chunk: u32| -> Segment {
        let payload = Bytes::from(vec![chunk as u8; 512]);
        Segment {
            src_addr: from.addr,
            src_port: from.port,
            dst_addr: to.addr,
            dst_port: to.port,
            cb: SegmentCb {
                seq: base.wrapping_add(chunk * 512),
                end_seq: base.wrapping_add(chunk * 512 + 512),
                ack_seq,
                flags: SegmentFlags {
                    ack: true,
                    psh: true,
                    ..SegmentFlags::default()
                },
                window: 4096,
                options: SegmentOptions::default(),
                payload,
            },
            pkt_total_len: 512,
            checksum: 0,
        }
    };

    // 乱序暂存与接收队列共享 rcvbuf(1024) 预算：两段占满，第三段丢弃。
    lo.b.on_segment(seg(1), PacketClass::Host, LookupCtx::default());
    lo.b.on_segment(seg(2), PacketClass::Host, LookupCtx::default());
    assert_eq!(StackCounters::read(&lo.b.counters().memory_pressure_drops), 0);
    lo.b.on_segment(seg(3), PacketClass::Host, LookupCtx::default());
    assert_eq!(
        StackCounters::read(&lo.b.counters().memory_pressure_drops),
        1,
        "超出接收预算的乱序段应计数后丢弃"
    );

    // 缺口补齐后，暂存段按序一次性交付。
    lo.b.on_segment(seg(0), PacketClass::Host, LookupCtx::default());
    let mut buf = vec![0u8; 4096];
    assert_eq!(child.recv(&mut buf).await.unwrap(), 1536);
    assert!(buf[..512].iter().all(|&b| b == 0));
    assert!(buf[512..1024].iter().all(|&b| b == 1));
    assert!(buf[1024..1536].iter().all(|&b| b == 2));
}

#[tokio::test]
async fn close_with_unread_data_sends_reset_not_fin() {
    let (lo, mem_a, mem_b) = Loopback::metered(Default::default(), Default::default());
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4602)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4602)).await.unwrap();
    lo.pump();
    let child = listener.accept().await.unwrap();

    client.send(b"undrained").await.unwrap();
    lo.pump();

    // 接收缓冲仍有未读字节：关闭必须走 RST 而非 FIN。
    child.close();
    let delivered = lo.pump();
    assert!(
        delivered.iter().any(|s| s.cb.flags.rst),
        "未读数据关闭应发出 RST"
    );
    assert!(
        delivered.iter().all(|s| !s.cb.flags.fin),
        "未读数据关闭不得发出 FIN"
    );
    assert_eq!(StackCounters::read(&lo.b.counters().resets_sent), 1);

    let mut buf = [0u8; 8];
    assert_eq!(
        client.recv(&mut buf).await,
        Err(RecvError::ConnectionReset)
    );
    assert_eq!(client.state(), TcpState::Closed);

    // 复位终结后两端的缓冲记账必须全额归还。
    assert_eq!(mem_a.balance(), 0, "发送端记账应清零");
    assert_eq!(mem_b.balance(), 0, "接收端未读数据的记账应随关闭归还");
}

#[tokio::test]
async fn four_tuple_is_unique_across_sockets() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4603)).unwrap();
    listener.listen(4).unwrap();

    let first = lo.a.socket();
    first.set_nonblocking(true);
    first.bind(SocketAddrNip::new(addr_a(), 5000)).unwrap();
    first.connect(server_at(4603)).await.unwrap();

    let second = lo.a.socket();
    second.set_nonblocking(true);
    second.bind(SocketAddrNip::new(addr_a(), 5000)).unwrap();
    assert_eq!(
        second.connect(server_at(4603)).await,
        Err(ConnectError::AddressInUse),
        "相同四元组的后到者必须失败"
    );
}

#[tokio::test]
async fn disconnect_jumps_sequence_space_forward() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4604)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4604)).await.unwrap();
    let delivered = lo.pump();
    let isn1 = delivered
        .iter()
        .find(|s| s.cb.flags.syn && !s.cb.flags.ack)
        .map(|s| s.cb.seq)
        .expect("首个 SYN");
    assert_eq!(client.state(), TcpState::Established);

    client.disconnect();
    assert_eq!(client.state(), TcpState::Closed);
    lo.pump();

    // 再次连接沿用前跳后的 write_seq：旧 write_seq(isn1+1) + 最大窗口 + 2。
    client.connect(server_at(4604)).await.expect("断开后可复用");
    let delivered = lo.pump();
    let isn2 = delivered
        .iter()
        .find(|s| s.cb.flags.syn && !s.cb.flags.ack)
        .map(|s| s.cb.seq)
        .expect("复用后的 SYN");
    let expected = isn1.wrapping_add(1).wrapping_add(65_535 + 2);
    assert_eq!(isn2, expected, "断开必须把发送序号前跳 max_window + 2");
    assert_eq!(client.state(), TcpState::Established);
}

#[tokio::test]
async fn accept_queue_overflow_drops_syn_and_counts() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4605)).unwrap();
    listener.listen(1).unwrap();

    let first = lo.a.socket();
    first.set_nonblocking(true);
    first.connect(server_at(4605)).await.unwrap();
    lo.pump();
    assert_eq!(first.state(), TcpState::Established);

    // 队列已满（首个子连接未被取走）：第二个 SYN 静默丢弃并计数。
    let second = lo.a.socket();
    second.set_nonblocking(true);
    second.connect(server_at(4605)).await.unwrap();
    lo.pump();
    assert_eq!(second.state(), TcpState::SynSent, "溢出的 SYN 不应得到应答");
    assert_eq!(StackCounters::read(&lo.b.counters().listen_overflows), 1);

    // 被丢弃的 SYN 不会留下半开请求：取走子连接后队列重新为空。
    let _child = listener.accept().await.unwrap();
    assert!(matches!(listener.accept().await, Err(AcceptError::WouldBlock)));
}

#[tokio::test]
async fn specific_listener_beats_wildcard() {
    let lo = Loopback::new();
    let wildcard = lo.b.socket();
    wildcard.set_nonblocking(true);
    wildcard.bind(SocketAddrNip::new(NipAddr::ANY, 7000)).unwrap();
    wildcard.listen(4).unwrap();

    let specific = lo.b.socket();
    specific.set_nonblocking(true);
    specific.bind(server_at(7000)).unwrap();
    specific.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(7000)).await.unwrap();
    lo.pump();

    assert!(specific.accept().await.is_ok(), "精确地址监听者优先收编");
    assert!(matches!(wildcard.accept().await, Err(AcceptError::WouldBlock)));
}

#[tokio::test]
async fn unmatched_segment_gets_stateless_reset() {
    let lo = Loopback::new();
    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(9999)).await.unwrap();
    let delivered = lo.pump();

    assert!(
        delivered.iter().any(|s| s.cb.flags.rst),
        "无监听端口的 SYN 应换来无状态 RST"
    );
    assert_eq!(StackCounters::read(&lo.b.counters().no_socket_drops), 1);
    assert_eq!(StackCounters::read(&lo.b.counters().resets_sent), 1);
    // RST 带有可验证的确认号，SYN_SENT 端立即终结。
    assert_eq!(client.state(), TcpState::Closed);
}

#[tokio::test]
async fn checksum_failure_is_counted_and_dropped() {
    let lo = Loopback::custom(
        Default::default(),
        Default::default(),
        std::sync::Arc::new(support::RejectChecksum),
    );
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(4606)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(4606)).await.unwrap();
    lo.pump();

    assert_eq!(StackCounters::read(&lo.b.counters().checksum_failures), 1);
    assert_eq!(client.state(), TcpState::SynSent, "校验失败的 SYN 不产生任何应答");
    assert!(matches!(listener.accept().await, Err(AcceptError::WouldBlock)));
}
