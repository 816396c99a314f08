//! 阻塞等待的期限与中断语义验证。
//!
//! # 教案式注释
//!
//! - **意图 (Why)**：`set_recv_timeout` 与 `interrupt` 是挂起调用仅有的
//!   两个外部退出通道，必须保证超时与中断都能把调用方从等待中解救
//!   出来且错误形态可区分；
//! - **手法 (How)**：`start_paused` 运行时下虚拟时钟自动推进到下一个
//!   期限，测试无需真实等待；
//! - **契约 (What)**：期限只约束 `recv`/`accept`；中断标志一次性生效，
//!   被打断的调用消费后自动清除。

mod support;

use std::sync::Arc;
use std::time::Duration;

use nip_core::addr::SocketAddrNip;
use nip_core::error::{AcceptError, RecvError};
use nip_tcp::{Connection, TcpState};

use support::{addr_b, Loopback};

fn server_at(port: u16) -> SocketAddrNip {
    SocketAddrNip::new(addr_b(), port)
}

async fn establish(lo: &Loopback, port: u16) -> (Arc<Connection>, Arc<Connection>) {
    let listener = lo.b.socket();
    listener.set_nonblocking(true);
    listener.bind(server_at(port)).unwrap();
    listener.listen(4).unwrap();

    let client = lo.a.socket();
    client.set_nonblocking(true);
    client.connect(server_at(port)).await.unwrap();
    lo.pump();
    let child = listener.accept().await.unwrap();
    assert_eq!(client.state(), TcpState::Established);
    (client, child)
}

#[tokio::test(start_paused = true)]
async fn recv_respects_deadline() {
    let lo = Loopback::new();
    let (client, _child) = establish(&lo, 4800).await;

    client.set_nonblocking(false);
    client.set_recv_timeout(Some(Duration::from_millis(100)));

    let mut buf = [0u8; 4];
    assert_eq!(
        client.recv(&mut buf).await,
        Err(RecvError::TimedOut),
        "无数据到达时 recv 必须在期限内返回"
    );
    // 超时不是终态：连接本身不受影响。
    assert_eq!(client.state(), TcpState::Established);
}

#[tokio::test(start_paused = true)]
async fn accept_respects_deadline() {
    let lo = Loopback::new();
    let listener = lo.b.socket();
    listener.bind(server_at(4801)).unwrap();
    listener.listen(4).unwrap();
    listener.set_recv_timeout(Some(Duration::from_millis(100)));

    assert_eq!(
        listener.accept().await.err(),
        Some(AcceptError::TimedOut),
        "接受队列持续为空时 accept 必须在期限内返回"
    );
    assert_eq!(listener.state(), TcpState::Listen);
}

#[tokio::test(start_paused = true)]
async fn interrupt_wakes_blocked_recv_once() {
    let lo = Loopback::new();
    let (client, _child) = establish(&lo, 4802).await;
    client.set_nonblocking(false);

    let reader = client.clone();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        reader.recv(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.interrupt();
    assert_eq!(task.await.unwrap(), Err(RecvError::Interrupted));

    // 标志已被消费：后续调用回到正常路径。
    client.set_nonblocking(true);
    let mut buf = [0u8; 4];
    assert_eq!(client.recv(&mut buf).await, Err(RecvError::WouldBlock));
}
