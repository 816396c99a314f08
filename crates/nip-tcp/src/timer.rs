//! 协议定时器：武装、驱动与到期处理。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 四个协议定时器（重传、延迟 ACK、保活、零窗口探测）共用一个
//!   按连接的驱动任务：任务持弱引用轮询最近到期点，状态变更经
//!   `timer_notify` 即时打断休眠，避免每个定时器各起一个任务；
//! - 到期处理与入站处理走同一所有权入口（`with_owner`），定时器
//!   回调天然与报文段处理串行，无需额外同步。
//!
//! ## 并发契约 (What)
//! - 驱动任务先创建 `notified()` 未来再读取到期点：两步之间发生的
//!   任何重武装都不会丢失唤醒；
//! - 驱动在连接进入 CLOSED 且被标记废弃后退出；`close`/中止路径
//!   负责在收敛时触发 `timer_notify`；
//! - 重传与零窗口探测互斥：有在途数据只武装重传，发送因零窗口停滞
//!   且无在途数据时才武装探测。

use std::sync::Arc;

use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::conn::{ConnCore, ConnFailure, Connection};
use crate::state::{needs_reset_on_abort, TcpState};

/// 重传退避上限（毫秒）。
const RTO_MAX_MS: u64 = 120_000;

impl Connection {
    /// 以当前退避档位武装重传定时器。
    pub(crate) fn arm_retransmit(&self, core: &mut ConnCore) {
        let rto = (core.rto_ms << core.backoff.min(16)).min(RTO_MAX_MS);
        core.timers.retransmit = Some(Instant::now() + Duration::from_millis(rto));
        self.timer_notify.notify_waiters();
    }

    /// 发送停滞且无在途数据时武装零窗口探测定时器。
    pub(crate) fn check_probe_timer(&self, core: &mut ConnCore) {
        if core.packets_out != 0 || core.timers.probe0.is_some() {
            return;
        }
        let rto = (core.rto_ms << core.probes_out.min(16)).min(RTO_MAX_MS);
        core.timers.probe0 = Some(Instant::now() + Duration::from_millis(rto));
        self.timer_notify.notify_waiters();
    }

    /// 按生效中的保活参数武装空闲定时器；未启用则撤防。
    pub(crate) fn arm_keepalive_if_enabled(&self, core: &mut ConnCore) {
        if !core.ka.enabled && !core.ka.override_active {
            core.timers.keepalive = None;
            return;
        }
        let idle_ms = u64::from(core.ka.idle) * self.ctx.config.keepalive_tick_ms;
        core.timers.keepalive = Some(Instant::now() + Duration::from_millis(idle_ms));
        self.timer_notify.notify_waiters();
    }

    /// 保活探测间隔重武装。
    pub(crate) fn rearm_keepalive_interval(&self, core: &mut ConnCore) {
        let interval_ms = u64::from(core.ka.interval) * self.ctx.config.keepalive_tick_ms;
        core.timers.keepalive = Some(Instant::now() + Duration::from_millis(interval_ms));
        self.timer_notify.notify_waiters();
    }

    /// 驱动任务的到期分发。
    fn on_timer_tick(self: &Arc<Self>) {
        let now = Instant::now();
        self.with_owner(|core| {
            if core.state == TcpState::Closed {
                return;
            }
            if core.timers.retransmit.is_some_and(|d| d <= now) {
                self.retransmit_timeout(core);
            }
            if core.timers.delack.is_some_and(|d| d <= now) {
                core.timers.delack = None;
                if core.ack_scheduled {
                    self.send_ack(core);
                }
            }
            if core.timers.probe0.is_some_and(|d| d <= now) {
                self.probe0_timeout(core);
            }
            if core.timers.keepalive.is_some_and(|d| d <= now) {
                self.keepalive_timeout(core);
            }
        });
    }

    /// 重传超时：退避重发，预算耗尽则中止连接。
    fn retransmit_timeout(self: &Arc<Self>, core: &mut ConnCore) {
        core.timers.retransmit = None;
        if core.packets_out == 0 {
            return;
        }
        core.retries += 1;
        if core.retries > self.ctx.config.max_retries {
            debug!(retries = core.retries, "retransmit budget exhausted, abort");
            if needs_reset_on_abort(core.state) {
                self.send_active_reset(core);
            }
            self.enter_closed(core, Some(ConnFailure::Aborted));
            return;
        }
        trace!(retries = core.retries, backoff = core.backoff, "retransmit timeout");
        self.retransmit_head(core);
        core.backoff += 1;
        self.arm_retransmit(core);
    }

    /// 零窗口探测超时。
    fn probe0_timeout(self: &Arc<Self>, core: &mut ConnCore) {
        core.timers.probe0 = None;
        if core.snd_wnd > 0 {
            core.probes_out = 0;
            self.flush_pending(core, false);
            return;
        }
        if core.probes_out > self.ctx.config.max_retries {
            debug!("zero-window probe budget exhausted, abort");
            if needs_reset_on_abort(core.state) {
                self.send_active_reset(core);
            }
            self.enter_closed(core, Some(ConnFailure::Aborted));
            return;
        }
        self.send_probe0(core);
        self.check_probe_timer(core);
    }
}

/// 为连接启动定时器驱动任务。
///
/// 任务持弱引用进入循环，仅在等待期间短暂持有强引用；连接收敛到
/// CLOSED 并被废弃后任务退出。
pub(crate) fn spawn_timer_driver(conn: &Arc<Connection>) {
    let weak = Arc::downgrade(conn);
    tokio::spawn(async move {
        loop {
            let Some(conn) = weak.upgrade() else { break };
            // 先建未来再读状态：其间发生的重武装不会丢失唤醒。
            let notified = conn.timer_notify.notified();
            let (deadline, finished) = {
                let core = conn.core.lock();
                (
                    core.timers.next_deadline(),
                    core.state == TcpState::Closed && core.dead,
                )
            };
            if finished {
                break;
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => conn.on_timer_tick(),
                        _ = notified => {}
                    }
                }
                None => notified.await,
            }
        }
        trace!("timer driver exits");
    });
}
