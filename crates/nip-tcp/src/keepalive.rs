//! 保活：用户参数、自适应覆盖与探测。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 用户保活参数与协议侧自适应覆盖共用同一组生效字段：发送路径按
//!   单次写入总量选择短/长空闲阈值并临时覆盖，空闲探测满额后恢复
//!   用户基线。覆盖前的用户参数备份在 `*_bak` 影子字段；
//! - 参数校验与提交分离：任何一项越界都在提交前整体拒绝，三项参数
//!   不存在部分生效的中间态。
//!
//! ## 契约 (What)
//! - [`Connection::set_keepalive`] 越界时返回
//!   [`KeepaliveError::InvalidArgument`] 且不改动任何状态；
//! - 覆盖激活且用户未重新配置时，发送路径的再次覆盖是幂等空操作；
//! - 恢复触发时 `*_bak` 三项一并清零：备份非零当且仅当覆盖激活且
//!   覆盖前存在用户配置；
//! - 无响应探测数超过生效上限即中止连接（发 RST 后收敛）。

use std::sync::Arc;

use tracing::{debug, trace};

use nip_core::config::{
    MAX_KEEPALIVE_IDLE, MAX_KEEPALIVE_INTERVAL, MAX_KEEPALIVE_PROBES, SMALL_PAYLOAD_BOUNDARY,
};
use nip_core::error::KeepaliveError;

use crate::conn::{ConnCore, ConnFailure, Connection};
use crate::state::{needs_reset_on_abort, TcpState};

/// 三项参数的整体校验；首个越界项即返回错误。
fn validate(idle: u32, interval: u32, probes: u32) -> Result<(), KeepaliveError> {
    if idle == 0 || idle > MAX_KEEPALIVE_IDLE {
        return Err(KeepaliveError::InvalidArgument {
            field: "idle",
            value: idle,
        });
    }
    if interval == 0 || interval > MAX_KEEPALIVE_INTERVAL {
        return Err(KeepaliveError::InvalidArgument {
            field: "interval",
            value: interval,
        });
    }
    if probes == 0 || probes > MAX_KEEPALIVE_PROBES {
        return Err(KeepaliveError::InvalidArgument {
            field: "probes",
            value: probes,
        });
    }
    Ok(())
}

impl Connection {
    /// 配置用户保活参数（时间单位为保活时基）。
    ///
    /// 校验先于提交：任何一项越界都整体拒绝且不留任何副作用。
    pub fn set_keepalive(
        self: &Arc<Self>,
        enabled: bool,
        idle: u32,
        interval: u32,
        probes: u32,
    ) -> Result<(), KeepaliveError> {
        if enabled {
            validate(idle, interval, probes)?;
        }
        self.with_owner(|core| {
            if enabled {
                if core.ka.override_active {
                    // 覆盖期内只刷新恢复目标，生效参数仍归覆盖所有。
                    core.ka.idle_bak = idle;
                    core.ka.interval_bak = interval;
                    core.ka.probes_bak = probes;
                    core.ka.user_dirty = true;
                } else {
                    core.ka.idle = idle;
                    core.ka.interval = interval;
                    core.ka.probes = probes;
                    self.arm_keepalive_if_enabled_after_enable(core);
                }
                core.ka.enabled = true;
            } else {
                core.ka.enabled = false;
                if !core.ka.override_active {
                    core.timers.keepalive = None;
                }
            }
            core.ka.probes_out = 0;
        });
        Ok(())
    }

    fn arm_keepalive_if_enabled_after_enable(self: &Arc<Self>, core: &mut ConnCore) {
        // enabled 位在调用后才置位，这里直接按新参数武装。
        let idle_ms = u64::from(core.ka.idle) * self.ctx.config.keepalive_tick_ms;
        core.timers.keepalive =
            Some(tokio::time::Instant::now() + tokio::time::Duration::from_millis(idle_ms));
        self.timer_notify.notify_waiters();
    }

    /// 保活参数快照：（用户开关，生效 idle/interval/probes，覆盖激活）。
    pub fn keepalive_params(&self) -> (bool, u32, u32, u32, bool) {
        let core = self.core.lock();
        (
            core.ka.enabled,
            core.ka.idle,
            core.ka.interval,
            core.ka.probes,
            core.ka.override_active,
        )
    }

    /// 发送路径的自适应覆盖：按单次写入总量选择空闲阈值。
    ///
    /// 覆盖激活且用户参数未变时为幂等空操作。
    pub(crate) fn keepalive_override_engage(
        self: &Arc<Self>,
        core: &mut ConnCore,
        pkt_total_len: u32,
    ) {
        if core.state != TcpState::Established {
            return;
        }
        if core.ka.override_active && !core.ka.user_dirty {
            return;
        }
        if core.ka.enabled && !core.ka.override_active {
            // 首次覆盖：备份用户基线。
            core.ka.idle_bak = core.ka.idle;
            core.ka.interval_bak = core.ka.interval;
            core.ka.probes_bak = core.ka.probes;
        }
        let idle = if pkt_total_len < SMALL_PAYLOAD_BOUNDARY {
            self.ctx.config.keepalive_idle_short
        } else {
            self.ctx.config.keepalive_idle_long
        };
        core.ka.idle = idle;
        core.ka.interval = self.ctx.config.keepalive_interval;
        core.ka.probes = self.ctx.config.keepalive_probes;
        core.ka.override_active = true;
        core.ka.user_dirty = false;
        core.ka.idle_probes_out = 0;
        trace!(idle, pkt_total_len, "keepalive override engaged");
        self.arm_keepalive_if_enabled(core);
    }

    /// 覆盖恢复：回到用户基线；覆盖前无用户配置则整体停用。
    pub(crate) fn keepalive_override_restore(self: &Arc<Self>, core: &mut ConnCore) {
        if !core.ka.override_active {
            return;
        }
        let had_user_config =
            core.ka.idle_bak != 0 || core.ka.interval_bak != 0 || core.ka.probes_bak != 0;
        if had_user_config {
            core.ka.idle = core.ka.idle_bak;
            core.ka.interval = core.ka.interval_bak;
            core.ka.probes = core.ka.probes_bak;
        }
        core.ka.idle_bak = 0;
        core.ka.interval_bak = 0;
        core.ka.probes_bak = 0;
        core.ka.override_active = false;
        core.ka.user_dirty = false;
        core.ka.idle_probes_out = 0;
        debug!(restored = had_user_config, "keepalive override restored");
        self.arm_keepalive_if_enabled(core);
    }

    /// 保活定时器到期：空闲探测、覆盖恢复与无响应中止。
    pub(crate) fn keepalive_timeout(self: &Arc<Self>, core: &mut ConnCore) {
        core.timers.keepalive = None;
        if !core.ka.enabled && !core.ka.override_active {
            return;
        }
        if core.state != TcpState::Established {
            return;
        }
        if core.packets_out > 0 || core.send_head < core.write_queue.len() {
            // 发送方向仍活跃，重传定时器已经接管连通性判定。
            self.arm_keepalive_if_enabled(core);
            return;
        }
        if core.ka.probes_out >= core.ka.probes {
            debug!(probes = core.ka.probes_out, "keepalive probes exhausted, abort");
            if needs_reset_on_abort(core.state) {
                self.send_active_reset(core);
            }
            self.enter_closed(core, Some(ConnFailure::Aborted));
            return;
        }

        self.send_probe0(core);
        core.probes_out = 0;
        core.ka.probes_out += 1;

        if core.ka.override_active {
            core.ka.idle_probes_out += 1;
            if core.ka.idle_probes_out >= self.ctx.config.idle_probes_before_restore {
                // 连接长期空闲：覆盖的意义（发送活跃期的快速检测）消失。
                self.keepalive_override_restore(core);
                return;
            }
        }
        self.rearm_keepalive_interval(core);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_each_field_atomically() {
        assert_eq!(
            validate(0, 10, 5),
            Err(KeepaliveError::InvalidArgument {
                field: "idle",
                value: 0
            })
        );
        assert_eq!(
            validate(100, MAX_KEEPALIVE_INTERVAL + 1, 5),
            Err(KeepaliveError::InvalidArgument {
                field: "interval",
                value: MAX_KEEPALIVE_INTERVAL + 1
            })
        );
        assert_eq!(
            validate(100, 10, 0),
            Err(KeepaliveError::InvalidArgument {
                field: "probes",
                value: 0
            })
        );
        assert!(validate(100, 10, 5).is_ok());
        assert!(validate(MAX_KEEPALIVE_IDLE, MAX_KEEPALIVE_INTERVAL, MAX_KEEPALIVE_PROBES).is_ok());
    }
}
