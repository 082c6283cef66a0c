//! 在线状态跟踪
//!
//! 每个用户一条记录（单连接，后写覆盖）。只有客户端上行的活动才刷新记录；周期清扫移除
//! 超过过期阈值的记录；周期探测给所有活跃用户发 ping，ping 入队只表示发出，不算存活。
//! 上一轮的 ping 到下一轮仍未得到任何上行活动，或者 ping 发送失败，该用户标记为不活跃。

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use domain::{ConnectionId, OutboundEvent, PingPayload, Timestamp, UserId};

use crate::clock::Clock;
use crate::delivery::{DeliveryEngine, Destination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// 超过该时长无活动的记录会被清扫
    pub stale_after: chrono::Duration,
    /// `is_online` 的最近活动窗口，必须短于 `stale_after`
    pub online_window: chrono::Duration,
    /// 单次探测的超时
    pub probe_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::seconds(120),
            online_window: chrono::Duration::seconds(60),
            probe_timeout: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub connection_id: ConnectionId,
    pub last_activity: Timestamp,
    pub active: bool,
    /// 已发出但还没有等到上行活动的 ping
    pub probe_sent_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub failed: usize,
}

pub struct PresenceTracker {
    entries: DashMap<UserId, PresenceEntry>,
    clock: Arc<dyn Clock>,
    config: PresenceConfig,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            config,
        }
    }

    /// 用户上线，覆盖同一用户的旧记录
    pub fn register_connection(&self, user_id: UserId, connection_id: ConnectionId) {
        let entry = PresenceEntry {
            connection_id,
            last_activity: self.clock.now(),
            active: true,
            probe_sent_at: None,
        };
        if let Some(previous) = self.entries.insert(user_id, entry) {
            tracing::debug!(
                user_id = %user_id,
                previous = %previous.connection_id,
                connection_id = %connection_id,
                "presence entry overwritten"
            );
        }
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "用户上线");
    }

    /// 只在记录仍属于该连接时移除；被顶替的旧连接断开不影响新连接
    pub fn release_connection(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = self
            .entries
            .remove_if(&user_id, |_, entry| entry.connection_id == connection_id)
            .is_some();
        if removed {
            tracing::info!(user_id = %user_id, connection_id = %connection_id, "用户下线");
        }
        removed
    }

    /// 刷新最近活动时间；用户未注册时返回 false
    pub fn record_activity(&self, user_id: UserId) -> bool {
        let now = self.clock.now();
        match self.entries.get_mut(&user_id) {
            Some(mut entry) => {
                entry.last_activity = now;
                entry.active = true;
                entry.probe_sent_at = None;
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        let now = self.clock.now();
        self.entries.get(&user_id).is_some_and(|entry| {
            entry.active && now - entry.last_activity <= self.config.online_window
        })
    }

    pub fn entry(&self, user_id: UserId) -> Option<PresenceEntry> {
        self.entries.get(&user_id).map(|entry| entry.clone())
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| entry.active && now - entry.last_activity <= self.config.online_window)
            .map(|entry| *entry.key())
            .collect()
    }

    /// 移除超过过期阈值的记录，返回被移除的用户及其当时的连接
    pub fn sweep_stale(&self) -> Vec<(UserId, ConnectionId)> {
        let cutoff = self.clock.now() - self.config.stale_after;
        let mut removed = Vec::new();
        self.entries.retain(|user_id, entry| {
            let keep = entry.last_activity >= cutoff;
            if !keep {
                removed.push((*user_id, entry.connection_id));
            }
            keep
        });

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "清理过期在线记录");
        }
        removed
    }

    /// 一轮存活探测。上一轮的 ping 没有回应的用户直接标记不活跃，不再重发；
    /// 其余活跃用户各发一次 ping，发送失败或超时同样标记不活跃
    pub async fn probe(&self, delivery: &DeliveryEngine) -> ProbeReport {
        let mut unanswered = Vec::new();
        let mut targets = Vec::new();
        for entry in self.entries.iter().filter(|entry| entry.active) {
            if entry.probe_sent_at.is_some() {
                unanswered.push(*entry.key());
            } else {
                targets.push(*entry.key());
            }
        }

        let mut report = ProbeReport::default();
        for user_id in unanswered {
            report.probed += 1;
            // 两轮之间有活动时 record_activity 已清掉了标记
            if self.mark_inactive_if_unanswered(user_id) {
                report.failed += 1;
                tracing::warn!(user_id = %user_id, "liveness probe unanswered");
            }
        }

        for user_id in targets {
            report.probed += 1;
            let now = self.clock.now();
            // 先记下发出时间，回应可能在入队返回之前就到了
            if !self.mark_probe_sent(user_id, now) {
                continue;
            }
            let ping = OutboundEvent::SystemPing(PingPayload {
                sent_at: now.timestamp_millis(),
            });
            let outcome = tokio::time::timeout(
                self.config.probe_timeout,
                delivery.unicast(user_id, Destination::Notifications, &ping),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    report.failed += 1;
                    self.mark_inactive(user_id);
                    tracing::warn!(user_id = %user_id, error = %err, "liveness probe failed");
                }
                Err(_) => {
                    report.failed += 1;
                    self.mark_inactive(user_id);
                    tracing::warn!(user_id = %user_id, "liveness probe timed out");
                }
            }
        }
        report
    }

    fn mark_probe_sent(&self, user_id: UserId, now: Timestamp) -> bool {
        match self.entries.get_mut(&user_id) {
            Some(mut entry) => {
                entry.probe_sent_at = Some(now);
                true
            }
            None => false,
        }
    }

    fn mark_inactive_if_unanswered(&self, user_id: UserId) -> bool {
        match self.entries.get_mut(&user_id) {
            Some(mut entry) if entry.probe_sent_at.is_some() => {
                entry.active = false;
                true
            }
            _ => false,
        }
    }

    fn mark_inactive(&self, user_id: UserId) {
        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            entry.active = false;
        }
    }
}
