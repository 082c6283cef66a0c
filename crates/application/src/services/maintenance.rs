use std::sync::Arc;
use std::time::Duration;

use crate::delivery::DeliveryEngine;
use crate::presence::PresenceTracker;
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::scheduler::PeriodicTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub sweep_interval: Duration,
    pub probe_interval: Duration,
    pub bucket_cleanup_interval: Duration,
    pub bucket_idle_eviction: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            bucket_cleanup_interval: Duration::from_secs(60),
            bucket_idle_eviction: Duration::from_secs(600),
        }
    }
}

/// 后台维护任务：在线清扫、存活探测、限流桶回收
pub struct MaintenanceTasks {
    tasks: Vec<PeriodicTask>,
}

impl MaintenanceTasks {
    pub fn start(
        config: MaintenanceConfig,
        presence: Arc<PresenceTracker>,
        delivery: Arc<DeliveryEngine>,
        rate_limiter: Arc<TokenBucketRateLimiter>,
    ) -> Self {
        let sweep = {
            let presence = presence.clone();
            let delivery = delivery.clone();
            PeriodicTask::start("presence-sweep", config.sweep_interval, move || {
                let presence = presence.clone();
                let delivery = delivery.clone();
                async move {
                    sweep_stale_sessions(&presence, &delivery);
                }
            })
        };

        let probe = PeriodicTask::start("presence-probe", config.probe_interval, move || {
            let presence = presence.clone();
            let delivery = delivery.clone();
            async move {
                let report = presence.probe(&delivery).await;
                if report.failed > 0 {
                    tracing::info!(probed = report.probed, failed = report.failed, "liveness probe round finished");
                }
            }
        });

        let idle = chrono::Duration::from_std(config.bucket_idle_eviction)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let cleanup = PeriodicTask::start(
            "rate-bucket-cleanup",
            config.bucket_cleanup_interval,
            move || {
                let rate_limiter = rate_limiter.clone();
                async move {
                    rate_limiter.cleanup_idle(idle);
                }
            },
        );

        Self {
            tasks: vec![sweep, probe, cleanup],
        }
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(PeriodicTask::name).collect()
    }

    pub async fn stop(self) {
        for task in self.tasks {
            task.stop().await;
        }
        tracing::info!("maintenance tasks stopped");
    }
}

/// 过期记录按断开处理，只摘除当时那条连接的队列；期间重连的新连接不受影响
fn sweep_stale_sessions(presence: &PresenceTracker, delivery: &DeliveryEngine) -> usize {
    let mut detached = 0;
    for (user_id, connection_id) in presence.sweep_stale() {
        if delivery.unregister_connection(user_id, connection_id) {
            detached += 1;
            tracing::info!(user_id = %user_id, connection_id = %connection_id, "stale connection detached");
        }
    }
    detached
}
