//! 下行投递
//!
//! 每个在线用户一个有界队列，由传输层的发送任务消费。广播对所有接收者并发投递，
//! 单个接收者失败或队列已满只记日志，不影响也不拖慢其他人。

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use domain::{ConnectionId, Envelope, OutboundEvent, RoomId, UserId};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::clock::Clock;

/// 连接队列容量
pub const CONNECTION_QUEUE_CAPACITY: usize = 256;

/// 投递目的地，只作为路由元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    Rooms,
    Join,
    Receipts,
    Errors,
    Notifications,
    RoomTopic(RoomId),
    SystemErrors,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rooms => f.write_str("/queue/rooms"),
            Self::Join => f.write_str("/queue/join"),
            Self::Receipts => f.write_str("/queue/receipts"),
            Self::Errors => f.write_str("/queue/errors"),
            Self::Notifications => f.write_str("/queue/notifications"),
            Self::RoomTopic(room_id) => write!(f, "/topic/rooms/{room_id}"),
            Self::SystemErrors => f.write_str("/topic/system.errors"),
        }
    }
}

/// 交给传输层写出的一帧
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub destination: Destination,
    pub envelope: Envelope,
}

impl OutboundFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.envelope)
    }
}

/// 某个用户当前连接的下行队列
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    sender: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(connection_id: ConnectionId, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    /// 新建连接队列，接收端交给传输层
    pub fn channel(connection_id: ConnectionId) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        (Self::new(connection_id, sender), receiver)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("user {0} is not connected")]
    NotConnected(UserId),
    #[error("connection queue of user {0} is closed")]
    Closed(UserId),
    #[error("timed out delivering to user {0}")]
    Timeout(UserId),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 一次广播的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct DeliveryEngine {
    connections: DashMap<UserId, ConnectionHandle>,
    subscriptions: DashMap<RoomId, HashSet<UserId>>,
    clock: Arc<dyn Clock>,
    send_timeout: Duration,
}

impl DeliveryEngine {
    pub fn new(clock: Arc<dyn Clock>, send_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
            clock,
            send_timeout,
        }
    }

    /// 绑定用户的下行队列。已有旧连接时替换之，通知旧连接被顶替，旧连接的订阅作废
    pub fn register_connection(
        &self,
        user_id: UserId,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let connection_id = handle.connection_id;
        let previous = self.connections.insert(user_id, handle)?;
        if previous.connection_id == connection_id {
            return None;
        }

        tracing::info!(
            user_id = %user_id,
            connection_id = %previous.connection_id,
            replaced_by = %connection_id,
            "connection superseded"
        );
        // 订阅属于连接，新连接要自己重新订阅
        self.drop_subscriptions(user_id);
        let notice = OutboundEvent::notification(
            "session.superseded",
            "this session was replaced by a newer connection",
        );
        match Envelope::wrap(&notice, self.clock.now()) {
            Ok(envelope) => {
                let frame = OutboundFrame {
                    destination: Destination::Notifications,
                    envelope,
                };
                if previous.sender.try_send(frame).is_err() {
                    tracing::debug!(user_id = %user_id, "superseded connection already gone");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode supersession notice"),
        }
        Some(previous)
    }

    /// 解除绑定；只有仍是当前连接时才生效，并清理它的订阅
    pub fn unregister_connection(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, handle| handle.connection_id == connection_id)
            .is_some();
        if removed {
            self.drop_subscriptions(user_id);
        }
        removed
    }

    fn drop_subscriptions(&self, user_id: UserId) {
        self.subscriptions.iter_mut().for_each(|mut subscribers| {
            subscribers.remove(&user_id);
        });
        self.subscriptions
            .retain(|_, subscribers| !subscribers.is_empty());
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connected_users(&self) -> Vec<UserId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// 订阅房间广播，返回广播目的地
    pub fn subscribe(&self, room_id: RoomId, user_id: UserId) -> Destination {
        self.subscriptions
            .entry(room_id)
            .or_default()
            .insert(user_id);
        Destination::RoomTopic(room_id)
    }

    pub fn subscribers(&self, room_id: RoomId) -> Vec<UserId> {
        self.subscriptions
            .get(&room_id)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.subscriptions
            .get(&room_id)
            .is_some_and(|subscribers| subscribers.contains(&user_id))
    }

    /// 发给单个用户
    pub async fn unicast(
        &self,
        user_id: UserId,
        destination: Destination,
        event: &OutboundEvent,
    ) -> Result<(), DeliveryError> {
        let envelope = Envelope::wrap(event, self.clock.now())?;
        self.deliver(
            user_id,
            OutboundFrame {
                destination,
                envelope,
            },
        )
        .await
    }

    /// 发给房间的所有订阅者。各接收者并发投递，慢接收者最多拖住自己的发送超时
    pub async fn broadcast(&self, room_id: RoomId, event: &OutboundEvent) -> BroadcastReport {
        let destination = Destination::RoomTopic(room_id);
        let recipients = self.subscribers(room_id);
        let outcomes = join_all(
            recipients
                .iter()
                .map(|user_id| self.unicast(*user_id, destination, event)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (user_id, outcome) in recipients.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        room_id = %room_id,
                        user_id = %user_id,
                        event_type = event.event_type().as_str(),
                        error = %err,
                        "broadcast delivery failed"
                    );
                }
            }
        }

        tracing::debug!(
            room_id = %room_id,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast finished"
        );
        report
    }

    /// 没有可定位的操作者时，把错误发到系统错误频道（所有在线连接）
    pub async fn broadcast_system_error(&self, event: &OutboundEvent) -> BroadcastReport {
        let recipients = self.connected_users();
        let outcomes = join_all(
            recipients
                .iter()
                .map(|user_id| self.unicast(*user_id, Destination::SystemErrors, event)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (user_id, outcome) in recipients.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(user_id = %user_id, error = %err, "system error delivery failed");
                }
            }
        }
        report
    }

    async fn deliver(&self, user_id: UserId, frame: OutboundFrame) -> Result<(), DeliveryError> {
        // 先克隆出发送端，不在分片锁内等待
        let sender = self
            .connections
            .get(&user_id)
            .map(|handle| handle.sender.clone())
            .ok_or(DeliveryError::NotConnected(user_id))?;

        sender
            .send_timeout(frame, self.send_timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DeliveryError::Timeout(user_id),
                SendTimeoutError::Closed(_) => DeliveryError::Closed(user_id),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use domain::EventType;

    fn engine() -> DeliveryEngine {
        DeliveryEngine::new(Arc::new(SystemClock), Duration::from_millis(100))
    }

    fn connect(engine: &DeliveryEngine, user_id: UserId) -> mpsc::Receiver<OutboundFrame> {
        let (handle, receiver) = ConnectionHandle::channel(ConnectionId::random());
        engine.register_connection(user_id, handle);
        receiver
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_with_fresh_trace_ids() {
        let engine = engine();
        let room_id = RoomId::random();
        let alice = UserId::random();
        let bob = UserId::random();
        let mut alice_rx = connect(&engine, alice);
        let mut bob_rx = connect(&engine, bob);
        engine.subscribe(room_id, alice);
        engine.subscribe(room_id, bob);

        let report = engine
            .broadcast(room_id, &OutboundEvent::notification("test", "hello"))
            .await;

        assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });
        let first = alice_rx.recv().await.unwrap();
        let second = bob_rx.recv().await.unwrap();
        assert_eq!(first.destination, Destination::RoomTopic(room_id));
        assert_eq!(first.envelope.event_type, EventType::SystemNotification);
        assert_ne!(first.envelope.message_id, second.envelope.message_id);
    }

    #[tokio::test]
    async fn one_failed_recipient_does_not_abort_the_fan_out() {
        let engine = engine();
        let room_id = RoomId::random();
        let gone = UserId::random();
        let alive = UserId::random();
        drop(connect(&engine, gone));
        let mut alive_rx = connect(&engine, alive);
        engine.subscribe(room_id, gone);
        engine.subscribe(room_id, alive);
        // 已订阅但没有连接
        engine.subscribe(room_id, UserId::random());

        let report = engine
            .broadcast(room_id, &OutboundEvent::error("X", "y"))
            .await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 2 });
        assert!(alive_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn unicast_to_disconnected_user_fails() {
        let engine = engine();
        let result = engine
            .unicast(
                UserId::random(),
                Destination::Errors,
                &OutboundEvent::error("X", "y"),
            )
            .await;
        assert!(matches!(result, Err(DeliveryError::NotConnected(_))));
    }

    #[tokio::test]
    async fn superseded_connection_is_notified() {
        let engine = engine();
        let user_id = UserId::random();
        let mut first_rx = connect(&engine, user_id);
        let _second_rx = connect(&engine, user_id);

        let frame = first_rx.recv().await.unwrap();
        assert_eq!(frame.destination, Destination::Notifications);
        assert_eq!(frame.envelope.payload["kind"], "session.superseded");
    }

    #[tokio::test]
    async fn stale_connection_cannot_unregister_its_successor() {
        let engine = engine();
        let user_id = UserId::random();
        let room_id = RoomId::random();
        let (old, _old_rx) = ConnectionHandle::channel(ConnectionId::random());
        let old_id = old.connection_id;
        engine.register_connection(user_id, old);
        let (new, _new_rx) = ConnectionHandle::channel(ConnectionId::random());
        let new_id = new.connection_id;
        engine.register_connection(user_id, new);
        engine.subscribe(room_id, user_id);

        assert!(!engine.unregister_connection(user_id, old_id));
        assert!(engine.is_subscribed(room_id, user_id));

        assert!(engine.unregister_connection(user_id, new_id));
        assert!(!engine.is_connected(user_id));
        assert!(engine.subscribers(room_id).is_empty());
    }

    #[tokio::test]
    async fn superseded_connection_loses_its_subscriptions() {
        let engine = engine();
        let user_id = UserId::random();
        let room_id = RoomId::random();
        let _first_rx = connect(&engine, user_id);
        engine.subscribe(room_id, user_id);

        let mut second_rx = connect(&engine, user_id);
        assert!(!engine.is_subscribed(room_id, user_id));

        let report = engine
            .broadcast(room_id, &OutboundEvent::notification("test", "hello"))
            .await;
        assert_eq!(report, BroadcastReport::default());
        assert!(second_rx.try_recv().is_err());

        engine.subscribe(room_id, user_id);
        engine
            .broadcast(room_id, &OutboundEvent::notification("test", "again"))
            .await;
        assert!(second_rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queues_do_not_delay_each_other() {
        let engine = engine();
        let room_id = RoomId::random();

        // 三个队列已满、从不消费的接收者
        let mut stalled = Vec::new();
        for _ in 0..3 {
            let user_id = UserId::random();
            let (sender, receiver) = mpsc::channel(1);
            let handle = ConnectionHandle::new(ConnectionId::random(), sender);
            engine.register_connection(user_id, handle);
            engine
                .unicast(user_id, Destination::Notifications, &OutboundEvent::error("X", "fill"))
                .await
                .unwrap();
            engine.subscribe(room_id, user_id);
            stalled.push(receiver);
        }
        let healthy = UserId::random();
        let mut healthy_rx = connect(&engine, healthy);
        engine.subscribe(room_id, healthy);

        let started = tokio::time::Instant::now();
        let report = engine
            .broadcast(room_id, &OutboundEvent::notification("test", "hello"))
            .await;

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 3 });
        // 串行等待会是三倍发送超时
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(healthy_rx.recv().await.is_some());
        drop(stalled);
    }

    #[test]
    fn destinations_render_as_paths() {
        let room_id = RoomId::random();
        assert_eq!(Destination::Receipts.to_string(), "/queue/receipts");
        assert_eq!(
            Destination::RoomTopic(room_id).to_string(),
            format!("/topic/rooms/{room_id}")
        );
    }
}
