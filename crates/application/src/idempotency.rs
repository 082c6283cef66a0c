//! 发送幂等检查
//!
//! 先看本进程内是否有同一 `(room, key)` 的发送正在进行，有则等待它的结果；否则占位后
//! 再查消息存储。最终仍以存储的唯一约束为准，插入时冲突按重复处理。

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{IdempotencyKey, Message, RoomId};
use tokio::sync::watch;

use crate::error::ApplicationError;
use crate::repository::MessageRepository;

type InFlightKey = (RoomId, IdempotencyKey);

#[derive(Debug, Clone)]
enum InFlight {
    Pending,
    Accepted(Box<Message>),
    Abandoned,
}

type InFlightMap = DashMap<InFlightKey, watch::Sender<InFlight>>;

#[derive(Debug)]
pub enum IdempotencyOutcome {
    /// 新的发送；带 key 时附带占位，发送结束前必须保留
    Fresh(Option<Reservation>),
    /// 已接受过的同一条消息
    AlreadyAccepted(Message),
}

/// 进行中发送的占位。接受后调用 [`Reservation::complete`]；未完成即被丢弃时，
/// 等待者会自行重新检查。
#[derive(Debug)]
pub struct Reservation {
    key: InFlightKey,
    in_flight: Arc<InFlightMap>,
    settled: bool,
}

impl Reservation {
    /// 通知等待者该 key 对应的已接受消息
    pub fn complete(mut self, message: &Message) {
        self.settle(InFlight::Accepted(Box::new(message.clone())));
    }

    fn settle(&mut self, state: InFlight) {
        if self.settled {
            return;
        }
        self.settled = true;
        if let Some((_, sender)) = self.in_flight.remove(&self.key) {
            sender.send_replace(state);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.settle(InFlight::Abandoned);
    }
}

pub struct IdempotencyGuard {
    messages: Arc<dyn MessageRepository>,
    in_flight: Arc<InFlightMap>,
}

impl IdempotencyGuard {
    pub fn new(messages: Arc<dyn MessageRepository>) -> Self {
        Self {
            messages,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// 没有 key 的发送总是 `Fresh(None)`，不做去重
    pub async fn check_and_reserve(
        &self,
        room_id: RoomId,
        key: Option<&IdempotencyKey>,
    ) -> Result<IdempotencyOutcome, ApplicationError> {
        let Some(key) = key else {
            return Ok(IdempotencyOutcome::Fresh(None));
        };
        let in_flight_key = (room_id, key.clone());

        let reservation = loop {
            let mut receiver = match self.in_flight.entry(in_flight_key.clone()) {
                Entry::Vacant(vacant) => {
                    let (sender, _) = watch::channel(InFlight::Pending);
                    vacant.insert(sender);
                    break Reservation {
                        key: in_flight_key.clone(),
                        in_flight: self.in_flight.clone(),
                        settled: false,
                    };
                }
                Entry::Occupied(occupied) => occupied.get().subscribe(),
            };

            tracing::debug!(room_id = %room_id, key = key.as_str(), "waiting for in-flight send");
            let settled = receiver
                .wait_for(|state| !matches!(state, InFlight::Pending))
                .await
                .map(|state| state.clone());
            let state = match settled {
                Ok(state) => state,
                Err(_) => receiver.borrow().clone(),
            };
            if let InFlight::Accepted(message) = state {
                return Ok(IdempotencyOutcome::AlreadyAccepted(*message));
            }
            // 先行者放弃了，重新竞争占位
        };

        // 占位失败时 reservation 被丢弃，等待者会重试
        let existing = self
            .messages
            .find_by_room_and_idempotency_key(room_id, key)
            .await?;

        match existing {
            Some(message) => {
                tracing::info!(
                    room_id = %room_id,
                    message_id = %message.id,
                    key = key.as_str(),
                    "duplicate send detected"
                );
                reservation.complete(&message);
                Ok(IdempotencyOutcome::AlreadyAccepted(message))
            }
            None => Ok(IdempotencyOutcome::Fresh(Some(reservation))),
        }
    }

    /// 插入时唯一约束冲突后，取回先前已接受的消息
    pub async fn resolve_conflict(
        &self,
        room_id: RoomId,
        key: &IdempotencyKey,
    ) -> Result<Option<Message>, ApplicationError> {
        Ok(self
            .messages
            .find_by_room_and_idempotency_key(room_id, key)
            .await?)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
