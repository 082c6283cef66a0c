//! 会话网关
//!
//! 连接建立后的全部上行操作都从这里进入：解析主体、鉴权、执行操作、通过投递引擎回写
//! 结果。预期内的失败（无权限、不存在、校验失败、限流）都在这里转成 `error` 信封，
//! 不会越过操作边界。

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use domain::{
    ChatMessagePayload, ChatRoom, ConnectionId, CreateRoom, DomainError, IdempotencyKey,
    InboundOperation, JoinDecisionPayload, JoinRequest, JoinRequestedPayload, Message,
    OutboundEvent, ReceiptStatus, RepositoryError, RequestJoin, RespondJoin, RoomId, RoomSummary,
    SendMessage, Subscribe, SubscribedPayload, UserId,
};
use tokio::sync::{mpsc, Mutex};

use crate::clock::Clock;
use crate::content_filter::ContentFilter;
use crate::delivery::{ConnectionHandle, DeliveryEngine, DeliveryError, Destination, OutboundFrame};
use crate::error::ApplicationError;
use crate::identity::{AuthError, SessionAttributes, SessionIdentityResolver};
use crate::idempotency::{IdempotencyGuard, IdempotencyOutcome};
use crate::presence::PresenceTracker;
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::repository::{JoinRequestRepository, MessageRepository, RoomRepository, UserRepository};
use crate::sequencer::RoomSequencer;

pub struct ChatGatewayDependencies {
    pub room_repository: Arc<dyn RoomRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub user_repository: Arc<dyn UserRepository>,
    pub join_request_repository: Arc<dyn JoinRequestRepository>,
    pub identity: Arc<SessionIdentityResolver>,
    pub delivery: Arc<DeliveryEngine>,
    pub presence: Arc<PresenceTracker>,
    pub rate_limiter: Arc<TokenBucketRateLimiter>,
    pub content_filter: Arc<ContentFilter>,
    pub sequencer: Arc<RoomSequencer>,
    pub clock: Arc<dyn Clock>,
}

/// 一次发送的结果
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Accepted(Message),
    Duplicate(Message),
}

impl SendOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Accepted(message) | Self::Duplicate(message) => message,
        }
    }
}

pub struct ChatGateway {
    deps: ChatGatewayDependencies,
    idempotency: IdempotencyGuard,
    /// 同一房间的成员变更串行执行，读-改-整体写回之间不会丢更新；无人使用时回收
    membership_locks: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl ChatGateway {
    pub fn new(deps: ChatGatewayDependencies) -> Self {
        let idempotency = IdempotencyGuard::new(deps.message_repository.clone());
        Self {
            deps,
            idempotency,
            membership_locks: DashMap::new(),
        }
    }

    pub fn delivery(&self) -> &Arc<DeliveryEngine> {
        &self.deps.delivery
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.deps.presence
    }

    pub fn rate_limiter(&self) -> &Arc<TokenBucketRateLimiter> {
        &self.deps.rate_limiter
    }

    // ---- 连接生命周期 ----

    /// 握手认证，失败时连接必须被拒绝
    pub fn handshake(
        &self,
        raw_query: Option<&str>,
        session: &SessionAttributes,
    ) -> Result<UserId, AuthError> {
        match self.deps.identity.handshake(raw_query, session) {
            Ok(subject) => {
                tracing::info!(user_id = %subject, "handshake accepted");
                Ok(subject)
            }
            Err(err) => {
                tracing::warn!(error = %err, "handshake refused");
                Err(err)
            }
        }
    }

    /// 连接建立：登记下行队列与在线状态，返回交给写任务的接收端
    pub fn open_session(
        &self,
        subject: UserId,
        connection_id: ConnectionId,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (handle, receiver) = ConnectionHandle::channel(connection_id);
        self.deps.delivery.register_connection(subject, handle);
        self.deps.presence.register_connection(subject, connection_id);
        tracing::info!(user_id = %subject, connection_id = %connection_id, "session opened");
        receiver
    }

    /// 连接断开。已被新连接顶替时不影响新连接
    pub fn close_session(&self, subject: UserId, connection_id: ConnectionId) {
        let detached = self.deps.delivery.unregister_connection(subject, connection_id);
        let released = self.deps.presence.release_connection(subject, connection_id);
        tracing::info!(
            user_id = %subject,
            connection_id = %connection_id,
            detached,
            released,
            "session closed"
        );
    }

    /// 任意上行活动都刷新在线状态
    pub fn record_activity(&self, subject: UserId) {
        self.deps.presence.record_activity(subject);
    }

    // ---- 上行操作 ----

    /// 解析主体后执行操作。主体无法恢复时不产生任何副作用，由调用方直接回写错误
    pub async fn dispatch(
        &self,
        transport_principal: Option<UserId>,
        session: &SessionAttributes,
        operation: InboundOperation,
    ) -> Result<(), AuthError> {
        let subject = match self.deps.identity.resolve(transport_principal, session) {
            Ok(subject) => subject,
            Err(err) => {
                tracing::warn!(op = operation.name(), error = %err, "operation rejected, identity unavailable");
                return Err(err);
            }
        };
        self.handle(subject, operation).await;
        Ok(())
    }

    /// 执行一个已确认主体的操作，所有结果都通过投递引擎回写
    pub async fn handle(&self, subject: UserId, operation: InboundOperation) {
        self.record_activity(subject);
        let op = operation.name();
        tracing::debug!(user_id = %subject, op, "handling operation");

        let result = match operation {
            InboundOperation::CreateRoom(request) => self.create_room(subject, request).await.map(|_| ()),
            InboundOperation::JoinRequest(request) => self.request_join(subject, request).await.map(|_| ()),
            InboundOperation::JoinResponse(request) => self.respond_join(subject, request).await,
            InboundOperation::Subscribe(request) => self.subscribe(subject, request).await,
            InboundOperation::SendMessage(request) => {
                // 发送管线自己负责回执和错误
                self.send_message(subject, request).await;
                Ok(())
            }
            InboundOperation::Pong => Ok(()),
        };

        if let Err(err) = result {
            self.report_failure(subject, op, &err).await;
        }
    }

    pub async fn create_room(
        &self,
        subject: UserId,
        request: CreateRoom,
    ) -> Result<ChatRoom, ApplicationError> {
        let participants: BTreeSet<UserId> = request
            .participant_ids
            .into_iter()
            .filter(|id| *id != subject)
            .collect();
        for participant in &participants {
            self.deps
                .user_repository
                .load_user(*participant)
                .await?
                .ok_or(DomainError::UserNotFound)?;
        }

        let now = self.deps.clock.now();
        let room = ChatRoom::new(RoomId::random(), request.room_name, subject, participants, now)?;
        let room = self.deps.room_repository.create(room).await?;
        self.deps.sequencer.restore(room.id, 0);

        tracing::info!(
            room_id = %room.id,
            user_id = %subject,
            members = room.members().len(),
            "room created"
        );

        let summary = RoomSummary::from(&room);
        self.notify(subject, Destination::Rooms, OutboundEvent::RoomCreated(summary.clone()))
            .await;
        for participant in room.participants_except_owner() {
            self.notify(
                participant,
                Destination::Rooms,
                OutboundEvent::RoomInvited(summary.clone()),
            )
            .await;
        }
        Ok(room)
    }

    pub async fn request_join(
        &self,
        subject: UserId,
        request: RequestJoin,
    ) -> Result<JoinRequest, ApplicationError> {
        if request.requester_id.is_some_and(|requester| requester != subject) {
            return Err(DomainError::invalid_argument(
                "requesterId",
                "must match the authenticated user",
            )
            .into());
        }

        let room = self.load_room(request.room_id).await?;
        if room.is_member(subject) {
            return Err(DomainError::UserAlreadyInRoom.into());
        }

        let join_request = JoinRequest::new(room.id, subject, self.deps.clock.now());
        let join_request = self.deps.join_request_repository.create(join_request).await?;
        tracing::info!(
            room_id = %room.id,
            user_id = %subject,
            request_id = %join_request.id,
            "join requested"
        );

        self.notify(
            room.owner_id,
            Destination::Join,
            OutboundEvent::JoinRequested(JoinRequestedPayload {
                request_id: join_request.id,
                room_id: room.id,
                requester_id: subject,
            }),
        )
        .await;
        Ok(join_request)
    }

    pub async fn respond_join(
        &self,
        subject: UserId,
        request: RespondJoin,
    ) -> Result<(), ApplicationError> {
        let room_id = request.room_id;
        let lock = self.membership_lock(room_id);
        let result = {
            let _guard = lock.lock().await;
            self.answer_join(subject, request).await
        };
        drop(lock);
        // 没有其他人持有或等待时回收这把锁
        self.membership_locks
            .remove_if(&room_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// 在房间成员锁内处理加入答复
    async fn answer_join(
        &self,
        subject: UserId,
        request: RespondJoin,
    ) -> Result<(), ApplicationError> {
        let room = self.load_room(request.room_id).await?;
        if !room.is_owner(subject) {
            return Err(DomainError::NotRoomOwner.into());
        }

        let join_request = self
            .deps
            .join_request_repository
            .find(request.request_id)
            .await?
            .filter(|found| found.matches(room.id, request.requester_id))
            .ok_or(DomainError::JoinRequestNotFound)?;

        if request.accepted {
            let updated = match room.with_member_added(join_request.requester_id, self.deps.clock.now()) {
                Ok(updated) => updated,
                Err(err) => {
                    self.deps
                        .join_request_repository
                        .remove(join_request.id)
                        .await?;
                    return Err(err.into());
                }
            };
            self.deps.room_repository.replace_members(&updated).await?;
        }
        self.deps
            .join_request_repository
            .remove(join_request.id)
            .await?;

        tracing::info!(
            room_id = %room.id,
            requester_id = %join_request.requester_id,
            accepted = request.accepted,
            "join request answered"
        );

        let payload = JoinDecisionPayload {
            request_id: join_request.id,
            room_id: room.id,
            requester_id: join_request.requester_id,
        };
        let event = if request.accepted {
            OutboundEvent::JoinAccepted(payload)
        } else {
            OutboundEvent::JoinRejected(payload)
        };
        self.notify(join_request.requester_id, Destination::Join, event)
            .await;
        Ok(())
    }

    pub async fn subscribe(
        &self,
        subject: UserId,
        request: Subscribe,
    ) -> Result<(), ApplicationError> {
        let room = self.load_room(request.room_id).await?;
        if !room.is_member(subject) {
            return Err(DomainError::UserNotInRoom.into());
        }

        let destination = self.deps.delivery.subscribe(room.id, subject);
        tracing::info!(room_id = %room.id, user_id = %subject, "subscribed");

        self.notify(
            subject,
            Destination::Notifications,
            OutboundEvent::SubscribeSuccess(SubscribedPayload {
                room_id: room.id,
                destination: destination.to_string(),
            }),
        )
        .await;
        Ok(())
    }

    /// 发送管线：每次尝试恰好一个回执
    pub async fn send_message(&self, subject: UserId, request: SendMessage) {
        let client_message_id = request.client_message_id.clone();

        match self.accept_message(subject, &request).await {
            Ok(SendOutcome::Accepted(message)) => {
                self.broadcast_message(&message).await;
                self.notify(
                    subject,
                    Destination::Receipts,
                    OutboundEvent::receipt(client_message_id, ReceiptStatus::Ok, Some(message.id)),
                )
                .await;
            }
            Ok(SendOutcome::Duplicate(message)) => {
                // 第一次的回执可能没有送达，原样重发广播
                self.broadcast_message(&message).await;
                self.notify(
                    subject,
                    Destination::Receipts,
                    OutboundEvent::receipt(
                        client_message_id,
                        ReceiptStatus::Duplicate,
                        Some(message.id),
                    ),
                )
                .await;
            }
            Err(err) => {
                self.report_failure(subject, "send-message", &err).await;
                self.notify(
                    subject,
                    Destination::Receipts,
                    OutboundEvent::receipt(client_message_id, ReceiptStatus::Error, None),
                )
                .await;
            }
        }
    }

    /// 鉴权 → 限流 → 内容过滤 → 幂等检查 → 分配序号 → 持久化
    pub async fn accept_message(
        &self,
        subject: UserId,
        request: &SendMessage,
    ) -> Result<SendOutcome, ApplicationError> {
        let room = self.load_room(request.room_id).await?;
        if !room.is_member(subject) {
            return Err(DomainError::UserNotInRoom.into());
        }

        self.deps.rate_limiter.try_acquire(subject)?;
        let content = self.deps.content_filter.validate(&request.content)?;
        let key = IdempotencyKey::parse_optional(request.client_message_id.as_deref())?;

        let reservation = match self
            .idempotency
            .check_and_reserve(room.id, key.as_ref())
            .await?
        {
            IdempotencyOutcome::AlreadyAccepted(existing) => {
                return Ok(SendOutcome::Duplicate(existing));
            }
            IdempotencyOutcome::Fresh(reservation) => reservation,
        };

        self.ensure_sequence_restored(room.id).await?;
        let sequence = self.deps.sequencer.issue_next(room.id);
        let message = Message::new(
            room.id,
            subject,
            content.into_inner(),
            sequence,
            key.clone(),
            self.deps.clock.now(),
        );

        match self.deps.message_repository.save_message(&message).await {
            Ok(_) => {
                tracing::info!(
                    room_id = %room.id,
                    user_id = %subject,
                    message_id = %message.id,
                    sequence = sequence.value(),
                    "message accepted"
                );
                if let Some(reservation) = reservation {
                    reservation.complete(&message);
                }
                Ok(SendOutcome::Accepted(message))
            }
            Err(RepositoryError::Conflict) => {
                let Some(key) = key else {
                    return Err(RepositoryError::Conflict.into());
                };
                // 插入时才发现的冲突，按重复处理；已分配的序号作废
                let existing = self
                    .idempotency
                    .resolve_conflict(room.id, &key)
                    .await?
                    .ok_or(ApplicationError::Repository(RepositoryError::Conflict))?;
                tracing::info!(
                    room_id = %room.id,
                    message_id = %existing.id,
                    discarded_sequence = sequence.value(),
                    "duplicate detected at insert"
                );
                if let Some(reservation) = reservation {
                    reservation.complete(&existing);
                }
                Ok(SendOutcome::Duplicate(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    // ---- 内部 ----

    async fn load_room(&self, room_id: RoomId) -> Result<ChatRoom, ApplicationError> {
        Ok(self
            .deps
            .room_repository
            .load_room(room_id)
            .await?
            .ok_or(DomainError::RoomNotFound)?)
    }

    /// 进程内第一次给房间分配序号前，从存储恢复最大已分配序号
    async fn ensure_sequence_restored(&self, room_id: RoomId) -> Result<(), ApplicationError> {
        if self.deps.sequencer.is_tracked(room_id) {
            return Ok(());
        }
        let high_water = self.deps.message_repository.max_sequence(room_id).await?;
        self.deps.sequencer.restore(room_id, high_water);
        Ok(())
    }

    fn membership_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        self.membership_locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn broadcast_message(&self, message: &Message) {
        let sender_name = match self.deps.user_repository.load_user(message.sender_id).await {
            Ok(profile) => profile.map(|profile| profile.display_name),
            Err(err) => {
                tracing::warn!(user_id = %message.sender_id, error = %err, "sender lookup failed");
                None
            }
        };
        let event = OutboundEvent::ChatMessage(ChatMessagePayload::from_message(message, sender_name));
        self.deps.delivery.broadcast(message.room_id, &event).await;
    }

    async fn notify(&self, user_id: UserId, destination: Destination, event: OutboundEvent) {
        if let Err(err) = self.deps.delivery.unicast(user_id, destination, &event).await {
            tracing::warn!(
                user_id = %user_id,
                destination = %destination,
                event_type = event.event_type().as_str(),
                error = %err,
                "unicast delivery failed"
            );
        }
    }

    /// 把失败转成 `error` 信封发给操作者；内部错误且操作者不可达时发到系统错误频道
    async fn report_failure(&self, subject: UserId, op: &str, err: &ApplicationError) {
        if err.is_internal() {
            tracing::error!(user_id = %subject, op, error = %err, "operation failed");
        } else {
            tracing::debug!(user_id = %subject, op, code = err.code(), error = %err, "operation rejected");
        }

        let event = OutboundEvent::error(err.code(), err.reason());
        let delivered = self
            .deps
            .delivery
            .unicast(subject, Destination::Errors, &event)
            .await;

        match delivered {
            Ok(()) => {}
            Err(DeliveryError::NotConnected(_) | DeliveryError::Closed(_)) if err.is_internal() => {
                self.deps.delivery.broadcast_system_error(&event).await;
            }
            Err(delivery_err) => {
                tracing::warn!(user_id = %subject, error = %delivery_err, "error delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::content_filter::ContentFilterConfig;
    use crate::identity::MockIdentityVerifier;
    use crate::presence::PresenceConfig;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::repository::memory::{
        MemoryJoinRequestRepository, MemoryMessageRepository, MemoryRoomRepository,
        MemoryUserRepository,
    };
    use std::time::Duration;

    fn gateway() -> ChatGateway {
        let clock = Arc::new(ManualClock::default());
        ChatGateway::new(ChatGatewayDependencies {
            room_repository: Arc::new(MemoryRoomRepository::new()),
            message_repository: Arc::new(MemoryMessageRepository::new()),
            user_repository: Arc::new(MemoryUserRepository::new()),
            join_request_repository: Arc::new(MemoryJoinRequestRepository::new()),
            identity: Arc::new(SessionIdentityResolver::new(Arc::new(
                MockIdentityVerifier::new(),
            ))),
            delivery: Arc::new(DeliveryEngine::new(clock.clone(), Duration::from_millis(50))),
            presence: Arc::new(PresenceTracker::new(PresenceConfig::default(), clock.clone())),
            rate_limiter: Arc::new(TokenBucketRateLimiter::new(
                RateLimiterConfig::default(),
                clock.clone(),
            )),
            content_filter: Arc::new(ContentFilter::new(ContentFilterConfig::default())),
            sequencer: Arc::new(RoomSequencer::new()),
            clock,
        })
    }

    #[tokio::test]
    async fn membership_locks_are_released_after_join_answers() {
        let gateway = gateway();
        let owner = UserId::random();
        let room = gateway
            .create_room(
                owner,
                CreateRoom {
                    room_name: "general".into(),
                    participant_ids: Vec::new(),
                },
            )
            .await
            .unwrap();

        for accepted in [true, false] {
            let requester = UserId::random();
            let join_request = gateway
                .request_join(
                    requester,
                    RequestJoin {
                        room_id: room.id,
                        requester_id: None,
                    },
                )
                .await
                .unwrap();
            gateway
                .respond_join(
                    owner,
                    RespondJoin {
                        request_id: join_request.id,
                        room_id: room.id,
                        requester_id: requester,
                        accepted,
                    },
                )
                .await
                .unwrap();
            assert!(gateway.membership_locks.is_empty());
        }

        // 失败的答复同样回收
        let result = gateway
            .respond_join(
                UserId::random(),
                RespondJoin {
                    request_id: domain::JoinRequestId::random(),
                    room_id: room.id,
                    requester_id: UserId::random(),
                    accepted: true,
                },
            )
            .await;
        assert!(result.is_err());
        assert!(gateway.membership_locks.is_empty());
    }
}
