use std::collections::BTreeSet;

use crate::errors::DomainError;
use crate::value_objects::{RoomId, Timestamp, UserId};

/// 聊天室
///
/// 成员集合只能通过 [`ChatRoom::with_members`] 整体替换，调用方再把新集合一次性写回
/// 存储，避免并发邀请时的丢失更新。序号计数器不在这里，由 `RoomSequencer` 持有。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatRoom {
    pub id: RoomId,
    pub name: String,
    pub owner_id: UserId,
    members: BTreeSet<UserId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ChatRoom {
    /// 创建房间，创建者总是初始成员。
    pub fn new(
        id: RoomId,
        name: impl Into<String>,
        owner_id: UserId,
        participants: impl IntoIterator<Item = UserId>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let name = Self::validate_name(name.into())?;
        let mut members: BTreeSet<UserId> = participants.into_iter().collect();
        members.insert(owner_id);
        Ok(Self {
            id,
            name,
            owner_id,
            members,
            created_at,
            updated_at: created_at,
        })
    }

    /// 从存储中还原房间，校验成员不变量。
    pub fn restore(
        id: RoomId,
        name: String,
        owner_id: UserId,
        members: BTreeSet<UserId>,
        created_at: Timestamp,
        updated_at: Timestamp,
    ) -> Result<Self, DomainError> {
        Self::check_members(owner_id, &members)?;
        Ok(Self {
            id,
            name,
            owner_id,
            members,
            created_at,
            updated_at,
        })
    }

    pub fn members(&self) -> &BTreeSet<UserId> {
        &self.members
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }

    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_id == user_id
    }

    /// 其他参与者（不含房主）
    pub fn participants_except_owner(&self) -> impl Iterator<Item = UserId> + '_ {
        self.members
            .iter()
            .copied()
            .filter(move |id| *id != self.owner_id)
    }

    /// 生成替换后的成员集合快照。
    pub fn with_members(
        &self,
        members: BTreeSet<UserId>,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        Self::check_members(self.owner_id, &members)?;
        Ok(Self {
            members,
            updated_at: now,
            ..self.clone()
        })
    }

    /// 在当前成员基础上加入一个成员。
    pub fn with_member_added(&self, user_id: UserId, now: Timestamp) -> Result<Self, DomainError> {
        if self.is_member(user_id) {
            return Err(DomainError::UserAlreadyInRoom);
        }
        let mut members = self.members.clone();
        members.insert(user_id);
        self.with_members(members, now)
    }

    fn check_members(owner_id: UserId, members: &BTreeSet<UserId>) -> Result<(), DomainError> {
        if members.is_empty() {
            return Err(DomainError::MembershipInvariant("member set is empty"));
        }
        if !members.contains(&owner_id) {
            return Err(DomainError::MembershipInvariant("owner is not a member"));
        }
        Ok(())
    }

    fn validate_name(name: String) -> Result<String, DomainError> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_argument("roomName", "cannot be empty"));
        }
        if trimmed.chars().count() > 60 {
            return Err(DomainError::invalid_argument("roomName", "too long"));
        }
        Ok(trimmed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn creator_is_always_a_member() {
        let owner = UserId::random();
        let room = ChatRoom::new(RoomId::random(), "general", owner, [], Utc::now()).unwrap();
        assert!(room.is_member(owner));
        assert_eq!(room.members().len(), 1);
    }

    #[test]
    fn replacing_members_cannot_drop_the_owner() {
        let owner = UserId::random();
        let guest = UserId::random();
        let room = ChatRoom::new(RoomId::random(), "general", owner, [guest], Utc::now()).unwrap();

        let result = room.with_members(BTreeSet::from([guest]), Utc::now());
        assert!(matches!(result, Err(DomainError::MembershipInvariant(_))));
    }

    #[test]
    fn adding_an_existing_member_is_rejected() {
        let owner = UserId::random();
        let room = ChatRoom::new(RoomId::random(), "general", owner, [], Utc::now()).unwrap();
        assert_eq!(
            room.with_member_added(owner, Utc::now()),
            Err(DomainError::UserAlreadyInRoom)
        );
    }

    #[test]
    fn blank_room_name_is_rejected() {
        let result = ChatRoom::new(RoomId::random(), "  ", UserId::random(), [], Utc::now());
        assert!(result.is_err());
    }
}
