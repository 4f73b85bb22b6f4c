use tracing::{info, warn};

use chaos_core::envelope::FriendRequestData;
use chaos_core::ids::UserId;
use chaos_core::Event;
use chaos_realtime::Dispatcher;
use chaos_store::notifications::{NewNotification, NotificationKind};
use chaos_store::social::{BlockRow, FriendshipRow, FriendshipStatus, PendingRequest, SocialRepo};
use chaos_store::users::{UserRepo, UserRow};
use chaos_store::Database;

use crate::error::ServiceError;
use crate::notifications::NotificationService;

/// Friend requests, friendships and blocks.
#[derive(Clone)]
pub struct SocialService {
    db: Database,
    dispatcher: Dispatcher,
    notifications: NotificationService,
}

impl SocialService {
    pub fn new(db: Database, dispatcher: Dispatcher, notifications: NotificationService) -> Self {
        Self {
            db,
            dispatcher,
            notifications,
        }
    }

    fn repo(&self) -> SocialRepo {
        SocialRepo::new(self.db.clone())
    }

    fn user(&self, id: &UserId) -> Result<UserRow, ServiceError> {
        Ok(UserRepo::new(self.db.clone()).get(id)?)
    }

    pub async fn send_friend_request(&self, requester: &UserId, addressee: &UserId) -> Result<FriendshipRow, ServiceError> {
        if requester == addressee {
            return Err(ServiceError::InvalidInput("cannot send a friend request to yourself".into()));
        }
        let from = self.user(requester)?;
        self.user(addressee)?;

        let social = self.repo();
        if social.is_blocked(requester, addressee)? {
            return Err(ServiceError::blocked());
        }
        match social.find_between(requester, addressee)? {
            Some(existing) if existing.status == FriendshipStatus::Accepted => {
                return Err(ServiceError::Conflict("users are already friends".into()));
            }
            Some(_) => return Err(ServiceError::Conflict("friend request already exists".into())),
            None => {}
        }

        let row = social.create_request(requester, addressee)?;
        info!(requester = %requester, addressee = %addressee, "friend request sent");

        let content = format!("{} sent you a friend request", from.username);
        if let Err(e) = self
            .notifications
            .create(NewNotification {
                user_id: addressee,
                kind: NotificationKind::FriendRequest,
                title: "New Friend Request",
                content: &content,
                related_user_id: Some(requester),
                related_conversation_id: None,
            })
            .await
        {
            warn!(addressee = %addressee, error = %e, "failed to store friend request notification");
        }

        let event = Event::FriendRequest(FriendRequestData {
            requester_id: from.id,
            requester_username: from.username,
        });
        self.dispatcher.to_user(addressee, event).await;
        Ok(row)
    }

    /// `addressee` accepts the pending request sent by `requester`.
    pub async fn accept_friend_request(&self, requester: &UserId, addressee: &UserId) -> Result<FriendshipRow, ServiceError> {
        let social = self.repo();
        if social.is_blocked(requester, addressee)? {
            return Err(ServiceError::blocked());
        }
        let row = social.accept_request(requester, addressee)?;
        let accepter = self.user(addressee)?;
        info!(requester = %requester, addressee = %addressee, "friend request accepted");

        let content = format!("{} accepted your friend request", accepter.username);
        if let Err(e) = self
            .notifications
            .create(NewNotification {
                user_id: requester,
                kind: NotificationKind::FriendAccepted,
                title: "Friend Request Accepted",
                content: &content,
                related_user_id: Some(addressee),
                related_conversation_id: None,
            })
            .await
        {
            warn!(requester = %requester, error = %e, "failed to store friend accepted notification");
        }

        let event = Event::FriendAccepted(FriendRequestData {
            requester_id: accepter.id,
            requester_username: accepter.username,
        });
        self.dispatcher.to_user(requester, event).await;
        Ok(row)
    }

    /// `addressee` declines the pending request sent by `requester`.
    pub fn decline_friend_request(&self, requester: &UserId, addressee: &UserId) -> Result<(), ServiceError> {
        if !self.repo().delete_request(requester, addressee)? {
            return Err(ServiceError::NotFound(format!("friend request {requester} -> {addressee}")));
        }
        Ok(())
    }

    pub fn remove_friend(&self, user: &UserId, friend: &UserId) -> Result<(), ServiceError> {
        if !self.repo().delete_friendship(user, friend)? {
            return Err(ServiceError::NotFound(format!("friendship {user} <-> {friend}")));
        }
        info!(user_id = %user, friend = %friend, "friend removed");
        Ok(())
    }

    pub fn friends(&self, user: &UserId) -> Result<Vec<UserRow>, ServiceError> {
        Ok(self.repo().friends(user)?)
    }

    pub fn pending_requests(&self, user: &UserId) -> Result<Vec<PendingRequest>, ServiceError> {
        Ok(self.repo().pending_requests(user)?)
    }

    pub fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool, ServiceError> {
        Ok(self.repo().are_friends(a, b)?)
    }

    /// Either direction.
    pub fn is_blocked(&self, a: &UserId, b: &UserId) -> Result<bool, ServiceError> {
        Ok(self.repo().is_blocked(a, b)?)
    }

    /// Block `blocked`, then drop any friendship between the two. The
    /// friendship cleanup is best-effort.
    pub fn block_user(&self, blocker: &UserId, blocked: &UserId) -> Result<BlockRow, ServiceError> {
        if blocker == blocked {
            return Err(ServiceError::InvalidInput("cannot block yourself".into()));
        }
        self.user(blocked)?;

        let social = self.repo();
        let row = social.create_block(blocker, blocked).map_err(|e| match e {
            chaos_store::StoreError::Conflict(_) => ServiceError::Conflict("user is already blocked".into()),
            other => other.into(),
        })?;
        info!(blocker = %blocker, blocked = %blocked, "user blocked");

        // TODO: decide with product whether a failed cleanup should roll back the block.
        if let Err(e) = social.delete_any_between(blocker, blocked) {
            warn!(blocker = %blocker, blocked = %blocked, error = %e, "failed to remove friendship after block");
        }
        Ok(row)
    }

    pub fn unblock_user(&self, blocker: &UserId, blocked: &UserId) -> Result<(), ServiceError> {
        if !self.repo().delete_block(blocker, blocked)? {
            return Err(ServiceError::NotFound(format!("block {blocker} -> {blocked}")));
        }
        Ok(())
    }

    pub fn blocked_users(&self, blocker: &UserId) -> Result<Vec<BlockRow>, ServiceError> {
        Ok(self.repo().blocked_users(blocker)?)
    }
}
