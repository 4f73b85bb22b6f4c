use serde::{Deserialize, Serialize};
use tracing::instrument;

use chaos_core::ids::{BlockId, FriendshipId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::users::{row_to_user, UserRow, USER_COLUMNS};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
}

impl std::fmt::Display for FriendshipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
        }
    }
}

impl std::str::FromStr for FriendshipStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            other => Err(format!("unknown friendship status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FriendshipRow {
    pub id: FriendshipId,
    pub requester_id: UserId,
    pub addressee_id: UserId,
    pub status: FriendshipStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingRequest {
    pub friendship_id: FriendshipId,
    pub requester: UserRow,
    pub created_at: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: BlockId,
    pub blocker_id: UserId,
    pub blocked_id: UserId,
    pub created_at: String,
}

const FRIENDSHIP_COLUMNS: &str = "id, requester_id, addressee_id, status, created_at, updated_at";

/// Friendships and blocks between users.
pub struct SocialRepo {
    db: Database,
}

impl SocialRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a pending request. Any existing row in either direction is a conflict.
    #[instrument(skip(self), fields(requester = %requester, addressee = %addressee))]
    pub fn create_request(&self, requester: &UserId, addressee: &UserId) -> Result<FriendshipRow, StoreError> {
        let id = FriendshipId::new();
        let now = row_helpers::now();

        self.db.with_conn(|conn| {
            let existing: i64 = conn.query_row(
                "SELECT COUNT(*) FROM friendships
                 WHERE (requester_id = ?1 AND addressee_id = ?2)
                    OR (requester_id = ?2 AND addressee_id = ?1)",
                [requester.as_str(), addressee.as_str()],
                |row| row.get(0),
            )?;
            if existing > 0 {
                return Err(StoreError::Conflict("friendship or request already exists".into()));
            }

            conn.execute(
                "INSERT INTO friendships (id, requester_id, addressee_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
                rusqlite::params![id.as_str(), requester.as_str(), addressee.as_str(), now],
            )
            .map_err(|e| StoreError::unique_or_db(e, "friend request already exists"))?;

            Ok(FriendshipRow {
                id,
                requester_id: requester.clone(),
                addressee_id: addressee.clone(),
                status: FriendshipStatus::Pending,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Row between two users in either direction.
    pub fn find_between(&self, a: &UserId, b: &UserId) -> Result<Option<FriendshipRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FRIENDSHIP_COLUMNS} FROM friendships
                 WHERE (requester_id = ?1 AND addressee_id = ?2)
                    OR (requester_id = ?2 AND addressee_id = ?1)
                 LIMIT 1"
            ))?;
            let mut rows = stmt.query([a.as_str(), b.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_friendship(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Flip a pending request to accepted. Conditional on the row still being pending.
    #[instrument(skip(self), fields(requester = %requester, addressee = %addressee))]
    pub fn accept_request(&self, requester: &UserId, addressee: &UserId) -> Result<FriendshipRow, StoreError> {
        let now = row_helpers::now();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE friendships SET status = 'accepted', updated_at = ?1
                 WHERE requester_id = ?2 AND addressee_id = ?3 AND status = 'pending'",
                rusqlite::params![now, requester.as_str(), addressee.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("friend request {requester} -> {addressee}")));
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT {FRIENDSHIP_COLUMNS} FROM friendships WHERE requester_id = ?1 AND addressee_id = ?2"
            ))?;
            let mut rows = stmt.query([requester.as_str(), addressee.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_friendship(row),
                None => Err(StoreError::NotFound(format!("friend request {requester} -> {addressee}"))),
            }
        })
    }

    /// Delete a pending request requester -> addressee. Returns whether a row was removed.
    #[instrument(skip(self), fields(requester = %requester, addressee = %addressee))]
    pub fn delete_request(&self, requester: &UserId, addressee: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM friendships WHERE requester_id = ?1 AND addressee_id = ?2 AND status = 'pending'",
                [requester.as_str(), addressee.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Delete an accepted friendship in either direction.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn delete_friendship(&self, a: &UserId, b: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM friendships
                 WHERE status = 'accepted'
                   AND ((requester_id = ?1 AND addressee_id = ?2) OR (requester_id = ?2 AND addressee_id = ?1))",
                [a.as_str(), b.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Delete any row between two users, pending or accepted.
    pub fn delete_any_between(&self, a: &UserId, b: &UserId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM friendships
                 WHERE (requester_id = ?1 AND addressee_id = ?2) OR (requester_id = ?2 AND addressee_id = ?1)",
                [a.as_str(), b.as_str()],
            )?;
            Ok(n)
        })
    }

    pub fn are_friends(&self, a: &UserId, b: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM friendships
                               WHERE status = 'accepted'
                                 AND ((requester_id = ?1 AND addressee_id = ?2)
                                   OR (requester_id = ?2 AND addressee_id = ?1)))",
                [a.as_str(), b.as_str()],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
    }

    pub fn friend_ids(&self, user: &UserId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN requester_id = ?1 THEN addressee_id ELSE requester_id END
                 FROM friendships
                 WHERE status = 'accepted' AND (requester_id = ?1 OR addressee_id = ?1)",
            )?;
            let ids = stmt
                .query_map([user.as_str()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(UserId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn friends(&self, user: &UserId) -> Result<Vec<UserRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM friendships f
                 JOIN users u ON u.id = CASE WHEN f.requester_id = ?1 THEN f.addressee_id ELSE f.requester_id END
                 WHERE f.status = 'accepted' AND (f.requester_id = ?1 OR f.addressee_id = ?1)
                 ORDER BY u.username"
            ))?;
            let mut rows = stmt.query([user.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_user(row, 0)?);
            }
            Ok(results)
        })
    }

    /// Incoming pending requests, newest first.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn pending_requests(&self, user: &UserId) -> Result<Vec<PendingRequest>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT f.id, f.created_at, {USER_COLUMNS} FROM friendships f
                 JOIN users u ON u.id = f.requester_id
                 WHERE f.addressee_id = ?1 AND f.status = 'pending'
                 ORDER BY f.created_at DESC, f.id DESC"
            ))?;
            let mut rows = stmt.query([user.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(PendingRequest {
                    friendship_id: FriendshipId::from_raw(row_helpers::get::<String>(row, 0, "friendships", "id")?),
                    created_at: row_helpers::get(row, 1, "friendships", "created_at")?,
                    requester: row_to_user(row, 2)?,
                });
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(blocker = %blocker, blocked = %blocked))]
    pub fn create_block(&self, blocker: &UserId, blocked: &UserId) -> Result<BlockRow, StoreError> {
        let id = BlockId::new();
        let now = row_helpers::now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO blocks (id, blocker_id, blocked_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.as_str(), blocker.as_str(), blocked.as_str(), now],
            )
            .map_err(|e| StoreError::unique_or_db(e, "user already blocked"))?;
            Ok(BlockRow {
                id,
                blocker_id: blocker.clone(),
                blocked_id: blocked.clone(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(blocker = %blocker, blocked = %blocked))]
    pub fn delete_block(&self, blocker: &UserId, blocked: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2",
                [blocker.as_str(), blocked.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// True if either user has blocked the other.
    pub fn is_blocked(&self, a: &UserId, b: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM blocks
                               WHERE (blocker_id = ?1 AND blocked_id = ?2)
                                  OR (blocker_id = ?2 AND blocked_id = ?1))",
                [a.as_str(), b.as_str()],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
    }

    pub fn blocked_users(&self, blocker: &UserId) -> Result<Vec<BlockRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, blocker_id, blocked_id, created_at FROM blocks
                 WHERE blocker_id = ?1 ORDER BY created_at DESC, id DESC",
            )?;
            let mut rows = stmt.query([blocker.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(BlockRow {
                    id: BlockId::from_raw(row_helpers::get::<String>(row, 0, "blocks", "id")?),
                    blocker_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "blocks", "blocker_id")?),
                    blocked_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "blocks", "blocked_id")?),
                    created_at: row_helpers::get(row, 3, "blocks", "created_at")?,
                });
            }
            Ok(results)
        })
    }
}

fn row_to_friendship(row: &rusqlite::Row<'_>) -> Result<FriendshipRow, StoreError> {
    let status: String = row_helpers::get(row, 3, "friendships", "status")?;
    Ok(FriendshipRow {
        id: FriendshipId::from_raw(row_helpers::get::<String>(row, 0, "friendships", "id")?),
        requester_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "friendships", "requester_id")?),
        addressee_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "friendships", "addressee_id")?),
        status: row_helpers::parse_enum(&status, "friendships", "status")?,
        created_at: row_helpers::get(row, 4, "friendships", "created_at")?,
        updated_at: row_helpers::get(row, 5, "friendships", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    fn setup() -> (SocialRepo, UserId, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let a = users.create("Ann", "ann", "ann@example.com").unwrap().id;
        let b = users.create("Ben", "ben", "ben@example.com").unwrap().id;
        let c = users.create("Cat", "cat", "cat@example.com").unwrap().id;
        (SocialRepo::new(db), a, b, c)
    }

    #[test]
    fn request_then_accept() {
        let (repo, a, b, _) = setup();
        let req = repo.create_request(&a, &b).unwrap();
        assert_eq!(req.status, FriendshipStatus::Pending);
        assert!(!repo.are_friends(&a, &b).unwrap());

        let accepted = repo.accept_request(&a, &b).unwrap();
        assert_eq!(accepted.status, FriendshipStatus::Accepted);
        assert!(repo.are_friends(&a, &b).unwrap());
        assert!(repo.are_friends(&b, &a).unwrap());
        assert_eq!(repo.friend_ids(&b).unwrap(), vec![a.clone()]);
    }

    #[test]
    fn reverse_request_conflicts() {
        let (repo, a, b, _) = setup();
        repo.create_request(&a, &b).unwrap();
        let err = repo.create_request(&b, &a).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn accept_requires_pending_row_in_that_direction() {
        let (repo, a, b, _) = setup();
        repo.create_request(&a, &b).unwrap();
        assert!(matches!(repo.accept_request(&b, &a), Err(StoreError::NotFound(_))));
        repo.accept_request(&a, &b).unwrap();
        assert!(matches!(repo.accept_request(&a, &b), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn pending_requests_lists_incoming_only() {
        let (repo, a, b, c) = setup();
        repo.create_request(&a, &b).unwrap();
        repo.create_request(&c, &b).unwrap();
        repo.create_request(&b, &a).unwrap_err();

        let pending = repo.pending_requests(&b).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(repo.pending_requests(&a).unwrap().is_empty());
    }

    #[test]
    fn decline_and_remove() {
        let (repo, a, b, c) = setup();
        repo.create_request(&a, &b).unwrap();
        assert!(repo.delete_request(&a, &b).unwrap());
        assert!(!repo.delete_request(&a, &b).unwrap());

        repo.create_request(&a, &c).unwrap();
        repo.accept_request(&a, &c).unwrap();
        assert!(repo.delete_friendship(&c, &a).unwrap());
        assert!(!repo.are_friends(&a, &c).unwrap());
    }

    #[test]
    fn friends_lists_users() {
        let (repo, a, b, c) = setup();
        for other in [&b, &c] {
            repo.create_request(&a, other).unwrap();
            repo.accept_request(&a, other).unwrap();
        }
        let names: Vec<String> = repo.friends(&a).unwrap().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["ben", "cat"]);
    }

    #[test]
    fn block_is_symmetric_for_checks() {
        let (repo, a, b, _) = setup();
        repo.create_block(&a, &b).unwrap();
        assert!(repo.is_blocked(&a, &b).unwrap());
        assert!(repo.is_blocked(&b, &a).unwrap());
        assert!(matches!(repo.create_block(&a, &b), Err(StoreError::Conflict(_))));
        assert_eq!(repo.blocked_users(&a).unwrap().len(), 1);

        assert!(repo.delete_block(&a, &b).unwrap());
        assert!(!repo.is_blocked(&a, &b).unwrap());
    }

    #[test]
    fn delete_any_between_clears_pending_and_accepted() {
        let (repo, a, b, _) = setup();
        repo.create_request(&b, &a).unwrap();
        assert_eq!(repo.delete_any_between(&a, &b).unwrap(), 1);
        assert!(repo.find_between(&a, &b).unwrap().is_none());
    }
}
