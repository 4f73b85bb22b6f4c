use serde::{Deserialize, Serialize};
use tracing::instrument;

use chaos_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub const SEARCH_LIMIT: u32 = 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub name: String,
    pub username: String,
    pub email: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSearchRow {
    #[serde(flatten)]
    pub user: UserRow,
    pub is_friend: bool,
}

pub(crate) const USER_COLUMNS: &str = "u.id, u.name, u.username, u.email, u.created_at";

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, email), fields(username))]
    pub fn create(&self, name: &str, username: &str, email: &str) -> Result<UserRow, StoreError> {
        let id = UserId::new();
        let now = row_helpers::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, username, email, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), name, username, email, now],
            )
            .map_err(|e| StoreError::unique_or_db(e, "username or email already taken"))?;

            Ok(UserRow {
                id,
                name: name.to_string(),
                username: username.to_string(),
                email: email.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get(&self, id: &UserId) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_user(row, 0),
                None => Err(StoreError::NotFound(format!("user {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn get_by_username(&self, username: &str) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users u WHERE u.username = ?1"))?;
            let mut rows = stmt.query([username])?;
            match rows.next()? {
                Some(row) => row_to_user(row, 0),
                None => Err(StoreError::NotFound(format!("user @{username}"))),
            }
        })
    }

    pub fn exists(&self, id: &UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
    }

    /// Case-insensitive substring search over username and name.
    ///
    /// The viewer and anyone in a block relationship with them are excluded.
    #[instrument(skip(self), fields(viewer = %viewer))]
    pub fn search(&self, query: &str, viewer: &UserId) -> Result<Vec<UserSearchRow>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(query.trim()));
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS},
                        EXISTS(SELECT 1 FROM friendships f
                               WHERE f.status = 'accepted'
                                 AND ((f.requester_id = u.id AND f.addressee_id = ?2)
                                   OR (f.addressee_id = u.id AND f.requester_id = ?2)))
                 FROM users u
                 WHERE (u.username LIKE ?1 ESCAPE '\\' OR u.name LIKE ?1 ESCAPE '\\')
                   AND u.id <> ?2
                   AND NOT EXISTS(SELECT 1 FROM blocks b
                                  WHERE (b.blocker_id = ?2 AND b.blocked_id = u.id)
                                     OR (b.blocker_id = u.id AND b.blocked_id = ?2))
                 ORDER BY u.username
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![pattern, viewer.as_str(), SEARCH_LIMIT])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let is_friend: i64 = row_helpers::get(row, 5, "users", "is_friend")?;
                results.push(UserSearchRow {
                    user: row_to_user(row, 0)?,
                    is_friend: is_friend != 0,
                });
            }
            Ok(results)
        })
    }
}

/// Map the five `USER_COLUMNS` starting at `offset`.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>, offset: usize) -> Result<UserRow, StoreError> {
    Ok(UserRow {
        id: UserId::from_raw(row_helpers::get::<String>(row, offset, "users", "id")?),
        name: row_helpers::get(row, offset + 1, "users", "name")?,
        username: row_helpers::get(row, offset + 2, "users", "username")?,
        email: row_helpers::get(row, offset + 3, "users", "email")?,
        created_at: row_helpers::get(row, offset + 4, "users", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social::SocialRepo;

    fn setup() -> (Database, UserRepo) {
        let db = Database::in_memory().unwrap();
        (db.clone(), UserRepo::new(db))
    }

    #[test]
    fn create_and_get_user() {
        let (_, repo) = setup();
        let user = repo.create("Alice Liddell", "alice", "alice@example.com").unwrap();
        assert!(user.id.as_str().starts_with("usr_"));
        let fetched = repo.get(&user.id).unwrap();
        assert_eq!(fetched, user);
        assert!(repo.exists(&user.id).unwrap());
    }

    #[test]
    fn duplicate_username_conflicts() {
        let (_, repo) = setup();
        repo.create("Alice", "alice", "a@example.com").unwrap();
        let err = repo.create("Other Alice", "alice", "b@example.com").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got: {err}");
    }

    #[test]
    fn duplicate_email_conflicts() {
        let (_, repo) = setup();
        repo.create("Alice", "alice", "a@example.com").unwrap();
        let err = repo.create("Bob", "bob", "a@example.com").unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn get_missing_user() {
        let (_, repo) = setup();
        let err = repo.get(&UserId::from_raw("usr_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!repo.exists(&UserId::from_raw("usr_missing")).unwrap());
    }

    #[test]
    fn get_by_username() {
        let (_, repo) = setup();
        let user = repo.create("Carol", "carol", "c@example.com").unwrap();
        assert_eq!(repo.get_by_username("carol").unwrap().id, user.id);
        assert!(repo.get_by_username("dave").is_err());
    }

    #[test]
    fn search_excludes_viewer_and_blocked() {
        let (db, repo) = setup();
        let social = SocialRepo::new(db);
        let viewer = repo.create("Sam Viewer", "sam", "sam@example.com").unwrap();
        let friend = repo.create("Sam Friend", "samfriend", "sf@example.com").unwrap();
        let blocked = repo.create("Sam Blocked", "samblocked", "sb@example.com").unwrap();
        repo.create("Unrelated", "zed", "z@example.com").unwrap();

        social.create_request(&viewer.id, &friend.id).unwrap();
        social.accept_request(&viewer.id, &friend.id).unwrap();
        social.create_block(&blocked.id, &viewer.id).unwrap();

        let results = repo.search("SAM", &viewer.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user.id, friend.id);
        assert!(results[0].is_friend);
    }

    #[test]
    fn search_escapes_wildcards() {
        let (_, repo) = setup();
        let viewer = repo.create("Viewer", "viewer", "v@example.com").unwrap();
        repo.create("Plain", "plain", "p@example.com").unwrap();
        assert!(repo.search("%", &viewer.id).unwrap().is_empty());
    }
}
