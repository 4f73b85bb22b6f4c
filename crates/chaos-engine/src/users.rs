use tracing::info;

use chaos_core::ids::UserId;
use chaos_store::users::{UserRepo, UserRow, UserSearchRow};
use chaos_store::Database;

use crate::error::ServiceError;

#[derive(Clone)]
pub struct UserService {
    db: Database,
}

impl UserService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn repo(&self) -> UserRepo {
        UserRepo::new(self.db.clone())
    }

    pub fn create(&self, name: &str, username: &str, email: &str) -> Result<UserRow, ServiceError> {
        let (name, username, email) = (name.trim(), username.trim(), email.trim());
        if name.is_empty() || username.is_empty() {
            return Err(ServiceError::InvalidInput("name and username are required".into()));
        }
        if username.chars().any(char::is_whitespace) {
            return Err(ServiceError::InvalidInput("username cannot contain whitespace".into()));
        }
        if !email.contains('@') {
            return Err(ServiceError::InvalidInput("invalid email address".into()));
        }
        let user = self.repo().create(name, username, email)?;
        info!(user_id = %user.id, username = %user.username, "user created");
        Ok(user)
    }

    pub fn get(&self, id: &UserId) -> Result<UserRow, ServiceError> {
        Ok(self.repo().get(id)?)
    }

    pub fn exists(&self, id: &UserId) -> Result<bool, ServiceError> {
        Ok(self.repo().exists(id)?)
    }

    pub fn search(&self, query: &str, viewer: &UserId) -> Result<Vec<UserSearchRow>, ServiceError> {
        if query.trim().is_empty() {
            return Err(ServiceError::InvalidInput("search query is required".into()));
        }
        Ok(self.repo().search(query, viewer)?)
    }
}
