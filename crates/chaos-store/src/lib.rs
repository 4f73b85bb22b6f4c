pub mod calls;
pub mod conversations;
pub mod database;
pub mod error;
pub mod notifications;
pub mod row_helpers;
pub mod schema;
pub mod social;
pub mod users;

pub use database::Database;
pub use error::StoreError;
