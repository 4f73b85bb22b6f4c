pub mod calls;
pub mod envelope;
pub mod ids;
pub mod page;

pub use calls::{CallStatus, CallType};
pub use envelope::{Envelope, Event};
pub use page::Page;
