//! Real-time session layer: live sessions, the registry that owns them,
//! and the dispatcher that routes domain events to them.

pub mod dispatcher;
pub mod presence;
pub mod registry;
pub mod session;

pub use dispatcher::{Directory, DirectoryError, Dispatcher};
pub use presence::start_presence_bridge;
pub use registry::{start_liveness_sweep, PresenceChange, Registry, RegistryError, RegistrySettings};
pub use session::{EnqueueError, Frame, Session, SessionHandle, SessionSettings};
