//! drift services — membership coordination, routing and the protocol
//! handlers, plus the collaborator seams they run against.

pub mod control;
pub mod coordinator;
pub mod membership;
pub mod memory;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod store;

pub use coordinator::{Coordinator, CoordinatorError};
pub use membership::{MembershipTable, SupernodeInfo};
pub use protocol::{Protocol, ProtocolError};
pub use registry::{Registries, RegistryError};
pub use store::{CoordinationStore, StoreError};
