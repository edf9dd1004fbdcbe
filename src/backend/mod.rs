mod connection;
mod credentials;
mod registry;
mod session;

pub use connection::{connect, ConnectError, ConnectParams};
pub use credentials::{Credential, CredentialStore};
pub use registry::{Backend, BackendId, BackendRegistry, BackendState};
pub use session::{Attr, AttrMask, BackendError, BackendSession, DispatchState, SessionAttrs};
