pub mod error;
pub mod protocol;
pub mod resource;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{Result, RelayError};
pub use protocol::{RegisterRequest, RegisterResponse, RegistrationHandler, RejectReason, Status};
pub use resource::PortPool;
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionRegistry, SessionState};
