//! Value objects shared by the token and session services.
//!
//! Nothing in here performs I/O.

mod credential;
mod revocation;
mod rotation;
mod session;

pub use credential::{CredentialMetadata, CredentialPair, TokenKind};
pub use revocation::RevocationRecord;
pub use rotation::RotationState;
pub use session::{Session, SessionStatus};
