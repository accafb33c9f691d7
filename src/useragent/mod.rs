mod error;
pub mod state;
#[cfg(test)]
mod tests;
mod useragent;

pub use error::VoipError;
pub use state::{CallSession, CallState, Effect, Operation, SessionInput, SessionKind, UserState};
pub use useragent::{VoipUser, VoipUserBuilder};
