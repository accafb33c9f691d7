pub mod config;
pub mod event;
pub mod media;
pub mod transport;
pub mod useragent;
pub mod version;

pub use useragent::{VoipError, VoipUser, VoipUserBuilder};

