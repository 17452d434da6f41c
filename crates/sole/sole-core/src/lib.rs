pub mod checksum;
pub mod identity;
pub mod jitter;
pub mod platform;

pub use checksum::checksum16;
pub use identity::{AppIdentity, IDENTITY_SALT, Identifier};
pub use jitter::jitter;
pub use platform::{OsPlatform, Platform, StaticPlatform};
