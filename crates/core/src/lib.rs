// ContentMap Core - publish pipeline, locking and transaction scopes
// NO infrastructure dependencies: stores and lock services plug in through ports

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{PublishError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
