#![allow(clippy::too_many_arguments, clippy::type_complexity)]

pub mod bandwidth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod file_backing;
pub mod message;
pub mod state_file;
pub mod stop;
pub mod transport;
pub mod url;

pub use config::{AddressFamily, Config};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use message::{Message, Severity};
pub use stop::StopToken;
pub use url::Url;
