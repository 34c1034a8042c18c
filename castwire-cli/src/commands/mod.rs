//! CLI command implementations

mod config;
mod info;
mod stream;

pub use config::{config, ConfigArgs};
pub use info::info;
pub use stream::{stream, StreamArgs};
