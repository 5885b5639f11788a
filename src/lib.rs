pub mod bot;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod log_length;
pub mod monitor;
pub mod notify;
pub mod tmux;
pub mod tracker;

pub use config::Config;
pub use error::RelayError;
