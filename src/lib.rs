pub mod auth;
pub mod banner;
pub mod config;
pub mod consts;
pub mod error;
pub mod events;
pub mod spinner;

pub use config::Config;
pub use error::{AuthError, Result};
