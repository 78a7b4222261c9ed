pub mod app;
pub mod common;
pub mod config;
pub mod dns;
pub mod proxy;
pub mod router;

pub use app::Engine;
pub use config::Config;
