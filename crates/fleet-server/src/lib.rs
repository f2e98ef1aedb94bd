pub mod config;
pub mod connection;
pub mod dispatch;
pub mod server;
pub mod store;
