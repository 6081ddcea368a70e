/// provide tenant cloner blocking apis.
pub mod cloner;
mod connection;

pub use connection::Connection;
