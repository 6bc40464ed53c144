pub mod auth;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod presence;
pub mod relay;
pub mod rooms;
pub mod store;
