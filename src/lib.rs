pub mod auth;
pub mod bridge;
pub mod deferred;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod permission;
pub mod service;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
