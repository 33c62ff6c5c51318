pub mod auth;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod serial;
pub mod settlement;
pub mod sql;
pub mod sweeper;
pub mod timeofday;
pub mod trigger;
pub mod venue;
pub mod wal;
pub mod wire;
