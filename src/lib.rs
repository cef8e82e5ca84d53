pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod shop;
pub mod sql;
pub mod sweeper;
pub mod tls;
pub mod waitlist;
pub mod wal;
pub mod wire;
