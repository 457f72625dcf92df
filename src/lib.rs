pub mod config;
pub mod counters;
pub mod engine;
pub mod keys;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reservable;
pub mod store;
pub mod watcher;
pub mod worker;
