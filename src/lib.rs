//! Contract record keeping: a contract lifecycle state machine, per-contract
//! document sets, an e-signature workflow, an asynchronous audit log,
//! expiration notices, and a retention sweeper, on top of two SQLite stores.

pub mod activity;
pub mod app;
pub mod audit;
pub mod clock;
pub mod config;
pub mod contract;
pub mod documents;
pub mod error;
pub mod lifecycle;
pub mod notifications;
pub mod protocol;
pub mod retention;
pub mod signature;
pub mod storage;
pub mod tools;

pub use activity::{ActivityLogger, Actor};
pub use app::App;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
