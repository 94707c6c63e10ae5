pub mod captchas;
pub mod images;
pub mod migrations;
pub mod models;
pub mod pending;
pub mod pool;
pub mod schema;
pub mod upkeep;

pub use captchas::CheckResult;
pub use pool::Db;
