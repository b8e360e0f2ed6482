pub mod bulk;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod history;
pub mod rate_limit;
pub mod registry;
pub mod rollup;
pub mod runtime;
pub mod store;
pub mod submissions;
