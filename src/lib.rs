pub mod bundler;
pub mod client;
pub mod config;
pub mod dashboard;
pub mod driver;
pub mod error;
pub mod id;
pub mod manager;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;
