pub mod config;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod scrape_loop;
pub mod target;
