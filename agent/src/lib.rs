pub mod appender;
pub mod common;
pub mod discover;
pub mod http;
pub mod input;
pub mod scrape;
