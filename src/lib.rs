pub mod config;
pub mod db;
pub mod error;
pub mod failure;
pub mod fetch;
pub mod knowledge;
pub mod listing;
pub mod parser;
pub mod scrape;
pub mod site;
pub mod snapshot;
