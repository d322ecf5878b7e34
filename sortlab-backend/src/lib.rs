pub mod config;
pub mod db;
pub mod equipment;
mod schema;
pub mod server;
