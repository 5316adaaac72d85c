pub mod cache;
pub mod codec;
pub mod config;
pub mod database;
pub mod errors;
pub mod fetch;
pub mod loader;
pub mod models;
pub mod web;
