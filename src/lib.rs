// src/lib.rs
pub mod api;
pub mod banner;
pub mod config;
pub mod database;
pub mod errors;
pub mod export;
pub mod mail;
pub mod models;
pub mod parameters;
pub mod progress;
pub mod receipts;
pub mod reports;
pub mod runner;
pub mod template;
pub mod verification;
