pub mod activity;
pub mod actors;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod filter;
pub mod identity;
pub mod observability;
pub mod pagination;
pub mod query;
pub mod resolver;
pub mod service;
pub mod store;
pub mod tasks;

// Relational stores (PostgreSQL, SQLite)
pub mod db;
