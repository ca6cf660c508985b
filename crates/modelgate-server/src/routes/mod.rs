//! HTTP route handlers, grouped by family.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod health;
pub mod logs;
pub mod oauth;
pub mod providers;
pub mod proxy;
pub mod usage;
pub mod users;
