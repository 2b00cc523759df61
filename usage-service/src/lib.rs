//! Usage accounting and quota enforcement for AudioMax.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;
