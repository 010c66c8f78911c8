#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod presence;
pub mod questions;
pub mod relay;




#[cfg(test)]
mod relay_tests;
