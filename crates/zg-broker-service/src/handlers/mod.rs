//! API handlers.

pub mod health;
pub mod proxy;
pub mod settlement;
pub mod usage;
