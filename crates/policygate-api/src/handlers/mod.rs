//! API Handlers

pub mod admit;
pub mod health;
pub mod policies;
pub mod run;
