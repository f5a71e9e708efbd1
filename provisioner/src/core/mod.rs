//! Pure, deterministic session and planning logic. No I/O.

pub mod error;
pub mod resolver;
pub mod session;
pub mod types;
