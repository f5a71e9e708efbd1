//! Side-effecting edges: child processes, machine probes, and the on-disk
//! session store. Everything above this layer stays pure and deterministic.

pub mod audit;
pub mod process;
pub mod runner;
pub mod session_store;
