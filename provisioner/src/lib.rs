//! Session-state and task-execution core for a conversational provisioning
//! assistant.
//!
//! An external agent interviews the user and calls into this crate to build
//! an installation plan from declarative TOML manifests, execute shell steps
//! with approval, and persist progress so interrupted setups can resume.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (session state machine, task
//!   graph resolution, error taxonomy). No I/O, fully testable in isolation.
//! - **[`manifest`]**: Task and profile definitions with layered loading and
//!   all-or-nothing referential validation.
//! - **[`io`]**: Side-effecting operations (session store, shell execution,
//!   system audit). Isolated behind traits to enable scripted fakes in tests.
//!
//! The [`coordinator`] module drives an approved plan through the session
//! state machine, one task at a time, delegating command execution and
//! approval decisions to external collaborators.

pub mod coordinator;
pub mod core;
pub mod io;
pub mod logging;
pub mod manifest;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
