//! panel-bridge: compositor event bridge and IPC server for desktop shells
//!
//! One blocking compositor connection is fanned out to many socket clients:
//!
//! ```text
//! compositor -> EventPump (thread) -> EventQueue -> EventDistributor -> clients
//!                                                                    \-> subscribers
//! client -> run_session -> CommandRegistry -> handler -> client
//! ```

pub mod clients;
pub mod commands;
pub mod compositor;
pub mod context;
pub mod distributor;
pub mod ipc;
pub mod protocol;
pub mod pump;
pub mod queue;
pub mod registry;
pub mod translate;

pub use context::BridgeContext;
