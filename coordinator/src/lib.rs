//! Coordinador: cola ordenada de tareas, procesadores locales y leases
//! para workers remotos.

pub mod collaborators;
pub mod config;
pub mod events;
pub mod failover;
pub mod handlers;
pub mod lane;
pub mod lease;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod state;
pub mod store;

pub use config::CoordinatorConfig;
pub use service::{start, Collaborators, ServiceHandle};
