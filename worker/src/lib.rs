//! Worker remoto: pide tareas al coordinador, las procesa con herramientas
//! externas y sube los resultados.

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod pipeline;
pub mod predictor;
pub mod tools;

pub use client::{CoordinatorApi, HttpCoordinator};
pub use config::WorkerConfig;
pub use pipeline::{Pipeline, PipelineSettings};
pub use tools::{CommandTools, ImageTools};
