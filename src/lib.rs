pub mod expr;
pub mod graph;
pub mod handlers;
pub mod runtime;

pub use graph::{GraphStore, ProcessGraph};
pub use runtime::engine::{SimError, Simulator, SimulatorBuilder};
