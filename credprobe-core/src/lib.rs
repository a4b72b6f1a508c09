pub mod engine;
pub mod registry;

pub use engine::{EngineError, ProbeEngine};
pub use registry::Registry;
