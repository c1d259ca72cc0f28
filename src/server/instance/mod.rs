pub mod compiler;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod state_machine;
