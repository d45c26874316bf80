pub mod commands;
pub mod engine;

pub use commands::BranchCloseMode;
pub use engine::{ContextMenu, EngineConfig, EngineError, TabEngine, TreeViewState};
