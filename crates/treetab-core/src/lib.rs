pub mod parent_map;
pub mod tab;
pub mod tree;
pub mod wire;

pub use parent_map::{OpenerCorrection, ParentMap};
pub use tab::{CreateProps, TabId, TabQuery, TabRecord, UpdateProps, WindowId};
pub use tree::{build_tree, BuildOutcome, TreeSnapshot};
