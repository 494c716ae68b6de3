//! skein-checkpoint: workflow execution persistence.
//!
//! One gzip-compressed JSON file per workflow execution, written
//! atomically into per-session directories, with a background flusher and
//! a size-budgeted retention policy. The DTO layer keeps all cross
//! references id-based so cyclic runtime handles never reach the disk
//! format.

pub mod codec;
pub mod dto;
pub mod error;
pub mod state_manager;

pub use codec::{dumps_gzip, load_from_path, loads_gzip, save_to_path};
pub use dto::{from_dto, to_dto, WorkflowExecutionDto};
pub use error::{CheckpointError, Result};
pub use state_manager::{WorkflowChangedListener, WorkflowStateManager};
