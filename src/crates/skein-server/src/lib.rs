//! skein-server: project, manager stack and UI event bridge.
//!
//! Hosts everything around the core runner: configuration loading with
//! includes and variables, the concrete [`project::Project`], the
//! internal HTTP server, process/shell management, background
//! persistence wiring, the runner [`manager::Manager`] and the packet
//! based [`manager::server::UIServer`].

pub mod error;
pub mod executors;
pub mod http;
pub mod logging;
pub mod manager;
pub mod proc;
pub mod project;
pub mod settings;

pub use error::{Result, ServerError};
pub use http::InternalHttpServer;
pub use manager::endpoint::{Endpoint, InMemoryEndpoint, RpcHelper};
pub use manager::proto::{Packet, PacketEnvelope, PacketKind};
pub use manager::server::UIServer;
pub use manager::{Manager, RunEventListener, RunnerFrame};
pub use proc::{ProcessManager, ShellManager};
pub use project::Project;
pub use settings::load_settings;
