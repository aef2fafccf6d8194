//! Webspaces: one LXD instance per user plus its ports, domains and config.

mod allocation;
mod error;
mod lifecycle;
mod manager;
mod model;
mod startup;

pub use error::{WebspaceError, WebspaceResult, translate};
pub use manager::{ManagerConfig, WebspaceManager};
pub use model::{
    ExecInteractiveControl, ExecInteractiveRequest, ExecOutput, InitRequest, InterfaceAddress,
    InterfaceCounters, MAX_STARTUP_DELAY, METADATA_KEY, NetworkInterface, ResizeRequest, Usage,
    Webspace, WebspaceConfig, WebspaceState,
};
pub use startup::select_address;
