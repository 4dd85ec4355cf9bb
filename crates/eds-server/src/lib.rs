pub mod affinity;
pub mod channel;
#[cfg(unix)]
pub mod channel_host;
pub mod dispatcher;
pub mod presence;
pub mod registry;
pub mod server;
pub mod workspace;

pub use channel::{Channel, ChannelError, MemoryChannel};
pub use dispatcher::{BatchReport, Dispatcher};
pub use registry::{DesktopId, DocumentId, DocumentRegistry, MacroEngine, WindowId};
pub use server::{run, run_with, ServerConfig};
pub use workspace::{LoggingMacroEngine, Workspace, WorkspaceEvent};
