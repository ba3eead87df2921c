//! agentbridge daemon - mailbox processing, patch lifecycle, completion
//! detection and agent liveness for the file-exchange bridge.

pub mod agent_state;
pub mod completion;
pub mod config;
pub mod daemon;
pub mod heartbeat;
pub mod layout;
pub mod memory;
pub mod patch;
pub mod processor;
pub mod resources;
pub mod retry;
pub mod validation;
pub mod watcher;

pub use agent_state::{AgentStateStore, ResumeController, ResumeOutcome};
pub use completion::{CompletionDetector, ContentSource, StabilityTracker, StatusSource};
pub use config::BridgeConfig;
pub use daemon::{Daemon, DaemonState, DaemonStats};
pub use heartbeat::HeartbeatMonitor;
pub use layout::BridgeLayout;
pub use memory::MemoryTracker;
pub use patch::{FsPatchBackend, PatchBackend};
pub use processor::{ProcessorFactory, ResponseProcessor};
pub use resources::ResourceManager;
pub use retry::ErrorHandler;
pub use validation::{ValidationEngine, Validator};
