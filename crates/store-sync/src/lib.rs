//! Concurrency and synchronization layer for the embedded, multi-device,
//! file-synced key-value store: serial task queues, file-system watching,
//! the merge engine, its async facade, and the offline merge tool.

pub mod merge_engine;
pub mod merge_tool;
pub mod notification;
pub mod serial_executor;
pub mod store_facade;
pub mod watch_source;

pub use merge_engine::{generate_device_id, EngineTuning, InsertMode, MergeEngine};
pub use merge_tool::{union, MergeReport};
pub use notification::{Event, NotificationBus};
pub use serial_executor::{QueueId, ReentrantPolicy, SerialExecutor, TimerBehavior};
pub use store_facade::StoreFacade;
pub use watch_source::WatchSource;
