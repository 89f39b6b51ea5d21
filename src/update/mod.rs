pub mod broadcaster;
pub mod coordinator;
pub mod models;
pub mod notes;
pub mod service;
pub mod transport;
pub mod version;

pub use broadcaster::{
    ChannelObserver, LogObserver, ObserverHandle, StatusBroadcaster, StatusObserver,
};
pub use coordinator::UpdateCoordinator;
pub use models::*;
pub use service::{GithubReleaseSource, HttpTransport};
pub use transport::{ProgressFn, ReleaseSource, UpdateTransport};
