//! Request/response correlation and notification dispatch for a media worker.
//!
//! A [`Channel`] owns the transport to one worker. Callers on any thread issue
//! requests and block until the matching response, a timeout, or channel
//! close. A single reader thread reassembles inbound frames, completes pending
//! requests and routes notifications through the [`EntityRegistry`].

pub mod channel;
pub mod error;
pub mod message;
pub mod method;
pub mod pending;
pub mod registry;

pub use channel::{
    Channel, ChannelConfig, ChannelFault, ChannelObserver, ChannelOptions, WORKER_LOG_TARGET,
};
pub use error::{ChannelError, Result};
pub use message::{
    classify, HostNotification, InboundMessage, Notification, RequestMessage, Response, ResponseOutcome,
    RoutingContext, WorkerLogLevel,
};
pub use method::{Method, UnknownMethod};
pub use pending::{PendingRequest, PendingTable, Waiter};
pub use registry::{EntityRegistry, NotificationHandler};
