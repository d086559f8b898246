//! Streaming plumbing for agentrelay: the session registry that owns
//! per-session streaming state, the relay that fans events out to
//! subscribers, and the broker bridge that carries events between
//! processes.

pub mod broker;
pub mod redis_broker;
pub mod registry;
pub mod relay;
pub mod sink;

pub use broker::{Broker, BrokerError, BrokerSink, channel_for, forward, spawn_forwarder};
pub use redis_broker::RedisBroker;
pub use registry::{codes, RetentionPolicy, StreamRegistry, StreamStatus, StreamingSession, CANCELLED_MESSAGE};
pub use relay::{ConnectionId, EventRelay};
pub use sink::{EventSink, FanoutSink, NullSink, RecordingSink};
