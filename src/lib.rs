pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod model;
pub mod queue;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod sender;

pub use bridge::EffectBridge;
pub use config::Config;
pub use connection::ConnectionState;
pub use dispatch::{DispatchOutcome, EffectContext, HostSignals};
pub use model::{EffectStatus, Request, RequestId, Response};
pub use registry::{EffectHandler, HandlerRegistry, HandlerResult};
pub use scheduler::{TimedEffect, TimedEffectScheduler};
pub use sender::ResponseSender;
