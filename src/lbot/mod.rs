//! An in-process, typed publish/subscribe and request/response fabric.
//!
//! [`Manager`] is the process-wide registry that owns [`node::Node`]s and
//! [`plugin::Plugin`]s; nodes exchange strongly-typed messages on named
//! [`topic::Topic`]s and call named [`service::Service`]s; plugins observe
//! every message that flows through the fabric. See `SPEC_FULL.md` for the
//! full design.

pub mod channel;
pub mod clock;
pub mod cluster;
pub mod common;
pub mod config;
pub mod logger;
pub mod manager;
pub mod message;
pub mod node;
pub mod plugin;
pub mod service;
pub mod topic;

pub use channel::{ExecutionPolicy, Receiver, Sender};
pub use clock::{Clock, ClockMode, TimeMessage, TimeNode, Timestamp};
pub use cluster::{Cluster, ClusterHandle};
pub use common::{Error, ErrorKind, Result};
pub use logger::{init_tracing, init_tracing_with_sink, LogRecord, LogSinkNode};
pub use manager::Manager;
pub use message::{Adapter, Message, MessageInfo, ServiceHandle, TopicInfo, TypeHandle};
pub use node::{Node, NodeHandle};
pub use plugin::{Plugin, PluginEntry};
pub use service::{CallHandle, Client, Server};
pub use topic::Topic;
