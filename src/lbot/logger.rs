//! Console logging bootstrap and the `/log` bridge: every tracing event is
//! also published on the reserved `/log` topic so any node can subscribe to
//! the process's own log stream (`SPEC_FULL.md` §4.11 "Logging", spec §6
//! "Reserved topics").
//!
//! Grounded on the teacher's `init_tracing` (a plain `FmtSubscriber` console
//! sink) plus `clock.rs`'s `/time` pattern for bridging an internal signal
//! onto a topic via a dedicated unique node.

use std::sync::Arc;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{FmtSubscriber, Layer};

use crate::lbot::channel::Sender;
use crate::lbot::common::Result;
use crate::lbot::message::{Adapter, Message};
use crate::lbot::node::{Node, NodeHandle};

/// Install a console subscriber at `max_level`. Call once at process start.
pub fn init_tracing(max_level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(max_level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

/// Install a console subscriber at `max_level` plus a layer mirroring every
/// event onto `sink`'s `/log` topic.
pub fn init_tracing_with_sink(max_level: Level, sink: Arc<LogSinkNode>) {
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .with(TopicLayer::new(sink))
        .with(tracing_subscriber::filter::LevelFilter::from_level(max_level));
    registry.try_init().expect("setting default subscriber failed");
}

/// One tracing event, carried on `/log`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: std::time::Duration,
}

impl Message for LogRecord {
    fn serialize(&self) -> Vec<u8> {
        format!("[{:?}] {} {}: {}", self.timestamp, self.level, self.target, self.message).into_bytes()
    }
}

/// Owns the `/log` sender. A unique node: at most one instance exists per
/// process, since there is only one log stream to mirror.
pub struct LogSinkNode {
    sender: Sender<LogRecord, LogRecord>,
}

impl Node for LogSinkNode {
    const UNIQUE: bool = true;
}

impl LogSinkNode {
    pub fn new(env: NodeHandle) -> Result<Self> {
        Ok(LogSinkNode { sender: env.add_sender("/log", Adapter::identity())? })
    }

    pub fn publish(&self, record: LogRecord) {
        self.sender.put(&record);
    }
}

/// A `tracing_subscriber::Layer` forwarding every event to a [`LogSinkNode`]
/// rather than (or in addition to) the console.
struct TopicLayer {
    sink: Arc<LogSinkNode>,
}

impl TopicLayer {
    fn new(sink: Arc<LogSinkNode>) -> Self {
        TopicLayer { sink }
    }
}

impl<S: Subscriber> Layer<S> for TopicLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.sink.publish(LogRecord {
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            timestamp: std::time::Duration::ZERO,
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbot::channel::Receiver;
    use crate::lbot::clock::{Clock, ClockMode};
    use test_env_log::test;
    use crate::lbot::plugin::PluginRegistry;
    use crate::lbot::service::ServiceRegistry;
    use crate::lbot::topic::TopicRegistry;
    use std::sync::Arc;

    fn handle(name: &str) -> NodeHandle {
        NodeHandle::new(
            name.to_string(),
            Arc::new(TopicRegistry::new()),
            Arc::new(ServiceRegistry::new()),
            Arc::new(PluginRegistry::new()),
            Arc::new(Clock::new(ClockMode::Steady)),
        )
    }

    #[test]
    fn test_log_sink_node_publishes_to_log_topic() {
        let env = handle("logger");
        let sink = LogSinkNode::new(env.clone()).unwrap();
        let receiver: Receiver<LogRecord, LogRecord> = env.add_receiver("/log", Adapter::identity(), 4).unwrap();

        sink.publish(LogRecord {
            level: "INFO".into(),
            target: "lbot".into(),
            message: "started".into(),
            timestamp: std::time::Duration::ZERO,
        });

        assert_eq!(receiver.latest().unwrap().message, "started");
    }
}
