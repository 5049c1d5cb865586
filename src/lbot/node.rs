//! The node-facing interface: the `Environment` a node is constructed with
//! and the typed factory operations it exposes (spec §6 "Node-facing
//! interface").
//!
//! Grounded on `node.hpp`'s `Node::Environment` (name, `topic_map`,
//! `service_map`, `plugin_list`) and its `addSender`/`addReceiver`/
//! `addServer`/`addClient` member templates. The template-heavy
//! specializations collapse into plain generic methods parameterized over
//! `(MessageType, ContainerType)`, per spec §9.

use std::sync::Arc;

use crate::lbot::channel::{Receiver, Sender};
use crate::lbot::clock::Clock;
use crate::lbot::common::Result;
use crate::lbot::message::{Adapter, Message, ServiceHandle};
use crate::lbot::plugin::PluginRegistry;
use crate::lbot::service::{Client, Server, Service, ServiceRegistry};
use crate::lbot::topic::TopicRegistry;

/// Marker trait for a user-defined unit that owns endpoints and threads.
/// Implement `UNIQUE = true` for a node type that may have at most one live
/// instance per process, regardless of the name it is registered under
/// (spec §4.1 "Unique-node constraint").
pub trait Node: Send + Sync + 'static {
    const UNIQUE: bool = false;
}

/// The environment a node is constructed with: its own name plus shared
/// references into the manager's topic registry, service registry, plugin
/// list and clock. Mirrors `node.hpp::Node::Environment`, copied by value
/// into the node on construction.
#[derive(Clone)]
pub struct NodeHandle {
    name: String,
    topics: Arc<TopicRegistry>,
    services: Arc<ServiceRegistry>,
    plugins: Arc<PluginRegistry>,
    clock: Arc<Clock>,
}

impl NodeHandle {
    pub(crate) fn new(
        name: String,
        topics: Arc<TopicRegistry>,
        services: Arc<ServiceRegistry>,
        plugins: Arc<PluginRegistry>,
        clock: Arc<Clock>,
    ) -> Self {
        NodeHandle { name, topics, services, plugins, clock }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Bind a new sender to `topic_name`. Fails if a sender is already
    /// registered on that topic, or if the topic's type handle does not
    /// match `M`.
    pub fn add_sender<M: Message, C>(&self, topic_name: &str, adapter: Adapter<M, C>) -> Result<Sender<M, C>> {
        let topic = self.topics.get_or_create(topic_name, M::type_handle())?;
        Sender::new(topic, self.plugins.clone(), adapter)
    }

    /// Bind a new receiver to `topic_name` with a ring buffer of at least
    /// `buffer_size` slots (rounded up to a power of two).
    pub fn add_receiver<M: Message, C: Send + 'static>(
        &self,
        topic_name: &str,
        adapter: Adapter<M, C>,
        buffer_size: usize,
    ) -> Result<Receiver<M, C>> {
        let topic = self.topics.get_or_create(topic_name, M::type_handle())?;
        Receiver::new(topic, adapter, buffer_size)
    }

    /// Register a server under `service_name`. Fails if a server is already
    /// registered there.
    pub fn add_server<Req: 'static, Resp: 'static>(
        &self,
        service_name: &str,
        handler: impl Fn(&Req) -> Resp + Send + Sync + 'static,
    ) -> Result<Server<Req, Resp>> {
        let service = self.service_for::<Req, Resp>(service_name)?;
        Server::new(service, handler)
    }

    /// Build a stateless client bound to `service_name`; invoking it calls
    /// out to whatever server is currently registered there.
    pub fn add_client<Req: Send + 'static, Resp: Send + 'static>(&self, service_name: &str) -> Result<Client<Req, Resp>> {
        let service = self.service_for::<Req, Resp>(service_name)?;
        Ok(Client::new(service))
    }

    fn service_for<Req: 'static, Resp: 'static>(&self, service_name: &str) -> Result<Arc<Service>> {
        self.services.get_or_create(service_name, ServiceHandle::of::<Req, Resp>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbot::clock::ClockMode;
    use test_env_log::test;

    #[derive(Default, Clone, PartialEq, Debug)]
    struct Num(i64);

    impl Message for Num {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }
    }

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
    fn test_add_sender_and_receiver_share_topic() {
        let env = handle("a");
        let sender = env.add_sender::<Num, Num>("/x", Adapter::identity()).unwrap();
        let receiver = env.add_receiver::<Num, Num>("/x", Adapter::identity(), 4).unwrap();

        sender.put(&Num(3));
        assert_eq!(receiver.latest().unwrap(), Num(3));
    }

    #[test]
    fn test_add_server_and_client_share_service() {
        let env = handle("a");
        let server = env.add_server::<u32, u32>("/inc", |r: &u32| r + 1).unwrap();
        let client: Client<u32, u32> = env.add_client("/inc").unwrap();
        assert_eq!(client.call_sync(1).unwrap(), 2);
        drop(server);
    }
}
