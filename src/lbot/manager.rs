//! The process-wide registry: singleton lifecycle, node/plugin/cluster
//! ownership, and shutdown ordering (spec §3 "Manager", §4.1).
//!
//! Grounded on `manager.hpp`/`manager.cpp`'s `Manager::get`/`addNode`/
//! `removeNode`/`addPlugin`/`removePlugin` (insertion-ordered plugin list,
//! `node_map`/`cluster_map` keyed by name) and `cluster.cpp`'s teardown
//! (nodes removed in reverse insertion order when the cluster is dropped).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::lbot::clock::{Clock, ClockMode, TimeNode};
use crate::lbot::cluster::{Cluster, ClusterHandle};
use crate::lbot::common::{Error, Result};
use crate::lbot::config;
use crate::lbot::node::{Node, NodeHandle};
use crate::lbot::plugin::{Plugin, PluginEntry, PluginRegistry};
use crate::lbot::service::ServiceRegistry;
use crate::lbot::topic::TopicRegistry;

struct NodeEntry {
    type_id: TypeId,
    #[allow(dead_code)]
    handle: Arc<dyn Any + Send + Sync>,
}

struct ClusterEntry {
    type_id: TypeId,
    node_names: Vec<String>,
    #[allow(dead_code)]
    handle: Arc<dyn Any + Send + Sync>,
}

struct PluginInstance {
    type_id: TypeId,
    #[allow(dead_code)]
    handle: Arc<dyn Any + Send + Sync>,
}

/// Central registry of nodes, plugins, clusters, topics and services. Exactly
/// one instance per process (spec §3 "Manager (singleton)").
pub struct Manager {
    topics: Arc<TopicRegistry>,
    services: Arc<ServiceRegistry>,
    plugins: Arc<PluginRegistry>,
    clock: Arc<Clock>,
    nodes: Mutex<HashMap<String, NodeEntry>>,
    clusters: Mutex<HashMap<String, ClusterEntry>>,
    plugin_instances: Mutex<HashMap<String, PluginInstance>>,
    unique_nodes: Mutex<std::collections::HashSet<TypeId>>,
    unique_plugins: Mutex<std::collections::HashSet<TypeId>>,
}

static MANAGER: OnceLock<Manager> = OnceLock::new();

impl Manager {
    /// Return the process-wide instance, creating it on first call. Clock
    /// mode is read from the config store's `/lbot/clock_mode` key, falling
    /// back to `system` (spec §4.7 "Initialization").
    ///
    /// `OnceLock::get_or_init` synchronizes concurrent callers onto the same
    /// construction, which is how this crate enforces "a second simultaneous
    /// construction is a registration failure": no second instance can ever
    /// be observed, so the race never manifests as a fallible operation.
    pub fn get() -> &'static Manager {
        MANAGER.get_or_init(|| {
            let manager = Manager::new();
            manager
                .add_node::<TimeNode, _>("time_node", TimeNode::new)
                .expect("failed to construct the /time node");
            manager
        })
    }

    fn new() -> Self {
        let mode = config::store()
            .and_then(|store| store.get_fallback("/lbot/clock_mode", config::ConfigValue::String("system".into())).as_str().map(str::to_string))
            .unwrap_or_else(|| "system".to_string());
        let mode: ClockMode = mode.parse().unwrap_or(ClockMode::System);

        Manager {
            topics: Arc::new(TopicRegistry::new()),
            services: Arc::new(ServiceRegistry::new()),
            plugins: Arc::new(PluginRegistry::new()),
            clock: Arc::new(Clock::new(mode)),
            nodes: Mutex::new(HashMap::new()),
            clusters: Mutex::new(HashMap::new()),
            plugin_instances: Mutex::new(HashMap::new()),
            unique_nodes: Mutex::new(std::collections::HashSet::new()),
            unique_plugins: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    fn node_environment(&self, name: String) -> NodeHandle {
        NodeHandle::new(name, self.topics.clone(), self.services.clone(), self.plugins.clone(), self.clock.clone())
    }

    /// Construct and register a node under `name`. `build` receives the
    /// node's `Environment` and returns the constructed node (spec §4.1
    /// "addNode").
    pub fn add_node<T: Node>(&self, name: impl Into<String>, build: impl FnOnce(NodeHandle) -> Result<T>) -> Result<Arc<T>> {
        let name = name.into();
        let type_id = TypeId::of::<T>();

        {
            let nodes = self.nodes.lock()?;
            if nodes.contains_key(&name) {
                return Err(Error::management(format!("node '{name}' is already registered")));
            }
        }

        if T::UNIQUE {
            let mut unique = self.unique_nodes.lock()?;
            if !unique.insert(type_id) {
                return Err(Error::management("a unique node of this type is already registered"));
            }
        }

        let environment = self.node_environment(name.clone());
        let node = match build(environment) {
            Ok(node) => Arc::new(node),
            Err(err) => {
                if T::UNIQUE {
                    self.unique_nodes.lock()?.remove(&type_id);
                }
                return Err(err);
            }
        };

        self.nodes.lock()?.insert(name, NodeEntry { type_id, handle: node.clone() });
        Ok(node)
    }

    /// Drop a node by name. Destroying it flushes its senders and drops its
    /// receivers, servers and clients.
    pub fn remove_node(&self, name: &str) -> Result<()> {
        let entry = self
            .nodes
            .lock()?
            .remove(name)
            .ok_or_else(|| Error::management(format!("node '{name}' not found")))?;

        self.unique_nodes.lock()?.remove(&entry.type_id);
        Ok(())
    }

    /// Construct and register a cluster under `name`. `build` receives a
    /// `ClusterHandle` that proxies `add_node` to this manager and records
    /// every node name it added, so `remove_cluster` can tear them down in
    /// reverse order (spec §4.1 "addCluster").
    pub fn add_cluster<T: Cluster>(&self, name: impl Into<String>, build: impl FnOnce(&ClusterHandle) -> Result<T>) -> Result<Arc<T>> {
        let name = name.into();
        {
            let clusters = self.clusters.lock()?;
            if clusters.contains_key(&name) {
                return Err(Error::management(format!("cluster '{name}' is already registered")));
            }
        }

        let handle = ClusterHandle::new(self);
        let cluster = match build(&handle) {
            Ok(cluster) => Arc::new(cluster),
            Err(err) => {
                for added in handle.into_added().into_iter().rev() {
                    let _ = self.remove_node(&added);
                }
                return Err(err);
            }
        };

        let node_names = handle.into_added();
        self.clusters.lock()?.insert(
            name,
            ClusterEntry { type_id: TypeId::of::<T>(), node_names, handle: cluster.clone() },
        );
        Ok(cluster)
    }

    /// Remove a cluster by name, removing every node it added in reverse
    /// insertion order before dropping the cluster itself (spec §4.12,
    /// mirroring `cluster.cpp`'s destructor).
    pub fn remove_cluster(&self, name: &str) -> Result<()> {
        let entry = self
            .clusters
            .lock()?
            .remove(name)
            .ok_or_else(|| Error::management(format!("cluster '{name}' not found")))?;

        for node_name in entry.node_names.into_iter().rev() {
            let _ = self.remove_node(&node_name);
        }
        Ok(())
    }

    /// Construct and register a plugin under `name`. Insertion into the
    /// trace path's plugin list happens immediately after `build` returns,
    /// so no message published after `add_plugin` returns can miss it (spec
    /// §4.1 "addPlugin", §4.3).
    pub fn add_plugin<T: Plugin>(&self, name: impl Into<String>, build: impl FnOnce() -> Result<T>) -> Result<Arc<T>> {
        let name = name.into();
        let type_id = TypeId::of::<T>();

        if T::UNIQUE {
            let mut unique = self.unique_plugins.lock()?;
            if !unique.insert(type_id) {
                return Err(Error::management("a unique plugin of this type is already registered"));
            }
        }

        let plugin = match build() {
            Ok(plugin) => Arc::new(plugin),
            Err(err) => {
                if T::UNIQUE {
                    self.unique_plugins.lock()?.remove(&type_id);
                }
                return Err(err);
            }
        };

        let filter = plugin.filter();
        let callback_plugin = plugin.clone();
        let message_plugin = plugin.clone();
        let entry = Arc::new(PluginEntry::new(
            name.clone(),
            filter,
            move |topic| callback_plugin.on_topic(topic),
            move |message| message_plugin.on_message(message),
        ));

        if let Err(err) = self.plugins.add(entry) {
            if T::UNIQUE {
                self.unique_plugins.lock()?.remove(&type_id);
            }
            return Err(err);
        }

        self.plugin_instances.lock()?.insert(name, PluginInstance { type_id, handle: plugin.clone() });
        Ok(plugin)
    }

    /// Remove a plugin by name, blocking until no in-flight callback of it
    /// is still running before it is dropped.
    pub fn remove_plugin(&self, name: &str) -> Result<()> {
        self.plugins.remove(name)?;
        if let Some(entry) = self.plugin_instances.lock()?.remove(name) {
            self.unique_plugins.lock()?.remove(&entry.type_id);
        }
        Ok(())
    }

    /// Flush every topic, then tear down every plugin, then every node
    /// (spec §3 "destruction flushes every topic, then tears down plugins,
    /// then nodes"). Exposed for deterministic teardown in tests and at the
    /// end of a process's lifetime, since Rust does not run destructors on
    /// process-wide statics at normal exit the way the original's
    /// function-local `std::unique_ptr<Manager>` does.
    pub fn shutdown(&self) {
        self.topics.force_flush();
        self.plugins.clear();
        self.plugin_instances.lock().unwrap().clear();
        self.unique_plugins.lock().unwrap().clear();
        self.nodes.lock().unwrap().clear();
        self.clusters.lock().unwrap().clear();
        self.unique_nodes.lock().unwrap().clear();
        self.clock.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbot::message::{Adapter, Message};
    use serial_test::serial;
    use test_env_log::test;

    #[derive(Default, Clone, PartialEq, Debug)]
    struct Num(i64);
    impl Message for Num {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }
    }

    struct Publisher {
        sender: crate::lbot::channel::Sender<Num, Num>,
    }
    impl Node for Publisher {}

    #[test]
    #[serial]
    fn test_get_returns_same_instance() {
        let a = Manager::get() as *const Manager;
        let b = Manager::get() as *const Manager;
        assert_eq!(a, b);
    }

    #[test]
    #[serial]
    fn test_add_node_rejects_duplicate_name() {
        let manager = Manager::get();
        manager.shutdown();

        manager
            .add_node::<Publisher, _>("pub", |env| Ok(Publisher { sender: env.add_sender("/x", Adapter::identity())? }))
            .unwrap();

        let err = manager
            .add_node::<Publisher, _>("pub", |env| Ok(Publisher { sender: env.add_sender("/y", Adapter::identity())? }))
            .unwrap_err();
        assert!(matches!(err.kind(), crate::lbot::common::ErrorKind::Management(_)));

        manager.shutdown();
    }

    #[test]
    #[serial]
    fn test_remove_node_drops_sender_and_flushes_topic() {
        let manager = Manager::get();
        manager.shutdown();

        manager
            .add_node::<Publisher, _>("pub", |env| Ok(Publisher { sender: env.add_sender("/x", Adapter::identity())? }))
            .unwrap();

        let topic = manager.topics().get("/x").unwrap();
        assert!(topic.has_sender());

        manager.remove_node("pub").unwrap();
        assert!(!topic.has_sender());

        manager.shutdown();
    }

    struct UniqueThing;
    impl Node for UniqueThing {
        const UNIQUE: bool = true;
    }

    #[test]
    #[serial]
    fn test_unique_node_constraint_is_per_type_not_per_name() {
        let manager = Manager::get();
        manager.shutdown();

        manager.add_node::<UniqueThing, _>("a", |_| Ok(UniqueThing)).unwrap();
        let err = manager.add_node::<UniqueThing, _>("b", |_| Ok(UniqueThing)).unwrap_err();
        assert!(matches!(err.kind(), crate::lbot::common::ErrorKind::Management(_)));

        manager.shutdown();
    }
}
