//! Node-group construction: a cluster owns a set of nodes it added and
//! removes them all when it is torn down (spec §4.12, `SPEC_FULL.md`
//! §2 "Cluster").
//!
//! Grounded on `cluster.hpp`/`cluster.cpp`: `Cluster::addNode` proxies to
//! `Manager::addNode` and records the name; the destructor pops names off
//! the back (reverse insertion order) and calls `Manager::removeNode` for
//! each.

use std::sync::Mutex;

use crate::lbot::common::Result;
use crate::lbot::manager::Manager;
use crate::lbot::node::{Node, NodeHandle};

/// Marker trait for a node-group constructor.
pub trait Cluster: Send + Sync + 'static {}

/// Handed to a cluster's `build` closure; proxies `add_node` to the manager
/// and records every name added so `Manager::remove_cluster` can tear them
/// down in reverse order.
pub struct ClusterHandle<'a> {
    manager: &'a Manager,
    added: Mutex<Vec<String>>,
}

impl<'a> ClusterHandle<'a> {
    pub(crate) fn new(manager: &'a Manager) -> Self {
        ClusterHandle { manager, added: Mutex::new(Vec::new()) }
    }

    pub fn add_node<T: Node>(&self, name: impl Into<String>, build: impl FnOnce(NodeHandle) -> Result<T>) -> Result<std::sync::Arc<T>> {
        let name = name.into();
        let node = self.manager.add_node::<T, _>(name.clone(), build)?;
        self.added.lock().unwrap().push(name);
        Ok(node)
    }

    pub(crate) fn into_added(&self) -> Vec<String> {
        std::mem::take(&mut *self.added.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbot::message::{Adapter, Message};
    use serial_test::serial;
    use test_env_log::test;

    #[derive(Default, Clone)]
    struct Num(i64);
    impl Message for Num {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }
    }

    struct Leaf {
        #[allow(dead_code)]
        sender: crate::lbot::channel::Sender<Num, Num>,
    }
    impl Node for Leaf {}

    struct Pair;
    impl Cluster for Pair {}

    #[test]
    #[serial]
    fn test_cluster_teardown_removes_every_node_it_added() {
        let manager = Manager::get();
        manager.shutdown();

        manager
            .add_cluster::<Pair, _>("pair", |handle| {
                handle.add_node::<Leaf, _>("a", |env| Ok(Leaf { sender: env.add_sender("/a", Adapter::identity())? }))?;
                handle.add_node::<Leaf, _>("b", |env| Ok(Leaf { sender: env.add_sender("/b", Adapter::identity())? }))?;
                Ok(Pair)
            })
            .unwrap();

        manager.remove_cluster("pair").unwrap();
        assert!(manager.remove_node("a").is_err());
        assert!(manager.remove_node("b").is_err());

        manager.shutdown();
    }
}
