//! The plugin trace path: per-plugin name-hash filter, topic-announce and
//! message callbacks, and the delete-flag + use-count drain protocol that
//! lets `remove_plugin` return only once no callback of that plugin is still
//! running (spec §3, §4.5, §6).
//!
//! Grounded on `plugin.hpp`'s `Plugin` entry (user pointer, two callbacks,
//! `delete_flag`/`use_count`) and `manager.cpp`'s `addPlugin`/`removePlugin`
//! (insert at head, `delete_flag.test_and_set()` then
//! `waitUntil(use_count, 0)` before unlinking).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lbot::common::{wait_until_zero, Error, Filter, Result};
use crate::lbot::message::{MessageInfo, TopicInfo};

/// A reader guard on a plugin's use-count, held for the duration of one
/// callback invocation. Mirrors the original's `utils::ConsumerGuard<u32>`.
/// While any guard is outstanding, `remove_plugin` blocks.
struct UseGuard<'a> {
    use_count: &'a AtomicUsize,
}

impl<'a> UseGuard<'a> {
    fn acquire(use_count: &'a AtomicUsize) -> Self {
        use_count.fetch_add(1, Ordering::AcqRel);
        UseGuard { use_count }
    }
}

impl Drop for UseGuard<'_> {
    fn drop(&mut self) {
        self.use_count.fetch_sub(1, Ordering::AcqRel);
        self.use_count.notify_all();
    }
}

/// A process-wide observer that sees announce and message events across
/// every topic its filter admits. Implement `UNIQUE = true` for a plugin
/// type that may have at most one live instance per process, regardless of
/// the name it is registered under — the same constraint §4.1 specifies for
/// nodes (spec §4.1, §4.5).
pub trait Plugin: Send + Sync + 'static {
    const UNIQUE: bool = false;

    /// The name-hash filter admitting the topics this plugin observes.
    /// Default is an empty blacklist, i.e. accept-all.
    fn filter(&self) -> Filter {
        Filter::new()
    }

    /// Called once per topic the filter admits, at the moment a sender
    /// appears.
    fn on_topic(&self, _topic: &TopicInfo) {}

    /// Called after each successful `put`/`move`/`trace` on a topic the
    /// filter admits.
    fn on_message(&self, _message: &MessageInfo) {}
}

pub struct PluginEntry {
    pub name: String,
    filter: Mutex<Filter>,
    delete_flag: AtomicBool,
    use_count: AtomicUsize,
    topic_callback: Box<dyn Fn(&TopicInfo) + Send + Sync>,
    message_callback: Box<dyn Fn(&MessageInfo) + Send + Sync>,
}

impl PluginEntry {
    pub fn new(
        name: impl Into<String>,
        filter: Filter,
        topic_callback: impl Fn(&TopicInfo) + Send + Sync + 'static,
        message_callback: impl Fn(&MessageInfo) + Send + Sync + 'static,
    ) -> Self {
        PluginEntry {
            name: name.into(),
            filter: Mutex::new(filter),
            delete_flag: AtomicBool::new(false),
            use_count: AtomicUsize::new(0),
            topic_callback: Box::new(topic_callback),
            message_callback: Box::new(message_callback),
        }
    }

    fn admits(&self, topic_hash: u64) -> bool {
        !self.delete_flag.load(Ordering::Acquire) && self.filter.lock().unwrap().check(topic_hash)
    }
}

/// The process-wide, insertion-ordered plugin list. New plugins are inserted
/// at the head so no message already in flight is missed by a plugin whose
/// constructor is still running.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Mutex<Vec<Arc<PluginEntry>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    pub fn add(&self, entry: Arc<PluginEntry>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.name == entry.name) {
            return Err(Error::management(format!("plugin '{}' already registered", entry.name)));
        }
        entries.insert(0, entry);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let entry = {
            let entries = self.entries.lock().unwrap();
            entries.iter().find(|e| e.name == name).cloned()
        };
        let entry = entry.ok_or_else(|| Error::management(format!("plugin '{name}' not found")))?;

        entry.delete_flag.store(true, Ordering::Release);
        wait_until_zero(&entry.use_count);

        self.entries.lock().unwrap().retain(|e| e.name != name);
        Ok(())
    }

    /// Remove every registered plugin, draining each one's in-flight
    /// callbacks first. Used by `Manager::shutdown`.
    pub fn clear(&self) {
        let names: Vec<String> = self.entries.lock().unwrap().iter().map(|e| e.name.clone()).collect();
        for name in names {
            let _ = self.remove(&name);
        }
    }

    /// Announce a newly created topic to every currently matching plugin.
    /// Called once from a sender's constructor (spec §4.3).
    pub fn announce(&self, topic_info: &TopicInfo) {
        let entries = self.entries.lock().unwrap().clone();
        for entry in entries {
            if !entry.admits(topic_info.topic_hash) {
                continue;
            }
            let _guard = UseGuard::acquire(&entry.use_count);
            (entry.topic_callback)(topic_info);
        }
    }

    /// Dispatch a message to every matching plugin, serializing the message
    /// lazily the first time a plugin actually matches (spec §4.3 `trace`).
    pub fn dispatch<F>(&self, topic_info: &TopicInfo, timestamp: Duration, mut serialize: F)
    where
        F: FnMut() -> Vec<u8>,
    {
        let entries = self.entries.lock().unwrap().clone();
        let mut serialized: Option<Vec<u8>> = None;

        for entry in entries {
            if !entry.admits(topic_info.topic_hash) {
                continue;
            }

            let bytes = serialized.get_or_insert_with(&mut serialize);
            let _guard = UseGuard::acquire(&entry.use_count);
            let info = MessageInfo {
                topic: topic_info,
                timestamp,
                serialized: bytes,
            };
            (entry.message_callback)(&info);
        }
    }

    /// Number of plugins currently admitting `topic_hash`, used by the
    /// sender's move fast path to decide whether exactly one consumer
    /// exists.
    pub fn matching_count(&self, topic_hash: u64) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.admits(topic_hash))
            .count()
    }

    /// Dispatch directly to the single plugin matching `topic_hash`, used by
    /// the sender's move fast path when the sole consumer is a plugin rather
    /// than a receiver. Returns `false` if no matching plugin is found (the
    /// list changed between the caller's count check and this call).
    pub fn dispatch_unique(&self, topic_info: &TopicInfo, timestamp: Duration, serialized: &[u8]) -> bool {
        let entries = self.entries.lock().unwrap().clone();
        let Some(entry) = entries.into_iter().find(|e| e.admits(topic_info.topic_hash)) else {
            return false;
        };

        let _guard = UseGuard::acquire(&entry.use_count);
        let info = MessageInfo {
            topic: topic_info,
            timestamp,
            serialized,
        };
        (entry.message_callback)(&info);
        true
    }
}
