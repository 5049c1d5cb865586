//! The topic registry: name→topic map, the at-most-one-sender slot, and the
//! receiver roster's two-stage mutation protocol (spec §3, §4.2).
//!
//! Grounded on `topic.hpp`/`topic.cpp`'s `TopicMap`/`TopicMap::Topic`: a
//! receiver roster is mutated under a change-flag + use-count drain (the
//! original's `FlagGuard` + `ReceiverList`), so that `put`'s hot path only
//! ever increments an atomic counter instead of taking a lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::lbot::common::{hash_topic_name, wait_until_zero, Error, Result};
use crate::lbot::message::TypeHandle;

/// A type-erased handle into a receiver's ring buffer, held by the roster.
/// Implemented by `Receiver<M, C>`'s inner state; `deliver` downcasts the
/// boxed message back to `M`, which is sound because the topic's type handle
/// was checked at registration time.
pub trait RosterEntry: Send + Sync {
    fn deliver(&self, message: Box<dyn Any + Send>);
    fn flush(&self);
}

struct ChangeGuard<'a> {
    topic: &'a Topic,
}

impl<'a> ChangeGuard<'a> {
    fn acquire(topic: &'a Topic) -> Self {
        while topic.change_flag.swap(true, Ordering::AcqRel) {
            topic.change_flag.wait(true);
        }
        wait_until_zero(&topic.use_count);
        ChangeGuard { topic }
    }
}

impl Drop for ChangeGuard<'_> {
    fn drop(&mut self) {
        self.topic.change_flag.store(false, Ordering::Release);
        self.topic.change_flag.notify_all();
    }
}

/// Mirrors the original's `Topic::ReceiverList`: acquiring a guard bumps the
/// use-count (blocking only if a mutation is in flight), and the roster may
/// be iterated for as long as the guard lives.
pub struct RosterGuard<'a> {
    topic: &'a Topic,
}

impl<'a> RosterGuard<'a> {
    fn acquire(topic: &'a Topic) -> Self {
        loop {
            topic.use_count.fetch_add(1, Ordering::AcqRel);

            if !topic.change_flag.load(Ordering::Acquire) {
                break;
            }

            topic.use_count.fetch_sub(1, Ordering::AcqRel);
            topic.use_count.notify_all();
            topic.change_flag.wait(true);
        }

        RosterGuard { topic }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<dyn RosterEntry>> {
        // Safe: a RosterGuard is only ever constructed while the change-flag
        // protocol guarantees no mutator is concurrently editing the roster.
        unsafe { (*self.topic.receivers.get()).iter() }
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.topic.receivers.get()).len() }
    }
}

impl Drop for RosterGuard<'_> {
    fn drop(&mut self) {
        self.topic.use_count.fetch_sub(1, Ordering::AcqRel);
        self.topic.use_count.notify_all();
    }
}

/// A named, typed channel. One optional sender, many receivers. Created on
/// first registration and persists for the lifetime of the manager.
pub struct Topic {
    pub name: String,
    pub topic_hash: u64,
    pub type_handle: TypeHandle,
    sender: Mutex<Option<u64>>,
    change_flag: AtomicBool,
    use_count: AtomicUsize,
    receivers: std::cell::UnsafeCell<Vec<Arc<dyn RosterEntry>>>,
}

// SAFETY: `receivers` is only ever accessed either under the change-flag +
// use-count protocol (reads, via `RosterGuard`) or under the change-flag
// alone with the use-count drained to zero (mutation, via `ChangeGuard`).
unsafe impl Sync for Topic {}
unsafe impl Send for Topic {}

static NEXT_SENDER_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque token identifying one live sender, handed back to the holder so
/// it can prove ownership on removal. Mirrors comparing the original's raw
/// `void *sender` pointer on `removeSender`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SenderToken(u64);

impl SenderToken {
    fn issue() -> Self {
        SenderToken(NEXT_SENDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Topic {
    fn new(topic_hash: u64, name: String, type_handle: TypeHandle) -> Self {
        Topic {
            name,
            topic_hash,
            type_handle,
            sender: Mutex::new(None),
            change_flag: AtomicBool::new(false),
            use_count: AtomicUsize::new(0),
            receivers: std::cell::UnsafeCell::new(Vec::new()),
        }
    }

    pub fn has_sender(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    pub fn add_sender(&self) -> Result<SenderToken> {
        let mut slot = self.sender.lock().unwrap();
        if slot.is_some() {
            return Err(Error::management(format!(
                "a sender has already been registered for topic '{}'",
                self.name
            )));
        }
        let token = SenderToken::issue();
        *slot = Some(token.0);
        Ok(token)
    }

    pub fn remove_sender(&self, token: SenderToken) -> Result<()> {
        let mut slot = self.sender.lock().unwrap();
        if *slot != Some(token.0) {
            return Err(Error::management(format!(
                "the sender to be removed does not match the existing sender on '{}'",
                self.name
            )));
        }
        *slot = None;
        Ok(())
    }

    pub fn add_receiver(&self, receiver: Arc<dyn RosterEntry>) {
        let _guard = ChangeGuard::acquire(self);
        unsafe { (*self.receivers.get()).push(receiver) };
    }

    pub fn remove_receiver(&self, receiver: &Arc<dyn RosterEntry>) -> Result<()> {
        let _guard = ChangeGuard::acquire(self);
        let list = unsafe { &mut *self.receivers.get() };
        let position = list.iter().position(|entry| Arc::ptr_eq(entry, receiver));
        match position {
            Some(index) => {
                list.remove(index);
                Ok(())
            }
            None => Err(Error::management(format!(
                "receiver to be removed not found on topic '{}'",
                self.name
            ))),
        }
    }

    pub fn receivers(&self) -> RosterGuard<'_> {
        RosterGuard::acquire(self)
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers().len()
    }

    /// Advance every receiver's ring past its next slot and mark it flushed,
    /// so any blocked `next`/`latest` fails with *no-data-available*. Called
    /// when a sender is destroyed and, via `force_flush`, on manager
    /// shutdown.
    pub fn flush(&self) {
        let guard = self.receivers();
        for entry in guard.iter() {
            entry.flush();
        }
    }
}

/// Thread-safe name→topic map. Lookup-or-insert returns the existing entry
/// when type handles match and fails otherwise (spec §4.2).
#[derive(Default)]
pub struct TopicRegistry {
    map: Mutex<HashMap<String, Arc<Topic>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        TopicRegistry::default()
    }

    /// Look up or create the topic for `name`, checking that `type_handle`
    /// matches any existing registration.
    pub fn get_or_create(&self, name: &str, type_handle: TypeHandle) -> Result<Arc<Topic>> {
        let mut map = self.map.lock().unwrap();
        if let Some(existing) = map.get(name) {
            if existing.type_handle != type_handle {
                return Err(Error::management(format!(
                    "topic '{name}' does not match the provided type handle"
                )));
            }
            return Ok(existing.clone());
        }

        let topic_hash = hash_topic_name(name);
        let topic = Arc::new(Topic::new(topic_hash, name.to_string(), type_handle));
        map.insert(name.to_string(), topic.clone());
        Ok(topic)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.map.lock().unwrap().get(name).cloned()
    }

    /// Flush every receiver of every topic. Called once, on manager
    /// shutdown, before plugins and nodes are torn down.
    pub fn force_flush(&self) {
        for topic in self.map.lock().unwrap().values() {
            topic.flush();
        }
    }
}
