//! Sender and Receiver: ring-buffered delivery, `put`/`move`/`flush`/`trace`,
//! `latest`/`next`, and per-receiver callbacks (spec §3, §4.3, §4.4).
//!
//! Grounded on `node.hpp`'s `_Sender`/`_Receiver` (formerly one generic class
//! per `(MessageType, ContainerType)` pair via template specialization; here
//! the pair is simply the two type parameters of [`Sender`]/[`Receiver`], and
//! the specializations collapse into the [`Adapter`] passed to each).

use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lbot::common::{Error, Result};
use crate::lbot::message::{Adapter, Message, TopicInfo};
use crate::lbot::plugin::PluginRegistry;
use crate::lbot::topic::{RosterEntry, Topic};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExecutionPolicy {
    /// The callback runs on the publishing thread, before `put` returns.
    Inline,
    /// The callback is handed to a worker thread so the publisher never
    /// blocks on user code.
    Parallel,
}

type CallbackFn<C> = Arc<dyn Fn(&C) + Send + Sync>;

struct ReceiverInner<M, C> {
    adapter: Adapter<M, C>,
    index_mask: u64,
    write_count: AtomicU64,
    read_count: AtomicU64,
    next_count: AtomicU64,
    flush_flag: AtomicBool,
    slots: Vec<Mutex<M>>,
    callback: Mutex<Option<(CallbackFn<C>, ExecutionPolicy)>>,
}

impl<M: Message, C: Send + 'static> RosterEntry for ReceiverInner<M, C> {
    fn deliver(&self, message: Box<dyn Any + Send>) {
        let message = *message
            .downcast::<M>()
            .unwrap_or_else(|_| panic!("topic type handle invariant violated on delivery"));

        let count = self.write_count.fetch_add(1, Ordering::Relaxed);
        let index = (count & self.index_mask) as usize;

        // Only pay the adapter's conversion cost when a callback is actually
        // registered; a receiver polled via latest()/next() converts lazily
        // on those calls instead.
        let callback_entry = self.callback.lock().unwrap().clone();

        let container = {
            let mut slot = self.slots[index].lock().unwrap();
            *slot = message;
            callback_entry.is_some().then(|| self.adapter.reverse(&slot))
        };

        self.read_count.store(count, Ordering::Release);
        self.flush_flag.store(false, Ordering::Release);
        self.read_count.notify_one();

        if let (Some((callback, policy)), Some(container)) = (callback_entry, container) {
            match policy {
                ExecutionPolicy::Inline => callback(&container),
                ExecutionPolicy::Parallel => {
                    std::thread::spawn(move || callback(&container));
                }
            }
        }
    }

    fn flush(&self) {
        let count = self.write_count.fetch_add(1, Ordering::Relaxed);
        self.flush_flag.store(true, Ordering::Release);
        self.read_count.store(count, Ordering::Release);
        self.read_count.notify_one();
    }
}

/// Round `requested` up to a power of two, rejecting anything below the
/// minimum of 4 (spec §4.4 ring sizing).
fn calculate_buffer_size(requested: usize) -> Result<usize> {
    if requested < 4 {
        return Err(Error::invalid_argument("the buffer size for a receiver must be at least 4"));
    }
    Ok(requested.next_power_of_two())
}

/// Bound to one topic; many receivers may share a topic. Owns a power-of-two
/// ring buffer, each slot guarded by its own mutex.
pub struct Receiver<M, C> {
    inner: Arc<ReceiverInner<M, C>>,
    roster_entry: Arc<dyn RosterEntry>,
    topic: Arc<Topic>,
    topic_info: TopicInfo,
}

impl<M: Message, C: Send + 'static> Receiver<M, C> {
    pub(crate) fn new(topic: Arc<Topic>, adapter: Adapter<M, C>, buffer_size: usize) -> Result<Self> {
        let size = calculate_buffer_size(buffer_size)?;
        let index_mask = (size - 1) as u64;

        let inner = Arc::new(ReceiverInner {
            adapter,
            index_mask,
            write_count: AtomicU64::new(0),
            read_count: AtomicU64::new(index_mask),
            next_count: AtomicU64::new(index_mask),
            flush_flag: AtomicBool::new(true),
            slots: (0..size).map(|_| Mutex::new(M::default())).collect(),
            callback: Mutex::new(None),
        });

        let roster_entry: Arc<dyn RosterEntry> = inner.clone();
        topic.add_receiver(roster_entry.clone());

        let topic_info = TopicInfo {
            name: topic.name.clone(),
            topic_hash: topic.topic_hash,
            type_handle: topic.type_handle,
        };

        Ok(Receiver {
            inner,
            roster_entry,
            topic,
            topic_info,
        })
    }

    pub fn topic_info(&self) -> &TopicInfo {
        &self.topic_info
    }

    pub fn buffer_size(&self) -> usize {
        (self.inner.index_mask + 1) as usize
    }

    /// Non-blocking. Fails with `topic_no_data` if the topic was flushed or
    /// never written.
    pub fn latest(&self) -> Result<C> {
        if self.inner.flush_flag.load(Ordering::Acquire) {
            return Err(Error::topic_no_data(format!("topic '{}' was flushed", self.topic.name)));
        }

        let index = (self.inner.read_count.load(Ordering::Acquire) & self.inner.index_mask) as usize;
        let slot = self.inner.slots[index].lock().unwrap();
        Ok(self.inner.adapter.reverse(&slot))
    }

    /// Whether a call to `next` would return immediately.
    pub fn new_data_available(&self) -> bool {
        self.inner.read_count.load(Ordering::Acquire) != self.inner.next_count.load(Ordering::Relaxed)
    }

    /// Blocks until a message strictly newer than the last one returned by
    /// `next` is available, consuming the move-adapter if one is set.
    pub fn next(&self) -> Result<C> {
        if self.inner.flush_flag.load(Ordering::Acquire) {
            return Err(Error::topic_no_data(format!("topic '{}' was flushed", self.topic.name)));
        }

        let next_count = self.inner.next_count.load(Ordering::Relaxed);
        loop {
            let current = self.inner.read_count.load(Ordering::Acquire);
            if current != next_count {
                break;
            }
            self.inner.read_count.wait(next_count);
        }

        if self.inner.flush_flag.load(Ordering::Acquire) {
            return Err(Error::topic_no_data(format!(
                "topic '{}' was flushed during wait",
                self.topic.name
            )));
        }

        let count = self.inner.read_count.load(Ordering::Acquire);
        let index = (count & self.inner.index_mask) as usize;

        let result = if self.inner.adapter.has_move() {
            let mut slot = self.inner.slots[index].lock().unwrap();
            let taken = std::mem::take(&mut *slot);
            self.inner
                .adapter
                .reverse_move(taken)
                .ok_or_else(|| Error::conversion("move adapter rejected the value"))?
        } else {
            let slot = self.inner.slots[index].lock().unwrap();
            self.inner.adapter.reverse(&slot)
        };

        self.inner.next_count.store(count, Ordering::Relaxed);
        Ok(result)
    }

    pub fn set_callback(&self, callback: impl Fn(&C) + Send + Sync + 'static, policy: ExecutionPolicy) {
        *self.inner.callback.lock().unwrap() = Some((Arc::new(callback), policy));
    }

    pub fn clear_callback(&self) {
        *self.inner.callback.lock().unwrap() = None;
    }
}

impl<M, C> Drop for Receiver<M, C> {
    fn drop(&mut self) {
        let _ = self.topic.remove_receiver(&self.roster_entry);
    }
}

/// Bound to one topic; at most one live sender per topic.
pub struct Sender<M, C> {
    adapter: Adapter<M, C>,
    topic: Arc<Topic>,
    token: crate::lbot::topic::SenderToken,
    topic_info: TopicInfo,
    plugins: Arc<PluginRegistry>,
    _marker: PhantomData<fn(M)>,
}

impl<M: Message, C> Sender<M, C> {
    pub(crate) fn new(topic: Arc<Topic>, plugins: Arc<PluginRegistry>, adapter: Adapter<M, C>) -> Result<Self> {
        let token = topic.add_sender()?;

        let topic_info = TopicInfo {
            name: topic.name.clone(),
            topic_hash: topic.topic_hash,
            type_handle: topic.type_handle,
        };

        plugins.announce(&topic_info);

        Ok(Sender {
            adapter,
            topic,
            token,
            topic_info,
            plugins,
            _marker: PhantomData,
        })
    }

    pub fn topic_info(&self) -> &TopicInfo {
        &self.topic_info
    }

    /// Copy-convert `container` into every receiver's next slot, then trace
    /// it to matching plugins.
    pub fn put(&self, container: &C) {
        let guard = self.topic.receivers();
        for entry in guard.iter() {
            let message = self.adapter.forward(container);
            entry.deliver(Box::new(message));
        }
        drop(guard);

        self.trace(container);
    }

    /// Zero-copy fast path. Requires exactly one consumer (a receiver or a
    /// matching plugin) and a registered move-adapter; otherwise falls back
    /// to `put` (logging a warning) or fails with a conversion error.
    pub fn move_put(&self, container: C) -> Result<()> {
        if !self.adapter.has_move() {
            return Err(Error::conversion("sender has no move adapter registered"));
        }

        let receiver_count = self.topic.receiver_count();
        let plugin_count = self.plugins.matching_count(self.topic_info.topic_hash);
        let total = receiver_count + plugin_count;

        if total != 1 {
            if total > 1 {
                tracing::warn!(
                    topic = %self.topic_info.name,
                    "move() is sending to multiple receivers or plugins, falling back to put()",
                );
                self.put(&container);
            }
            return Ok(());
        }

        if receiver_count == 1 {
            let guard = self.topic.receivers();
            let entry = guard.iter().next().expect("receiver_count was 1");
            let message = self.adapter.forward_move(container).expect("has_move checked above");
            entry.deliver(Box::new(message));
        } else {
            let message = self.adapter.forward_move(container).expect("has_move checked above");
            let serialized = message.serialize();
            self.plugins
                .dispatch_unique(&self.topic_info, Duration::from_secs(0), &serialized);
        }

        Ok(())
    }

    /// Advance every receiver past its next slot and mark it flushed; any
    /// blocked `next` call fails with `topic_no_data`.
    pub fn flush(&self) {
        self.topic.flush();
    }

    /// Provide `container` to matching plugins without publishing to any
    /// receiver.
    pub fn trace(&self, container: &C) {
        let topic_info = &self.topic_info;
        self.plugins.dispatch(topic_info, Duration::from_secs(0), || {
            self.adapter.forward(container).serialize()
        });
    }
}

impl<M, C> Drop for Sender<M, C> {
    fn drop(&mut self) {
        self.topic.flush();
        let _ = self.topic.remove_sender(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbot::message::TypeHandle;
    use crate::lbot::topic::TopicRegistry;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration as StdDuration;
    use test_env_log::test;

    #[derive(Default, Clone, PartialEq, Debug)]
    struct Num(i64);

    impl Message for Num {
        fn serialize(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }
    }

    fn make_pair(buffer_size: usize) -> (Sender<Num, Num>, Receiver<Num, Num>, Arc<TopicRegistry>) {
        let registry = Arc::new(TopicRegistry::new());
        let plugins = Arc::new(PluginRegistry::new());
        let topic = registry.get_or_create("/x", TypeHandle::of::<Num>()).unwrap();

        let sender = Sender::new(topic.clone(), plugins, Adapter::identity()).unwrap();
        let receiver = Receiver::new(topic, Adapter::identity(), buffer_size).unwrap();
        (sender, receiver, registry)
    }

    #[test]
    fn test_pair_fan_out() {
        let (sender, receiver, _registry) = make_pair(4);

        sender.put(&Num(10));
        assert_eq!(receiver.latest().unwrap(), Num(10));

        sender.put(&Num(5));
        assert_eq!(receiver.latest().unwrap(), Num(5));

        sender.flush();
        assert!(receiver.latest().is_err());

        sender.put(&Num(7));
        assert_eq!(receiver.latest().unwrap(), Num(7));
    }

    #[test]
    fn test_blocking_next_in_order() {
        let (sender, receiver, _registry) = make_pair(4);

        sender.put(&Num(10));
        sender.put(&Num(11));
        assert_eq!(receiver.next().unwrap(), Num(10));
        assert_eq!(receiver.next().unwrap(), Num(11));

        let handle = thread::spawn(move || receiver.next().unwrap());
        thread::sleep(StdDuration::from_millis(50));
        sender.put(&Num(12));

        assert_eq!(handle.join().unwrap(), Num(12));
    }

    #[test]
    fn test_ordered_stress() {
        let (sender, receiver, _registry) = make_pair(4);
        let total = 1_000_000i64;

        let publisher = thread::spawn(move || {
            for i in 1..=total {
                sender.put(&Num(i));
            }
        });

        let mut last = 0i64;
        while last < total {
            let Num(value) = receiver.next().unwrap();
            assert!(value > last, "next() must strictly progress");
            last = value;
        }

        publisher.join().unwrap();
    }

    #[test]
    fn test_flush_unblocks_waiting_next() {
        let (sender, receiver, _registry) = make_pair(4);
        let handle = thread::spawn(move || receiver.next());
        thread::sleep(StdDuration::from_millis(50));
        sender.flush();
        assert!(handle.join().unwrap().is_err());
    }

    #[derive(Clone)]
    struct BytesContainer(Vec<u8>);

    #[derive(Default)]
    struct BytesMessage(Vec<u8>);

    impl Message for BytesMessage {
        fn serialize(&self) -> Vec<u8> {
            self.0.clone()
        }
    }

    #[test]
    fn test_move_fast_path_leaves_source_empty() {
        let registry = Arc::new(TopicRegistry::new());
        let plugins = Arc::new(PluginRegistry::new());
        let topic = registry.get_or_create("/bytes", TypeHandle::of::<BytesMessage>()).unwrap();

        let adapter = Adapter::<BytesMessage, BytesContainer>::new(
            |c: &BytesContainer| BytesMessage(c.0.clone()),
            |m: &BytesMessage| BytesContainer(m.0.clone()),
        )
        .with_move(
            |c: BytesContainer| BytesMessage(c.0),
            |m: BytesMessage| BytesContainer(m.0),
        );

        let sender = Sender::new(topic.clone(), plugins, adapter).unwrap();
        let receiver_adapter = Adapter::<BytesMessage, BytesContainer>::new(
            |c: &BytesContainer| BytesMessage(c.0.clone()),
            |m: &BytesMessage| BytesContainer(m.0.clone()),
        )
        .with_move(
            |c: BytesContainer| BytesMessage(c.0),
            |m: BytesMessage| BytesContainer(m.0),
        );
        let receiver = Receiver::new(topic, receiver_adapter, 4).unwrap();

        let payload = vec![7u8; 10_000_000];
        let expected_len = payload.len();
        let mut source = BytesContainer(payload.clone());

        sender.move_put(std::mem::replace(&mut source, BytesContainer(Vec::new()))).unwrap();
        assert!(source.0.is_empty());

        let received = receiver.next().unwrap();
        assert_eq!(received.0.len(), expected_len);
        assert_eq!(received.0[0], 7);
    }

    #[test]
    fn test_move_falls_back_to_put_with_multiple_receivers() {
        let registry = Arc::new(TopicRegistry::new());
        let plugins = Arc::new(PluginRegistry::new());
        let topic = registry.get_or_create("/x", TypeHandle::of::<Num>()).unwrap();

        let sender = Sender::new(topic.clone(), plugins, Adapter::identity()).unwrap();
        let r1 = Receiver::new(topic.clone(), Adapter::identity(), 4).unwrap();
        let r2 = Receiver::new(topic, Adapter::identity(), 4).unwrap();

        sender.move_put(Num(9)).unwrap();
        assert_eq!(r1.latest().unwrap(), Num(9));
        assert_eq!(r2.latest().unwrap(), Num(9));
    }

    #[test]
    fn test_callback_inline_runs_before_put_returns() {
        let (sender, receiver, _registry) = make_pair(4);
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();

        receiver.set_callback(
            move |Num(v)| {
                seen2.store(*v as u32, Ordering::SeqCst);
            },
            ExecutionPolicy::Inline,
        );

        sender.put(&Num(42));
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_at_least_four_buffer_size_enforced() {
        let registry = Arc::new(TopicRegistry::new());
        let topic = registry.get_or_create("/x", TypeHandle::of::<Num>()).unwrap();
        assert!(Receiver::<Num, Num>::new(topic, Adapter::identity(), 2).is_err());
    }

    #[test]
    fn test_buffer_size_rounds_up_to_power_of_two() {
        let registry = Arc::new(TopicRegistry::new());
        let topic = registry.get_or_create("/x", TypeHandle::of::<Num>()).unwrap();
        let receiver = Receiver::<Num, Num>::new(topic, Adapter::identity(), 5).unwrap();
        assert_eq!(receiver.buffer_size(), 8);
    }
}
