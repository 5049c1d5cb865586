//! The time subsystem: system/steady/custom modes, a waiter queue for
//! threads blocked on a future point in custom time, and the `/time` node
//! every manager constructs automatically (spec §3, §4.7).
//!
//! Grounded on `clock.hpp`/`clock.cpp`: `Clock::now`, `Clock::setTime`,
//! `Clock::registerWaiter` and the priority queue of pending waiters, woken
//! in wakeup-time order as custom time advances. `Clock::initialize` always
//! builds a node on `/time` — a 10ms-cadence sender in `System`/`Steady`
//! mode, a receiver that calls `setTime` on each inbound message in `Custom`
//! mode — mirrored here by [`TimeNode`] over [`TimeMessage`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strum::{Display, EnumString};

use crate::lbot::channel::{Receiver, Sender};
use crate::lbot::common::{Error, Result};
use crate::lbot::message::{Adapter, Message};
use crate::lbot::node::{Node, NodeHandle};

/// A point in lbot time, always expressed as a duration since some origin
/// fixed at clock initialization (the Unix epoch for `System`, an arbitrary
/// instant for `Steady`, and the publisher's own choice for `Custom`).
pub type Timestamp = Duration;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ClockMode {
    System,
    Steady,
    Custom,
}

impl ClockMode {
    /// Parse a mode name from configuration, e.g. `/lbot/clock_mode`.
    /// Wraps the `strum`-derived `FromStr` to produce the fabric's own error
    /// type instead of `strum::ParseError`.
    pub fn parse(name: &str) -> Result<Self> {
        name.parse().map_err(|_| Error::invalid_argument(format!("invalid clock mode '{name}'")))
    }
}

/// A thread parked waiting for custom time to reach `wakeup_time`. Dropped
/// from the queue once fired, either by `set_time` crossing its deadline or
/// by `cleanup` on shutdown (in which case the wait still returns, just
/// without the deadline having truly elapsed — callers must recheck).
struct Waiter {
    wakeup_time: Timestamp,
    fired: AtomicBool,
}

impl Waiter {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.fired.notify_all();
    }
}

/// A handle returned by [`Clock::register_waiter`]; block on it with
/// [`WaiterRegistration::wait`].
pub struct WaiterRegistration {
    inner: Arc<Waiter>,
}

impl WaiterRegistration {
    pub fn wait(&self) {
        while !self.inner.fired.load(Ordering::Acquire) {
            self.inner.fired.wait(false);
        }
    }
}

struct HeapEntry(Arc<Waiter>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.wakeup_time == other.0.wakeup_time
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the earliest wakeup time sits at the top of the heap.
        other.0.wakeup_time.cmp(&self.0.wakeup_time)
    }
}

/// The time authority shared by every node. One instance per manager.
pub struct Clock {
    mode: ClockMode,
    current_time: AtomicU64,
    steady_origin: std::time::Instant,
    exit_flag: AtomicBool,
    waiters: Mutex<BinaryHeap<HeapEntry>>,
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        Clock {
            mode,
            current_time: AtomicU64::new(0),
            steady_origin: std::time::Instant::now(),
            exit_flag: AtomicBool::new(false),
            waiters: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn now(&self) -> Timestamp {
        match self.mode {
            ClockMode::System => SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default(),
            ClockMode::Steady => self.steady_origin.elapsed(),
            ClockMode::Custom => Duration::from_nanos(self.current_time.load(Ordering::Acquire)),
        }
    }

    /// Advance custom time and wake every waiter whose deadline has passed.
    /// Only meaningful in `Custom` mode; callers in other modes should not
    /// call this, but it is not itself mode-gated to keep `ReceiverNode`'s
    /// incoming `/time` callback simple.
    pub fn set_time(&self, time: Timestamp) -> Result<()> {
        let previous = Duration::from_nanos(self.current_time.load(Ordering::Relaxed));
        if time < previous {
            return Err(Error::clock("updated time is in the past"));
        }

        self.current_time.store(time.as_nanos() as u64, Ordering::SeqCst);

        let mut waiters = self.waiters.lock()?;
        while let Some(HeapEntry(top)) = waiters.peek() {
            if top.wakeup_time > time {
                break;
            }
            top.fire();
            waiters.pop();
        }

        Ok(())
    }

    /// Register a wakeup for `wakeup_time`. Returns `None` if the deadline
    /// has already passed or the clock has been shut down, signaling the
    /// caller should proceed immediately rather than block.
    pub fn register_waiter(&self, wakeup_time: Timestamp) -> Option<WaiterRegistration> {
        let mut waiters = self.waiters.lock().ok()?;

        let current = Duration::from_nanos(self.current_time.load(Ordering::Acquire));
        if wakeup_time <= current || self.exit_flag.load(Ordering::Acquire) {
            return None;
        }

        let waiter = Arc::new(Waiter {
            wakeup_time,
            fired: AtomicBool::new(false),
        });
        waiters.push(HeapEntry(waiter.clone()));
        Some(WaiterRegistration { inner: waiter })
    }

    /// Block the calling thread until `deadline`. In `System`/`Steady` mode
    /// this is a plain sleep; in `Custom` mode it waits for `set_time` to
    /// cross the deadline (or for shutdown).
    pub fn sleep_until(&self, deadline: Timestamp) {
        match self.mode {
            ClockMode::System | ClockMode::Steady => {
                let now = self.now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
            }
            ClockMode::Custom => {
                if let Some(waiter) = self.register_waiter(deadline) {
                    waiter.wait();
                }
            }
        }
    }

    pub fn sleep_for(&self, duration: Duration) {
        self.sleep_until(self.now() + duration);
    }

    /// Mark the clock as shutting down and wake every pending waiter so no
    /// thread stays parked past manager teardown. Mirrors `Clock::cleanup`.
    pub fn shutdown(&self) {
        self.exit_flag.store(true, Ordering::SeqCst);

        if self.mode == ClockMode::Custom {
            let mut waiters = self.waiters.lock().unwrap();
            while let Some(HeapEntry(top)) = waiters.pop() {
                top.fire();
            }
        }
    }
}

/// The payload published on `/time` in `System`/`Steady` mode and consumed
/// from it in `Custom` mode, carrying one [`Timestamp`].
#[derive(Clone, Default)]
pub struct TimeMessage(pub Timestamp);

impl Message for TimeMessage {
    fn serialize(&self) -> Vec<u8> {
        self.0.as_nanos().to_le_bytes().to_vec()
    }
}

/// How often the `/time` sender publishes in `System`/`Steady` mode.
const TIME_NODE_PERIOD: Duration = Duration::from_millis(10);

/// The node every manager constructs on `/time` at startup. In `System` and
/// `Steady` mode it publishes the clock's own time every 10ms; in `Custom`
/// mode it subscribes instead, advancing the clock via `set_time` on each
/// inbound message. A unique node: exactly one instance runs per process.
pub struct TimeNode {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Node for TimeNode {
    const UNIQUE: bool = true;
}

impl TimeNode {
    pub fn new(env: NodeHandle) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let thread = match env.clock().mode() {
            ClockMode::System | ClockMode::Steady => {
                let sender: Sender<TimeMessage, TimeMessage> = env.add_sender("/time", Adapter::identity())?;
                let clock = env.clock().clone();
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        sender.put(&TimeMessage(clock.now()));
                        std::thread::sleep(TIME_NODE_PERIOD);
                    }
                })
            }
            ClockMode::Custom => {
                let receiver: Receiver<TimeMessage, TimeMessage> = env.add_receiver("/time", Adapter::identity(), 4)?;
                let clock = env.clock().clone();
                std::thread::spawn(move || {
                    while let Ok(TimeMessage(time)) = receiver.next() {
                        let _ = clock.set_time(time);
                    }
                })
            }
        };

        Ok(TimeNode { stop, thread: Some(thread) })
    }
}

impl Drop for TimeNode {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;
    use test_env_log::test;

    #[test]
    fn test_parse_mode() {
        assert_eq!(ClockMode::parse("system").unwrap(), ClockMode::System);
        assert_eq!(ClockMode::parse("steady").unwrap(), ClockMode::Steady);
        assert_eq!(ClockMode::parse("custom").unwrap(), ClockMode::Custom);
        assert!(ClockMode::parse("nonsense").is_err());
        assert_eq!(ClockMode::Custom.to_string(), "custom");
    }

    #[test]
    fn test_system_mode_now_advances() {
        let clock = Clock::new(ClockMode::System);
        let first = clock.now();
        thread::sleep(StdDuration::from_millis(5));
        assert!(clock.now() > first);
    }

    #[test]
    fn test_steady_mode_now_advances() {
        let clock = Clock::new(ClockMode::Steady);
        let first = clock.now();
        thread::sleep(StdDuration::from_millis(5));
        assert!(clock.now() > first);
    }

    #[test]
    fn test_custom_mode_starts_at_zero_and_holds() {
        let clock = Clock::new(ClockMode::Custom);
        assert_eq!(clock.now(), Duration::ZERO);
        thread::sleep(StdDuration::from_millis(5));
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_set_time_rejects_regression() {
        let clock = Clock::new(ClockMode::Custom);
        clock.set_time(Duration::from_secs(10)).unwrap();
        let err = clock.set_time(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err.kind(), crate::lbot::common::ErrorKind::Clock(_)));
    }

    #[test]
    fn test_register_waiter_fires_on_set_time() {
        let clock = Arc::new(Clock::new(ClockMode::Custom));
        let waiting_clock = clock.clone();

        let handle = thread::spawn(move || {
            waiting_clock.sleep_until(Duration::from_secs(5));
        });

        thread::sleep(StdDuration::from_millis(20));
        clock.set_time(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_register_waiter_returns_none_past_deadline() {
        let clock = Clock::new(ClockMode::Custom);
        clock.set_time(Duration::from_secs(10)).unwrap();
        assert!(clock.register_waiter(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn test_shutdown_wakes_pending_waiters() {
        let clock = Arc::new(Clock::new(ClockMode::Custom));
        let waiting_clock = clock.clone();

        let handle = thread::spawn(move || {
            waiting_clock.sleep_until(Duration::from_secs(60));
        });

        thread::sleep(StdDuration::from_millis(20));
        clock.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_waiters_fire_in_wakeup_order() {
        let clock = Clock::new(ClockMode::Custom);
        let order = Mutex::new(Vec::new());

        thread::scope(|scope| {
            for (label, deadline) in [(3, 30), (1, 10), (2, 20)] {
                let waiter = clock.register_waiter(Duration::from_millis(deadline)).unwrap();
                let order = &order;
                scope.spawn(move || {
                    waiter.wait();
                    order.lock().unwrap().push(label);
                });
            }

            thread::sleep(StdDuration::from_millis(20));
            clock.set_time(Duration::from_millis(40)).unwrap();
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    fn node_environment(clock: Arc<Clock>) -> NodeHandle {
        use crate::lbot::plugin::PluginRegistry;
        use crate::lbot::service::ServiceRegistry;
        use crate::lbot::topic::TopicRegistry;

        NodeHandle::new(
            "time_node".to_string(),
            Arc::new(TopicRegistry::new()),
            Arc::new(ServiceRegistry::new()),
            Arc::new(PluginRegistry::new()),
            clock,
        )
    }

    #[test]
    fn test_time_node_system_mode_publishes_periodically() {
        let clock = Arc::new(Clock::new(ClockMode::Steady));
        let env = node_environment(clock);

        let node = TimeNode::new(env.clone()).unwrap();
        let receiver: Receiver<TimeMessage, TimeMessage> = env.add_receiver("/time", Adapter::identity(), 4).unwrap();

        let TimeMessage(first) = receiver.next().unwrap();
        let TimeMessage(second) = receiver.next().unwrap();
        assert!(second >= first);

        drop(node);
    }

    #[test]
    fn test_time_node_custom_mode_advances_clock_from_time_topic() {
        let clock = Arc::new(Clock::new(ClockMode::Custom));
        let env = node_environment(clock.clone());

        let node = TimeNode::new(env.clone()).unwrap();
        let sender: Sender<TimeMessage, TimeMessage> = env.add_sender("/time", Adapter::identity()).unwrap();

        sender.put(&TimeMessage(Duration::from_secs(5)));

        let mut waited = StdDuration::ZERO;
        while clock.now() < Duration::from_secs(5) && waited < StdDuration::from_secs(1) {
            thread::sleep(StdDuration::from_millis(5));
            waited += StdDuration::from_millis(5);
        }
        assert_eq!(clock.now(), Duration::from_secs(5));

        drop(node);
    }
}
