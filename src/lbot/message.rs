//! Message identity and the conversion adapter layer (spec §3, §4.8, §9).
//!
//! Every type that flows through a topic or service implements [`Message`],
//! which gives it a collision-free [`TypeHandle`] — Rust's `TypeId` replaces
//! the original's `typeid(T).hash_code()` identity check. Endpoints are
//! parameterized over `(MessageType, ContainerType)`; rather than the
//! template-specialization zoo the original uses to bridge raw messages,
//! wrapped messages, and user containers, the adapter between them is simply
//! a pair of boxed closures stored inside the endpoint (see [`Adapter`]).

use std::any::TypeId;
use std::fmt;

/// Opaque identity of a message type, fixed for the lifetime of a topic.
/// Two registrations on the same topic name must present the same handle or
/// the registration fails (spec invariant: "the type handle is fixed at
/// first registration").
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TypeHandle(TypeId);

impl fmt::Debug for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TypeHandle({:?})", self.0)
    }
}

/// Combined identity for a service: request and response types folded
/// together, mirroring the original's `typeid(Req).hash_code() ^
/// typeid(Resp).hash_code()`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ServiceHandle(TypeHandle, TypeHandle);

impl ServiceHandle {
    pub fn of<Req: 'static, Resp: 'static>() -> Self {
        ServiceHandle(TypeHandle::of::<Req>(), TypeHandle::of::<Resp>())
    }
}

impl TypeHandle {
    pub fn of<M: 'static>() -> Self {
        TypeHandle(TypeId::of::<M>())
    }
}

/// A message flowing through the fabric. `Default` gives ring slots an
/// initial value before the first `put`; `serialize` feeds the plugin trace
/// path, which builds the wire bytes lazily the first time a plugin matches.
pub trait Message: Send + Default + 'static {
    fn serialize(&self) -> Vec<u8>;

    fn type_handle() -> TypeHandle
    where
        Self: Sized,
    {
        TypeHandle::of::<Self>()
    }
}

/// The conversion adapter bridging a sender/receiver's external
/// `ContainerType` and the canonical `MessageType` stored in ring slots.
/// `to_message`/`to_container` are the copying forward/reverse adapters used
/// by `put`/`latest`/`next`; `move_to_message`/`move_to_container` are the
/// optional move variants required for the zero-copy fast path (spec §4.3,
/// §4.8). Adapter absence on the move path is a conversion error.
pub struct Adapter<M, C> {
    to_message: Box<dyn Fn(&C) -> M + Send + Sync>,
    to_container: Box<dyn Fn(&M) -> C + Send + Sync>,
    move_to_message: Option<Box<dyn Fn(C) -> M + Send + Sync>>,
    move_to_container: Option<Box<dyn Fn(M) -> C + Send + Sync>>,
}

impl<M, C> Adapter<M, C> {
    pub fn new(
        to_message: impl Fn(&C) -> M + Send + Sync + 'static,
        to_container: impl Fn(&M) -> C + Send + Sync + 'static,
    ) -> Self {
        Adapter {
            to_message: Box::new(to_message),
            to_container: Box::new(to_container),
            move_to_message: None,
            move_to_container: None,
        }
    }

    /// Register the move adapter pair required to use `Sender::move_put` and
    /// to get move semantics out of `Receiver::next`.
    pub fn with_move(
        mut self,
        move_to_message: impl Fn(C) -> M + Send + Sync + 'static,
        move_to_container: impl Fn(M) -> C + Send + Sync + 'static,
    ) -> Self {
        self.move_to_message = Some(Box::new(move_to_message));
        self.move_to_container = Some(Box::new(move_to_container));
        self
    }

    pub fn forward(&self, container: &C) -> M {
        (self.to_message)(container)
    }

    pub fn reverse(&self, message: &M) -> C {
        (self.to_container)(message)
    }

    pub fn has_move(&self) -> bool {
        self.move_to_message.is_some()
    }

    pub fn forward_move(&self, container: C) -> Option<M> {
        self.move_to_message.as_ref().map(|f| f(container))
    }

    /// Consume an owned slot value (typically lifted out of a ring slot with
    /// `std::mem::take`, leaving `M::default()` behind) and convert it into a
    /// container without copying.
    pub fn reverse_move(&self, message: M) -> Option<C> {
        self.move_to_container.as_ref().map(|f| f(message))
    }
}

impl<M: Clone + Default + 'static> Adapter<M, M> {
    /// The identity adapter for a sender/receiver where the container *is*
    /// the message type, equivalent to the original's
    /// `defaultSenderConversionFunction`/`defaultReceiverConversionFunction`.
    pub fn identity() -> Self {
        Adapter::new(|m: &M| m.clone(), |m: &M| m.clone()).with_move(|m: M| m, |m: M| m)
    }
}

/// Information about a topic handed to plugins on topic-announce and with
/// every message callback.
#[derive(Clone, Debug)]
pub struct TopicInfo {
    pub name: String,
    pub topic_hash: u64,
    pub type_handle: TypeHandle,
}

/// The plugin-facing view of a single message (spec §3, §6).
pub struct MessageInfo<'a> {
    pub topic: &'a TopicInfo,
    pub timestamp: std::time::Duration,
    pub serialized: &'a [u8],
}
