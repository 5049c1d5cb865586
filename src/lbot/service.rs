//! The service registry: at-most-one-server-per-name discipline, and
//! `Client::call_async`/`call_sync`/`call_sync_timeout` (spec §3, §4.6).
//!
//! Grounded on `service.hpp`/`service.cpp`'s `ServiceMap`/`ServiceMap::Service`
//! (the reader-count drain on add/remove) and `node.hpp`'s
//! `Server`/`Client::callAsync`/`callSync` (a detached task completing a
//! future, `service-unavailable` when no server is installed).

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lbot::common::{wait_until_zero, Error, Result};
use crate::lbot::message::ServiceHandle;

type Handler<Req, Resp> = Arc<dyn Fn(&Req) -> Resp + Send + Sync>;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ServerToken(u64);

impl ServerToken {
    fn issue() -> Self {
        ServerToken(NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

struct ServiceChangeGuard<'a> {
    service: &'a Service,
}

impl<'a> ServiceChangeGuard<'a> {
    fn acquire(service: &'a Service) -> Self {
        while service.change_flag.swap(true, Ordering::AcqRel) {
            service.change_flag.wait(true);
        }
        wait_until_zero(&service.use_count);
        ServiceChangeGuard { service }
    }
}

impl Drop for ServiceChangeGuard<'_> {
    fn drop(&mut self) {
        self.service.change_flag.store(false, Ordering::Release);
        self.service.change_flag.notify_all();
    }
}

/// A reader guard on a service's server slot, held for the duration of one
/// call. While any guard is outstanding, `add_server`/`remove_server` block.
pub struct ServerGuard<'a, Req, Resp> {
    service: &'a Service,
    handler: Handler<Req, Resp>,
}

impl<Req, Resp> ServerGuard<'_, Req, Resp> {
    pub fn call(&self, request: &Req) -> Resp {
        (self.handler)(request)
    }
}

impl<Req, Resp> Drop for ServerGuard<'_, Req, Resp> {
    fn drop(&mut self) {
        self.service.use_count.fetch_sub(1, Ordering::AcqRel);
        self.service.use_count.notify_all();
    }
}

/// A named, typed request/response endpoint. At most one live server.
pub struct Service {
    pub name: String,
    pub handle: ServiceHandle,
    change_flag: AtomicBool,
    use_count: AtomicUsize,
    server: UnsafeCell<Option<(ServerToken, Box<dyn Any + Send + Sync>)>>,
}

unsafe impl Sync for Service {}
unsafe impl Send for Service {}

impl Service {
    fn new(handle: ServiceHandle, name: String) -> Self {
        Service {
            name,
            handle,
            change_flag: AtomicBool::new(false),
            use_count: AtomicUsize::new(0),
            server: UnsafeCell::new(None),
        }
    }

    pub fn add_server<Req: 'static, Resp: 'static>(&self, handler: Handler<Req, Resp>) -> Result<ServerToken> {
        let _guard = ServiceChangeGuard::acquire(self);
        let slot = unsafe { &mut *self.server.get() };
        if slot.is_some() {
            return Err(Error::management(format!(
                "a server has already been registered for service '{}'",
                self.name
            )));
        }
        let token = ServerToken::issue();
        *slot = Some((token, Box::new(handler)));
        Ok(token)
    }

    pub fn remove_server(&self, token: ServerToken) -> Result<()> {
        let _guard = ServiceChangeGuard::acquire(self);
        let slot = unsafe { &mut *self.server.get() };
        match slot {
            Some((existing, _)) if *existing == token => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::management(format!(
                "the server to be removed does not match the existing server on '{}'",
                self.name
            ))),
        }
    }

    pub fn get_server<Req: 'static, Resp: 'static>(&self) -> Option<ServerGuard<'_, Req, Resp>> {
        loop {
            self.use_count.fetch_add(1, Ordering::AcqRel);
            if !self.change_flag.load(Ordering::Acquire) {
                break;
            }
            self.use_count.fetch_sub(1, Ordering::AcqRel);
            self.use_count.notify_all();
            self.change_flag.wait(true);
        }

        let handler = unsafe { &*self.server.get() }
            .as_ref()
            .and_then(|(_, boxed)| boxed.downcast_ref::<Handler<Req, Resp>>())
            .cloned();

        match handler {
            Some(handler) => Some(ServerGuard { service: self, handler }),
            None => {
                self.use_count.fetch_sub(1, Ordering::AcqRel);
                self.use_count.notify_all();
                None
            }
        }
    }
}

/// Thread-safe name→service map.
#[derive(Default)]
pub struct ServiceRegistry {
    map: Mutex<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    pub fn get_or_create(&self, name: &str, handle: ServiceHandle) -> Result<Arc<Service>> {
        let mut map = self.map.lock().unwrap();
        if let Some(existing) = map.get(name) {
            if existing.handle != handle {
                return Err(Error::management(format!(
                    "service '{name}' does not match the provided type handle"
                )));
            }
            return Ok(existing.clone());
        }

        let service = Arc::new(Service::new(handle, name.to_string()));
        map.insert(name.to_string(), service.clone());
        Ok(service)
    }
}

/// A handle used to invoke the current server under a service name.
pub struct Client<Req, Resp> {
    service: Arc<Service>,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

/// The pending result of one `call_async` invocation.
pub struct CallHandle<Resp> {
    receiver: mpsc::Receiver<Result<Resp>>,
}

impl<Resp> CallHandle<Resp> {
    pub fn get(self) -> Result<Resp> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(Error::service_unavailable("server task terminated without a response")))
    }

    pub fn get_timeout(self, timeout: Duration) -> Result<Resp> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => Err(Error::service_timeout("service took too long to respond")),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> Client<Req, Resp> {
    pub(crate) fn new(service: Arc<Service>) -> Self {
        Client {
            service,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    /// Invoke the current server in a detached thread. Does not block.
    pub fn call_async(&self, request: Req) -> CallHandle<Resp> {
        let (tx, rx) = mpsc::channel();
        let service = self.service.clone();

        std::thread::spawn(move || {
            let result = match service.get_server::<Req, Resp>() {
                Some(guard) => std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| guard.call(&request)))
                    .map_err(|_| Error::management("service handler panicked")),
                None => Err(Error::service_unavailable(format!("service '{}' is not available", service.name))),
            };
            let _ = tx.send(result);
        });

        CallHandle { receiver: rx }
    }

    pub fn call_sync(&self, request: Req) -> Result<Resp> {
        self.call_async(request).get()
    }

    pub fn call_sync_timeout(&self, request: Req, timeout: Duration) -> Result<Resp> {
        self.call_async(request).get_timeout(timeout)
    }
}

/// Holds a handler registered under one service name; removal on drop.
pub struct Server<Req, Resp> {
    service: Arc<Service>,
    token: ServerToken,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req: 'static, Resp: 'static> Server<Req, Resp> {
    pub(crate) fn new(service: Arc<Service>, handler: impl Fn(&Req) -> Resp + Send + Sync + 'static) -> Result<Self> {
        let token = service.add_server::<Req, Resp>(Arc::new(handler))?;
        Ok(Server {
            service,
            token,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }
}

impl<Req, Resp> Drop for Server<Req, Resp> {
    fn drop(&mut self) {
        let _ = self.service.remove_server(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;
    use test_env_log::test;

    fn make_pair(handler: impl Fn(&u32) -> u32 + Send + Sync + 'static) -> (Server<u32, u32>, Client<u32, u32>) {
        let registry = ServiceRegistry::new();
        let handle = ServiceHandle::of::<u32, u32>();
        let service = registry.get_or_create("/add_one", handle).unwrap();
        let server = Server::new(service.clone(), handler).unwrap();
        let client = Client::new(service);
        (server, client)
    }

    #[test]
    fn test_call_sync_roundtrip() {
        let (_server, client) = make_pair(|req: &u32| req + 1);
        assert_eq!(client.call_sync(41).unwrap(), 42);
    }

    #[test]
    fn test_at_most_one_server() {
        let registry = ServiceRegistry::new();
        let handle = ServiceHandle::of::<u32, u32>();
        let service = registry.get_or_create("/x", handle).unwrap();
        let _first = Server::new(service.clone(), |r: &u32| *r).unwrap();
        assert!(Server::new(service, |r: &u32| *r).is_err());
    }

    #[test]
    fn test_call_without_server_is_service_unavailable() {
        let registry = ServiceRegistry::new();
        let handle = ServiceHandle::of::<u32, u32>();
        let service = registry.get_or_create("/x", handle).unwrap();
        let client: Client<u32, u32> = Client::new(service);
        let err = client.call_sync(1).unwrap_err();
        assert!(matches!(err.kind(), crate::lbot::common::ErrorKind::ServiceUnavailable(_)));
    }

    #[test]
    fn test_call_sync_timeout_expires() {
        let (_server, client) = make_pair(|req: &u32| {
            thread::sleep(StdDuration::from_secs(2));
            *req
        });

        let err = client.call_sync_timeout(1, StdDuration::from_millis(100)).unwrap_err();
        assert!(matches!(err.kind(), crate::lbot::common::ErrorKind::ServiceTimeout(_)));
    }

    #[test]
    fn test_removed_server_rejects_subsequent_calls() {
        let registry = ServiceRegistry::new();
        let handle = ServiceHandle::of::<u32, u32>();
        let service = registry.get_or_create("/x", handle).unwrap();
        let server = Server::new(service.clone(), |r: &u32| *r).unwrap();
        let client: Client<u32, u32> = Client::new(service);

        assert_eq!(client.call_sync(7).unwrap(), 7);
        drop(server);
        assert!(client.call_sync(7).is_err());
    }
}
