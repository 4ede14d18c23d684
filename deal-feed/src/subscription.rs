//! One long-lived push-event connection that keeps itself alive.
//!
//! A single driver task owns the connection. It dials, dispatches events to the
//! registered handlers while the connection is open, and after a failure sleeps
//! for the backoff delay before dialing again. Because there is only ever one
//! driver, there is only ever one pending reconnect.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::StreamExt;
use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use indexmap::IndexMap;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::sse::ServerEvent;

pub type EventStream = LocalBoxStream<'static, Result<ServerEvent, TransportError>>;

/// Something that can dial the push-event endpoint.
///
/// `open` failing and the returned stream ending or erroring are all treated the
/// same way: the connection is gone and will be re-dialed.
pub trait EventTransport {
    fn open(&self) -> LocalBoxFuture<'static, Result<EventStream, TransportError>>;
}

/// Handlers are compared by `Rc` identity, so register a clone of the same `Rc`
/// to remove it later.
pub type EventHandler = Rc<dyn Fn(&ServerEvent)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    TornDown,
}

/// Cheap to clone; all clones drive the same connection. The connection is torn
/// down by [`StreamSubscription::close`] or when the last clone is dropped.
///
/// Must be created inside a `tokio::task::LocalSet`.
#[derive(Clone)]
pub struct StreamSubscription {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    state: ConnectionState,
    attempt: u32,
    // event name -> handlers, in registration order
    handlers: IndexMap<String, Vec<EventHandler>>,
    transport: Rc<dyn EventTransport>,
    backoff: Backoff,
    auto_reconnect: bool,
    driver: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Inner {
    fn handler_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

impl StreamSubscription {
    /// Start dialing immediately.
    pub fn connect(transport: Rc<dyn EventTransport>, backoff: Backoff, auto_reconnect: bool) -> Self {
        let subscription = Self {
            inner: Rc::new(RefCell::new(Inner {
                state: ConnectionState::Connecting,
                attempt: 0,
                handlers: IndexMap::new(),
                transport,
                backoff,
                auto_reconnect,
                driver: None,
            })),
        };
        subscription.spawn_driver();
        subscription
    }

    /// Register `handler` for events named `event`. Handlers added while the
    /// connection is still being dialed start receiving events once it opens.
    /// Adding the same handler twice has no effect.
    pub fn add_handler(&self, event: &str, handler: EventHandler) {
        let mut inner = self.inner.borrow_mut();
        let handlers = inner.handlers.entry(event.to_string()).or_default();
        if !handlers.iter().any(|h| Rc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
    }

    pub fn remove_handler(&self, event: &str, handler: &EventHandler) {
        let mut inner = self.inner.borrow_mut();
        let Some(handlers) = inner.handlers.get_mut(event) else {
            return;
        };
        handlers.retain(|h| !Rc::ptr_eq(h, handler));
        if handlers.is_empty() {
            inner.handlers.shift_remove(event);
        }
    }

    /// Tear the connection down for good and cancel any pending reconnect.
    pub fn close(&self) {
        let driver = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ConnectionState::TornDown {
                return;
            }
            inner.state = ConnectionState::TornDown;
            inner.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        log::debug!("Event stream torn down");
    }

    /// Drop the current connection (or pending reconnect) and dial again right
    /// away, without waiting out the backoff.
    pub fn reconnect(&self) {
        let driver = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ConnectionState::TornDown {
                log::warn!("Ignoring reconnect on a closed event stream");
                return;
            }
            inner.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        self.spawn_driver();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    /// Failed connection attempts since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.borrow().attempt
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner.borrow().handlers.get(event).map_or(0, Vec::len)
    }

    fn spawn_driver(&self) {
        self.inner.borrow_mut().state = ConnectionState::Connecting;
        let driver = tokio::task::spawn_local(drive(Rc::downgrade(&self.inner)));
        self.inner.borrow_mut().driver = Some(driver);
    }
}

// Borrows are kept to these short closures; none is held across an await or a
// handler call.
fn with_inner<T>(inner: &Weak<RefCell<Inner>>, f: impl FnOnce(&mut Inner) -> T) -> Option<T> {
    let inner = inner.upgrade()?;
    let mut inner = inner.borrow_mut();
    Some(f(&mut inner))
}

async fn drive(inner: Weak<RefCell<Inner>>) {
    loop {
        let Some(transport) = with_inner(&inner, |i| {
            i.state = ConnectionState::Connecting;
            Rc::clone(&i.transport)
        }) else {
            return;
        };

        match transport.open().await {
            Ok(mut events) => {
                let Some(attached) = with_inner(&inner, |i| {
                    i.state = ConnectionState::Open;
                    i.attempt = 0;
                    i.handler_count()
                }) else {
                    return;
                };
                log::info!("Event stream open, {attached} handler(s) attached");

                loop {
                    match events.next().await {
                        Some(Ok(event)) => {
                            if !dispatch(&inner, &event) {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            log::warn!("Event stream failed: {e}");
                            break;
                        }
                        None => {
                            log::warn!("Event stream closed by the server");
                            break;
                        }
                    }
                }
            }
            Err(e) => log::warn!("Could not open event stream: {e}"),
        }

        let Some(retry) = with_inner(&inner, |i| {
            i.state = ConnectionState::Closed;
            if !i.auto_reconnect {
                return None;
            }
            let delay = i.backoff.next_delay(i.attempt);
            i.attempt += 1;
            Some((delay, i.attempt))
        }) else {
            return;
        };
        let Some((delay, attempt)) = retry else {
            log::info!("Event stream closed, automatic reconnect is off");
            return;
        };

        log::info!("Reconnecting event stream in {delay:?} (attempt {attempt})");
        tokio::time::sleep(delay).await;
    }
}

/// Hand `event` to its handlers. Returns false once this driver should stop,
/// which happens if a handler closed or re-dialed the subscription.
fn dispatch(inner: &Weak<RefCell<Inner>>, event: &ServerEvent) -> bool {
    let Some(handlers) = with_inner(inner, |i| {
        i.handlers.get(&event.event).cloned().unwrap_or_default()
    }) else {
        return false;
    };

    for handler in handlers {
        let still_open = with_inner(inner, |i| i.state == ConnectionState::Open).unwrap_or(false);
        if !still_open {
            return false;
        }
        handler(event);
    }

    with_inner(inner, |i| i.state == ConnectionState::Open).unwrap_or(false)
}
