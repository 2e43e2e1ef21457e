//! `WasmWsTransport`: the browser WebSocket channel to the relay.
//!
//! Grounded on `docsync-core::transport_ws::WsTransport` for the overall
//! shape (request/response correlation via a pending map, full-jitter
//! reconnect backoff, `on_push`/`on_connect` listener lists) but driven by
//! `web_sys::WebSocket`'s callback events instead of a polled
//! `tokio_tungstenite` stream, and built on `Rc`/`RefCell` since the
//! browser gives us exactly one thread.
//!
//! Does not implement [`docsync_core::Transport`]: that trait's
//! `on_push`/`on_connect` take `Box<dyn Fn(..) + Send + Sync>` unconditionally
//! (only the trait's own `async fn`s relax to `?Send` on wasm32), which a
//! single-threaded, `Rc`-closure-based transport cannot satisfy. Its only
//! generic callers (`DocSyncClient`, `ServerSync`) are native-only, so there
//! is no consumer this would need to satisfy anyway; this type exposes its
//! own inherent, non-`Send` API instead.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::channel::oneshot;
use serde::de::DeserializeOwned;
use serde::Serialize;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use docsync_core::error::TransportError;
use docsync_core::protocol::{ClientMessage, RequestId, RequestIdGenerator, ServerMessage};

const BASE_BACKOFF_MS: f64 = 200.0;
const MAX_BACKOFF_MS: f64 = 5_000.0;

/// `random(0, min(cap, base * 2^attempt))`, mirroring
/// `transport_ws::full_jitter_backoff` but in plain milliseconds since
/// `web_sys`'s timer APIs want an `i32` millisecond count, not a `Duration`.
pub(crate) fn full_jitter_backoff_ms(attempt: u32) -> f64 {
    let exp = BASE_BACKOFF_MS * 2f64.powi(attempt.min(32) as i32);
    let capped = exp.min(MAX_BACKOFF_MS).max(BASE_BACKOFF_MS);
    js_sys::Math::random() * capped
}

/// Resolves after `delay_ms` milliseconds, via `window.setTimeout`.
pub(crate) async fn sleep_ms(delay_ms: f64) {
    let promise = js_sys::Promise::new(&mut |resolve, _reject| {
        let window = web_sys::window().expect("no global `window`");
        let _ = window.set_timeout_with_callback_and_timeout_and_arguments_0(&resolve, delay_ms as i32);
    });
    let _ = wasm_bindgen_futures::JsFuture::from(promise).await;
}

type Pending<O, S> = HashMap<RequestId, oneshot::Sender<Result<ServerMessage<O, S>, TransportError>>>;

struct Inner<O, S> {
    url: String,
    socket: Option<WebSocket>,
    pending: Pending<O, S>,
    push_listeners: Vec<Rc<dyn Fn(ServerMessage<O, S>)>>,
    connect_listeners: Vec<Rc<dyn Fn()>>,
    attempt: u32,
    generation: u64,
    // Closures registered on the live socket must outlive it; dropping them
    // before the socket does detaches the handler.
    _onopen: Option<Closure<dyn FnMut()>>,
    _onmessage: Option<Closure<dyn FnMut(MessageEvent)>>,
    _onclose: Option<Closure<dyn FnMut(CloseEvent)>>,
    _onerror: Option<Closure<dyn FnMut(ErrorEvent)>>,
}

/// Connects to exactly one relay URL, re-dialing with full-jitter backoff on
/// any close or error. Construct with [`WasmWsTransport::connect`], which
/// starts the first connection attempt immediately.
pub struct WasmWsTransport<O, S> {
    inner: RefCell<Inner<O, S>>,
    request_ids: RequestIdGenerator,
}

impl<O, S> WasmWsTransport<O, S>
where
    O: Serialize + DeserializeOwned + Clone + 'static,
    S: Serialize + DeserializeOwned + Clone + 'static,
{
    pub fn connect(url: impl Into<String>) -> Rc<Self> {
        let this = Rc::new(Self {
            inner: RefCell::new(Inner {
                url: url.into(),
                socket: None,
                pending: HashMap::new(),
                push_listeners: Vec::new(),
                connect_listeners: Vec::new(),
                attempt: 0,
                generation: 0,
                _onopen: None,
                _onmessage: None,
                _onclose: None,
                _onerror: None,
            }),
            request_ids: RequestIdGenerator::new(),
        });
        Self::open_socket(&this);
        this
    }

    /// Tear down the current socket (if any) and open a fresh one, wiring
    /// `onopen`/`onmessage`/`onclose`/`onerror` against this connection's
    /// `generation` so a stale socket's late events are ignored after a
    /// reconnect has already moved on.
    fn open_socket(self: &Rc<Self>) {
        let generation = {
            let mut inner = self.inner.borrow_mut();
            inner.generation += 1;
            inner.generation
        };

        let url = self.inner.borrow().url.clone();
        let socket = match WebSocket::new(&url) {
            Ok(ws) => ws,
            Err(_) => {
                self.schedule_reconnect(generation);
                return;
            }
        };

        let onopen = {
            let this = Rc::clone(self);
            Closure::<dyn FnMut()>::new(move || {
                if this.inner.borrow().generation != generation {
                    return;
                }
                this.inner.borrow_mut().attempt = 0;
                let handlers: Vec<_> = this.inner.borrow().connect_listeners.clone();
                for handler in handlers {
                    handler();
                }
            })
        };

        let onmessage = {
            let this = Rc::clone(self);
            Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
                if this.inner.borrow().generation != generation {
                    return;
                }
                if let Some(text) = event.data().as_string() {
                    this.dispatch(&text);
                } else {
                    tracing::error!("relay sent a non-text frame; protocol only allows JSON text frames");
                }
            })
        };

        let onclose = {
            let this = Rc::clone(self);
            Closure::<dyn FnMut(CloseEvent)>::new(move |_event: CloseEvent| {
                if this.inner.borrow().generation != generation {
                    return;
                }
                this.fail_all_pending();
                this.schedule_reconnect(generation);
            })
        };

        let onerror = {
            let this = Rc::clone(self);
            Closure::<dyn FnMut(ErrorEvent)>::new(move |_event: ErrorEvent| {
                if this.inner.borrow().generation != generation {
                    return;
                }
                // `close` always follows `error` for a WebSocket; the close
                // handler above is what actually schedules the reconnect.
                tracing::warn!("websocket error");
            })
        };

        socket.set_onopen(Some(onopen.as_ref().unchecked_ref()));
        socket.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
        socket.set_onclose(Some(onclose.as_ref().unchecked_ref()));
        socket.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        let mut inner = self.inner.borrow_mut();
        inner.socket = Some(socket);
        inner._onopen = Some(onopen);
        inner._onmessage = Some(onmessage);
        inner._onclose = Some(onclose);
        inner._onerror = Some(onerror);
    }

    fn schedule_reconnect(self: &Rc<Self>, generation: u64) {
        let attempt = {
            let mut inner = self.inner.borrow_mut();
            if inner.generation != generation {
                return;
            }
            inner.socket = None;
            let attempt = inner.attempt;
            inner.attempt += 1;
            attempt
        };
        let delay = full_jitter_backoff_ms(attempt);
        let this = Rc::clone(self);
        wasm_bindgen_futures::spawn_local(async move {
            sleep_ms(delay).await;
            if this.inner.borrow().generation == generation {
                Self::open_socket(&this);
            }
        });
    }

    fn dispatch(self: &Rc<Self>, text: &str) {
        let msg: ServerMessage<O, S> = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode server message");
                return;
            }
        };
        match msg.request_id() {
            Some(id) => {
                if let Some(tx) = self.inner.borrow_mut().pending.remove(&id) {
                    let _ = tx.send(Ok(msg));
                }
            }
            None => {
                let handlers: Vec<_> = self.inner.borrow().push_listeners.clone();
                for handler in handlers {
                    handler(msg.clone());
                }
            }
        }
    }

    fn fail_all_pending(&self) {
        for (_, tx) in self.inner.borrow_mut().pending.drain() {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next()
    }

    /// Send a request-shaped `ClientMessage` and await its correlated ack.
    /// Errors immediately with [`TransportError::ConnectionClosed`] if no
    /// socket is currently open, rather than queuing — callers (the doc
    /// push loop) already retry with backoff on any transport error.
    pub async fn request(&self, msg: ClientMessage<O>) -> Result<ServerMessage<O, S>, TransportError> {
        let id = msg.request_id();
        let text = serde_json::to_string(&msg).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.borrow_mut();
            let socket = inner.socket.as_ref().ok_or(TransportError::ConnectionClosed)?;
            socket.send_with_str(&text).map_err(|_| TransportError::Io("websocket send failed".into()))?;
            inner.pending.insert(id, tx);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionClosed),
        }
    }

    pub fn on_push(&self, handler: impl Fn(ServerMessage<O, S>) + 'static) {
        self.inner.borrow_mut().push_listeners.push(Rc::new(handler));
    }

    pub fn on_connect(&self, handler: impl Fn() + 'static) {
        self.inner.borrow_mut().connect_listeners.push(Rc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_cap() {
        for attempt in 0..40 {
            let d = full_jitter_backoff_ms(attempt);
            assert!(d <= MAX_BACKOFF_MS);
            assert!(d >= 0.0);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_count_on_average() {
        let early: f64 = (0..20).map(|_| full_jitter_backoff_ms(0)).sum();
        let late: f64 = (0..20).map(|_| full_jitter_backoff_ms(10)).sum();
        assert!(late > early);
    }
}
