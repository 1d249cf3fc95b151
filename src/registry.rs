//! Pending-call registry – correlates a command with its eventual reply and
//! resolves each call exactly once.
//!
//! ## Resolution pipeline
//!
//! ```text
//! call(command, parse)
//!   ├── argument defect          → Err(Transport)   (resolved immediately)
//!   ├── transport send failure   → Err(Transport)   (resolved immediately)
//!   └── reply arrives
//!         ├── error envelope     → Err(Engine)
//!         ├── parse fails/panics → Err(Parse)
//!         └── otherwise          → Ok(V)
//! ```
//!
//! A call is identified solely by the closure captured at issuance – the
//! transport guarantees one reply per registration, so no numeric call-id
//! multiplexing is needed. Duplicate replies from a misbehaving transport are
//! ignored and logged; they never re-resolve the call. No retries happen
//! here – if the caller wants them, it reissues the command itself.

use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::SdkError;
use crate::transport::BridgeTransport;
use crate::types::Command;

type CallResult<V> = Result<V, SdkError>;

/// Standard reply parser: deserialize the whole reply into `T`.
///
/// Pass it to [`CallRegistry::call`] for commands whose reply body is the
/// value itself.
pub fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, SdkError> {
    Ok(serde_json::from_str(raw)?)
}

/// Per-bridge pending-call registry. Cheap to clone (shared transport and
/// in-flight counter); safe for concurrent issuance from any thread.
#[derive(Clone)]
pub struct CallRegistry {
    transport: Arc<dyn BridgeTransport>,
    in_flight: Arc<AtomicUsize>,
}

impl CallRegistry {
    pub fn new(transport: Arc<dyn BridgeTransport>) -> Self {
        Self {
            transport,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Calls registered but not yet resolved. A call with no reply stays
    /// counted forever – the engine protocol has no timeouts.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fire-and-forget send. Failures are reported to the caller but carry
    /// no reply either way.
    pub fn send(&self, command: Command) -> Result<(), SdkError> {
        let (name, args) = command.into_parts()?;
        self.transport.send(&name, &args)
    }

    /// Issue a request/response command.
    ///
    /// Never blocks: the returned future resolves with exactly one outcome.
    /// `parse` converts the raw reply into `V`; a parse error (or panic)
    /// resolves the call as `Err` rather than unwinding into the transport's
    /// delivery frame.
    pub fn call<V, F>(&self, command: Command, parse: F) -> CallFuture<V>
    where
        V: Send + 'static,
        F: FnOnce(&str) -> CallResult<V> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let future = CallFuture { rx };

        let (name, args) = match command.into_parts() {
            Ok(parts) => parts,
            Err(defect) => {
                // Never registered; resolve before the caller can await.
                resolve(tx, Err(defect), "<defective command>");
                return future;
            }
        };

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = Arc::new(ReplySlot::new(name.clone(), parse, tx, self.in_flight.clone()));

        let handler_slot = slot.clone();
        let send_result = self.transport.send_expecting_reply(
            &name,
            &args,
            Box::new(move |raw| handler_slot.resolve_from_reply(raw)),
        );

        if let Err(e) = send_result {
            // The transport dropped the handler; fail the call locally.
            slot.resolve_with(Err(e));
        }

        future
    }

    /// [`call`](Self::call) with a deadline.
    ///
    /// The engine never times a call out on its own; this is a deliberate
    /// extension so a dead engine cannot leave the caller pending forever.
    /// On expiry the call resolves to [`SdkError::Timeout`]; a reply arriving
    /// later is ignored by the dropped receiver.
    pub async fn call_with_timeout<V, F>(
        &self,
        command: Command,
        parse: F,
        timeout: Duration,
    ) -> CallResult<V>
    where
        V: Send + 'static,
        F: FnOnce(&str) -> CallResult<V> + Send + 'static,
    {
        let name = command.name().to_string();
        match tokio::time::timeout(timeout, self.call(command, parse)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::warn!("command `{name}` timed out after {timeout:?}");
                Err(SdkError::Timeout {
                    command: name,
                    timeout,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Exactly-once reply slot
// ---------------------------------------------------------------------------

/// Single-resolution slot shared between the transport's reply handler and
/// the local failure path. Whichever side resolves first wins; the loser is
/// logged. Resolving twice through the same path is a broken invariant in
/// this core and is flagged at error level.
struct ReplySlot<V, F> {
    command: String,
    inner: Mutex<Option<(F, oneshot::Sender<CallResult<V>>)>>,
    in_flight: Arc<AtomicUsize>,
}

impl<V, F> ReplySlot<V, F>
where
    V: Send + 'static,
    F: FnOnce(&str) -> CallResult<V> + Send + 'static,
{
    fn new(
        command: String,
        parse: F,
        tx: oneshot::Sender<CallResult<V>>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            command,
            inner: Mutex::new(Some((parse, tx))),
            in_flight,
        }
    }

    fn take(&self) -> Option<(F, oneshot::Sender<CallResult<V>>)> {
        let taken = self.inner.lock().take();
        if taken.is_some() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        taken
    }

    /// Reply path: envelope detection first, then parsing, all fenced off
    /// from the transport's delivery frame.
    fn resolve_from_reply(&self, raw: &str) {
        let Some((parse, tx)) = self.take() else {
            log::error!(
                "duplicate reply for `{}` ignored – call already resolved",
                self.command
            );
            return;
        };

        let outcome = match SdkError::from_reply(raw) {
            Some(engine_err) => Err(engine_err),
            None => match catch_unwind(AssertUnwindSafe(|| parse(raw))) {
                Ok(parsed) => parsed,
                Err(_) => {
                    log::error!("reply parser for `{}` panicked", self.command);
                    Err(SdkError::Parse(format!(
                        "reply parser for `{}` panicked",
                        self.command
                    )))
                }
            },
        };

        resolve(tx, outcome, &self.command);
    }

    /// Local failure path (send error).
    fn resolve_with(&self, outcome: CallResult<V>) {
        match self.take() {
            Some((_parse, tx)) => resolve(tx, outcome, &self.command),
            None => log::error!(
                "call `{}` resolved twice – second resolution dropped",
                self.command
            ),
        }
    }
}

/// Hand the outcome to the caller. A dropped receiver (caller gave up) is
/// not a transport failure; it is logged and the outcome discarded.
fn resolve<V>(tx: oneshot::Sender<CallResult<V>>, outcome: CallResult<V>, command: &str) {
    if tx.send(outcome).is_err() {
        log::debug!("caller dropped the result of `{command}` before it resolved");
    }
}

// ---------------------------------------------------------------------------
// CallFuture
// ---------------------------------------------------------------------------

/// Single-resolution result of a request/response call.
///
/// Await it from async code, or use [`wait`](Self::wait) from a thread that
/// may block. Dropping it abandons the call; a late reply is then discarded.
pub struct CallFuture<V> {
    rx: oneshot::Receiver<CallResult<V>>,
}

impl<V> Future for CallFuture<V> {
    type Output = CallResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SdkError::ChannelClosed(
                "call registry dropped before resolving".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<V> CallFuture<V> {
    /// Block the current thread until the call resolves.
    ///
    /// Must not be used on an async runtime thread.
    pub fn wait(self) -> CallResult<V> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(SdkError::ChannelClosed(
                "call registry dropped before resolving".into(),
            )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
