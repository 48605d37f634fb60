//! Request/response coordination over the message bus.
//!
//! The protocol has no reply-to-request correlation field, so a command
//! is matched to its reply purely by kind: the caller registers a
//! predicate before sending, then waits on the one-shot slot the bus
//! resolves. Registration strictly precedes the send, so a reply that
//! arrives faster than the caller can block is never missed.
//!
//! Waits poll in short slices so cancellation is observed promptly even
//! while blocked on the reply channel. A reply that was already matched
//! always wins over a concurrent cancellation.

use crate::dispatch::{MessageBus, PendingGuard};
use crate::error::{CommandError, WaitError};
use crate::link::Link;
use crate::protocol::codes::{ReplyKind, RequestCode};
use crate::protocol::message::DeviceMessage;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity of cancellation checks while waiting on a reply.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation flag.
///
/// Cloning yields a handle to the same flag; once set it stays set.
/// Waits observe it within one wait slice.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every operation holding this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Matches outbound commands to inbound replies.
#[derive(Clone)]
pub struct Coordinator {
    link: Arc<Link>,
    bus: MessageBus,
}

impl Coordinator {
    /// Creates a coordinator over a link and its message bus.
    pub fn new(link: Arc<Link>, bus: MessageBus) -> Self {
        Self { link, bus }
    }

    /// Registers interest in the next message matching `predicate`.
    ///
    /// Must be called before the triggering command is sent.
    pub(crate) fn register<P>(&self, predicate: P) -> (PendingGuard, Receiver<DeviceMessage>)
    where
        P: Fn(&DeviceMessage) -> bool + Send + 'static,
    {
        self.bus.register_pending(Box::new(predicate))
    }

    /// Sends a pre-encoded frame and waits for a matching reply.
    ///
    /// Fails with [`WaitError::Timeout`] if no match arrives within
    /// `timeout`, and [`WaitError::Cancelled`] if `cancel` fires first.
    pub fn send_and_await<P>(
        &self,
        frame: &[u8],
        predicate: P,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<DeviceMessage, WaitError>
    where
        P: Fn(&DeviceMessage) -> bool + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        let (_guard, rx) = self.register(predicate);
        self.link.send_raw(frame)?;
        Self::wait_on(&rx, timeout, cancel)
    }

    /// Sends a Simple command and runs the accept/conclude sequence.
    ///
    /// The device answers such a command with either the terminal kind
    /// directly, a `Rejected`, or an `Accepted` followed later by the
    /// terminal kind. Both reply slots are registered before the send so
    /// neither ordering can race.
    pub fn process_simple_command(
        &self,
        code: RequestCode,
        terminal: ReplyKind,
        user_data: u32,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<(), CommandError> {
        if cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        let first_match = move |m: &DeviceMessage| {
            matches!(m.kind(), ReplyKind::Accepted | ReplyKind::Rejected) || m.kind() == terminal
        };
        let final_match = move |m: &DeviceMessage| {
            m.kind() == ReplyKind::Rejected || m.kind() == terminal
        };

        let (_g1, rx1) = self.register(first_match);
        let (_g2, rx2) = self.register(final_match);

        debug!("sending {code:?}, awaiting {terminal:?}");
        self.link.send_simple(code, user_data)?;

        let deadline = Instant::now() + timeout;
        let first = Self::wait_on(&rx1, timeout, cancel)?;
        let outcome = match first.kind() {
            ReplyKind::Accepted => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                Self::wait_on(&rx2, remaining, cancel)?
            },
            _ => first,
        };

        match outcome.kind() {
            ReplyKind::Rejected => Err(CommandError::Rejected),
            _ => Ok(()),
        }
    }

    /// Waits on an already-registered reply slot.
    ///
    /// Used when several messages must be awaited for one command and
    /// all slots had to exist before the send.
    pub(crate) fn wait_on(
        rx: &Receiver<DeviceMessage>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<DeviceMessage, WaitError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // A reply resolved in the final slice still counts.
                return match rx.try_recv() {
                    Ok(msg) => Ok(msg),
                    Err(_) => Err(WaitError::Timeout(timeout)),
                };
            }

            match rx.recv_timeout(remaining.min(WAIT_SLICE)) {
                Ok(msg) => {
                    trace!("reply matched: {:?}", msg.kind());
                    return Ok(msg);
                },
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        // An already-resolved reply wins over cancellation.
                        return match rx.try_recv() {
                            Ok(msg) => Ok(msg),
                            Err(_) => Err(WaitError::Cancelled),
                        };
                    }
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WaitError::Timeout(timeout));
                },
            }
        }
    }
}
