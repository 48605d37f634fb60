//! Receive-side dispatch: the drain loop and the message bus.
//!
//! One dedicated background thread continuously drains the transport,
//! decodes each read unit as a single frame and publishes the resulting
//! [`DeviceMessage`] on a [`MessageBus`]. Publication is synchronous and
//! in decode order; subscribers do minimal work and hand anything
//! longer to the orchestrator layer.
//!
//! Decode failures are logged and the frame is dropped. The transport
//! guarantees byte-level ordering and integrity, so no resynchronization
//! beyond discarding the bad frame is attempted.

use crate::protocol::frame::FrameCodec;
use crate::protocol::message::DeviceMessage;
use crate::transport::SharedTransport;
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause between polls when the transport has nothing for us.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Pause before retrying after a hard transport error.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

type Predicate = Box<dyn Fn(&DeviceMessage) -> bool + Send>;
type Listener = Box<dyn FnMut(&DeviceMessage) + Send>;

struct PendingEntry {
    id: u64,
    predicate: Predicate,
    tx: SyncSender<DeviceMessage>,
    resolved: bool,
}

struct ListenerEntry {
    id: u64,
    callback: Listener,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    pendings: Vec<PendingEntry>,
    listeners: Vec<ListenerEntry>,
}

/// Publish/subscribe registry for inbound messages.
///
/// Two subscriber classes share the bus:
///
/// - *Pending requests*: a predicate plus a one-shot result slot.
///   Resolved exactly once; later matches are ignored. Every inbound
///   message is offered to every live pending request, because several
///   operations can legitimately wait on the same message class.
/// - *Listeners*: plain callbacks invoked for every message (console
///   taps, file-list collection).
///
/// Registration is scoped: dropping the returned guard removes the
/// entry on every exit path, including cancellation and timeout.
#[derive(Clone, Default)]
pub struct MessageBus {
    state: Arc<Mutex<BusState>>,
}

impl MessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Offers a message to all listeners and pending requests.
    pub fn publish(&self, msg: &DeviceMessage) {
        let mut state = self.lock();

        for listener in &mut state.listeners {
            (listener.callback)(msg);
        }

        for pending in &mut state.pendings {
            if !pending.resolved && (pending.predicate)(msg) {
                pending.resolved = true;
                // Capacity 1 and the resolved flag make this the only
                // send for this entry; a full channel cannot happen.
                let _ = pending.tx.try_send(msg.clone());
            }
        }
    }

    /// Registers a pending request. Must happen before the matching
    /// command is sent, so a fast reply cannot be missed.
    pub(crate) fn register_pending(
        &self,
        predicate: Predicate,
    ) -> (PendingGuard, Receiver<DeviceMessage>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pendings.push(PendingEntry {
            id,
            predicate,
            tx,
            resolved: false,
        });

        (
            PendingGuard {
                state: Arc::clone(&self.state),
                id,
            },
            rx,
        )
    }

    /// Registers a listener invoked synchronously for every message.
    ///
    /// Listeners run on the dispatch thread and must not block.
    pub fn add_listener<F>(&self, callback: F) -> ListenerGuard
    where
        F: FnMut(&DeviceMessage) + Send + 'static,
    {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.push(ListenerEntry {
            id,
            callback: Box::new(callback),
        });

        ListenerGuard {
            state: Arc::clone(&self.state),
            id,
        }
    }
}

/// Scoped registration of a pending request; removal on drop.
pub(crate) struct PendingGuard {
    state: Arc<Mutex<BusState>>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.pendings.retain(|p| p.id != self.id);
    }
}

/// Scoped registration of a listener; removal on drop.
pub struct ListenerGuard {
    state: Arc<Mutex<BusState>>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.listeners.retain(|l| l.id != self.id);
    }
}

/// Background thread draining the transport into the bus.
pub struct ReceiveDispatcher {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ReceiveDispatcher {
    /// Spawns the drain thread.
    ///
    /// `max_packet_size` bounds the read buffer; one read unit is
    /// expected to contain at most one complete frame.
    pub fn spawn(transport: SharedTransport, bus: MessageBus, max_packet_size: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("hcom-dispatch".to_string())
            .spawn(move || drain_loop(&transport, &bus, max_packet_size, &flag))
            .expect("failed to spawn dispatch thread");

        Self {
            handle: Some(handle),
            shutdown,
        }
    }
}

impl Drop for ReceiveDispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop(
    transport: &SharedTransport,
    bus: &MessageBus,
    max_packet_size: usize,
    shutdown: &AtomicBool,
) {
    let mut buf = vec![0u8; max_packet_size];

    while !shutdown.load(Ordering::Relaxed) {
        let read = {
            let mut t = transport
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !t.is_open() {
                drop(t);
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
            t.read(&mut buf)
        };

        match read {
            Ok(0) => {
                // No data yet; not end-of-stream.
                thread::sleep(IDLE_POLL);
            },
            Ok(n) => dispatch_frame(bus, &buf[..n]),
            Err(e) => {
                warn!("transport read failed: {e}");
                thread::sleep(ERROR_BACKOFF);
            },
        }
    }
}

/// Decodes one frame and publishes it; bad frames are dropped.
fn dispatch_frame(bus: &MessageBus, raw: &[u8]) {
    match FrameCodec::decode(raw) {
        Ok((header, body)) => match DeviceMessage::from_frame(&header, body) {
            Some(msg) => {
                trace!("dispatching {:?}", msg.kind());
                bus.publish(&msg);
            },
            None => {
                debug!(
                    "dropping frame with unhandled code {:#04x} (type {:#06x})",
                    header.code(),
                    header.request_type & 0xFF00
                );
            },
        },
        Err(e) => {
            warn!("dropping undecodable {} byte frame: {e}", raw.len());
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes::ReplyKind;
    use crate::transport::Transport;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Instant;

    /// Transport that replays a fixed frame script, one frame per read.
    struct ScriptedReads {
        frames: VecDeque<Vec<u8>>,
    }

    impl Transport for ScriptedReads {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.frames.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                },
                None => Ok(0),
            }
        }

        fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn reopen(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn simple_reply(kind: ReplyKind, user_data: u32) -> Vec<u8> {
        FrameCodec::default().encode_simple(0, kind.code(), user_data)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_messages_dispatched_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = MessageBus::new();
        let sink = Arc::clone(&seen);
        let _guard = bus.add_listener(move |msg| sink.lock().unwrap().push(msg.kind()));

        let transport: SharedTransport = Arc::new(Mutex::new(Box::new(ScriptedReads {
            frames: vec![
                simple_reply(ReplyKind::Accepted, 0),
                simple_reply(ReplyKind::Concluded, 0),
            ]
            .into(),
        })));
        let _dispatcher = ReceiveDispatcher::spawn(transport, bus.clone(), 4096);

        wait_for(|| seen.lock().unwrap().len() == 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ReplyKind::Accepted, ReplyKind::Concluded]
        );
    }

    #[test]
    fn test_bad_frame_does_not_poison_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = MessageBus::new();
        let sink = Arc::clone(&seen);
        let _guard = bus.add_listener(move |msg| sink.lock().unwrap().push(msg.kind()));

        let transport: SharedTransport = Arc::new(Mutex::new(Box::new(ScriptedReads {
            frames: vec![
                vec![0xFF, 0xFF], // truncated
                {
                    let mut f = simple_reply(ReplyKind::Info, 0);
                    f[5] = 0x7F; // unknown header type
                    f
                },
                simple_reply(ReplyKind::Concluded, 0), // must still get through
            ]
            .into(),
        })));
        let _dispatcher = ReceiveDispatcher::spawn(transport, bus.clone(), 4096);

        wait_for(|| !seen.lock().unwrap().is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![ReplyKind::Concluded]);
    }

    #[test]
    fn test_pending_resolved_exactly_once() {
        let bus = MessageBus::new();
        let (_guard, rx) = bus.register_pending(Box::new(|m| m.kind() == ReplyKind::Concluded));

        let msg = DeviceMessage::Simple {
            kind: ReplyKind::Concluded,
            user_data: 1,
        };
        bus.publish(&msg);
        bus.publish(&DeviceMessage::Simple {
            kind: ReplyKind::Concluded,
            user_data: 2,
        });

        let first = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first, msg);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_message_offered_to_all_pendings() {
        let bus = MessageBus::new();
        let (_g1, rx1) = bus.register_pending(Box::new(|m| m.kind() == ReplyKind::Reconnect));
        let (_g2, rx2) = bus.register_pending(Box::new(|m| m.kind() == ReplyKind::Reconnect));

        bus.publish(&DeviceMessage::Simple {
            kind: ReplyKind::Reconnect,
            user_data: 0,
        });

        assert!(rx1.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(rx2.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_guard_drop_unsubscribes() {
        let bus = MessageBus::new();
        let (guard, rx) = bus.register_pending(Box::new(|_| true));
        drop(guard);

        bus.publish(&DeviceMessage::Simple {
            kind: ReplyKind::Accepted,
            user_data: 0,
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
