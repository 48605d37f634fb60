//! End-to-end tests over a scripted in-memory transport.
//!
//! The transport decodes every frame the host writes and lets the test
//! script the device's replies, exercising the full stack: link,
//! dispatch thread, coordinator, transfer engine and device operations.

use hcom::protocol::{Body, FrameCodec, Header, HeaderType, ReplyKind, RequestCode};
use hcom::{CancelToken, CommandError, Device, LinkConfig, TransferError, Transport};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Responder = Box<dyn FnMut(&Header, &Body) -> Vec<Vec<u8>> + Send>;

/// In-memory transport driven by a reply script.
///
/// Each host frame is decoded and handed to the responder; the frames
/// it returns are queued and delivered one per read, like a serial
/// port that yields one packet per poll.
struct ScriptedTransport {
    responder: Responder,
    inbox: VecDeque<Vec<u8>>,
}

impl ScriptedTransport {
    fn new<F>(responder: F) -> Box<Self>
    where
        F: FnMut(&Header, &Body) -> Vec<Vec<u8>> + Send + 'static,
    {
        Box::new(Self {
            responder: Box::new(responder),
            inbox: VecDeque::new(),
        })
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbox.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            },
            None => Ok(0),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let (header, body) = FrameCodec::decode(buf).expect("host sent undecodable frame");
        let replies = (self.responder)(&header, &body);
        self.inbox.extend(replies);
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    fn reopen(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn fast_config() -> LinkConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    LinkConfig {
        command_timeout: Duration::from_secs(2),
        file_ack_timeout: Duration::from_secs(2),
        conclude_timeout: Duration::from_secs(2),
        settle_delay: Duration::from_millis(10),
        ready_poll_interval: Duration::from_millis(50),
        ready_deadline: Duration::from_secs(2),
        reconnect_interval: Duration::from_millis(5),
        mode_toggle_deadline: Duration::from_secs(5),
        ..LinkConfig::default()
    }
}

fn simple_reply(kind: ReplyKind, user_data: u32) -> Vec<u8> {
    FrameCodec::default().encode_simple(0, kind.code(), user_data)
}

fn text_reply(kind: ReplyKind, text: &str) -> Vec<u8> {
    // SimpleText is receive-only, so the codec has no encoder for it.
    let mut raw = FrameCodec::default().encode_simple(0, kind.code(), 0);
    raw[5] = 0x03;
    raw.extend_from_slice(text.as_bytes());
    raw
}

fn binary_reply(kind: ReplyKind, data: &[u8]) -> Vec<u8> {
    FrameCodec::default()
        .encode_binary(0, kind.code(), 0, data)
        .unwrap()
}

fn is_code(header: &Header, code: RequestCode) -> bool {
    header.code() == code.code()
}

#[test]
fn test_device_info_round_trip() {
    let device = Device::new(
        ScriptedTransport::new(|header, _| {
            if is_code(header, RequestCode::GetDeviceInfo) {
                vec![text_reply(ReplyKind::DeviceInfo, "hw 2.1 fw 5.0.3")]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    let info = device.device_info(&CancelToken::new()).unwrap();
    assert_eq!(info, "hw 2.1 fw 5.0.3");
}

#[test]
fn test_run_mode_toggle_converges_after_two_cycles() {
    let queries = Arc::new(Mutex::new(0usize));
    let toggles = Arc::new(Mutex::new(0usize));
    let q = Arc::clone(&queries);
    let t = Arc::clone(&toggles);

    let device = Device::new(
        ScriptedTransport::new(move |header, _| {
            if is_code(header, RequestCode::QueryRunMode) {
                let mut q = q.lock().unwrap();
                *q += 1;
                // The flag sticks only after the second toggle cycle.
                vec![simple_reply(ReplyKind::Info, u32::from(*q >= 3))]
            } else if is_code(header, RequestCode::EnableRunMode) {
                *t.lock().unwrap() += 1;
                vec![simple_reply(ReplyKind::Reconnect, 0)]
            } else if is_code(header, RequestCode::GetDeviceInfo) {
                vec![text_reply(ReplyKind::DeviceInfo, "ready")]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    device.set_run_mode(true, &CancelToken::new()).unwrap();
    assert_eq!(*toggles.lock().unwrap(), 2);
    assert_eq!(*queries.lock().unwrap(), 3);
}

#[test]
fn test_run_mode_already_set_sends_no_toggle() {
    let toggles = Arc::new(Mutex::new(0usize));
    let t = Arc::clone(&toggles);

    let device = Device::new(
        ScriptedTransport::new(move |header, _| {
            if is_code(header, RequestCode::QueryRunMode) {
                vec![simple_reply(ReplyKind::Info, 1)]
            } else if is_code(header, RequestCode::EnableRunMode)
                || is_code(header, RequestCode::DisableRunMode)
            {
                *t.lock().unwrap() += 1;
                vec![simple_reply(ReplyKind::Reconnect, 0)]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    device.set_run_mode(true, &CancelToken::new()).unwrap();
    assert_eq!(*toggles.lock().unwrap(), 0);
}

#[test]
fn test_file_transfer_chunks_and_concludes() {
    let offsets = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));
    let o = Arc::clone(&offsets);
    let r = Arc::clone(&received);

    let device = Device::new(
        ScriptedTransport::new(move |header, body| {
            match header.header_type() {
                Some(HeaderType::FileStart) => vec![simple_reply(ReplyKind::FileStartOk, 0)],
                Some(HeaderType::SimpleBinary) => {
                    o.lock().unwrap().push(header.user_data);
                    if let Body::Binary(chunk) = body {
                        r.lock().unwrap().extend_from_slice(chunk);
                    }
                    vec![]
                },
                Some(HeaderType::Simple) if is_code(header, RequestCode::ConcludeTransfer) => {
                    vec![simple_reply(ReplyKind::Concluded, 0)]
                },
                _ => vec![],
            }
        }),
        fast_config(),
    );

    // Three chunks at the default 4084-byte chunk size.
    let payload = vec![0x5A; 10_000];
    let stats = device
        .write_file("app.bin", 0, &payload, &CancelToken::new())
        .unwrap();

    assert_eq!(stats.bytes_sent, 10_000);
    assert_eq!(stats.chunk_count, 3);
    assert_eq!(stats.crc32, crc32fast::hash(&payload));
    assert_eq!(*offsets.lock().unwrap(), vec![0, 4084, 8168]);
    // Chunks reassemble to exactly the original payload.
    assert_eq!(*received.lock().unwrap(), payload);
}

#[test]
fn test_file_transfer_rejected_by_device() {
    let device = Device::new(
        ScriptedTransport::new(|header, _| {
            match header.header_type() {
                Some(HeaderType::FileStart) => vec![simple_reply(ReplyKind::FileStartFail, 0)],
                _ => vec![],
            }
        }),
        fast_config(),
    );

    let err = device
        .write_file("app.bin", 0, &[1, 2, 3], &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, TransferError::Rejected));
}

#[test]
fn test_esp_batch_concludes_only_after_last_image() {
    let concludes_seen = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&concludes_seen);
    let starts = Arc::new(Mutex::new(0usize));
    let s = Arc::clone(&starts);

    let device = Device::new(
        ScriptedTransport::new(move |header, _| {
            match header.header_type() {
                Some(HeaderType::FileStart) => {
                    *s.lock().unwrap() += 1;
                    vec![simple_reply(ReplyKind::FileStartOk, 0)]
                },
                // Per-image conclusion without a host ConcludeTransfer.
                Some(HeaderType::SimpleBinary) => vec![simple_reply(ReplyKind::Concluded, 0)],
                Some(HeaderType::Simple) if is_code(header, RequestCode::ConcludeTransfer) => {
                    c.lock().unwrap().push(*s.lock().unwrap());
                    vec![simple_reply(ReplyKind::Concluded, 0)]
                },
                _ => vec![],
            }
        }),
        fast_config(),
    );

    let images: &[(&str, &[u8])] = &[("boot.bin", &[1u8; 64]), ("app.bin", &[2u8; 64])];
    let stats = device.flash_esp(images, 2, &CancelToken::new()).unwrap();

    assert_eq!(stats.len(), 2);
    // ConcludeTransfer went out exactly once, after the second FileStart.
    assert_eq!(*concludes_seen.lock().unwrap(), vec![2]);
}

#[test]
fn test_list_files_with_crcs() {
    let device = Device::new(
        ScriptedTransport::new(|header, _| {
            if is_code(header, RequestCode::ListFileCrcs) {
                vec![
                    text_reply(ReplyKind::ListHeader, "2 files"),
                    text_reply(ReplyKind::CrcMember, "app.exe [DEADBEEF"),
                    text_reply(ReplyKind::CrcMember, "lib.dll [0BAD0BAD"),
                    simple_reply(ReplyKind::Concluded, 0),
                ]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    let files = device.list_files(true, &CancelToken::new()).unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files["app.exe"], 0xDEAD_BEEF);
    assert_eq!(files["lib.dll"], 0x0BAD_0BAD);
}

#[test]
fn test_delete_file() {
    let device = Device::new(
        ScriptedTransport::new(|header, body| {
            if let (true, Body::FileStart(start)) = (is_code(header, RequestCode::DeleteFile), body)
            {
                assert_eq!(start.file_name, "old.bin");
                assert_eq!(start.file_size, 0);
                vec![simple_reply(ReplyKind::Concluded, 0)]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    device.delete_file("old.bin", &CancelToken::new()).unwrap();
}

#[test]
fn test_reset_completes_without_acknowledgement() {
    let resets = Arc::new(Mutex::new(0usize));
    let r = Arc::clone(&resets);

    let device = Device::new(
        ScriptedTransport::new(move |header, _| {
            if is_code(header, RequestCode::Reset) {
                // A resetting device cannot reply.
                *r.lock().unwrap() += 1;
                vec![]
            } else if is_code(header, RequestCode::GetDeviceInfo) {
                vec![text_reply(ReplyKind::DeviceInfo, "back up")]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    device.reset(&CancelToken::new()).unwrap();
    assert_eq!(*resets.lock().unwrap(), 1);
}

#[test]
fn test_cancellation_interrupts_silent_device() {
    let device = Device::new(ScriptedTransport::new(|_, _| vec![]), fast_config());

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    let started = Instant::now();
    let err = device.query_run_mode(&cancel).unwrap_err();
    assert!(matches!(err, CommandError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(1));
    handle.join().unwrap();
}

#[test]
fn test_read_mac_address() {
    let device = Device::new(
        ScriptedTransport::new(|header, _| {
            if is_code(header, RequestCode::ReadMacAddress) {
                vec![binary_reply(ReplyKind::Info, &[0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01])]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    let mac = device.read_mac_address(&CancelToken::new()).unwrap();
    assert_eq!(mac, [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
}

#[test]
fn test_console_tap_receives_both_streams() {
    let device = Device::new(
        ScriptedTransport::new(|header, _| {
            if is_code(header, RequestCode::EnableShell) {
                vec![
                    simple_reply(ReplyKind::Concluded, 0),
                    text_reply(ReplyKind::Stdout, "hello\n"),
                    text_reply(ReplyKind::Stderr, "oops\n"),
                ]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    let tap = device.subscribe_console();
    device.enable_shell(&CancelToken::new()).unwrap();

    let first = tap.rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first.stream, ReplyKind::Stdout);
    assert_eq!(first.text, "hello\n");

    let second = tap.rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(second.stream, ReplyKind::Stderr);
    assert_eq!(second.text, "oops\n");
}

#[test]
fn test_erase_flash_accepted_then_concluded() {
    let device = Device::new(
        ScriptedTransport::new(|header, _| {
            if is_code(header, RequestCode::EraseFlashVerify) {
                vec![
                    simple_reply(ReplyKind::Accepted, 0),
                    simple_reply(ReplyKind::Concluded, 0),
                ]
            } else {
                vec![]
            }
        }),
        fast_config(),
    );

    device.erase_flash(true, &CancelToken::new()).unwrap();
}
