//! Loopback socket fixtures for session tests.

use std::{
    io::{ErrorKind, Read},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{Directory, Readiness, Session, SessionConfig, SessionId};

/// A readiness request observed by [`Recorder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    WantWrite(SessionId),
    WantRead(SessionId),
    Closed(SessionId),
}

/// Readiness sink that records every request.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    signals: Mutex<Vec<Signal>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn contains(&self, signal: Signal) -> bool {
        self.signals.lock().contains(&signal)
    }

    pub(crate) fn count(&self, signal: Signal) -> usize {
        self.signals.lock().iter().filter(|s| **s == signal).count()
    }
}

impl Readiness for Recorder {
    fn want_write(&self, session: SessionId) {
        self.signals.lock().push(Signal::WantWrite(session));
    }

    fn want_read(&self, session: SessionId) {
        self.signals.lock().push(Signal::WantRead(session));
    }

    fn closed(&self, session: SessionId) {
        self.signals.lock().push(Signal::Closed(session));
    }
}

/// A session over a loopback connection plus the blocking client end.
pub(crate) fn connected(
    id: u64,
    directory: &Arc<Directory>,
    recorder: &Arc<Recorder>,
) -> (Arc<Session>, TcpStream) {
    connected_with(id, directory, recorder, &SessionConfig::default())
}

pub(crate) fn connected_with(
    id: u64,
    directory: &Arc<Directory>,
    recorder: &Arc<Recorder>,
    config: &SessionConfig,
) -> (Arc<Session>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let readiness: Arc<dyn Readiness> = Arc::clone(recorder) as Arc<dyn Readiness>;
    let session =
        Session::new(SessionId(id), server, Arc::clone(directory), readiness, config, Instant::now());
    (session, client)
}

/// Length-prefixed JSON frame.
pub(crate) fn frame<T: Serialize + ?Sized>(message: &T) -> Vec<u8> {
    let body = serde_json::to_vec(message).unwrap();
    let mut wire = (body.len() as i32).to_be_bytes().to_vec();
    wire.extend_from_slice(&body);
    wire
}

/// Drive `process_read` until `done` holds, failing after a few seconds.
pub(crate) fn pump_until(session: &Session, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "session {} never reached condition", session.id());
        session.process_read();
        thread::sleep(Duration::from_millis(1));
    }
}

/// Read one frame body from the client end.
pub(crate) fn expect_frame(client: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; i32::from_be_bytes(header) as usize];
    client.read_exact(&mut body).unwrap();
    body
}

/// Assert nothing arrives on the client end for a short while.
pub(crate) fn expect_silence(client: &mut TcpStream) {
    client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut byte = [0u8; 1];
    match client.read(&mut byte) {
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {},
        other => panic!("expected no data, got {other:?}"),
    }
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
}
