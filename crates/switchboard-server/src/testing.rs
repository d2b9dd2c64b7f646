//! Session fixtures for reactor-side tests.

use std::{
    net::{TcpListener, TcpStream},
    sync::Arc,
    time::Instant,
};

use switchboard_core::{Directory, Readiness, Session, SessionConfig, SessionId};

/// Readiness sink that ignores every request.
#[derive(Debug)]
pub(crate) struct Quiet;

impl Readiness for Quiet {
    fn want_write(&self, _session: SessionId) {}

    fn want_read(&self, _session: SessionId) {}

    fn closed(&self, _session: SessionId) {}
}

/// A session over loopback with its own directory, plus the client end.
pub(crate) fn session(id: u64) -> (Arc<Session>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();

    let session = Session::new(
        SessionId(id),
        server,
        Arc::new(Directory::new()),
        Arc::new(Quiet),
        &SessionConfig::default(),
        Instant::now(),
    );
    (session, client)
}
