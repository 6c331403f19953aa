//! Connect-and-submit state machine for a single submission.
//!
//! A [`Session`] owns at most one connection for its whole life and moves through
//! [`SessionState`] in one direction only:
//!
//! ```text
//! Idle -> Connecting -> Submitting -> AwaitingReport -> AwaitingSubObjects -> Closed
//! ```
//!
//! Every state may jump straight to `Closed`. The connection is released on every exit
//! path, including drop.
use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};
use rand::Rng;

use super::{
    ProtocolTransport, ServerEndpoint, ServerPool, SubObjectOutcome, SubObjectSink,
    SubmissionRequest, content_name, drain_subobjects, error::ProtocolError, select_order,
};
use crate::report::Reporter;

/// Where a session stands in the submission exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Submitting,
    AwaitingReport,
    AwaitingSubObjects,
    Closed,
}

/// Opens connections to server endpoints.
pub trait Connector {
    type Stream: Read + Write;

    fn connect(&self, endpoint: &ServerEndpoint) -> io::Result<Self::Stream>;
}

/// Plain TCP connector with optional connect, read and write timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            write_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, endpoint: &ServerEndpoint) -> io::Result<TcpStream> {
        let target = (endpoint.host.as_str(), endpoint.port);
        let stream = match self.connect_timeout {
            None => TcpStream::connect(target)?,
            Some(timeout) => {
                let mut last_err = None;
                let mut connected = None;
                for addr in target.to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                match (connected, last_err) {
                    (Some(stream), _) => stream,
                    (None, Some(e)) => return Err(e),
                    (None, None) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("could not resolve {}", endpoint.host),
                        ));
                    }
                }
            }
        };

        stream.set_read_timeout(self.read_timeout)?;
        stream.set_write_timeout(self.write_timeout)?;
        Ok(stream)
    }
}

/// Name of the directory sub-objects of `report` are dumped to.
pub fn dump_dir_name(epoch_secs: u64, report: &[u8]) -> String {
    format!("fsf_dump_{epoch_secs}_{}", content_name(report))
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub struct Session<'a, C: Connector> {
    connector: &'a C,
    reporter: &'a mut dyn Reporter,
    transport: Option<ProtocolTransport<C::Stream>>,
    host: Option<ServerEndpoint>,
    full: bool,
    state: SessionState,
}

impl<'a, C: Connector> Session<'a, C> {
    pub fn new(connector: &'a C, reporter: &'a mut dyn Reporter) -> Self {
        Self {
            connector,
            reporter,
            transport: None,
            host: None,
            full: false,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Endpoint that accepted the connection, kept after close.
    pub fn host(&self) -> Option<&ServerEndpoint> {
        self.host.as_ref()
    }

    pub fn reporter(&mut self) -> &mut dyn Reporter {
        &mut *self.reporter
    }

    /// Connects to the first endpoint of a random ordering of `pool` that accepts.
    pub fn open<R: Rng + ?Sized>(
        &mut self,
        pool: &ServerPool,
        rng: &mut R,
    ) -> Result<ServerEndpoint, ProtocolError> {
        let order = select_order(pool, rng);
        self.open_in_order(&order)
    }

    /// Tries each endpoint once, in the given order.
    pub fn open_in_order(
        &mut self,
        order: &[ServerEndpoint],
    ) -> Result<ServerEndpoint, ProtocolError> {
        self.expect_state("open", SessionState::Idle)?;
        self.state = SessionState::Connecting;

        for endpoint in order {
            match self.connector.connect(endpoint) {
                Ok(stream) => {
                    info!("connected to {endpoint}");
                    self.transport = Some(ProtocolTransport::new(stream));
                    self.host = Some(endpoint.clone());
                    self.state = SessionState::Submitting;
                    return Ok(endpoint.clone());
                }
                Err(source) => {
                    let err = ProtocolError::Connection {
                        endpoint: endpoint.clone(),
                        source,
                    };
                    warn!("{err}");
                    self.reporter
                        .warn(&format!("{err}. Trying another server."));
                }
            }
        }

        self.state = SessionState::Closed;
        Err(ProtocolError::NoServerAvailable {
            attempted: order.len(),
        })
    }

    /// Writes the framed request. The connection is closed afterwards when no report is
    /// expected or the write failed.
    pub fn submit(&mut self, request: &SubmissionRequest) -> Result<(), ProtocolError> {
        let (endpoint, transport) = self.active("submit", SessionState::Submitting)?;
        let written = transport.write_submission(request);

        if let Err(source) = written {
            self.close();
            return Err(ProtocolError::Write { endpoint, source });
        }
        info!(
            "sent {} ({} bytes) to {endpoint}",
            request.sample_name,
            request.payload.len()
        );

        if request.suppress_report {
            self.close();
        } else {
            self.full = request.full;
            self.state = SessionState::AwaitingReport;
        }
        Ok(())
    }

    /// Reads the scan report frame.
    pub fn await_report(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let (endpoint, transport) = self.active("read report", SessionState::AwaitingReport)?;

        match transport.read_frame() {
            Ok(report) => {
                debug!("received {} byte report from {endpoint}", report.len());
                if self.full {
                    self.state = SessionState::AwaitingSubObjects;
                } else {
                    self.close();
                }
                Ok(report)
            }
            Err(source) => {
                self.close();
                Err(ProtocolError::ReportRead { endpoint, source })
            }
        }
    }

    /// Drains the sub-objects that follow `report` into `sink`, then closes.
    pub fn await_subobjects<S: SubObjectSink + ?Sized>(
        &mut self,
        report: &[u8],
        sink: &mut S,
    ) -> Result<SubObjectOutcome, ProtocolError> {
        let (_, transport) = self.active("read sub-objects", SessionState::AwaitingSubObjects)?;
        let directory = dump_dir_name(now_epoch_secs(), report);

        let outcome = drain_subobjects(transport, &directory, sink);
        self.close();
        outcome
    }

    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("closed connection to {:?}", self.host);
        }
        self.state = SessionState::Closed;
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: SessionState,
    ) -> Result<(), ProtocolError> {
        if self.state != expected {
            return Err(ProtocolError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn active(
        &mut self,
        operation: &'static str,
        expected: SessionState,
    ) -> Result<(ServerEndpoint, &mut ProtocolTransport<C::Stream>), ProtocolError> {
        self.expect_state(operation, expected)?;
        match (&self.host, self.transport.as_mut()) {
            (Some(host), Some(transport)) => Ok((host.clone(), transport)),
            _ => Err(ProtocolError::InvalidState {
                operation,
                state: self.state,
            }),
        }
    }
}

impl<C: Connector> Drop for Session<'_, C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::HashSet,
        io::{Cursor, Read},
        net::TcpListener,
        rc::Rc,
        sync::mpsc,
        thread::{self, JoinHandle},
    };

    use rand::{SeedableRng, rngs::StdRng};
    use tempdir::TempDir;

    use super::*;
    use crate::{
        protocol::{ArchivePolicy, DirectorySink, decode_submission, error::FrameError},
        report::MemoryReporter,
    };

    #[derive(Clone, Default)]
    struct MockStream {
        input: Rc<RefCell<Cursor<Vec<u8>>>>,
        output: Rc<RefCell<Vec<u8>>>,
        reads: Rc<Cell<usize>>,
    }

    impl MockStream {
        fn with_input(bytes: Vec<u8>) -> Self {
            Self {
                input: Rc::new(RefCell::new(Cursor::new(bytes))),
                ..Default::default()
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.set(self.reads.get() + 1);
            self.input.borrow_mut().read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct MockConnector {
        live: HashSet<String>,
        stream: MockStream,
        attempts: RefCell<Vec<String>>,
    }

    impl MockConnector {
        fn new(live: &[&str], stream: MockStream) -> Self {
            Self {
                live: live.iter().map(|s| s.to_string()).collect(),
                stream,
                attempts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Connector for MockConnector {
        type Stream = MockStream;

        fn connect(&self, endpoint: &ServerEndpoint) -> io::Result<MockStream> {
            self.attempts.borrow_mut().push(endpoint.host.clone());
            if self.live.contains(&endpoint.host) {
                Ok(self.stream.clone())
            } else {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
        }
    }

    fn endpoints(hosts: &[&str]) -> Vec<ServerEndpoint> {
        hosts.iter().map(|h| ServerEndpoint::new(*h, 5800)).collect()
    }

    fn request(suppress_report: bool, full: bool) -> SubmissionRequest {
        SubmissionRequest {
            sample_name: "sample.zip".to_string(),
            source: "Analyst".to_string(),
            archive_policy: ArchivePolicy::None,
            suppress_report,
            full,
            payload: b"PK\x03\x04".to_vec(),
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = (payload.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn failover_to_third_server() {
        let connector = MockConnector::new(&["fsf3"], MockStream::default());
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        let host = session
            .open_in_order(&endpoints(&["fsf1", "fsf2", "fsf3"]))
            .unwrap();
        assert_eq!(host, ServerEndpoint::new("fsf3", 5800));
        assert_eq!(session.host(), Some(&host));
        assert_eq!(session.state(), SessionState::Submitting);
        drop(session);

        assert_eq!(reporter.warnings.len(), 2);
        assert!(reporter.warnings[0].contains("fsf1"));
        assert!(reporter.warnings[1].contains("fsf2"));
        assert!(reporter.errors.is_empty());
    }

    #[test]
    fn failover_with_random_order() {
        let connector = MockConnector::new(&["fsf2"], MockStream::default());
        let pool = ServerPool::new(endpoints(&["fsf1", "fsf2", "fsf3"])).unwrap();
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        let host = session
            .open(&pool, &mut StdRng::seed_from_u64(3))
            .unwrap();
        assert_eq!(host.host, "fsf2");
        drop(session);

        let attempts = connector.attempts.borrow();
        assert_eq!(attempts.last().map(String::as_str), Some("fsf2"));
        assert_eq!(reporter.warnings.len(), attempts.len() - 1);
    }

    #[test]
    fn no_server_available() {
        let stream = MockStream::default();
        let connector = MockConnector::new(&[], stream.clone());
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        let err = session
            .open_in_order(&endpoints(&["fsf1", "fsf2"]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoServerAvailable { attempted: 2 }));
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.submit(&request(false, false)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidState { .. }));
        drop(session);

        assert!(stream.output.borrow().is_empty());
        assert_eq!(reporter.warnings.len(), 2);
    }

    #[test]
    fn suppressed_report_closes_after_write() {
        let stream = MockStream::with_input(frame(b"never read"));
        let connector = MockConnector::new(&["fsf1"], stream.clone());
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        session.open_in_order(&endpoints(&["fsf1"])).unwrap();
        let req = request(true, true);
        session.submit(&req).unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.await_report(),
            Err(ProtocolError::InvalidState { .. })
        ));
        assert_eq!(stream.reads.get(), 0);
        assert_eq!(decode_submission(&stream.output.borrow()).unwrap(), req);
    }

    #[test]
    fn report_only() {
        let stream = MockStream::with_input(frame(b"{\"Scan Time\": 1}"));
        let connector = MockConnector::new(&["fsf1"], stream.clone());
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        session.open_in_order(&endpoints(&["fsf1"])).unwrap();
        session.submit(&request(false, false)).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingReport);

        let report = session.await_report().unwrap();
        assert_eq!(report, b"{\"Scan Time\": 1}");
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn report_read_error() {
        let stream = MockStream::with_input(vec![0, 0, 0, 50, b'{']);
        let connector = MockConnector::new(&["fsf1"], stream);
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        session.open_in_order(&endpoints(&["fsf1"])).unwrap();
        session.submit(&request(false, true)).unwrap();

        let err = session.await_report().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ReportRead { ref endpoint, ref source }
                if endpoint.host == "fsf1" && source.is_closed()
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn report_and_subobjects() {
        let report: Vec<u8> = (0..100).collect();
        let mut input = frame(&report);
        input.extend_from_slice(b"Subs");
        input.extend_from_slice(&1u32.to_be_bytes());
        input.extend(frame(b"embedded.exe"));
        input.extend_from_slice(&0u32.to_be_bytes());
        input.extend(frame(b"embedded.dll"));

        let temp = TempDir::new("session").unwrap();
        let mut sink = DirectorySink::new(temp.path());
        let connector = MockConnector::new(&["fsf1"], MockStream::with_input(input));
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        session.open_in_order(&endpoints(&["fsf1"])).unwrap();
        session.submit(&request(false, true)).unwrap();
        let received = session.await_report().unwrap();
        assert_eq!(received, report);
        assert_eq!(session.state(), SessionState::AwaitingSubObjects);

        let before = now_epoch_secs();
        let outcome = session.await_subobjects(&received, &mut sink).unwrap();
        let after = now_epoch_secs();
        assert_eq!(session.state(), SessionState::Closed);

        let SubObjectOutcome::Dumped { directory, objects } = outcome else {
            panic!("expected dumped sub-objects");
        };
        assert!((before..=after).any(|epoch| directory == dump_dir_name(epoch, &report)));
        assert_eq!(
            objects,
            vec![content_name(b"embedded.exe"), content_name(b"embedded.dll")]
        );

        let files = std::fs::read_dir(temp.path().join(&directory)).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn dump_dir_name_format() {
        assert_eq!(
            dump_dir_name(1455000000, b"abc"),
            "fsf_dump_1455000000_900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn close_is_idempotent_and_releases_stream() {
        let stream = MockStream::default();
        let connector = MockConnector::new(&["fsf1"], stream.clone());
        let mut reporter = MemoryReporter::default();

        {
            let mut session = Session::new(&connector, &mut reporter);
            session.open_in_order(&endpoints(&["fsf1"])).unwrap();
            assert_eq!(Rc::strong_count(&stream.output), 3);

            session.close();
            session.close();
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(Rc::strong_count(&stream.output), 2);
        }

        {
            let mut session = Session::new(&connector, &mut reporter);
            session.open_in_order(&endpoints(&["fsf1"])).unwrap();
        }
        assert_eq!(Rc::strong_count(&stream.output), 2);
    }

    #[test]
    fn tcp_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).unwrap();
            let length = u32::from_be_bytes(header) as usize;
            let mut rest = vec![0u8; length + 7];
            stream.read_exact(&mut rest).unwrap();

            stream.write_all(&frame(b"report")).unwrap();
            let mut frame_bytes = header.to_vec();
            frame_bytes.extend(rest);
            decode_submission(&frame_bytes).unwrap()
        });

        let connector = TcpConnector::new(
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(5)),
        );
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);
        session
            .open_in_order(&[ServerEndpoint::new("127.0.0.1", port)])
            .unwrap();
        let req = request(false, false);
        session.submit(&req).unwrap();
        assert_eq!(session.await_report().unwrap(), b"report");

        assert_eq!(server.join().unwrap(), req);
    }

    /// Accepts one submission, writes `reply` and then goes quiet until told to stop.
    fn silent_server(reply: Vec<u8>) -> (u16, mpsc::Sender<()>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (done, stop) = mpsc::channel();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).unwrap();
            let mut rest = vec![0u8; u32::from_be_bytes(header) as usize + 7];
            stream.read_exact(&mut rest).unwrap();
            stream.write_all(&reply).unwrap();
            let _ = stop.recv();
        });
        (port, done, handle)
    }

    fn impatient_connector() -> TcpConnector {
        TcpConnector::new(
            Some(Duration::from_secs(5)),
            Some(Duration::from_millis(200)),
            Some(Duration::from_secs(5)),
        )
    }

    #[test]
    fn read_timeout_on_silent_report() {
        let (port, done, server) = silent_server(Vec::new());
        let connector = impatient_connector();
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);

        session
            .open_in_order(&[ServerEndpoint::new("127.0.0.1", port)])
            .unwrap();
        session.submit(&request(false, true)).unwrap();

        let err = session.await_report().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ReportRead {
                source: FrameError::Io(_),
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Closed);

        done.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn read_timeout_mid_subobject_stream() {
        let mut reply = frame(b"report");
        reply.extend_from_slice(b"Subs");
        reply.extend_from_slice(&1u32.to_be_bytes());
        reply.extend(frame(b"first"));
        let (port, done, server) = silent_server(reply);

        let connector = impatient_connector();
        let mut reporter = MemoryReporter::default();
        let mut session = Session::new(&connector, &mut reporter);
        session
            .open_in_order(&[ServerEndpoint::new("127.0.0.1", port)])
            .unwrap();
        session.submit(&request(false, true)).unwrap();
        let report = session.await_report().unwrap();

        let mut written = Vec::new();
        let mut sink = |_: &str, name: &str, _: &[u8]| -> io::Result<()> {
            written.push(name.to_string());
            Ok(())
        };
        let err = session.await_subobjects(&report, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::SubObjectRead(FrameError::Io(_))
        ));
        assert_eq!(written, vec![content_name(b"first")]);
        assert_eq!(session.state(), SessionState::Closed);

        done.send(()).unwrap();
        server.join().unwrap();
    }
}
