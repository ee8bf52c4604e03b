use std::{
    collections::HashMap,
    io,
    net::{TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

#[cfg(unix)]
use std::{
    fs,
    os::unix::{fs::FileTypeExt, net::UnixListener},
    path::Path,
};

use log::{debug, info, warn};

use crate::{
    config::{ListenAddress, ServerConfig},
    handler::Handler,
};

use super::{ServerError, ThreadPool, connection::Connection, transport::Transport};

/// How often the accept loop checks for a stop request while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type Registry = Arc<Mutex<HashMap<u64, Transport>>>;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    fn bind(address: &ListenAddress) -> io::Result<Self> {
        match address {
            ListenAddress::Tcp(addr) => TcpListener::bind(addr).map(Listener::Tcp),
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                remove_stale_socket(path)?;
                UnixListener::bind(path).map(Listener::Unix)
            }
        }
    }

    fn local_address(&self, configured: &ListenAddress) -> io::Result<ListenAddress> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(ListenAddress::Tcp),
            #[cfg(unix)]
            Listener::Unix(_) => Ok(configured.clone()),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Listener::Unix(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    fn accept(&self) -> io::Result<Transport> {
        let transport = match self {
            Listener::Tcp(listener) => listener
                .accept()
                .map(|(stream, _)| stream)
                .and_then(prepare_tcp)
                .map(Transport::Tcp)?,
            #[cfg(unix)]
            Listener::Unix(listener) => listener
                .accept()
                .map(|(stream, _)| Transport::Unix(stream))?,
        };
        transport.set_nonblocking(false)?;
        Ok(transport)
    }
}

fn prepare_tcp(stream: TcpStream) -> io::Result<TcpStream> {
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// A socket left behind by a previous run blocks `bind`; anything that is
/// not a socket is left alone.
#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path),
        _ => Ok(()),
    }
}

/// A bound FastCGI listener that has not started accepting yet.
pub struct Server {
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    listener: Listener,
    local_address: ListenAddress,
}

impl Server {
    /// Validates `config` and binds its address.
    pub fn bind(config: ServerConfig, handler: impl Handler) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = Listener::bind(&config.address)?;
        let local_address = listener.local_address(&config.address)?;

        Ok(Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            listener,
            local_address,
        })
    }

    /// The bound address; for TCP the actual port when bound to port 0.
    pub fn local_address(&self) -> &ListenAddress {
        &self.local_address
    }

    /// Accepts connections on a background thread until
    /// [`ServerHandle::stop`] is called.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        self.listener.set_nonblocking(true)?;
        let connections = ThreadPool::new("connections", self.config.max_connections)?;
        let workers = Arc::new(ThreadPool::new("requests", self.config.max_requests)?);

        let stopped = Arc::new(AtomicBool::new(false));
        let local_address = self.local_address.clone();
        let flag = Arc::clone(&stopped);
        let thread = thread::Builder::new()
            .name("fcgid-accept".to_string())
            .spawn(move || self.accept_loop(connections, workers, &flag))?;

        Ok(ServerHandle {
            local_address,
            stopped,
            thread: Some(thread),
        })
    }

    /// Starts the server and blocks the calling thread until the accept
    /// thread exits. Nothing stops it from outside, so this serves for the
    /// life of the process.
    pub fn listen(self) -> Result<(), ServerError> {
        self.start()?.join()
    }

    fn accept_loop(
        self,
        connections: ThreadPool,
        workers: Arc<ThreadPool>,
        stopped: &AtomicBool,
    ) {
        info!("listening at {}", self.local_address);

        let registry = Registry::default();
        let active = Arc::new(AtomicUsize::new(0));
        let mut next_id = 0u64;

        while !stopped.load(Ordering::Acquire) {
            // Pending connections wait in the listen backlog while every
            // connection worker is busy.
            if active.load(Ordering::Acquire) >= self.config.max_connections {
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            let transport = match self.listener.accept() {
                Ok(transport) => transport,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    continue;
                }
            };

            next_id += 1;
            let id = next_id;
            match transport.try_clone() {
                Ok(clone) => {
                    lock(&registry).insert(id, clone);
                }
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    continue;
                }
            }

            active.fetch_add(1, Ordering::AcqRel);
            let connection = Connection::new(
                id,
                transport,
                Arc::clone(&self.config),
                Arc::clone(&self.handler),
                Arc::clone(&workers),
            );
            let done = {
                let registry = Arc::clone(&registry);
                let active = Arc::clone(&active);
                move || {
                    lock(&registry).remove(&id);
                    active.fetch_sub(1, Ordering::AcqRel);
                }
            };

            let job = move || {
                // Errors are logged by the connection itself.
                let _ = connection.serve();
                done();
            };
            if let Err(e) = connections.execute(job) {
                warn!("connection {id} dropped: {e}");
                if let Some(transport) = lock(&registry).remove(&id) {
                    let _ = transport.shutdown();
                }
                active.fetch_sub(1, Ordering::AcqRel);
            }
        }

        info!("stopping listener at {}", self.local_address);
        for (id, transport) in lock(&registry).drain() {
            debug!("closing connection {id}");
            let _ = transport.shutdown();
        }
        drop(connections);
        drop(workers);

        #[cfg(unix)]
        if let ListenAddress::Unix(path) = &self.local_address {
            if let Err(e) = fs::remove_file(path) {
                warn!("failed to remove {}: {e}", path.display());
            }
        }
        info!("listener at {} stopped", self.local_address);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Control over a running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_address: ListenAddress,
    stopped: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_address(&self) -> &ListenAddress {
        &self.local_address
    }

    /// Stops accepting, closes every open connection and waits for
    /// in-flight handlers to return.
    pub fn stop(mut self) -> Result<(), ServerError> {
        self.stopped.store(true, Ordering::Release);
        self.wait()
    }

    /// Blocks until the server stops.
    pub fn join(mut self) -> Result<(), ServerError> {
        self.wait()
    }

    fn wait(&mut self) -> Result<(), ServerError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::Panicked),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stopped.store(true, Ordering::Release);
            let _ = self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[cfg(unix)]
    use std::{io::Write, os::unix::net::UnixStream};

    #[cfg(unix)]
    use tempdir::TempDir;

    use crate::{
        config::ConfigError,
        handler::{HandlerError, Request, Response},
        protocol::{
            Record, RecordType,
            params::encode_pairs,
            request::{BeginRequest, EndRequest, ProtocolStatus, Role},
            transport::RecordTransport,
        },
    };

    use super::*;

    fn method(request: &Request) -> Result<Response, HandlerError> {
        Ok(Response::new(
            200,
            request.param("REQUEST_METHOD").unwrap_or("none").to_string(),
        ))
    }

    fn client(transport: Transport) -> RecordTransport<Transport> {
        let timeout = Some(Duration::from_secs(5));
        let set = match &transport {
            Transport::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.set_read_timeout(timeout),
        };
        set.unwrap();
        RecordTransport::new(transport)
    }

    fn begin(id: u16) -> Record {
        let content = BeginRequest::new(Role::Responder, true).encode().unwrap();
        Record::new(RecordType::BeginRequest, id, content)
    }

    fn exchange(peer: &mut RecordTransport<Transport>, id: u16, verb: &str) -> (Vec<u8>, EndRequest) {
        let params = encode_pairs([("REQUEST_METHOD", verb)]).unwrap();
        peer.write_records(&[
            begin(id),
            Record::new(RecordType::Params, id, params),
            Record::end_of_stream(RecordType::Params, id),
            Record::end_of_stream(RecordType::Stdin, id),
        ])
        .unwrap();

        let mut stdout = Vec::new();
        loop {
            let record = peer.read_record().unwrap().unwrap();
            match record.kind {
                RecordType::Stdout => stdout.extend(record.content),
                RecordType::EndRequest => {
                    return (stdout, EndRequest::decode(&record.content).unwrap());
                }
                other => panic!("unexpected {other} record"),
            }
        }
    }

    fn tcp_client(handle: &ServerHandle) -> RecordTransport<Transport> {
        let ListenAddress::Tcp(addr) = handle.local_address() else {
            panic!("expected a tcp address");
        };
        client(Transport::Tcp(TcpStream::connect(addr).unwrap()))
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_max_connections(0);
        let err = Server::bind(config, method).err().unwrap();
        assert!(matches!(
            err,
            ServerError::Config(ConfigError::ZeroLimit("max_connections"))
        ));
    }

    #[test]
    fn reports_bound_port() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Server::bind(config, method).unwrap();

        let ListenAddress::Tcp(addr) = server.local_address() else {
            panic!("expected a tcp address");
        };
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn connections_fail_independently() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let handle = Server::bind(config, method).unwrap().start().unwrap();

        let mut healthy = tcp_client(&handle);
        let mut broken = tcp_client(&handle);

        let (stdout, end) = exchange(&mut healthy, 1, "GET");
        assert_eq!(stdout, b"GET");
        assert_eq!(end, EndRequest::new(200, ProtocolStatus::RequestComplete));

        broken.write_records(&[begin(1), begin(1)]).unwrap();
        assert!(matches!(broken.read_record(), Ok(None) | Err(_)));

        let (stdout, _) = exchange(&mut healthy, 1, "POST");
        assert_eq!(stdout, b"POST");

        handle.stop().unwrap();
    }

    #[test]
    fn stop_closes_open_connections() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let handle = Server::bind(config, method).unwrap().start().unwrap();

        let mut peer = tcp_client(&handle);
        exchange(&mut peer, 1, "GET");
        handle.stop().unwrap();

        assert!(matches!(peer.read_record(), Ok(None) | Err(_)));
    }

    #[cfg(unix)]
    #[test]
    fn serves_unix_socket() {
        let temp = TempDir::new("fcgid").unwrap();
        let path = temp.path().join("fcgid.sock");
        let config = ServerConfig::new(ListenAddress::Unix(path.clone())).with_multiplex(true);
        let handle = Server::bind(config, method).unwrap().start().unwrap();
        assert_eq!(handle.local_address(), &ListenAddress::Unix(path.clone()));

        let mut peer = client(Transport::Unix(UnixStream::connect(&path).unwrap()));
        let (stdout, end) = exchange(&mut peer, 7, "PUT");
        assert_eq!(stdout, b"PUT");
        assert_eq!(end.app_status, 200);

        handle.stop().unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn replaces_stale_socket_but_not_files() {
        let temp = TempDir::new("fcgid").unwrap();

        let stale = temp.path().join("stale.sock");
        drop(UnixListener::bind(&stale).unwrap());
        let config = ServerConfig::new(ListenAddress::Unix(stale));
        assert!(Server::bind(config, method).is_ok());

        let file = temp.path().join("regular");
        fs::File::create(&file).unwrap().write_all(b"keep").unwrap();
        let config = ServerConfig::new(ListenAddress::Unix(file.clone()));
        assert!(Server::bind(config, method).is_err());
        assert_eq!(fs::read(&file).unwrap(), b"keep");
    }
}
