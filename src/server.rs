use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::Token;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::executor::{ClientInfo, WorkerPool};
use crate::http::{ConnectionOptions, Exchange};
use crate::net::{Direction, EventBase, Notification, Reactor};

/// Information about the peer of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handles complete requests.
///
/// A service runs on the worker thread owning the connection and must not
/// block. It answers through the [`Exchange`], or calls
/// [`Exchange::defer`] and finishes later through the returned
/// [`ReplyHandle`](crate::ReplyHandle). Without a deferral, an unanswered
/// request gets a 500 and an unfinished streamed reply is ended.
pub trait Service: Send + Sync + 'static {
    fn call(&self, exchange: &mut Exchange<'_>);
}

impl<F> Service for F
where
    F: Fn(&mut Exchange<'_>) + Send + Sync + 'static,
{
    fn call(&self, exchange: &mut Exchange<'_>) {
        self(exchange)
    }
}

/// Maps request paths to services.
///
/// A pattern is either an exact path or a prefix ending in `*`. Exact
/// matches win; otherwise the longest matching prefix is used. The query
/// string is not part of the match. Unmatched requests get 404.
#[derive(Default)]
pub struct Router {
    exact: HashMap<String, Box<dyn Service>>,
    /// Sorted longest first
    prefixes: Vec<(String, Box<dyn Service>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` for `pattern`, replacing an earlier registration.
    pub fn route(mut self, pattern: &str, service: impl Service) -> Self {
        self.insert(pattern, Box::new(service));
        self
    }

    fn insert(&mut self, pattern: &str, service: Box<dyn Service>) {
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                self.prefixes.retain(|(p, _)| p != prefix);
                self.prefixes.push((prefix.to_string(), service));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            None => {
                self.exact.insert(pattern.to_string(), service);
            }
        }
    }

    pub fn find(&self, path: &str) -> Option<&dyn Service> {
        if let Some(service) = self.exact.get(path) {
            return Some(service.as_ref());
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, service)| service.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

impl Service for Router {
    fn call(&self, exchange: &mut Exchange<'_>) {
        match self.find(exchange.request().path()) {
            Some(service) => service.call(exchange),
            None => exchange.send_error(404, "Not Found"),
        }
    }
}

/// HTTP server builder.
///
/// ```no_run
/// use evhttp::Server;
///
/// Server::bind("127.0.0.1:3000")
///     .route("/", |exchange: &mut evhttp::Exchange<'_>| {
///         exchange.send_reply(200, "OK", Some(b"Hello World!"));
///     })
///     .start()
///     .unwrap();
/// ```
pub struct Server {
    addr: String,
    config: ServerConfig,
    router: Router,
    service: Option<Arc<dyn Service>>,
}

impl Server {
    /// A server for `addr` with default settings.
    pub fn bind(addr: impl Into<String>) -> Self {
        Self::with_config(ServerConfig::default()).addr(addr)
    }

    /// A server configured from `.env`, an `evhttp` config file and
    /// `EVHTTP_` environment variables.
    pub fn from_env() -> ServerResult<Self> {
        Ok(Self::with_config(ServerConfig::new()?))
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            addr: config.address(),
            config,
            router: Router::new(),
            service: None,
        }
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    /// Per-phase inactivity timeout; zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_secs = timeout.as_secs();
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.config.max_header_size = size;
        self
    }

    pub fn max_body_size(mut self, size: u64) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Adds a route to the built-in [`Router`].
    pub fn route(mut self, pattern: &str, service: impl Service) -> Self {
        self.router.insert(pattern, Box::new(service));
        self
    }

    /// Serves every request with `service`, bypassing the router.
    pub fn service(mut self, service: impl Service) -> Self {
        self.service = Some(Arc::new(service));
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds, starts the workers and the acceptor, and returns immediately.
    ///
    /// # Errors
    /// Returns `Bind` if the address cannot be resolved or bound, and
    /// reactor or thread errors if startup fails.
    pub fn spawn(self) -> ServerResult<ServerHandle> {
        let addr = resolve(&self.addr)?;
        let mut listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            addr: self.addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        let mut reactor = Reactor::new()?;
        let token = reactor.register_listener(&mut listener)?;
        let waker = reactor.waker();

        let service = match self.service {
            Some(service) => service,
            None => Arc::new(self.router),
        };
        let options = ConnectionOptions::from(&self.config);
        let pool = WorkerPool::start(self.config.threads, self.config.wake_fanout, service, options)?;

        let terminate = Arc::new(AtomicBool::new(false));
        let acceptor = Acceptor {
            reactor,
            listener,
            token,
            pool,
            terminate: terminate.clone(),
        };
        let thread = thread::Builder::new()
            .name("evhttp-acceptor".to_owned())
            .spawn(move || acceptor.run())
            .map_err(ServerError::ThreadSpawn)?;

        log::info!("Listening on http://{}", local_addr);
        Ok(ServerHandle {
            local_addr,
            terminate,
            waker,
            thread: Some(thread),
        })
    }

    /// Runs the server on the current thread until it fails.
    pub fn start(self) -> ServerResult<()> {
        self.spawn()?.join()
    }
}

fn resolve(addr: &str) -> ServerResult<SocketAddr> {
    let bind_error = |source| ServerError::Bind { addr: addr.to_owned(), source };
    addr.to_socket_addrs()
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| bind_error(io::Error::new(io::ErrorKind::InvalidInput, "no address resolved")))
}

/// A running server.
///
/// Dropping the handle shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    terminate: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl ServerHandle {
    /// The bound address, with the actual port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every connection and waits for all threads.
    pub fn shutdown(mut self) -> ServerResult<()> {
        self.signal();
        self.wait()
    }

    /// Blocks until the server stops.
    pub fn join(mut self) -> ServerResult<()> {
        self.wait()
    }

    fn signal(&self) {
        self.terminate.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            log::error!("Failed to wake acceptor: {}", err);
        }
    }

    fn wait(&mut self) -> ServerResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ServerError::ThreadPanicked("evhttp-acceptor".to_owned()))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.signal();
            if let Err(err) = self.wait() {
                log::error!("Server shutdown failed: {}", err);
            }
        }
    }
}

/// Accepts connections and hands them to the worker pool.
struct Acceptor {
    reactor: Reactor,
    listener: TcpListener,
    token: Token,
    pool: WorkerPool,
    terminate: Arc<AtomicBool>,
}

impl Acceptor {
    fn run(mut self) -> ServerResult<()> {
        let mut notifications = Vec::new();
        let result = loop {
            if self.terminate.load(Ordering::Acquire) {
                break Ok(());
            }
            if let Err(err) = self.reactor.turn(None, &mut notifications) {
                break Err(err.into());
            }
            let ready = notifications
                .drain(..)
                .any(|n| matches!(n, Notification::Ready { token, .. } if token == self.token));
            if ready {
                if let Err(err) = self.accept_all() {
                    break Err(err);
                }
            }
        };

        log::info!("Shutting down");
        let shutdown = self.pool.shutdown();
        result.and(shutdown)
    }

    fn accept_all(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        log::debug!("set_nodelay failed for {}: {}", peer, err);
                    }
                    log::debug!("Accepted connection from {}", peer);
                    self.pool.dispatch(ClientInfo {
                        stream,
                        host: peer.ip().to_string(),
                        port: peer.port(),
                    })?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.reactor.clear_readiness(self.token, Direction::Read);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // retried on the next turn; readiness stays set
                    log::error!("Failed to accept connection: {}", err);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn reply_with(text: &'static str) -> impl Service {
        move |exchange: &mut Exchange<'_>| exchange.send_reply(200, "OK", Some(text.as_bytes()))
    }

    #[test]
    fn test_router_prefers_exact_then_longest_prefix() {
        let router = Router::new()
            .route("/", reply_with("root"))
            .route("/static/*", reply_with("static"))
            .route("/static/img/*", reply_with("img"))
            .route("/static/index.html", reply_with("index"));

        assert!(router.find("/").is_some());
        assert!(router.find("/static/index.html").is_some());
        assert!(router.find("/nope").is_none());
        assert!(router.find("/static").is_none());
        assert_eq!(router.prefixes[0].0, "/static/img/");
        assert!(!router.is_empty());
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(matches!(resolve("not an address"), Err(ServerError::Bind { .. })));
        assert_eq!(resolve("127.0.0.1:80").unwrap().port(), 80);
    }

    #[test]
    fn test_connection_info_display() {
        let info = ConnectionInfo { host: "10.0.0.1".into(), port: 8080 };
        assert_eq!(info.to_string(), "10.0.0.1:8080");
    }

    #[test]
    fn test_spawn_serves_routes_and_shuts_down() {
        let handle = Server::bind("127.0.0.1:0")
            .threads(2)
            .route("/static/*", reply_with("static"))
            .route("/", reply_with("root"))
            .spawn()
            .unwrap();
        assert_ne!(handle.local_addr().port(), 0);

        for (path, expected) in [("/", "root"), ("/static/a.css?v=1", "static")] {
            let mut client = TcpStream::connect(handle.local_addr()).unwrap();
            write!(client, "GET {} HTTP/1.0\r\n\r\n", path).unwrap();
            let mut reply = String::new();
            client.read_to_string(&mut reply).unwrap();
            assert!(reply.starts_with("HTTP/1.0 200 OK\r\n"), "{}", reply);
            assert!(reply.ends_with(expected), "{}", reply);
        }

        handle.shutdown().unwrap();
    }
}
