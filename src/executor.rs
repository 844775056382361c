use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::net::TcpStream;
use mio::Token;

use crate::error::{ServerError, ServerResult};
use crate::http::{ConnectionOptions, HttpConnection, ReplyQueue};
use crate::net::{Direction, Notification, Reactor};
use crate::server::{ConnectionInfo, Service};

/// An accepted socket waiting for a worker to adopt it.
#[derive(Debug)]
pub struct ClientInfo {
    pub stream: TcpStream,
    pub host: String,
    pub port: u16,
}

/// A fixed pool of worker threads, each running its own reactor.
///
/// Connections are sharded across workers and never move between them: a
/// connection is only ever touched by the thread that adopted it. The
/// client queue is the only state shared between threads.
pub struct WorkerPool {
    inner: Arc<Inner>,
    handles: Vec<JoinHandle<ServerResult<()>>>,
}

/// Internal state shared between the acceptor and the worker threads
struct Inner {
    /// Accepted clients not yet claimed by a worker
    queue: Mutex<VecDeque<ClientInfo>>,
    /// One waker per worker reactor
    wakers: Vec<Arc<mio::Waker>>,
    /// Next worker to wake; advances round-robin
    cursor: AtomicUsize,
    /// Workers woken per dispatched client
    fanout: usize,
    terminate: AtomicBool,
}

impl WorkerPool {
    /// Starts `threads` workers serving `service`.
    ///
    /// # Errors
    /// Returns an error if a reactor cannot be created or a thread cannot be
    /// spawned.
    pub fn start(
        threads: usize,
        fanout: usize,
        service: Arc<dyn Service>,
        options: ConnectionOptions,
    ) -> ServerResult<Self> {
        let threads = threads.max(1);
        let reactors = (0..threads).map(|_| Reactor::new()).collect::<Result<Vec<_>, _>>()?;

        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            wakers: reactors.iter().map(Reactor::waker).collect(),
            cursor: AtomicUsize::new(0),
            fanout: fanout.clamp(1, threads),
            terminate: AtomicBool::new(false),
        });

        let mut pool = WorkerPool { inner, handles: Vec::with_capacity(threads) };
        for (index, reactor) in reactors.into_iter().enumerate() {
            let worker = Worker {
                index,
                inner: pool.inner.clone(),
                replies: Arc::new(ReplyQueue::with_waker(reactor.waker())),
                reactor,
                connections: HashMap::new(),
                service: service.clone(),
                options: options.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("evhttp-worker-{}", index))
                .spawn(move || worker.run())
                .map_err(ServerError::ThreadSpawn)?;
            pool.handles.push(handle);
        }

        log::debug!("started {} workers", threads);
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.inner.wakers.len()
    }

    /// Queues an accepted client and wakes some workers to claim it.
    ///
    /// # Errors
    /// Returns `LockPoisoned` if a worker panicked while holding the queue.
    pub fn dispatch(&self, client: ClientInfo) -> ServerResult<()> {
        self.inner
            .queue
            .lock()
            .map_err(|_| ServerError::LockPoisoned)?
            .push_back(client);
        self.inner.wake(self.inner.fanout);
        Ok(())
    }

    /// Stops every worker, closing their connections, and waits for them.
    pub fn shutdown(&mut self) -> ServerResult<()> {
        self.inner.terminate.store(true, Ordering::Release);
        for waker in &self.inner.wakers {
            if let Err(err) = waker.wake() {
                log::error!("Failed to wake worker for shutdown: {}", err);
            }
        }

        let mut result = Ok(());
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("evhttp-worker").to_owned();
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::error!("Worker {} failed: {}", name, err);
                    result = Err(err);
                }
                Err(_) => result = Err(ServerError::ThreadPanicked(name)),
            }
        }
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            if let Err(err) = self.shutdown() {
                log::error!("Worker pool shutdown failed: {}", err);
            }
        }
    }
}

impl Inner {
    /// Wakes up to `count` workers, starting where the last wake stopped.
    fn wake(&self, count: usize) {
        let len = self.wakers.len();
        for _ in 0..count.min(len) {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            if let Err(err) = self.wakers[index].wake() {
                log::error!("Failed to wake worker {}: {}", index, err);
            }
        }
    }

    /// Takes at most one queued client. If more remain, another worker is
    /// signalled so a coalesced wake never strands a client.
    fn claim(&self) -> ServerResult<Option<ClientInfo>> {
        let mut queue = self.queue.lock().map_err(|_| ServerError::LockPoisoned)?;
        let client = queue.pop_front();
        let more = !queue.is_empty();
        drop(queue);

        if more {
            self.wake(1);
        }
        Ok(client)
    }
}

/// One worker thread: a reactor and the connections it owns.
struct Worker {
    index: usize,
    inner: Arc<Inner>,
    /// Commands from deferred replies to this worker's connections
    replies: Arc<ReplyQueue>,
    reactor: Reactor,
    connections: HashMap<Token, HttpConnection<TcpStream>>,
    service: Arc<dyn Service>,
    options: ConnectionOptions,
}

impl Worker {
    /// Main worker loop.
    ///
    /// The worker will:
    /// 1. Wait for readiness, timer expiry or a wake
    /// 2. Forward each notification to the connection it names
    /// 3. On every wake, adopt a queued client and apply deferred replies
    /// 4. Drop connections that closed during the turn
    ///
    /// # Errors
    /// Returns an error if polling fails or the client queue is poisoned.
    fn run(mut self) -> ServerResult<()> {
        let mut notifications = Vec::with_capacity(256);

        while !self.inner.terminate.load(Ordering::Acquire) {
            self.reactor.turn(None, &mut notifications)?;

            for notification in notifications.drain(..) {
                match notification {
                    Notification::Wake => {
                        if let Some(client) = self.inner.claim()? {
                            self.adopt(client);
                        }
                        self.resume_replies();
                    }
                    Notification::Ready { token, direction } => {
                        if let Some(conn) = self.connections.get_mut(&token) {
                            match direction {
                                Direction::Read => conn.handle_readable(&mut self.reactor),
                                Direction::Write => conn.handle_writable(&mut self.reactor),
                            }
                        }
                    }
                    Notification::Timer(key) => {
                        if let Some(conn) = self.connections.get_mut(&key.token) {
                            conn.handle_timeout(&mut self.reactor, key.kind);
                        }
                    }
                }
            }

            let reactor = &mut self.reactor;
            self.connections.retain(|token, conn| {
                if conn.is_closed() {
                    reactor.forget(*token);
                    false
                } else {
                    true
                }
            });
        }

        log::debug!("worker {} closing {} connections", self.index, self.connections.len());
        for (_, mut conn) in self.connections.drain() {
            conn.close(&mut self.reactor, false);
        }
        Ok(())
    }

    fn resume_replies(&mut self) {
        for deferred in self.replies.drain() {
            match self.connections.get_mut(&deferred.token()) {
                Some(conn) => conn.resume(&mut self.reactor, deferred),
                None => log::debug!("worker {} dropped a reply for closed {:?}", self.index, deferred.token()),
            }
        }
    }

    fn adopt(&mut self, client: ClientInfo) {
        let ClientInfo { mut stream, host, port } = client;
        let token = match self.reactor.register(&mut stream) {
            Ok(token) => token,
            Err(err) => {
                log::error!("Failed to register client {}:{}: {}", host, port, err);
                return;
            }
        };

        log::debug!("worker {} adopted {}:{} as {:?}", self.index, host, port, token);
        let info = ConnectionInfo { host, port };
        let mut conn = HttpConnection::server(token, stream, info, self.service.clone(), self.options.clone())
            .with_reply_queue(self.replies.clone());
        conn.serve(&mut self.reactor);
        self.connections.insert(token, conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Exchange;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream as StdStream};

    fn hello() -> Arc<dyn Service> {
        Arc::new(|exchange: &mut Exchange<'_>| {
            let body = format!("hello {}", exchange.info().host);
            exchange.send_reply(200, "OK", Some(body.as_bytes()));
        })
    }

    /// Returns a connected (client, accepted) pair with the accepted side
    /// ready for a worker.
    fn socket_pair(listener: &TcpListener) -> (StdStream, ClientInfo) {
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let info = ClientInfo {
            stream: TcpStream::from_std(accepted),
            host: peer.ip().to_string(),
            port: peer.port(),
        };
        (client, info)
    }

    #[test]
    fn test_pool_creation() {
        let mut pool = WorkerPool::start(3, 10, hello(), ConnectionOptions::default()).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.inner.fanout, 3);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_dispatched_clients_are_served() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut pool = WorkerPool::start(2, 2, hello(), ConnectionOptions::default()).unwrap();

        let mut clients = Vec::new();
        for _ in 0..4 {
            let (client, info) = socket_pair(&listener);
            pool.dispatch(info).unwrap();
            clients.push(client);
        }

        for mut client in clients {
            client.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
            let mut reply = String::new();
            client.read_to_string(&mut reply).unwrap();
            assert!(reply.starts_with("HTTP/1.0 200 OK\r\n"), "{}", reply);
            assert!(reply.ends_with("hello 127.0.0.1"));
        }

        pool.shutdown().unwrap();
    }

    #[test]
    fn test_claim_takes_one_client() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let reactor = Reactor::new().unwrap();
        let inner = Inner {
            queue: Mutex::new(VecDeque::new()),
            wakers: vec![reactor.waker()],
            cursor: AtomicUsize::new(0),
            fanout: 1,
            terminate: AtomicBool::new(false),
        };

        let (_first, info) = socket_pair(&listener);
        inner.queue.lock().unwrap().push_back(info);
        let (_second, info) = socket_pair(&listener);
        inner.queue.lock().unwrap().push_back(info);

        assert!(inner.claim().unwrap().is_some());
        assert_eq!(inner.queue.lock().unwrap().len(), 1);
        assert!(inner.claim().unwrap().is_some());
        assert!(inner.claim().unwrap().is_none());
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut pool = WorkerPool::start(1, 1, hello(), ConnectionOptions::default()).unwrap();

        let (mut client, info) = socket_pair(&listener);
        pool.dispatch(info).unwrap();
        // a keep-alive exchange leaves the connection open
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut buf = [0u8; 256];
        assert!(client.read(&mut buf).unwrap() > 0);

        pool.shutdown().unwrap();
        client.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        // EOF instead of a timeout
        assert!(client.read_to_end(&mut rest).is_ok());
    }

    #[test]
    fn test_deferred_reply_is_finished_from_another_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let service: Arc<dyn Service> = Arc::new(|exchange: &mut Exchange<'_>| {
            let mut handle = exchange.defer();
            thread::spawn(move || {
                handle.send_reply_start(200, "OK");
                for word in ["one", "two"] {
                    thread::sleep(std::time::Duration::from_millis(20));
                    handle.send_reply_chunk(word.as_bytes());
                }
                handle.send_reply_end();
            });
        });
        let mut pool = WorkerPool::start(1, 1, service, ConnectionOptions::default()).unwrap();

        let (mut client, info) = socket_pair(&listener);
        pool.dispatch(info).unwrap();
        client.write_all(b"GET /slow HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{}", reply);
        assert!(reply.ends_with("\r\n\r\n3\r\none\r\n3\r\ntwo\r\n0\r\n\r\n"), "{}", reply);
        pool.shutdown().unwrap();
    }
}
