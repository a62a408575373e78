//! Listener and per-connection supervision.
//!
//! Each accepted socket gets its own task that reads a tag, dispatches it,
//! and loops until the peer disconnects, a protocol error occurs, or the
//! server shuts down. A failure inside one connection never reaches the
//! accept loop or any other connection.

use crate::accounts::{AccountStore, JsonAccountStore};
use crate::codec::{FrameReader, FrameWriter};
use crate::config::ServerConfig;
use crate::console::ConsoleSink;
use crate::dispatch::dispatch;
use crate::error::ConnectionError;
use crate::file_store::{FileStore, Inbox};
use crate::protocol::Tag;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// Everything a request handler may touch. Cloned into every connection task.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub files: Arc<FileStore>,
    pub inbox: Arc<Inbox>,
    pub accounts: Arc<dyn AccountStore>,
    pub console: Arc<dyn ConsoleSink>,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        files: FileStore,
        inbox: Inbox,
        accounts: Arc<dyn AccountStore>,
        console: Arc<dyn ConsoleSink>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            files: Arc::new(files),
            inbox: Arc::new(inbox),
            accounts,
            console,
        }
    }

    /// Open the on-disk stores named by `config`, creating directories as needed
    pub fn from_config(config: ServerConfig, console: Arc<dyn ConsoleSink>) -> Result<Self> {
        let files = FileStore::open(&config.users_root)
            .with_context(|| format!("open users root {}", config.users_root.display()))?;
        let inbox = Inbox::open(&config.inbox_dir)
            .with_context(|| format!("open inbox {}", config.inbox_dir.display()))?;
        let accounts = JsonAccountStore::open(&config.accounts_path)
            .with_context(|| format!("open accounts {}", config.accounts_path.display()))?;
        Ok(Self::new(config, files, inbox, Arc::new(accounts), console))
    }
}

/// One client's framed stream
pub struct Connection<S> {
    pub(crate) reader: FrameReader<ReadHalf<S>>,
    pub(crate) writer: FrameWriter<WriteHalf<S>>,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    pub fn new(stream: S, peer: impl Into<String>, idle: Option<Duration>) -> Self {
        let (r, w) = split(stream);
        Self {
            reader: FrameReader::new(r).with_idle_timeout(idle),
            writer: FrameWriter::new(w).with_idle_timeout(idle),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Why a connection loop ended
#[derive(Debug)]
enum Exit {
    Closed,
    Shutdown,
    UnknownTag(String),
    Failed(ConnectionError),
}

/// Serve requests on one stream until it ends
pub async fn supervise<S>(
    ctx: ServerContext,
    stream: S,
    peer: String,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    let started = Instant::now();
    let mut conn = Connection::new(stream, peer, ctx.config.idle_timeout());
    ctx.console
        .log(&format!("New client connected: {}", conn.peer()));
    let mut requests: u64 = 0;

    let exit = loop {
        if *shutdown.borrow() {
            break Exit::Shutdown;
        }
        // Shutdown only interrupts the wait between requests; a request in
        // progress is allowed to finish.
        let next = tokio::select! {
            _ = shutdown.changed() => break Exit::Shutdown,
            r = conn.reader.read_tag() => r,
        };
        let wire = match next {
            Ok(Some(wire)) => wire,
            Ok(None) => break Exit::Closed,
            Err(e) => break Exit::Failed(e.into()),
        };
        let Some(tag) = Tag::from_wire(&wire) else {
            break Exit::UnknownTag(wire);
        };
        requests += 1;
        if let Err(e) = dispatch(&ctx, &mut conn, tag).await {
            break Exit::Failed(e);
        }
    };

    match &exit {
        Exit::Closed => {}
        Exit::Shutdown => debug!(peer = conn.peer(), "closing for shutdown"),
        Exit::UnknownTag(wire) => {
            warn!(peer = conn.peer(), tag = %wire, "unknown request tag; closing")
        }
        Exit::Failed(e) => warn!(peer = conn.peer(), error = %e, "connection error"),
    }
    if let Err(e) = conn.writer.shutdown().await {
        debug!(peer = conn.peer(), error = %e, "socket shutdown");
    }
    ctx.console
        .log(&format!("Client disconnected: {}", conn.peer()));
    info!(
        peer = conn.peer(),
        requests,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "connection closed"
    );
}

/// Cloneable trigger for [`Server::run`] to stop accepting and drain
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Server {
    ctx: ServerContext,
    listener: TcpListener,
    limiter: Option<Arc<Semaphore>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server {
    pub async fn bind(ctx: ServerContext) -> Result<Self> {
        let listener = TcpListener::bind(ctx.config.bind.as_str())
            .await
            .with_context(|| format!("bind {}", ctx.config.bind))?;
        let limiter = ctx
            .config
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let (tx, _rx) = watch::channel(false);
        Ok(Self {
            ctx,
            listener,
            limiter,
            shutdown: Arc::new(tx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Accept until shut down, then wait up to the grace period for open
    /// connections before aborting them.
    pub async fn run(self) -> Result<()> {
        let Server {
            ctx,
            listener,
            limiter,
            shutdown,
        } = self;
        let mut stop = shutdown.subscribe();
        let mut workers: JoinSet<()> = JoinSet::new();
        info!(addr = %listener.local_addr()?, "listening");
        ctx.console.log(&format!(
            "Server started on {}",
            listener.local_addr()?
        ));

        loop {
            if *stop.borrow() {
                break;
            }
            // Hold a slot before accepting so excess clients wait in the backlog
            let permit = match &limiter {
                Some(sem) => tokio::select! {
                    _ = stop.changed() => break,
                    p = sem.clone().acquire_owned() => match p {
                        Ok(p) => Some(p),
                        Err(_) => break,
                    },
                },
                None => None,
            };
            tokio::select! {
                _ = stop.changed() => break,
                Some(res) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            warn!(error = %e, "connection task panicked");
                        }
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %addr, error = %e, "set_nodelay");
                        }
                        let ctx = ctx.clone();
                        let rx = shutdown.subscribe();
                        workers.spawn(async move {
                            let _permit = permit;
                            supervise::<TcpStream>(ctx, stream, addr.to_string(), rx).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        shutdown.send_replace(true);
        let open = workers.len();
        if open > 0 {
            info!(open, "draining connections");
        }
        let grace = ctx.config.shutdown_grace();
        let drained = timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = workers.len(), "grace period elapsed; aborting connections");
            workers.shutdown().await;
        }
        ctx.console.log("Server stopped");
        info!("server stopped");
        Ok(())
    }

    /// Run until `signal` completes, then shut down gracefully
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            signal.await;
            handle.shutdown();
        });
        self.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::MemoryAccountStore;
    use crate::console::MemoryConsole;
    use crate::protocol::status;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn context(console: Arc<MemoryConsole>) -> (tempfile::TempDir, ServerContext) {
        let t = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            users_root: t.path().join("users"),
            inbox_dir: t.path().join("inbox"),
            ..Default::default()
        };
        let files = FileStore::open(&cfg.users_root).unwrap();
        let inbox = Inbox::open(&cfg.inbox_dir).unwrap();
        let ctx = ServerContext::new(
            cfg,
            files,
            inbox,
            Arc::new(MemoryAccountStore::new()),
            console,
        );
        (t, ctx)
    }

    fn client(s: DuplexStream) -> (FrameReader<ReadHalf<DuplexStream>>, FrameWriter<WriteHalf<DuplexStream>>) {
        let (r, w) = split(s);
        (FrameReader::new(r), FrameWriter::new(w))
    }

    #[tokio::test]
    async fn test_requests_on_one_connection() {
        let console = Arc::new(MemoryConsole::new());
        let (_t, ctx) = context(console.clone());
        let (a, b) = duplex(64 * 1024);
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(ctx, b, "test".to_string(), rx));

        let (mut r, mut w) = client(a);
        w.write_tag(Tag::Register.as_wire()).await.unwrap();
        w.write_string("ada").await.unwrap();
        w.write_string("pw").await.unwrap();
        w.write_string("").await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(r.read_string().await.unwrap(), status::CONNECTION_SAVED);

        w.write_tag(Tag::LoginCheck.as_wire()).await.unwrap();
        w.write_string("ada").await.unwrap();
        w.write_string("pw").await.unwrap();
        w.flush().await.unwrap();
        assert_eq!(r.read_string().await.unwrap(), status::EXIST_USER);

        w.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(console
            .lines()
            .iter()
            .any(|l| l.contains("Client disconnected")));
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_silently() {
        let (_t, ctx) = context(Arc::new(MemoryConsole::new()));
        let (a, b) = duplex(1024);
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(ctx, b, "test".to_string(), rx));

        let (mut r, mut w) = client(a);
        w.write_tag("FORMAT_DISK").await.unwrap();
        w.flush().await.unwrap();
        task.await.unwrap();

        let mut rest = Vec::new();
        r.into_inner().read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_reload_has_no_response() {
        let console = Arc::new(MemoryConsole::new());
        let (_t, ctx) = context(console.clone());
        let (a, b) = duplex(1024);
        let (_tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(ctx, b, "test".to_string(), rx));

        let (mut r, mut w) = client(a);
        w.write_tag(Tag::Reload.as_wire()).await.unwrap();
        w.flush().await.unwrap();
        w.shutdown().await.unwrap();
        task.await.unwrap();

        let mut rest = Vec::new();
        r.into_inner().read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(console.lines().iter().any(|l| l.contains("reload")));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_connection() {
        let (_t, ctx) = context(Arc::new(MemoryConsole::new()));
        let (_a, b) = duplex(1024);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervise(ctx, b, "test".to_string(), rx));
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection did not observe shutdown")
            .unwrap();
    }
}
