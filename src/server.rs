//! TCP server for RESP clients.
//!
//! Accepts connections, hands each one to the RESP connection loop with a
//! shared dispatcher, and runs the periodic expiry sweep against the
//! storage backend.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::protocols::resp::handle_connection;
use crate::storage::Storage;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Server instance
pub struct Server {
    listen: String,
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
    connection_limit: Arc<Semaphore>,
    sweep_delay: Duration,
    sweep_interval: Duration,
    /// Present when connections must complete a TLS handshake first
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config, storage: Arc<dyn Storage>, dispatcher: Arc<Dispatcher>) -> Self {
        Server {
            listen: config.server.listen.clone(),
            storage,
            dispatcher,
            connection_limit: Arc::new(Semaphore::new(config.server.max_connections)),
            sweep_delay: Duration::from_secs(config.storage.sweep_delay),
            sweep_interval: Duration::from_secs(config.storage.sweep_interval),
            tls: None,
        }
    }

    /// Serve every connection over TLS
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = tokio::net::lookup_host(&self.listen)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "listen address did not resolve"))?;

        let listener = bind(addr)?;
        info!(address = %listener.local_addr()?, tls = self.tls.is_some(), "Server listening");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

        info!("Server stopped");
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` completes.
    ///
    /// Connections that are already open keep running on their own tasks;
    /// only the accept loop and the sweep stop.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let sweep = tokio::spawn(sweep_task(
            Arc::clone(&self.storage),
            self.sweep_delay,
            self.sweep_interval,
        ));

        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = &mut shutdown => break,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let dispatcher = Arc::clone(&self.dispatcher);
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => handle_connection(stream, dispatcher).await,
                                Err(e) => Err(e),
                            },
                            None => handle_connection(stream, dispatcher).await,
                        };
                        if let Err(e) = result {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Shutting down");
        sweep.abort();
    }
}

/// Create a TCP listener with SO_REUSEADDR set, ready for tokio.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

/// Background task that physically removes expired records.
///
/// Waits `delay` before the first pass, then runs every `interval`. A failed
/// pass is logged and the next one runs on schedule.
async fn sweep_task(storage: Arc<dyn Storage>, delay: Duration, interval: Duration) {
    tokio::time::sleep(delay).await;

    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match storage.clear_expired().await {
            Ok(0) => {}
            Ok(count) => debug!(count, backend = storage.name(), "Cleared expired keys"),
            Err(e) => error!(error = %e, backend = storage.name(), "Expiry sweep failed"),
        }
    }
}
