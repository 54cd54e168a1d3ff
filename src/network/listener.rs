use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace};

use crate::service::{ListenerInfo, Shutdown};
use crate::{AppError, AppResult};

const MAX_ACCEPT_BACKOFF_MS: u64 = 1000;

/// Receives every connection a listener accepts.
pub(crate) trait AcceptHandler: Send + Sync + 'static {
    fn on_accepted(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        shutdown_complete_tx: &mpsc::Sender<()>,
    );
}

/// A bound and listening socket.
#[derive(Debug)]
pub struct Listener {
    info: ListenerInfo,
    listener: TcpListener,
}

impl Listener {
    /// Binds `info.endpoint` and starts listening with `info.backlog`.
    /// Must be called from within a tokio runtime.
    pub fn bind(info: ListenerInfo) -> AppResult<Listener> {
        let endpoint = info.endpoint;
        let domain = match endpoint {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&endpoint.into()).map_err(|e| {
            AppError::DetailedIoError(format!("failed to bind {}: {}", endpoint, e))
        })?;
        socket.listen(info.backlog)?;

        let listener = TcpListener::from_std(socket.into())?;
        Ok(Listener { info, listener })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn info(&self) -> &ListenerInfo {
        &self.info
    }

    /// Accepts until shutdown is signalled. Accept errors are logged and the
    /// loop goes on after a short pause.
    pub(crate) async fn run(
        self,
        acceptor: Arc<dyn AcceptHandler>,
        mut shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let endpoint = self
            .listener
            .local_addr()
            .unwrap_or(self.info.endpoint);
        info!("listener on {} started", endpoint);

        let mut backoff = 1;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("listener on {} received shutdown signal", endpoint);
                    break;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    backoff = 1;
                    trace!("accepted connection from {} on {}", remote, endpoint);
                    acceptor.on_accepted(stream, remote, &shutdown_complete_tx);
                }
                Err(e) => {
                    error!("accept error on {}: {}", endpoint, e);
                    time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF_MS);
                }
            }
        }
        // release the port before signalling completion
        drop(self.listener);
        drop(shutdown_complete_tx);
        info!("listener on {} stopped", endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_bind_ephemeral_port() -> AppResult<()> {
        let listener = Listener::bind(ListenerInfo {
            endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            backlog: 5,
        })?;
        let addr = listener.local_addr()?;
        assert_ne!(addr.port(), 0);
        TcpStream::connect(addr).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_bind_conflict() -> AppResult<()> {
        let first = Listener::bind(ListenerInfo {
            endpoint: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            backlog: 5,
        })?;
        let taken = first.local_addr()?;
        let second = Listener::bind(ListenerInfo {
            endpoint: taken,
            backlog: 5,
        });
        assert!(matches!(second, Err(AppError::DetailedIoError(_))));
        Ok(())
    }
}
