use crate::config::Settings;
use crate::error::Result;
use crate::relay::RelayTransaction;
use crate::smtp::session::SmtpSession;
use crate::trace::{NullObserver, ProtocolObserver, TraceLog};
use crate::transport::local_hostname;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct SmtpServer {
    settings: Arc<Settings>,
    relay: Arc<RelayTransaction>,
    trace: Arc<TraceLog>,
    hostname: String,
}

impl SmtpServer {
    pub fn new(settings: Arc<Settings>, relay: Arc<RelayTransaction>, trace: Arc<TraceLog>) -> Self {
        Self {
            settings,
            relay,
            trace,
            hostname: local_hostname(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Listen on `0.0.0.0:listenPort` until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.settings.listen_port));
        let listener = TcpListener::bind(addr).await?;
        info!("SMTP relay listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already bound listener
    ///
    /// Once `shutdown` fires no new connection is accepted; open sessions
    /// receive a 421 and the call returns when they have all ended.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SMTP listener shutting down");
                    break;
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New SMTP connection from {}", addr);

                        let session = SmtpSession::new(
                            self.hostname.clone(),
                            addr.ip(),
                            Arc::clone(&self.relay),
                            self.observer(),
                            shutdown.child_token(),
                        );

                        sessions.spawn(async move {
                            if let Err(e) = session.handle(socket).await {
                                error!("Session error with {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        drop(listener);
        debug!("Waiting for {} open session(s)", sessions.len());
        while sessions.join_next().await.is_some() {}

        Ok(())
    }

    fn observer(&self) -> Box<dyn ProtocolObserver> {
        if self.settings.enable_logging {
            Box::new(self.trace.session())
        } else {
            Box::new(NullObserver)
        }
    }
}
