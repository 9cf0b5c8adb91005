//! Server wiring: listener, outgoing connector and periodic maintenance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionType};
use crate::dns::DomainResolver;
use crate::error::S2sError;
use crate::handler::S2sHandler;
use crate::manager::{ConnectRequest, S2sState};
use crate::packet::Packet;
use crate::proc::Pipeline;
use crate::tls::TlsContext;
use crate::transport::{InboundStanza, Transport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs.
struct Shared {
    state: Arc<S2sState>,
    pipeline: Arc<Pipeline>,
    tls: Option<Arc<TlsContext>>,
    resolver: Arc<DomainResolver>,
    router: mpsc::UnboundedSender<InboundStanza>,
}

impl Shared {
    fn transport(&self, conn: Arc<Connection>) -> Transport {
        Transport::new(
            conn,
            self.pipeline.clone(),
            self.state.clone(),
            self.tls.clone(),
            self.resolver.clone(),
            self.router.clone(),
        )
    }

    async fn serve_incoming(&self, stream: TcpStream, addr: SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(ConnectionType::Accept, Some(addr), tx);
        tracing::debug!(conn = conn.id(), peer = %addr, "Accepted S2S connection");
        self.transport(conn).run(stream, rx).await;
    }

    async fn connect_outgoing(&self, req: ConnectRequest) {
        let cc = match self.state.get_cid_connections(&req.cid, true) {
            Ok(Some(cc)) => cc,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(cid = %req.cid, error = %e, "Refusing outgoing connection");
                return;
            }
        };

        let mut stream = None;
        for endpoint in self.resolver.resolve_endpoints(req.cid.remote_host()).await {
            let addr = endpoint.addr();
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(s)) => {
                    stream = Some(s);
                    break;
                }
                Ok(Err(e)) => tracing::debug!(cid = %req.cid, addr = %addr, error = %e, "Connect failed"),
                Err(_) => tracing::debug!(cid = %req.cid, addr = %addr, "Connect timed out"),
            }
        }
        let Some(stream) = stream else {
            if req.handshaking_only {
                tracing::warn!(cid = %req.cid, "No route for dialback verification");
            } else {
                cc.connect_attempt_finished();
                let dropped = cc.take_waiting();
                tracing::warn!(cid = %req.cid, dropped = dropped.len(), "Remote server unreachable");
            }
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::outgoing(req.cid.clone(), req.handshaking_only, stream.peer_addr().ok(), tx);
        cc.add_outgoing_handshaking(&conn);
        if !req.handshaking_only {
            // The handshaking entry now blocks duplicate connects.
            cc.connect_attempt_finished();
        }
        tracing::info!(
            conn = conn.id(),
            cid = %req.cid,
            peer = ?conn.remote_address(),
            handshaking_only = req.handshaking_only,
            "Outgoing S2S connection"
        );
        self.transport(conn).run(stream, rx).await;
    }

    fn maintenance(&self, auth_timeout: Duration) {
        let expired = self.pipeline.dialback().expire_pending(auth_timeout);
        let pruned = self.state.prune_idle();
        let stats = self.state.stats(&self.pipeline);
        tracing::info!(
            cids = stats.cids,
            incoming = stats.incoming,
            outgoing = stats.outgoing,
            handshaking = stats.handshaking,
            waiting = stats.waiting_packets,
            pending = stats.pending_verifications,
            expired,
            pruned,
            "S2S statistics"
        );
        for (method, cid, count) in &stats.failures {
            tracing::info!(method = method.name(), cid = %cid, count, "Authentication failures");
        }
    }
}

/// A started server, for embedding and tests.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub state: Arc<S2sState>,
    pub pipeline: Arc<Pipeline>,
    /// Authorized inbound stanzas.
    pub inbound: mpsc::UnboundedReceiver<InboundStanza>,
    pub handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    /// Send a stanza to a remote domain.
    pub fn send_packet(&self, packet: Packet) -> Result<(), S2sError> {
        self.state.send_packet(packet)
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    fn build_tls(&self) -> Result<Option<TlsContext>> {
        let (Some(cert), Some(key)) = (self.config.tls_cert.as_deref(), self.config.tls_key.as_deref()) else {
            return Ok(None);
        };
        TlsContext::load(cert, key, self.config.tls_ca.as_deref()).map(Some)
    }

    fn build(
        &self,
    ) -> Result<(
        Arc<Shared>,
        mpsc::UnboundedReceiver<ConnectRequest>,
        mpsc::UnboundedReceiver<InboundStanza>,
    )> {
        anyhow::ensure!(!self.config.domains.is_empty(), "At least one --domain is required");
        let tls = self.build_tls()?.map(Arc::new);
        let policy = self.config.policy();
        let resolver = Arc::new(DomainResolver::new(
            self.config.static_route_map().context("Invalid static route")?,
        ));

        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let (router, inbound) = mpsc::unbounded_channel();
        let state = Arc::new(S2sState::new(
            policy.clone(),
            &self.config.dialback_secrets,
            tls.is_some(),
            connect_tx,
        ));
        let pipeline = Arc::new(Pipeline::new(state.clone(), &policy, resolver.clone()));
        tracing::debug!(stages = ?pipeline.stage_names(), "Pipeline ready");

        let shared = Arc::new(Shared {
            state,
            pipeline,
            tls,
            resolver,
            router,
        });
        Ok((shared, connect_rx, inbound))
    }

    /// Bind the configured address and start serving.
    pub async fn start(self) -> Result<RunningServer> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        self.start_on(listener).await
    }

    /// Spawn the background tasks on an already-bound listener.
    pub async fn start_on(self, listener: TcpListener) -> Result<RunningServer> {
        let (shared, mut connect_rx, inbound) = self.build()?;
        let addr = listener.local_addr()?;
        tracing::info!(
            addr = %addr,
            domains = ?self.config.domains,
            tls = shared.tls.is_some(),
            "S2S listener ready"
        );

        {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(req) = connect_rx.recv().await {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move { shared.connect_outgoing(req).await });
                }
            });
        }

        {
            let shared = Arc::clone(&shared);
            let period = Duration::from_secs(self.config.stats_interval_secs.max(1));
            let auth_timeout = shared.state.config().auth_timeout;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // skip first immediate tick
                loop {
                    interval.tick().await;
                    shared.maintenance(auth_timeout);
                }
            });
        }

        let accept_shared = Arc::clone(&shared);
        let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Accept error: {e}");
                        continue;
                    }
                };
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move { shared.serve_incoming(stream, addr).await });
            }
        });

        Ok(RunningServer {
            addr,
            state: shared.state.clone(),
            pipeline: shared.pipeline.clone(),
            inbound,
            handle,
        })
    }

    /// Run the server, blocking forever. Inbound stanzas are logged.
    pub async fn run(self) -> Result<()> {
        let RunningServer {
            mut inbound, handle, ..
        } = self.start().await?;
        tokio::spawn(async move {
            while let Some(stanza) = inbound.recv().await {
                tracing::info!(
                    session_id = ?stanza.session_id,
                    from = ?stanza.packet.stanza_from(),
                    to = ?stanza.packet.stanza_to(),
                    kind = stanza.packet.name(),
                    "Inbound stanza"
                );
            }
        });
        handle.await.context("Listener task failed")?
    }
}
