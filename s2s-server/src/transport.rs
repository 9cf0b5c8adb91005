//! Per-socket driver.
//!
//! One task per connection reads the socket, cuts the byte stream into
//! frames and feeds them through the [`Pipeline`], and executes the
//! [`ConnCommand`]s the stages queue on the connection. Queued commands
//! are always drained before the next frame is processed, so a STARTTLS
//! upgrade or a stream close takes effect before anything the peer sent
//! afterwards is looked at.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::TlsStream;

use crate::connection::{ConnCommand, Connection};
use crate::dns::DomainResolver;
use crate::error::S2sError;
use crate::manager::S2sState;
use crate::packet::Packet;
use crate::proc::{generate_stream_error, Dispatch, Pipeline};
use crate::tls::TlsContext;
use crate::xml::{Frame, StreamFramer};

const READ_BUF_SIZE: usize = 16 * 1024;

/// An authorized inbound stanza handed to the router.
#[derive(Debug, Clone)]
pub struct InboundStanza {
    pub session_id: Option<String>,
    pub packet: Packet,
}

enum StreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Closed,
}

impl StreamIo {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamIo::Plain(s) => s.read(buf).await,
            StreamIo::Tls(s) => s.read(buf).await,
            StreamIo::Closed => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            StreamIo::Plain(s) => s.write_all(data).await,
            StreamIo::Tls(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            StreamIo::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            StreamIo::Plain(s) => s.shutdown().await,
            StreamIo::Tls(s) => s.shutdown().await,
            StreamIo::Closed => Ok(()),
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

enum Event {
    Command(Option<ConnCommand>),
    Recheck(Packet),
    Read(io::Result<usize>),
}

pub struct Transport {
    conn: Arc<Connection>,
    pipeline: Arc<Pipeline>,
    state: Arc<S2sState>,
    tls: Option<Arc<TlsContext>>,
    resolver: Arc<DomainResolver>,
    router: mpsc::UnboundedSender<InboundStanza>,
}

impl Transport {
    pub fn new(
        conn: Arc<Connection>,
        pipeline: Arc<Pipeline>,
        state: Arc<S2sState>,
        tls: Option<Arc<TlsContext>>,
        resolver: Arc<DomainResolver>,
        router: mpsc::UnboundedSender<InboundStanza>,
    ) -> Self {
        Self {
            conn,
            pipeline,
            state,
            tls,
            resolver,
            router,
        }
    }

    /// Drive `stream` until either side closes it.
    pub async fn run(self, stream: TcpStream, mut commands: mpsc::UnboundedReceiver<ConnCommand>) {
        let mut io = StreamIo::Plain(stream);
        let mut framer = StreamFramer::new();
        let (recheck_tx, mut recheck_rx) = mpsc::unbounded_channel::<Packet>();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        tracing::debug!(
            conn = self.conn.id(),
            peer = ?self.conn.remote_address(),
            direction = ?self.conn.connection_type(),
            "Connection started"
        );
        self.pipeline.service_started(&self.conn);

        loop {
            if self.drain_commands(&mut io, &mut framer, &mut commands).await == Flow::Close {
                break;
            }
            // A stopped connection processes nothing more; its Stop or
            // ForceStop command is still on its way.
            if !self.conn.is_stopped() {
                match framer.next_frame() {
                    Ok(Some(frame)) => {
                        if self.on_frame(frame, &recheck_tx) == Flow::Close {
                            break;
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.protocol_error(&e);
                        continue;
                    }
                }
            }

            let event = tokio::select! {
                biased;
                cmd = commands.recv() => Event::Command(cmd),
                Some(packet) = recheck_rx.recv() => Event::Recheck(packet),
                read = io.read(&mut buf), if !self.conn.is_stopped() => Event::Read(read),
            };
            match event {
                Event::Command(Some(cmd)) => {
                    if self.execute(cmd, &mut io, &mut framer).await == Flow::Close {
                        break;
                    }
                }
                Event::Command(None) => break,
                Event::Recheck(packet) => {
                    let dispatch = self.pipeline.recheck(packet, &self.conn);
                    self.apply(dispatch, &recheck_tx);
                }
                Event::Read(Ok(0)) => {
                    tracing::debug!(conn = self.conn.id(), "Peer closed the socket");
                    break;
                }
                Event::Read(Ok(n)) => {
                    if let Err(e) = framer.feed(&buf[..n]) {
                        self.protocol_error(&e);
                    }
                }
                Event::Read(Err(e)) => {
                    tracing::debug!(conn = self.conn.id(), error = %e, "Read failed");
                    break;
                }
            }
        }

        io.shutdown().await;
        if !self.conn.is_stopped() {
            self.conn.force_stop();
        }
        self.state.unregister_session(&self.conn);
        self.pipeline.service_stopped(&self.conn);
    }

    async fn drain_commands(
        &self,
        io: &mut StreamIo,
        framer: &mut StreamFramer,
        commands: &mut mpsc::UnboundedReceiver<ConnCommand>,
    ) -> Flow {
        while let Ok(cmd) = commands.try_recv() {
            if self.execute(cmd, io, framer).await == Flow::Close {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn on_frame(&self, frame: Frame, recheck_tx: &mpsc::UnboundedSender<Packet>) -> Flow {
        match frame {
            Frame::Open(header) => {
                let reply = self.pipeline.stream_opened(&self.conn, &header);
                if self.conn.is_accept() {
                    self.state.register_session(&self.conn);
                }
                if !reply.is_empty() {
                    self.conn.write_raw(reply);
                }
            }
            Frame::Stanza(element) => {
                let packet = Packet::new(element);
                tracing::trace!(conn = self.conn.id(), stanza = %packet, "Received");
                let dispatch = self.pipeline.process_packet(packet, &self.conn);
                self.apply(dispatch, recheck_tx);
            }
            Frame::Close => {
                tracing::debug!(conn = self.conn.id(), session_id = ?self.conn.session_id(), "Peer closed the stream");
                self.conn.stop();
            }
        }
        Flow::Continue
    }

    fn apply(&self, dispatch: Dispatch, recheck_tx: &mpsc::UnboundedSender<Packet>) {
        for packet in &dispatch.results {
            self.conn.send_packet(packet);
        }
        if let Some(packet) = dispatch.route {
            let inbound = InboundStanza {
                session_id: self.conn.session_id(),
                packet,
            };
            if self.router.send(inbound).is_err() {
                tracing::warn!(conn = self.conn.id(), "Router is gone, stanza dropped");
            }
        }
        if let Some((domain, packet)) = dispatch.deferred {
            let resolver = self.resolver.clone();
            let tx = recheck_tx.clone();
            tokio::spawn(async move {
                let ips = resolver.resolve_ips(&domain).await;
                tracing::debug!(domain = %domain, ips = ?ips, "Resolved for cross-domain check");
                let _ = tx.send(packet);
            });
        }
    }

    fn protocol_error(&self, e: &S2sError) {
        tracing::info!(conn = self.conn.id(), session_id = ?self.conn.session_id(), error = %e, "Protocol error");
        let header_pending = self.conn.is_accept() && self.conn.session_id().is_none();
        generate_stream_error(&self.conn, e.stream_condition(), header_pending);
    }

    async fn execute(&self, cmd: ConnCommand, io: &mut StreamIo, framer: &mut StreamFramer) -> Flow {
        let written = match cmd {
            ConnCommand::Write(xml) | ConnCommand::StreamOpen(xml) => {
                tracing::trace!(conn = self.conn.id(), xml = %xml, "Sending");
                io.write_all(xml.as_bytes()).await
            }
            ConnCommand::StartTls { client_mode, .. } => {
                return match self.upgrade(io, framer, client_mode).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        tracing::warn!(
                            conn = self.conn.id(),
                            cid = ?self.conn.cid(),
                            error = %e,
                            "TLS handshake failed"
                        );
                        Flow::Close
                    }
                };
            }
            ConnCommand::Stop => {
                let _ = io.write_all(b"</stream:stream>").await;
                return Flow::Close;
            }
            ConnCommand::ForceStop => return Flow::Close,
        };
        match written {
            Ok(()) => Flow::Continue,
            Err(e) => {
                tracing::debug!(conn = self.conn.id(), error = %e, "Write failed");
                Flow::Close
            }
        }
    }

    /// Replace the plain socket with a TLS session in place.
    async fn upgrade(&self, io: &mut StreamIo, framer: &mut StreamFramer, client_mode: bool) -> Result<(), S2sError> {
        let Some(tls) = &self.tls else {
            return Err(S2sError::Tls("no TLS context configured".into()));
        };
        let tcp = match std::mem::replace(io, StreamIo::Closed) {
            StreamIo::Plain(tcp) => tcp,
            other => {
                *io = other;
                return Err(S2sError::Tls("stream is already encrypted".into()));
            }
        };
        framer.reset();

        let domain = self.conn.cid().map(|c| c.remote_host().to_string());
        let (stream, chain): (TlsStream<TcpStream>, Vec<CertificateDer<'static>>) = if client_mode {
            let name = ServerName::try_from(domain.clone().unwrap_or_default())
                .map_err(|e| S2sError::Tls(e.to_string()))?;
            let s = tls.connector().connect(name, tcp).await?;
            let chain = s.get_ref().1.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
            (s.into(), chain)
        } else {
            let s = tls.acceptor().accept(tcp).await?;
            let chain = s.get_ref().1.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
            (s.into(), chain)
        };
        *io = StreamIo::Tls(Box::new(stream));

        let check = tls.classify(&chain, domain.as_deref());
        tracing::info!(
            conn = self.conn.id(),
            cid = ?self.conn.cid(),
            cert = ?check,
            "TLS established"
        );
        self.pipeline
            .tls_completed(&self.conn, check, chain.first().map(|c| c.to_vec()));
        Ok(())
    }
}
