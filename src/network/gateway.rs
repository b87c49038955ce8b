//! Gateway - TCP/TLS/WebSocket listeners that accept incoming connections.
//!
//! The Gateway binds to sockets and spawns a Connection task for each
//! incoming client. Every transport ends up in the same broker.

use crate::config::{Config, TlsConfig, WebSocketConfig};
use crate::metrics;
use crate::network::limit::RateLimitManager;
use crate::network::{Connection, ConnectionSettings};
use crate::state::{BrokerHandle, ConnectionHandle};
use rendezvous_proto::Transport;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::io::{BufReader, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_tungstenite::accept_hdr_async;
use tracing::{error, info, instrument, warn};

/// The Gateway accepts incoming connections and spawns handlers.
pub struct Gateway {
    plaintext_listener: TcpListener,
    tls_listener: Option<(TcpListener, TlsAcceptor)>,
    websocket_listener: Option<(TcpListener, WebSocketConfig)>,
    spawner: Spawner,
}

/// What every accept loop needs to admit a client and start its task.
#[derive(Clone)]
struct Spawner {
    broker: BrokerHandle,
    settings: Arc<ConnectionSettings>,
    rate_limiter: Arc<RateLimitManager>,
}

impl Spawner {
    /// Per-IP connection rate check, run before any handshake work.
    fn admit(&self, addr: SocketAddr, kind: &'static str) -> bool {
        if self.rate_limiter.check_connection_rate(addr.ip()) {
            return true;
        }
        warn!(%addr, transport = kind, "Connection rate limit exceeded - rejecting");
        metrics::record_rate_limited("connection");
        false
    }

    async fn serve(&self, addr: SocketAddr, transport: Transport) {
        let handle = ConnectionHandle::generate();
        let kind = transport.kind();
        let connection = Connection::new(
            handle,
            addr,
            transport,
            self.broker.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.rate_limiter),
        );
        connection.run().await;
        info!(%handle, %addr, transport = kind, "Connection closed");
    }
}

impl Gateway {
    /// Bind every configured listener.
    pub async fn bind(
        config: &Config,
        broker: BrokerHandle,
        rate_limiter: Arc<RateLimitManager>,
    ) -> anyhow::Result<Self> {
        let plaintext_listener = TcpListener::bind(config.listen.address).await?;
        info!(address = %config.listen.address, "Plaintext listener bound");

        let tls_listener = if let Some(tls_cfg) = &config.tls {
            let tls_acceptor = Self::load_tls(tls_cfg)?;
            let listener = TcpListener::bind(tls_cfg.address).await?;
            info!(address = %tls_cfg.address, "TLS listener bound");
            Some((listener, tls_acceptor))
        } else {
            None
        };

        let websocket_listener = if let Some(ws_cfg) = &config.websocket {
            let listener = TcpListener::bind(ws_cfg.address).await?;
            info!(address = %ws_cfg.address, "WebSocket listener bound");
            Some((listener, ws_cfg.clone()))
        } else {
            None
        };

        Ok(Self {
            plaintext_listener,
            tls_listener,
            websocket_listener,
            spawner: Spawner {
                broker,
                settings: Arc::new(ConnectionSettings::from_config(config)),
                rate_limiter,
            },
        })
    }

    /// Load TLS certificates and create TlsAcceptor.
    fn load_tls(config: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
        // Load certificates
        let cert_file = std::fs::read(&config.cert_path)?;
        let cert_reader = &mut BufReader::new(Cursor::new(cert_file));
        let certs: Vec<CertificateDer> = certs(cert_reader).collect::<Result<Vec<_>, _>>()?;

        if certs.is_empty() {
            anyhow::bail!("No certificates found in {}", config.cert_path);
        }

        // Load private key
        let key_file = std::fs::read(&config.key_path)?;
        let key_reader = &mut BufReader::new(Cursor::new(key_file));
        let Some(key) = pkcs8_private_keys(key_reader)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PrivateKeyDer::from)
            .next()
        else {
            anyhow::bail!("No private keys found in {}", config.key_path);
        };

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    /// Run the gateway, accepting connections forever.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> anyhow::Result<()> {
        let max_frame_len = self.spawner.settings.max_frame_len;

        if let Some((tls_listener, tls_acceptor)) = self.tls_listener {
            let spawner = self.spawner.clone();

            tokio::spawn(async move {
                loop {
                    match tls_listener.accept().await {
                        Ok((stream, addr)) => {
                            if !spawner.admit(addr, "tls") {
                                drop(stream);
                                continue;
                            }

                            let spawner = spawner.clone();
                            let acceptor = tls_acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        let transport = Transport::tls(tls_stream, max_frame_len);
                                        spawner.serve(addr, transport).await;
                                    }
                                    Err(e) => {
                                        warn!(%addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept TLS connection");
                        }
                    }
                }
            });
        }

        if let Some((ws_listener, ws_config)) = self.websocket_listener {
            let spawner = self.spawner.clone();
            let ws_config = Arc::new(ws_config);

            tokio::spawn(async move {
                loop {
                    match ws_listener.accept().await {
                        Ok((stream, addr)) => {
                            if !spawner.admit(addr, "websocket") {
                                drop(stream);
                                continue;
                            }

                            let spawner = spawner.clone();
                            let ws_config = Arc::clone(&ws_config);
                            tokio::spawn(async move {
                                // CORS validation callback for WebSocket handshake
                                let cors_callback =
                                    |req: &http::Request<()>, response: http::Response<()>| {
                                        let origin = req
                                            .headers()
                                            .get(http::header::ORIGIN)
                                            .and_then(|o| o.to_str().ok());
                                        if ws_config.allows_origin(origin) {
                                            return Ok(response);
                                        }
                                        warn!(%addr, origin = ?origin, "WebSocket CORS rejected");

                                        let mut forbidden =
                                            http::Response::new(Some("CORS origin not allowed".to_string()));
                                        *forbidden.status_mut() = http::StatusCode::FORBIDDEN;
                                        Err(forbidden)
                                    };

                                match accept_hdr_async(stream, cors_callback).await {
                                    Ok(ws_stream) => {
                                        let transport = Transport::websocket(ws_stream, max_frame_len);
                                        spawner.serve(addr, transport).await;
                                    }
                                    Err(e) => {
                                        warn!(%addr, error = %e, "WebSocket handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept WebSocket connection");
                        }
                    }
                }
            });
        }

        // Main plaintext listener loop
        loop {
            match self.plaintext_listener.accept().await {
                Ok((stream, addr)) => {
                    if !self.spawner.admit(addr, "tcp") {
                        drop(stream);
                        continue;
                    }

                    let spawner = self.spawner.clone();
                    tokio::spawn(async move {
                        let transport = Transport::tcp(stream, max_frame_len);
                        spawner.serve(addr, transport).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept plaintext connection");
                }
            }
        }
    }
}
