use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, ensure};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use tracing::{debug, info};

use sidedrop_core::channel::{
    AnsweredChannel, ByteChannel, ChannelFactory, OfferedChannel,
};
use sidedrop_core::signaling::{DescriptionKind, SessionDescription};
use sidedrop_core::tls::{self, TLS_SERVER_NAME};

const TRANSPORT: &str = "quic";
const ALPN_PROTOCOL: &[u8] = b"sidedrop/1";

/// Encrypted QUIC channel factory — the default transport.
///
/// Every offer gets a fresh self-signed certificate whose DER bytes ride
/// inside the offer description. The answering side pins exactly that
/// certificate as its sole trust anchor, so trust is anchored in the
/// out-of-band offer exchange itself, the same way the negotiation token
/// is.
#[derive(Clone)]
pub struct QuicChannelFactory {
    bind_addr: String,
}

impl QuicChannelFactory {
    #[must_use]
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

impl Default for QuicChannelFactory {
    fn default() -> Self {
        Self::new("127.0.0.1:0")
    }
}

impl ChannelFactory for QuicChannelFactory {
    type Offering = QuicOffering;
    type Answering = QuicAnswering;
    type Channel = QuicChannel;

    fn create_offer(
        &self,
    ) -> impl Future<Output = anyhow::Result<(Self::Offering, SessionDescription)>> + Send + '_
    {
        async move {
            let pair = tls::generate_self_signed_cert()?;
            let server_config = build_server_config(&pair)?;

            let socket_addr: SocketAddr = self
                .bind_addr
                .parse()
                .with_context(|| format!("invalid bind address: {}", self.bind_addr))?;

            let endpoint = quinn::Endpoint::server(server_config, socket_addr)
                .with_context(|| format!("failed to bind QUIC endpoint on {}", self.bind_addr))?;

            let local_addr = endpoint
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();

            info!(addr = %local_addr, "QUIC offer endpoint bound");

            let offer = SessionDescription::offer(TRANSPORT, local_addr, Some(pair.cert_der));
            Ok((QuicOffering { endpoint }, offer))
        }
    }

    fn accept_offer<'a>(
        &'a self,
        offer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<(Self::Answering, SessionDescription)>> + Send + 'a
    {
        async move {
            ensure!(
                offer.kind == DescriptionKind::Offer,
                "expected an offer description"
            );
            ensure!(
                offer.transport == TRANSPORT,
                "transport mismatch: expected {TRANSPORT}, got {}",
                offer.transport
            );
            let remote: SocketAddr = offer
                .endpoint
                .as_deref()
                .context("offer is missing an endpoint")?
                .parse()
                .context("offer endpoint is not a socket address")?;
            let cert_der = offer
                .cert_der
                .as_deref()
                .context("offer is missing a certificate")?;

            let client_config = build_client_config(cert_der)?;

            let local = SocketAddr::from(([0, 0, 0, 0], 0));
            let mut endpoint = quinn::Endpoint::client(local)
                .context("failed to create QUIC client endpoint")?;
            endpoint.set_default_client_config(client_config);

            let answer = SessionDescription::answer(TRANSPORT);
            Ok((QuicAnswering { endpoint, remote }, answer))
        }
    }
}

/// Offerer side of a pending QUIC negotiation: a bound server endpoint
/// waiting for the answering side to dial.
pub struct QuicOffering {
    endpoint: quinn::Endpoint,
}

impl OfferedChannel for QuicOffering {
    type Channel = QuicChannel;

    fn complete<'a>(
        self,
        _answer: &'a SessionDescription,
    ) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send + 'a {
        async move {
            let incoming = self
                .endpoint
                .accept()
                .await
                .context("QUIC endpoint closed before any dial")?;

            let connection = incoming
                .await
                .context("failed to complete QUIC handshake")?;

            let peer_addr = connection.remote_address().to_string();
            debug!(peer = %peer_addr, "Accepted QUIC connection");

            // The offerer opens the bidirectional stream; the answerer
            // only sees it once the first bytes (the bind frame) arrive.
            let (send, recv) = connection
                .open_bi()
                .await
                .context("failed to open QUIC stream")?;

            Ok(QuicChannel {
                _endpoint: self.endpoint,
                _connection: connection,
                send,
                recv,
                peer_addr,
            })
        }
    }
}

/// Answerer side of a pending QUIC negotiation: a client endpoint with
/// the offered certificate pinned, dialled once the session starts
/// waiting for the channel.
pub struct QuicAnswering {
    endpoint: quinn::Endpoint,
    remote: SocketAddr,
}

impl AnsweredChannel for QuicAnswering {
    type Channel = QuicChannel;

    fn wait_open(self) -> impl Future<Output = anyhow::Result<Self::Channel>> + Send {
        async move {
            let connection = self
                .endpoint
                .connect(self.remote, TLS_SERVER_NAME)
                .context("failed to start QUIC connection")?
                .await
                .context("failed to complete QUIC handshake")?;

            let peer_addr = connection.remote_address().to_string();
            debug!(peer = %peer_addr, "QUIC connection established");

            let (send, recv) = connection
                .accept_bi()
                .await
                .context("failed to accept QUIC stream")?;

            Ok(QuicChannel {
                _endpoint: self.endpoint,
                _connection: connection,
                send,
                recv,
                peer_addr,
            })
        }
    }
}

/// A QUIC channel backed by one bidirectional stream.
///
/// The endpoint and connection handles are retained so the driver keeps
/// running for the lifetime of the channel.
pub struct QuicChannel {
    _endpoint: quinn::Endpoint,
    _connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    peer_addr: String,
}

impl ByteChannel for QuicChannel {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.recv
                .read(buf)
                .await
                .context("failed to read from QUIC stream")?
                .map_or(Ok(0), Ok)
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.send
                .write_all(buf)
                .await
                .context("failed to write to QUIC stream")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.send
                .finish()
                .context("failed to finish QUIC send stream")
        }
    }
}

fn build_server_config(pair: &tls::CertKeyPair) -> anyhow::Result<quinn::ServerConfig> {
    let cert_der = rustls::pki_types::CertificateDer::from(pair.cert_der.clone());
    let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(pair.private_key_pkcs8_der.clone()),
    );

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .context("failed to build rustls server config")?;

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicServerConfig = tls_config
        .try_into()
        .context("failed to build QUIC server config")?;

    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic_config)))
}

/// Builds a client config whose only trust anchor is the certificate
/// carried by the offer.
fn build_client_config(cert_der: &[u8]) -> anyhow::Result<quinn::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(cert_der.to_vec()))
        .context("offer certificate is not a valid anchor")?;

    let mut tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_config: QuicClientConfig = tls_config
        .try_into()
        .context("failed to build QUIC client config")?;

    Ok(quinn::ClientConfig::new(Arc::new(quic_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn given_invalid_address_when_creating_offer_then_returns_error() {
        let factory = QuicChannelFactory::new("999.999.999.999:0");
        let result = factory.create_offer().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn given_created_offer_when_inspected_then_carries_endpoint_and_cert() {
        let factory = QuicChannelFactory::default();
        let (_offering, offer) = factory.create_offer().await.unwrap();
        assert_eq!(offer.transport, "quic");
        assert!(offer.endpoint.as_deref().unwrap().starts_with("127.0.0.1:"));
        assert!(!offer.cert_der.as_deref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn given_two_offers_when_compared_then_certs_differ() {
        let factory = QuicChannelFactory::default();
        let (_o1, offer1) = factory.create_offer().await.unwrap();
        let (_o2, offer2) = factory.create_offer().await.unwrap();
        assert_ne!(offer1.cert_der, offer2.cert_der);
    }

    #[tokio::test]
    async fn given_negotiation_when_completed_then_bytes_flow_both_ways() {
        let factory = QuicChannelFactory::default();
        let (offering, offer) = factory.create_offer().await.unwrap();
        let (answering, answer) = factory.accept_offer(&offer).await.unwrap();

        let answerer_task = tokio::spawn(async move {
            let mut chan = answering.wait_open().await.unwrap();
            let mut buf = [0u8; 16];
            let n = chan.read(&mut buf).await.unwrap();
            chan.write_all(b"pong").await.unwrap();
            // Keep the connection alive until the offerer has read.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            buf[..n].to_vec()
        });

        let mut chan = offering.complete(&answer).await.unwrap();
        chan.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = chan.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(answerer_task.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn given_offer_without_cert_when_accepted_then_returns_error() {
        let factory = QuicChannelFactory::default();
        let offer = SessionDescription::offer("quic", "127.0.0.1:1".into(), None);
        assert!(factory.accept_offer(&offer).await.is_err());
    }

    #[tokio::test]
    async fn given_mismatched_transport_when_accepted_then_returns_error() {
        let factory = QuicChannelFactory::default();
        let offer = SessionDescription::offer("tcp", "127.0.0.1:1".into(), None);
        assert!(factory.accept_offer(&offer).await.is_err());
    }

    #[tokio::test]
    async fn given_wrong_pinned_cert_when_dialling_then_handshake_fails() {
        let factory = QuicChannelFactory::default();
        let (offering, offer) = factory.create_offer().await.unwrap();

        // Pin a certificate from a *different* offer.
        let (_other_offering, other_offer) = factory.create_offer().await.unwrap();
        let mut forged = offer.clone();
        forged.cert_der = other_offer.cert_der;

        let (answering, answer) = factory.accept_offer(&forged).await.unwrap();

        let offerer_task = tokio::spawn(async move {
            // The TLS handshake never completes, so this must not yield a
            // channel before the answerer fails.
            let _ = offering.complete(&answer).await;
        });

        let result = answering.wait_open().await;
        assert!(result.is_err(), "handshake must fail with a wrong anchor");
        offerer_task.abort();
        let _ = offerer_task.await;
    }
}
