//! Transport setup: TCP, optional proxy tunnel, optional TLS.

use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{CONNECT_TIMEOUT, ClientCertificate, ConnectionConfig};
use crate::error::{Error, Result};
use crate::proxy;
use crate::session::Phase;

/// A connection that has completed TCP, the proxy tunnel and TLS but hasn't
/// started IRC registration yet.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

/// Open the transport described by `config`. `progress` is told about each
/// phase as it starts. The whole sequence is bounded by [`CONNECT_TIMEOUT`].
pub async fn establish(config: &ConnectionConfig, mut progress: impl FnMut(Phase)) -> Result<Transport> {
    let attempt = async {
        progress(Phase::Connecting);
        let proxy = config.active_proxy();
        let dial = proxy.map(|p| p.addr()).unwrap_or_else(|| config.server_addr());
        tracing::debug!(addr = %dial, tls = config.tls, via_proxy = proxy.is_some(), "Connecting");
        let mut tcp = TcpStream::connect(&dial)
            .await
            .map_err(|e| Error::transport(dial.clone(), e))?;
        let _ = tcp.set_nodelay(true);
        tracing::debug!(addr = %dial, "TCP connected");

        if let Some(proxy) = proxy {
            progress(Phase::ProxyTunnel);
            proxy::tunnel(&mut tcp, proxy, &config.host, config.port).await?;
        }

        if !config.tls {
            return Ok(Transport::Plain(tcp));
        }

        progress(Phase::TlsHandshake);
        let tls_config = tls_config(config)?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let dns_name = rustls::pki_types::ServerName::try_from(config.host.clone()).map_err(|e| Error::Tls {
            host: config.host.clone(),
            reason: e.to_string(),
        })?;
        let tls = connector.connect(dns_name, tcp).await.map_err(|e| Error::Tls {
            host: config.host.clone(),
            reason: e.to_string(),
        })?;
        tracing::debug!(host = %config.host, "TLS handshake complete");
        Ok(Transport::Tls(Box::new(tls)))
    };

    match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectTimeout {
            addr: config.server_addr(),
            secs: CONNECT_TIMEOUT.as_secs(),
        }),
    }
}

fn install_crypto_provider() {
    // ring is preferred when both are enabled; aws-lc-rs is the default.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

/// Bundled webpki roots plus whatever the platform store offers.
fn root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        tracing::debug!(errors = native.errors.len(), "Some platform certificates could not be loaded");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "Loaded platform root certificates");
    roots
}

/// rustls client configuration for `config`: verified or not, with or
/// without a client certificate.
pub fn tls_config(config: &ConnectionConfig) -> Result<rustls::ClientConfig> {
    install_crypto_provider();
    let builder = if config.tls_verify {
        rustls::ClientConfig::builder().with_root_certificates(root_store())
    } else {
        tracing::debug!(host = %config.host, "TLS: skipping certificate verification");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
    };
    match &config.client_cert {
        Some(cert) => {
            let (chain, key) = load_client_cert(cert)?;
            builder.with_client_auth_cert(chain, key).map_err(|e| Error::Tls {
                host: config.host.clone(),
                reason: format!("client certificate rejected: {e}"),
            })
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

type CertChain = Vec<rustls::pki_types::CertificateDer<'static>>;

fn load_client_cert(
    cert: &ClientCertificate,
) -> Result<(CertChain, rustls::pki_types::PrivateKeyDer<'static>)> {
    let open = |path: &std::path::Path| {
        std::fs::File::open(path)
            .map(BufReader::new)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
    };

    let chain = rustls_pemfile::certs(&mut open(&cert.cert_path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("bad certificate in {}: {e}", cert.cert_path.display())))?;
    if chain.is_empty() {
        return Err(Error::Config(format!(
            "no certificate found in {}",
            cert.cert_path.display()
        )));
    }

    let key_path = cert.key_path.as_deref().unwrap_or(&cert.cert_path);
    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| Error::Config(format!("bad private key in {}: {e}", key_path.display())))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_path.display())))?;
    Ok((chain, key))
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn plain_connect_reports_phases() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let cfg = ConnectionConfig::new("127.0.0.1", port, "me");
        let mut phases = Vec::new();
        let transport = establish(&cfg, |p| phases.push(p)).await.unwrap();
        assert!(!transport.is_tls());
        assert_eq!(phases, vec![Phase::Connecting]);
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let cfg = ConnectionConfig::new("127.0.0.1", port, "me");
        let err = establish(&cfg, |_| {}).await.err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }

    #[tokio::test]
    async fn tunnels_through_socks5() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            sock.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            sock.read_exact(&mut rest).await.unwrap();
            sock.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0, 0]).await.unwrap();
            let mut hold = [0u8; 1];
            let _ = sock.read(&mut hold).await;
        });

        let mut cfg = ConnectionConfig::new("irc.example.net", 6667, "me");
        cfg.proxy = Some(ProxyConfig {
            host: "127.0.0.1".into(),
            port: proxy_port,
            ..ProxyConfig::default()
        });
        let mut phases = Vec::new();
        establish(&cfg, |p| phases.push(p)).await.unwrap();
        assert_eq!(phases, vec![Phase::Connecting, Phase::ProxyTunnel]);
    }

    #[test]
    fn insecure_config_builds() {
        let mut cfg = ConnectionConfig::new("irc.example.net", 6697, "me");
        cfg.tls = true;
        cfg.tls_verify = false;
        assert!(tls_config(&cfg).is_ok());
    }

    #[test]
    fn missing_client_cert_is_config_error() {
        let mut cfg = ConnectionConfig::new("irc.example.net", 6697, "me");
        cfg.tls = true;
        cfg.client_cert = Some(ClientCertificate {
            cert_path: "/nonexistent/drift-client.pem".into(),
            key_path: None,
        });
        let err = tls_config(&cfg).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
