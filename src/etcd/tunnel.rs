//! Port-forward tunnel dialer for etcd
//!
//! Masters are usually not routable from wherever the operator runs, so every
//! etcd connection rides the API server's port-forward subprotocol to the
//! static `etcd-<node>` pod. Each logical connection opens its own
//! port-forward session with exactly one data stream and one error stream for
//! the client port, then runs mutual TLS over the data stream.
//!
//! Failures keep their category: upgrade/negotiation problems surface as
//! [`Error::Tunnel`], certificate and handshake problems as [`Error::Tls`], and
//! an exhausted dial budget as [`Error::Timeout`]. RPC failures only ever come
//! from the connected client.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, warn};

use super::proto::EtcdGrpc;
use super::{etcd_pod_name, EtcdClient, EtcdDialer, GrpcEtcdClient, ETCD_CLIENT_PORT, ETCD_NAMESPACE};
use crate::config::EtcdTlsFiles;
use crate::{Error, Result};

/// Name etcd serving certificates are always issued for
const ETCD_SERVER_NAME: &str = "localhost";

/// Placeholder authority; the connector ignores the URI
const TUNNEL_URI: &str = "http://etcd.tunnel";

/// Client TLS configuration for etcd members
#[derive(Clone)]
pub struct EtcdTls {
    config: Arc<ClientConfig>,
}

impl EtcdTls {
    /// Build from PEM-encoded CA bundle, client certificate chain and key
    pub fn from_pem(ca: &[u8], cert: &[u8], key: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for ca_cert in CertificateDer::pem_slice_iter(ca) {
            let ca_cert = ca_cert.map_err(|e| Error::tls(format!("CA bundle: {e}")))?;
            roots
                .add(ca_cert)
                .map_err(|e| Error::tls(format!("CA bundle: {e}")))?;
        }
        if roots.is_empty() {
            return Err(Error::tls("CA bundle contains no certificates"));
        }

        let chain = CertificateDer::pem_slice_iter(cert)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::tls(format!("client certificate: {e}")))?;
        if chain.is_empty() {
            return Err(Error::tls("client certificate file contains no certificates"));
        }
        let key = PrivateKeyDer::from_pem_slice(key)
            .map_err(|e| Error::tls(format!("client key: {e}")))?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::tls(format!("client certificate: {e}")))?;
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Read PEM material from disk
    pub fn from_files(files: &EtcdTlsFiles) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| Error::tls(format!("failed to read {}: {}", path.display(), e)))
        };
        Self::from_pem(
            &read(&files.ca_file)?,
            &read(&files.cert_file)?,
            &read(&files.key_file)?,
        )
    }

    async fn wrap<S>(&self, node: &str, stream: S) -> Result<tokio_rustls::client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(ETCD_SERVER_NAME)
            .map_err(|e| Error::tls(format!("server name: {e}")))?;
        TlsConnector::from(self.config.clone())
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::tls(format!("handshake with etcd on {node}: {e}")))
    }
}

/// Opens one port-forward session per connection
#[derive(Clone)]
struct TunnelConnector {
    pods: Api<Pod>,
    node: String,
    tls: EtcdTls,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl TunnelConnector {
    async fn open(&self) -> Result<impl AsyncRead + AsyncWrite + Unpin + Send + 'static> {
        let pod = etcd_pod_name(&self.node);
        let mut forwarder = self
            .pods
            .portforward(&pod, &[ETCD_CLIENT_PORT])
            .await
            .map_err(|e| Error::tunnel(&self.node, format!("port-forward to {pod}: {e}")))?;

        let stream = forwarder
            .take_stream(ETCD_CLIENT_PORT)
            .ok_or_else(|| Error::tunnel(&self.node, "port-forward opened no data stream"))?;
        let errors = forwarder
            .take_error(ETCD_CLIENT_PORT)
            .ok_or_else(|| Error::tunnel(&self.node, "port-forward opened no error stream"))?;

        let node = self.node.clone();
        tokio::spawn(async move {
            if let Some(message) = errors.await {
                warn!(node = %node, error = %message, "etcd port-forward reported an error");
            }
        });
        let node = self.node.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(node = %node, error = %e, "etcd port-forward closed");
            }
        });

        self.tls.wrap(&self.node, stream).await
    }

    async fn connect(&self) -> Result<TokioIo<impl AsyncRead + AsyncWrite + Unpin + Send + 'static>> {
        match self.open().await {
            Ok(stream) => Ok(TokioIo::new(stream)),
            Err(e) => {
                let message = e.to_string();
                if let Ok(mut slot) = self.last_error.lock() {
                    *slot = Some(e);
                }
                Err(Error::tunnel(&self.node, message))
            }
        }
    }

    fn take_error(&self) -> Option<Error> {
        self.last_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Dials etcd members through the API server
#[derive(Clone)]
pub struct PortForwardDialer {
    client: Client,
    tls: EtcdTls,
    timeout: Duration,
}

impl PortForwardDialer {
    /// Dialer with a whole-dial `timeout`
    pub fn new(client: Client, tls: EtcdTls, timeout: Duration) -> Self {
        Self {
            client,
            tls,
            timeout,
        }
    }

    async fn channel(&self, node: &str) -> Result<Channel> {
        let connector = TunnelConnector {
            pods: Api::namespaced(self.client.clone(), ETCD_NAMESPACE),
            node: node.to_string(),
            tls: self.tls.clone(),
            last_error: Arc::new(Mutex::new(None)),
        };
        let service = {
            let connector = connector.clone();
            tower::service_fn(move |_: Uri| {
                let connector = connector.clone();
                async move { connector.connect().await }
            })
        };

        let endpoint = Endpoint::from_static(TUNNEL_URI)
            .connect_timeout(self.timeout)
            .timeout(self.timeout);
        match tokio::time::timeout(self.timeout, endpoint.connect_with_connector(service)).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(connector
                .take_error()
                .unwrap_or_else(|| Error::tunnel(node, e.to_string()))),
            Err(_) => Err(Error::timeout(format!("etcd dial to {node}"), self.timeout)),
        }
    }
}

#[async_trait]
impl EtcdDialer for PortForwardDialer {
    async fn dial(&self, node: &str) -> Result<Arc<dyn EtcdClient>> {
        let channel = self.channel(node).await?;
        debug!(node = %node, "connected to etcd");
        Ok(Arc::new(GrpcEtcdClient::new(node, EtcdGrpc::new(channel))))
    }
}
