use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use http_body_util::{BodyExt, Empty};
use hyper::{Request, Response, body::Bytes};
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyPair};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_rustls::TlsConnector;

pub(crate) struct DoorwayHandle(pub(crate) tokio::task::JoinHandle<color_eyre::Result<()>>);

impl Drop for DoorwayHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) async fn wait_for_port(address: &str) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(address).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for {address} to accept connections.")
    };
}

// Test certificate authority, which signs the certificates served by the gateway.
pub(crate) struct TestCa {
    certificate: Certificate,
    key_pair: KeyPair,
}

impl TestCa {
    pub(crate) fn new() -> Self {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let certificate = params.self_signed(&key_pair).unwrap();
        TestCa {
            certificate,
            key_pair,
        }
    }

    // Write `fullchain.pem` and `privkey.pem` for the given names into `directory/subdirectory`.
    pub(crate) fn write_certificate(&self, directory: &Path, subdirectory: &str, names: &[&str]) {
        let key_pair = KeyPair::generate().unwrap();
        let certificate =
            CertificateParams::new(names.iter().map(|name| name.to_string()).collect::<Vec<_>>())
                .unwrap()
                .signed_by(&key_pair, &self.certificate, &self.key_pair)
                .unwrap();
        let path = directory.join(subdirectory);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(
            path.join("fullchain.pem"),
            format!("{}{}", certificate.pem(), self.certificate.pem()),
        )
        .unwrap();
        std::fs::write(path.join("privkey.pem"), key_pair.serialize_pem()).unwrap();
    }

    // Server configuration for a TLS backend that isn't the gateway.
    pub(crate) fn server_config(&self, names: &[&str]) -> Arc<ServerConfig> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let key_pair = KeyPair::generate().unwrap();
        let certificate =
            CertificateParams::new(names.iter().map(|name| name.to_string()).collect::<Vec<_>>())
                .unwrap()
                .signed_by(&key_pair, &self.certificate, &self.key_pair)
                .unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Arc::new(
            ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(
                    vec![certificate.der().clone(), self.certificate.der().clone()],
                    key,
                )
                .unwrap(),
        )
    }

    pub(crate) fn connector(&self) -> TlsConnector {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let mut roots = RootCertStore::empty();
        roots.add(self.certificate.der().clone()).unwrap();
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsConnector::from(Arc::new(config))
    }
}

pub(crate) fn temp_directory(name: &str) -> PathBuf {
    let directory = std::env::temp_dir().join(format!(
        "doorway-integration-{name}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&directory);
    std::fs::create_dir_all(&directory).unwrap();
    directory
}

// Send a GET request over TLS to `address`, with `host` as both the server name and the Host header.
pub(crate) async fn https_get(
    connector: &TlsConnector,
    address: SocketAddr,
    host: &str,
    path: &str,
) -> (Response<()>, Bytes) {
    let tcp_stream = TcpStream::connect(address)
        .await
        .expect("TCP connection failed");
    let server_name = ServerName::try_from(host.to_string()).unwrap();
    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .expect("TLS handshake failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            eprintln!("Connection failed: {error:?}");
        }
    });
    let request = Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (Response::from_parts(parts, ()), body)
}
