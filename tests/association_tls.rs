//! C-ECHO round trip over a real TLS connection, exercising the
//! `establish_tls_async`/`accept_tls_async` facade entry points rather than
//! a plaintext `tokio::io::duplex` pipe.

#![cfg(feature = "async-tls")]

use dicom_upper_layer::dimse::Status;
use dicom_upper_layer::{ClientAssociationOptions, ServerAssociationOptions};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_cert_gen::CertificateBuilder;
use std::convert::TryInto;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Generates a fresh CA, server, and client certificate chain under a
/// throwaway directory and builds a mutual-TLS config pair from them.
fn test_tls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let out_dir = std::env::temp_dir().join(format!(
        "dicom-upper-layer-test-certs-{}-{}",
        std::process::id(),
        "c_echo_over_tls"
    ));
    std::fs::create_dir_all(&out_dir).expect("failed to create cert output directory");

    let ca = CertificateBuilder::new()
        .certificate_authority()
        .country_name(&"US")
        .expect("invalid country name")
        .organization_name(&"dicom-upper-layer-test-ca")
        .build()
        .expect("failed to build CA certificate");
    ca.serialize_pem()
        .write(&out_dir, "ca")
        .expect("failed to write CA certificate");

    let sans = vec![
        rcgen::SanType::IpAddress(IpAddr::from_str("127.0.0.1").unwrap()),
        rcgen::SanType::DnsName("localhost".try_into().unwrap()),
    ];

    let mut server = CertificateBuilder::new()
        .end_entity()
        .common_name("dicom-upper-layer-test-server")
        .subject_alternative_names(sans.clone());
    server.server_auth();
    server
        .build(&ca)
        .expect("failed to build server certificate")
        .serialize_pem()
        .write(&out_dir, "server")
        .expect("failed to write server certificate");

    let mut client = CertificateBuilder::new()
        .end_entity()
        .common_name("dicom-upper-layer-test-client")
        .subject_alternative_names(sans);
    client.client_auth();
    client
        .build(&ca)
        .expect("failed to build client certificate")
        .serialize_pem()
        .write(&out_dir, "client")
        .expect("failed to write client certificate");

    let read_cert = |name: &str| {
        CertificateDer::from_pem_slice(&std::fs::read(out_dir.join(name)).unwrap())
            .expect("failed to parse certificate")
    };
    let read_key = |name: &str| {
        PrivateKeyDer::from_pem_slice(&std::fs::read(out_dir.join(name)).unwrap())
            .expect("failed to parse private key")
    };

    let ca_cert = read_cert("ca.pem");
    let server_cert = read_cert("server.pem");
    let server_key = read_key("server.key.pem");
    let client_cert = read_cert("client.pem");
    let client_key = read_key("client.key.pem");

    let _ = std::fs::remove_dir_all(&out_dir);

    let mut roots = RootCertStore::empty();
    roots.add_parsable_certificates(vec![ca_cert.clone()]);
    let roots = Arc::new(roots);

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(
            WebPkiClientVerifier::builder(roots.clone())
                .build()
                .expect("failed to build client cert verifier"),
        )
        .with_single_cert(vec![server_cert, ca_cert.clone()], server_key)
        .expect("failed to build server TLS config");

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(vec![client_cert, ca_cert], client_key)
        .expect("failed to build client TLS config");

    (Arc::new(server_config), Arc::new(client_config))
}

#[tokio::test(flavor = "multi_thread")]
async fn c_echo_over_tls() {
    let (server_tls_config, client_tls_config) = test_tls_configs();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind listener");
    let server_addr = listener.local_addr().unwrap();

    let server_options = ServerAssociationOptions::new()
        .ae_title("TLS-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .tls_config(server_tls_config)
        .on_c_echo(|_conn| async { Status::success() });

    let server = tokio::spawn(async move {
        let (stream, _addr) = listener.accept().await.expect("failed to accept connection");
        server_options
            .accept_tls_async(stream)
            .await
            .expect("TLS handshake or association setup failed")
    });

    let client_options = ClientAssociationOptions::new()
        .calling_ae_title("TLS-SCU")
        .called_ae_title("TLS-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .server_name("localhost")
        .tls_config(client_tls_config);

    let mut association = client_options
        .establish_tls(server_addr)
        .await
        .expect("TLS handshake or association setup failed");

    association.c_echo().await.expect("C-ECHO over TLS failed");

    association.release().await.expect("release failed");
    association.wait_for_close().await;

    let _provider = server.await.expect("server task panicked");
}

#[tokio::test]
async fn establish_tls_without_config_is_rejected() {
    // the tls_config check happens before any I/O, so a throwaway duplex
    // half is enough; no peer ever needs to read from it.
    let (client_io, _server_io) = tokio::io::duplex(64);

    let client_options = ClientAssociationOptions::new()
        .calling_ae_title("TLS-SCU")
        .called_ae_title("TLS-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let result = client_options.establish_tls_async(client_io).await;
    assert!(matches::matches!(
        result,
        Err(dicom_upper_layer::FacadeError::TlsConfigMissing)
    ));
}
