use dicom_upper_layer::access::AcceptCalledAeTitle;
use dicom_upper_layer::facade::{ClientAssociationOptions, ServerAssociationOptions};
use std::sync::Arc;

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Connecting to a closed port should fail fast with a connection error,
/// rather than hanging or panicking.
#[tokio::test]
async fn connection_refused_is_reported() {
    // bind and immediately drop the listener to free up a port nobody is
    // listening on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .await;

    assert!(result.is_err());
}

/// A called AE title that doesn't match the provider's own title is
/// rejected at the access-control stage, and the requestor observes the
/// rejection reason rather than a generic closed connection.
#[tokio::test(flavor = "multi_thread")]
async fn mismatched_called_ae_title_is_rejected() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        ServerAssociationOptions::new()
            .ae_title("REAL-SCP")
            .access_control(Arc::new(AcceptCalledAeTitle))
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .accept_async(server_io)
            .await
    });

    let client_result = ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("WRONG-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish_async(client_io)
        .await;

    assert!(client_result.is_err());

    // The provider side observes the handshake failing too (no
    // association ever reaches the acceptor's running state).
    let _ = server.await.unwrap();
}
