//! Exercises the fault injector: a simulated transport drop mid-association
//! should surface as an ordinary connection-closed error to the caller,
//! rather than a hang or a panic.

use dicom_upper_layer::fault::{FaultAction, FaultInjector};
use dicom_upper_layer::state_machine::Event;
use dicom_upper_layer::{ClientAssociationOptions, FacadeError, ServerAssociationOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

/// Disconnects on the first outbound DIMSE command after the handshake,
/// leaving the handshake itself untouched.
fn disconnect_on_first_downcall() -> FaultInjector {
    let triggered = Arc::new(AtomicBool::new(false));
    Arc::new(move |event: &Event| {
        if matches!(event, Event::Downcall(_)) && !triggered.swap(true, Ordering::SeqCst) {
            FaultAction::Disconnect
        } else {
            FaultAction::Continue
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_exchange_disconnect_surfaces_as_connection_closed() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server_options = ServerAssociationOptions::new()
        .ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let client_options = ClientAssociationOptions::new()
        .calling_ae_title("ECHO-SCU")
        .called_ae_title("ECHO-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_fault_injector(disconnect_on_first_downcall());

    let (provider, association) = tokio::join!(
        server_options.accept_async(server_io),
        client_options.establish_async(client_io),
    );
    let _provider = provider.expect("acceptor handshake failed");
    let mut association = association.expect("requestor handshake failed");

    let result = association.c_echo().await;
    assert!(matches!(result, Err(FacadeError::ConnectionClosed)));

    association.wait_for_close().await;
}
