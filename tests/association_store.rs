//! C-STORE round trip over an in-memory duplex pipe: a successful store
//! and a store rejected by the handler with a failure status.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_upper_layer::dimse::Status;
use dicom_upper_layer::{ClientAssociationOptions, ServerAssociationOptions};
use std::sync::{Arc, Mutex};

const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn sample_object(sop_instance_uid: &str) -> dicom_object::FileDicomObject<InMemDicomObject> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        Tag(0x0010, 0x0010),
        VR::PN,
        dicom_value!(Strs, ["Doe^John"]),
    ));
    obj.put(DataElement::new(
        Tag(0x0008, 0x0018),
        VR::UI,
        dicom_value!(Strs, [sop_instance_uid]),
    ));

    obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax(EXPLICIT_VR_LE)
            .media_storage_sop_class_uid(MR_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop_instance_uid),
    )
    .expect("failed to attach file meta")
}

#[tokio::test(flavor = "multi_thread")]
async fn c_store_round_trip_success_and_failure() {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let received_handler = Arc::clone(&received);

    let server_options = ServerAssociationOptions::new()
        .ae_title("STORE-SCP")
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .with_transfer_syntax(EXPLICIT_VR_LE)
        .on_c_store(move |_conn, _ts_uid, _sop_class_uid, sop_instance_uid, _data| {
            let received = Arc::clone(&received_handler);
            async move {
                if sop_instance_uid == "1.2.3.4.reject" {
                    return Status::failure(0xa700, "out of resources");
                }
                received.lock().unwrap().push(sop_instance_uid);
                Status::success()
            }
        });

    let client_options = ClientAssociationOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title("STORE-SCP")
        .with_abstract_syntax(MR_IMAGE_STORAGE)
        .with_transfer_syntax(EXPLICIT_VR_LE);

    let (provider, association) = tokio::join!(
        server_options.accept_async(server_io),
        client_options.establish_async(client_io),
    );
    let _provider = provider.expect("acceptor handshake failed");
    let mut association = association.expect("requestor handshake failed");

    let ok_object = sample_object("1.2.3.4.5");
    association
        .c_store(&ok_object)
        .await
        .expect("C-STORE should succeed");

    let rejected_object = sample_object("1.2.3.4.reject");
    let err = association
        .c_store(&rejected_object)
        .await
        .expect_err("C-STORE should be rejected by the handler");
    assert!(matches!(
        err,
        dicom_upper_layer::FacadeError::RemoteStatus { status_code: 0xa700, .. }
    ));

    association.release().await.expect("release failed");
    association.wait_for_close().await;

    assert_eq!(received.lock().unwrap().as_slice(), ["1.2.3.4.5"]);
}
