//! C-FIND round trip: the provider streams back matches one at a time and
//! the requestor consumes them as an async stream.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_object::InMemDicomObject;
use dicom_upper_layer::dimse::Status;
use dicom_upper_layer::facade::QrLevel;
use dicom_upper_layer::{ClientAssociationOptions, ServerAssociationOptions};
use futures::{pin_mut, StreamExt};

const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";

fn matching_study(study_instance_uid: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        Tag(0x0020, 0x000d),
        VR::UI,
        dicom_value!(Strs, [study_instance_uid]),
    ));
    obj
}

#[tokio::test(flavor = "multi_thread")]
async fn c_find_streams_matches() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server_options = ServerAssociationOptions::new()
        .ae_title("FIND-SCP")
        .with_abstract_syntax(STUDY_ROOT_FIND)
        .on_c_find(|_conn, level, _filter| async move {
            assert_eq!(level, QrLevel::Study);
            vec![
                (matching_study("1.2.3.1"), Status::pending()),
                (matching_study("1.2.3.2"), Status::pending()),
            ]
        });

    let client_options = ClientAssociationOptions::new()
        .calling_ae_title("FIND-SCU")
        .called_ae_title("FIND-SCP")
        .with_abstract_syntax(STUDY_ROOT_FIND);

    let (provider, association) = tokio::join!(
        server_options.accept_async(server_io),
        client_options.establish_async(client_io),
    );
    let _provider = provider.expect("acceptor handshake failed");
    let mut association = association.expect("requestor handshake failed");

    let filter = InMemDicomObject::new_empty();
    let mut study_uids = Vec::new();
    {
        let stream = association.c_find(STUDY_ROOT_FIND, QrLevel::Study, filter);
        pin_mut!(stream);
        while let Some(result) = stream.next().await {
            let element_set = result.expect("C-FIND result should decode");
            let uid = element_set
                .element(Tag(0x0020, 0x000d))
                .unwrap()
                .to_str()
                .unwrap()
                .into_owned();
            study_uids.push(uid);
        }
    }

    assert_eq!(study_uids, vec!["1.2.3.1", "1.2.3.2"]);

    association.release().await.expect("release failed");
    association.wait_for_close().await;
}
