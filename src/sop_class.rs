//! Well-known SOP class UID groupings, by DIMSE service.
//!
//! Grounded on the original implementation's `sopclass` package
//! (`original_source/sopclass/sopclass.go`), which groups UIDs by which
//! DIMSE request they are legal affected-SOP-classes for. The UID values
//! themselves come from [`dicom_dictionary_std::uids`] rather than being
//! retyped by hand.

use dicom_dictionary_std::uids;

/// SOP classes appropriate for a C-ECHO request.
pub const VERIFICATION_CLASSES: &[&str] = &[uids::VERIFICATION];

/// A representative set of storage SOP classes appropriate for a C-STORE
/// request, spanning the modalities most commonly exchanged.
pub const STORAGE_CLASSES: &[&str] = &[
    uids::STORED_PRINT_STORAGE,
    uids::HARDCOPY_GRAYSCALE_IMAGE_STORAGE,
    uids::HARDCOPY_COLOR_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_INTRA_ORAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_INTRA_ORAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::TWELVE_LEAD_ECG_WAVEFORM_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::RAW_DATA_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
];

/// SOP classes appropriate for a C-FIND request.
pub const QR_FIND_CLASSES: &[&str] = &[
    uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
];

/// SOP classes appropriate for a C-MOVE request.
pub const QR_MOVE_CLASSES: &[&str] = &[
    uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
];

/// SOP classes appropriate for a C-GET request: the QR "get" models plus
/// every storage class, since C-GET answers with C-STORE sub-operations
/// over the same association.
pub fn qr_get_classes() -> Vec<&'static str> {
    let mut classes = vec![
        uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
        uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
    ];
    classes.extend_from_slice(STORAGE_CLASSES);
    classes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_classes_contains_verification() {
        assert_eq!(VERIFICATION_CLASSES, &[uids::VERIFICATION]);
    }

    #[test]
    fn qr_get_classes_includes_storage_classes() {
        let classes = qr_get_classes();
        assert!(classes.len() > STORAGE_CLASSES.len());
        assert!(classes.contains(&uids::CT_IMAGE_STORAGE));
    }
}
