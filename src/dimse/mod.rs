//! DIMSE (DICOM Message Service Element) command encoding and decoding.
//!
//! A DIMSE command is a short sequence of DICOM elements, all in group
//! `0000`, encoded implicit-VR little endian regardless of the negotiated
//! transfer syntax for the associated data set. This module builds and
//! parses that element sequence using [`dicom_core`]/[`dicom_object`],
//! the same way [`crate::pdu::commands`] already does for the handful of
//! message types it covers; this module generalizes that approach to the
//! full command surface this crate dispatches on.

pub mod fragment;

use std::io::Cursor;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{FileDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use snafu::{OptionExt, ResultExt, Snafu};

pub use crate::pdu::commands::{CommandField, CommandDatasetType, Priority};

/// Well-known DIMSE status codes used by this crate's services.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xff00;
    pub const CANCEL: u16 = 0xfe00;
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0112;
    pub const INVALID_ARGUMENT_VALUE: u16 = 0x0115;
    pub const INVALID_ATTRIBUTE_VALUE: u16 = 0x0106;
    pub const ATTRIBUTE_VALUE_OUT_OF_RANGE: u16 = 0x0116;
    pub const ATTRIBUTE_LIST_ERROR: u16 = 0x0107;
    pub const INVALID_OBJECT_INSTANCE: u16 = 0x0117;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    pub const NOT_AUTHORIZED: u16 = 0x0124;
    pub const C_STORE_OUT_OF_RESOURCES: u16 = 0xa700;
    pub const C_STORE_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xa900;
    pub const CANNOT_UNDERSTAND: u16 = 0xc000;
    pub const C_MOVE_OUT_OF_RESOURCES_SUBOPERATIONS: u16 = 0xa701;
    pub const C_MOVE_OUT_OF_RESOURCES_PERFORMING: u16 = 0xa702;
    pub const C_MOVE_DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xa900;
    pub const C_MOVE_DESTINATION_UNKNOWN: u16 = 0xa801;
}

/// A status reported on a DIMSE response, as the pair of a 16-bit code
/// and an optional human-readable comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub comment: Option<String>,
}

impl Status {
    pub fn success() -> Self {
        Status {
            code: status::SUCCESS,
            comment: None,
        }
    }

    pub fn pending() -> Self {
        Status {
            code: status::PENDING,
            comment: None,
        }
    }

    pub fn failure(code: u16, comment: impl Into<String>) -> Self {
        Status {
            code,
            comment: Some(comment.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == status::SUCCESS
    }

    pub fn is_pending(&self) -> bool {
        self.code == status::PENDING
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("missing required command field {}", name))]
    MissingField { name: &'static str },

    #[snafu(display("unknown DIMSE command field {:#06x}", value))]
    UnknownCommand { value: u16 },

    #[snafu(display("failed to encode DIMSE command"))]
    Encode {
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("failed to decode DIMSE command"))]
    Decode {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A decoded (or to-be-encoded) DIMSE command message.
///
/// This is a thin typed view over a group-`0000` element set: the set
/// itself (`elements`) is preserved in full so that re-encoding a decoded
/// message reproduces it byte for byte, including any command element
/// this crate does not otherwise interpret.
#[derive(Debug, Clone)]
pub struct Message {
    pub command_field: CommandField,
    elements: InMemDicomObject,
}

fn implicit_vr_le() -> dicom_encoding::transfer_syntax::TransferSyntax {
    entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()
}

impl Message {
    fn new(command_field: CommandField, elements: InMemDicomObject) -> Self {
        Message {
            command_field,
            elements,
        }
    }

    fn get_u16(&self, tag: Tag, name: &'static str) -> Result<u16> {
        self.elements
            .element(tag)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            .context(MissingFieldSnafu { name })
    }

    fn get_str(&self, tag: Tag, name: &'static str) -> Result<String> {
        self.elements
            .element(tag)
            .ok()
            .and_then(|e| e.to_str().ok().map(|s| crate::uid::trim_uid(s).into_owned()))
            .context(MissingFieldSnafu { name })
    }

    fn get_str_opt(&self, tag: Tag) -> Option<String> {
        self.elements
            .element(tag)
            .ok()
            .and_then(|e| e.to_str().ok().map(|s| crate::uid::trim_uid(s).into_owned()))
    }

    fn get_u16_opt(&self, tag: Tag) -> Option<u16> {
        self.elements
            .element(tag)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
    }

    pub fn message_id(&self) -> Result<u16> {
        self.get_u16(tags::MESSAGE_ID, "MessageID")
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.get_u16(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "MessageIDBeingRespondedTo",
        )
    }

    pub fn affected_sop_class_uid(&self) -> Result<String> {
        self.get_str(tags::AFFECTED_SOPCLASS_UID, "AffectedSOPClassUID")
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.get_str_opt(tags::AFFECTED_SOPINSTANCE_UID)
    }

    pub fn priority(&self) -> Option<u16> {
        self.get_u16_opt(tags::PRIORITY)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.get_str_opt(tags::MOVE_DESTINATION)
    }

    pub fn move_originator_ae_title(&self) -> Option<String> {
        self.get_str_opt(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
    }

    pub fn move_originator_message_id(&self) -> Option<u16> {
        self.get_u16_opt(tags::MOVE_ORIGINATOR_MESSAGE_ID)
    }

    pub fn status(&self) -> Option<Status> {
        let code = self.get_u16_opt(tags::STATUS)?;
        Some(Status {
            code,
            comment: self.get_str_opt(tags::ERROR_COMMENT),
        })
    }

    /// Remaining/completed/failed/warning sub-operation counters,
    /// reported by C-GET-RSP and C-MOVE-RSP.
    pub fn suboperations(&self) -> Suboperations {
        Suboperations {
            remaining: self.get_u16_opt(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: self.get_u16_opt(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: self.get_u16_opt(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: self.get_u16_opt(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }

    /// Whether this command is followed by a data set, per the
    /// `CommandDataSetType` element (0x0101 = no data set).
    pub fn has_data(&self) -> bool {
        self.get_u16_opt(tags::COMMAND_DATA_SET_TYPE)
            .map(|v| v != CommandDatasetType::Absent as u16)
            .unwrap_or(false)
    }

    pub fn elements(&self) -> &InMemDicomObject {
        &self.elements
    }

    /// Encode this command's element set, synthesizing the leading
    /// `CommandGroupLength` element from the encoded length of the rest.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let ts = implicit_vr_le();
        let mut body = Vec::new();
        self.elements
            .write_dataset_with_ts(&mut body, &ts)
            .map_err(Box::new)
            .context(EncodeSnafu)?;

        let mut out = Vec::with_capacity(body.len() + 12);
        let group_length = DataElement::new(
            tags::COMMAND_GROUP_LENGTH,
            VR::UL,
            dicom_value!(U32, [body.len() as u32]),
        );
        let mut header_obj = InMemDicomObject::from_element_iter(std::iter::once(group_length));
        header_obj
            .write_dataset_with_ts(&mut out, &ts)
            .map_err(Box::new)
            .context(EncodeSnafu)?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a command's element set from a buffer, locating the
    /// `CommandField` element to determine which variant it is.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let ts = implicit_vr_le();
        let registry = TransferSyntaxRegistry;
        let ts = registry.get(ts.transfer_syntax_uid()).unwrap_or(&ts);
        let elements = InMemDicomObject::read_dataset_with_ts(Cursor::new(bytes), ts)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            .context(DecodeSnafu)?;

        let command_value = elements
            .element(tags::COMMAND_FIELD)
            .ok()
            .and_then(|e| e.to_int::<u16>().ok())
            .context(MissingFieldSnafu {
                name: "CommandField",
            })?;

        let command_field = command_field_from_u16(command_value)
            .context(UnknownCommandSnafu { value: command_value })?;

        Ok(Message::new(command_field, elements))
    }

    fn builder(command_field: CommandField) -> MessageBuilder {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field as u16]),
        ));
        MessageBuilder { command_field, obj }
    }

    pub fn c_echo_rq(message_id: u16) -> Self {
        Message::builder(CommandField::C_ECHO_RQ)
            .u16(tags::MESSAGE_ID, message_id)
            .str(
                tags::AFFECTED_SOPCLASS_UID,
                "1.2.840.10008.1.1",
            )
            .no_data()
            .build()
    }

    pub fn c_echo_rsp(message_id: u16, status: &Status) -> Self {
        Message::builder(CommandField::C_ECHO_RSP)
            .u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, "1.2.840.10008.1.1")
            .status(status)
            .no_data()
            .build()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn c_store_rq(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        priority: Priority,
        move_originator: Option<(&str, u16)>,
    ) -> Self {
        let mut b = Message::builder(CommandField::C_STORE_RQ)
            .u16(tags::MESSAGE_ID, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .str(tags::AFFECTED_SOPINSTANCE_UID, sop_instance_uid)
            .u16(tags::PRIORITY, priority as u16);
        if let Some((ae, msg_id)) = move_originator {
            b = b
                .str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, ae)
                .u16(tags::MOVE_ORIGINATOR_MESSAGE_ID, msg_id);
        }
        b.with_data().build()
    }

    pub fn c_store_rsp(
        message_id: u16,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        status: &Status,
    ) -> Self {
        Message::builder(CommandField::C_STORE_RSP)
            .u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .str(tags::AFFECTED_SOPINSTANCE_UID, sop_instance_uid)
            .status(status)
            .no_data()
            .build()
    }

    pub fn c_find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        Message::builder(CommandField::C_FIND_RQ)
            .u16(tags::MESSAGE_ID, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .u16(tags::PRIORITY, priority as u16)
            .with_data()
            .build()
    }

    pub fn c_find_rsp(message_id: u16, sop_class_uid: &str, status: &Status) -> Self {
        let b = Message::builder(CommandField::C_FIND_RSP)
            .u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .status(status);
        if status.is_pending() {
            b.with_data().build()
        } else {
            b.no_data().build()
        }
    }

    pub fn c_get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> Self {
        Message::builder(CommandField::C_GET_RQ)
            .u16(tags::MESSAGE_ID, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .u16(tags::PRIORITY, priority as u16)
            .with_data()
            .build()
    }

    pub fn c_get_rsp(
        message_id: u16,
        sop_class_uid: &str,
        status: &Status,
        subops: Suboperations,
    ) -> Self {
        let mut b = Message::builder(CommandField::C_GET_RSP)
            .u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .status(status);
        b = b.suboperations(&subops);
        b.no_data().build()
    }

    pub fn c_move_rq(
        message_id: u16,
        sop_class_uid: &str,
        priority: Priority,
        move_destination: &str,
    ) -> Self {
        Message::builder(CommandField::C_MOVE_RQ)
            .u16(tags::MESSAGE_ID, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .u16(tags::PRIORITY, priority as u16)
            .str(tags::MOVE_DESTINATION, move_destination)
            .with_data()
            .build()
    }

    pub fn c_move_rsp(
        message_id: u16,
        sop_class_uid: &str,
        status: &Status,
        subops: Suboperations,
    ) -> Self {
        let mut b = Message::builder(CommandField::C_MOVE_RSP)
            .u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id)
            .str(tags::AFFECTED_SOPCLASS_UID, sop_class_uid)
            .status(status);
        b = b.suboperations(&subops);
        b.no_data().build()
    }
}

/// Sub-operation progress counters carried by C-GET-RSP/C-MOVE-RSP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Suboperations {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

struct MessageBuilder {
    command_field: CommandField,
    obj: InMemDicomObject,
}

impl MessageBuilder {
    fn u16(mut self, tag: Tag, value: u16) -> Self {
        self.obj
            .put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
        self
    }

    fn str(mut self, tag: Tag, value: &str) -> Self {
        self.obj.put(DataElement::new(
            tag,
            VR::UI,
            PrimitiveValue::from(value.to_string()),
        ));
        self
    }

    fn status(mut self, status: &Status) -> Self {
        self = self.u16(tags::STATUS, status.code);
        if let Some(comment) = &status.comment {
            self = self.str(tags::ERROR_COMMENT, comment);
        }
        self
    }

    fn suboperations(mut self, subops: &Suboperations) -> Self {
        if let Some(v) = subops.remaining {
            self = self.u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, v);
        }
        if let Some(v) = subops.completed {
            self = self.u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, v);
        }
        if let Some(v) = subops.failed {
            self = self.u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS, v);
        }
        if let Some(v) = subops.warning {
            self = self.u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS, v);
        }
        self
    }

    fn with_data(self) -> Self {
        self.u16(tags::COMMAND_DATA_SET_TYPE, CommandDatasetType::Present as u16)
    }

    fn no_data(self) -> Self {
        self.u16(tags::COMMAND_DATA_SET_TYPE, CommandDatasetType::Absent as u16)
    }

    fn build(self) -> Message {
        Message::new(self.command_field, self.obj)
    }
}

fn command_field_from_u16(value: u16) -> Option<CommandField> {
    use CommandField::*;
    Some(match value {
        0x0001 => C_STORE_RQ,
        0x8001 => C_STORE_RSP,
        0x0010 => C_GET_RQ,
        0x8010 => C_GET_RSP,
        0x0020 => C_FIND_RQ,
        0x8020 => C_FIND_RSP,
        0x0021 => C_MOVE_RQ,
        0x8021 => C_MOVE_RSP,
        0x0030 => C_ECHO_RQ,
        0x8030 => C_ECHO_RSP,
        0x0100 => N_EVENT_REPORT_RQ,
        0x8100 => N_EVENT_REPORT_RSP,
        0x0110 => N_GET_RQ,
        0x8110 => N_GET_RSP,
        0x0120 => N_SET_RQ,
        0x8120 => N_SET_RSP,
        0x0130 => N_ACTION_RQ,
        0x8130 => N_ACTION_RSP,
        0x0140 => N_CREATE_RQ,
        0x8140 => N_CREATE_RSP,
        0x0150 => N_DELETE_RQ,
        0x8150 => N_DELETE_RSP,
        0x0FFF => C_CANCEL_RQ,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_echo_round_trip() {
        let msg = Message::c_echo_rq(7);
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.message_id().unwrap(), 7);
        assert!(!decoded.has_data());
        assert!(matches!(decoded.command_field, CommandField::C_ECHO_RQ));
    }

    #[test]
    fn c_store_rq_round_trip() {
        let msg = Message::c_store_rq(
            1,
            "1.2.840.10008.5.1.4.1.1.7",
            "1.2.3.4.5.6",
            Priority::Medium,
            None,
        );
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(
            decoded.affected_sop_instance_uid().as_deref(),
            Some("1.2.3.4.5.6")
        );
        assert!(decoded.has_data());
    }

    #[test]
    fn c_store_rsp_status_round_trip() {
        let status = Status::failure(0x0124, "Foohah");
        let msg = Message::c_store_rsp(1, "1.2.840.10008.5.1.4.1.1.7", "1.2.3.4.5.6", &status);
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        let decoded_status = decoded.status().unwrap();
        assert_eq!(decoded_status.code, 0x0124);
        assert_eq!(decoded_status.comment.as_deref(), Some("Foohah"));
    }

    #[test]
    fn unknown_command_field_is_rejected() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [0xbeef]),
        ));
        let ts = implicit_vr_le();
        let mut out = Vec::new();
        obj.write_dataset_with_ts(&mut out, &ts).unwrap();
        let err = Message::decode(&out).unwrap_err();
        assert!(matches!(err, Error::UnknownCommand { value: 0xbeef }));
    }
}
