//! Protocol data units for DICOM Upper Layer association control
//! and data transfer, as specified by PS3.8.

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    pub fn from(value: u8) -> Option<Self> {
        Some(match value {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => return None,
        })
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            PresentationContextResultReason::Acceptance => 0,
            PresentationContextResultReason::UserRejection => 1,
            PresentationContextResultReason::NoReason => 2,
            PresentationContextResultReason::AbstractSyntaxNotSupported => 3,
            PresentationContextResultReason::TransferSyntaxesNotSupported => 4,
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    pub fn from(value: u8) -> Option<Self> {
        Some(match value {
            1 => AssociationRJResult::Permanent,
            2 => AssociationRJResult::Transient,
            _ => return None,
        })
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        Some(match source {
            1 => AssociationRJSource::ServiceUser(match reason {
                1 => AssociationRJServiceUserReason::NoReasonGiven,
                2 => AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                3 => AssociationRJServiceUserReason::CallingAETitleNotRecognized,
                7 => AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                other => AssociationRJServiceUserReason::Reserved(other),
            }),
            2 => AssociationRJSource::ServiceProviderASCE(match reason {
                1 => AssociationRJServiceProviderASCEReason::NoReasonGiven,
                2 => AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                _ => return None,
            }),
            3 => AssociationRJSource::ServiceProviderPresentation(match reason {
                1 => AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
                2 => AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
                other => AssociationRJServiceProviderPresentationReason::Reserved(other),
            }),
            _ => return None,
        })
    }

    pub fn to_bytes(&self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let r = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(v) => *v,
                };
                (1, r)
            }
            AssociationRJSource::ServiceProviderASCE(reason) => {
                let r = match reason {
                    AssociationRJServiceProviderASCEReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => 2,
                };
                (2, r)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let r = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(v) => *v,
                };
                (3, r)
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub fn to_bytes(&self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let r = match reason {
                    AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPDU => 0,
                    AbortRQServiceProviderReason::UnexpectedPDU => 1,
                    AbortRQServiceProviderReason::Reserved => 2,
                    AbortRQServiceProviderReason::UnrecognizedPDUParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPDUParameter => 5,
                    AbortRQServiceProviderReason::InvalidPDUParameter => 6,
                };
                (2, r)
            }
            AbortRQSource::Reserved => (1, 0),
        }
    }

    pub fn from(source: u8, reason: u8) -> Option<Self> {
        Some(match source {
            0 => AbortRQSource::ServiceUser,
            1 => AbortRQSource::Reserved,
            2 => AbortRQSource::ServiceProvider(match reason {
                0 => AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPDU,
                1 => AbortRQServiceProviderReason::UnexpectedPDU,
                4 => AbortRQServiceProviderReason::UnrecognizedPDUParameter,
                5 => AbortRQServiceProviderReason::UnexpectedPDUParameter,
                6 => AbortRQServiceProviderReason::InvalidPDUParameter,
                _ => AbortRQServiceProviderReason::Reserved,
            }),
            _ => return None,
        })
    }
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecifiedUnrecognizedPDU,
    UnexpectedPDU,
    Reserved,
    UnrecognizedPDUParameter,
    UnexpectedPDUParameter,
    InvalidPDUParameter,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    UserIdentityItem(UserIdentity),
}

/// The kind of credential carried by a User Identity Negotiation sub-item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserIdentityType {
    Username,
    UsernameAndPassword,
    Kerberos,
    Saml,
    Jwt,
}

impl UserIdentityType {
    pub fn from(value: u8) -> Option<Self> {
        Some(match value {
            1 => UserIdentityType::Username,
            2 => UserIdentityType::UsernameAndPassword,
            3 => UserIdentityType::Kerberos,
            4 => UserIdentityType::Saml,
            5 => UserIdentityType::Jwt,
            _ => return None,
        })
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            UserIdentityType::Username => 1,
            UserIdentityType::UsernameAndPassword => 2,
            UserIdentityType::Kerberos => 3,
            UserIdentityType::Saml => 4,
            UserIdentityType::Jwt => 5,
        }
    }
}

/// User Identity Negotiation sub-item (PS3.7 Annex D.3.3.7).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> &UserIdentityType {
        &self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// An Association request PDU (A-ASSOCIATE-RQ).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub application_context_name: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// An Association acceptance PDU (A-ASSOCIATE-AC).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub application_context_name: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// An Association rejection PDU (A-ASSOCIATE-RJ).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

/// The top-level protocol data unit exchanged between two DICOM Upper Layer
/// peers.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum Pdu {
    AssociationRQ(AssociationRQ),
    AssociationAC(AssociationAC),
    AssociationRJ(AssociationRJ),
    PData { data: Vec<PDataValue> },
    ReleaseRQ,
    ReleaseRP,
    AbortRQ { source: AbortRQSource },
    /// An unrecognized PDU type, preserved so it can be forwarded or logged
    /// rather than discarded.
    Unknown { pdu_type: u8, data: Vec<u8> },
}

pub mod reader;
pub mod reader_async;
pub mod writer;
pub mod writer_async;

pub use reader::read_pdu;
pub use writer::write_pdu;

#[cfg(test)]
mod test;
