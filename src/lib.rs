//! This crate contains the types and methods needed to interact
//! with DICOM nodes through the upper layer protocol.
//!
//! This crate can be used as a base
//! for finite-state machines and higher-level helpers,
//! enabling the creation of concrete service class users (SCUs)
//! and service class providers (SCPs).
//!
//! - The [`address`] module
//!   provides an abstraction for working with compound addresses
//!   referring to application entities in a network.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   which are passed around as part of the DICOM network communication support.
//! - The [`dimse`] module
//!   provides the DIMSE message layer built on top of the PDU stream,
//!   assembling and disassembling command and data set fragments.
//! - The [`context`] module
//!   tracks presentation contexts negotiated for an association.
//! - The [`state_machine`] module
//!   implements the upper layer association state machine (PS3.8 section 9.2),
//!   driving an association's lifecycle from its events.
//! - The [`dispatcher`] module
//!   multiplexes outstanding DIMSE exchanges over a single association.
//! - The [`access`] module
//!   provides pluggable association acceptance policies.
//! - The [`facade`] module
//!   provides the `AssociationUser`/`AssociationProvider` high-level API,
//!   built on top of the state machine and dispatcher.
//! - The [`sop_class`] module
//!   lists well-known SOP class UIDs grouped by DIMSE service.
//! - The [`fault`] module
//!   provides per-association fault injection for tests.

pub mod access;
pub mod address;
pub mod context;
pub mod dimse;
pub mod dispatcher;
pub mod facade;
pub mod fault;
pub mod pdu;
pub mod sop_class;
pub mod state_machine;
pub mod transfer_syntax;
pub(crate) mod uid;

/// The current implementation class UID generically referring to this crate.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.156227610253341005307660858504280353500";

/// The current implementation version name generically referring to this crate.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-RS-UL 0.1";

// re-exports

pub use address::{AeAddr, FullAeAddr};
pub use context::{ContextManager, PresentationContext, PresentationContextDecision};
pub use dispatcher::Dispatcher;
pub use facade::{
    AssociationProvider, AssociationUser, ClientAssociationOptions, ConnectionState, FacadeError,
    QrLevel, ServerAssociationOptions,
};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use state_machine::{Association, AssociationParams, Event, Role, State};
