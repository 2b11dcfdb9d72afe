//! The association's 13-state / 19-event control state machine (DICOM
//! PS3.8 §9.2).
//!
//! One instance drives one TCP connection. Grounded on the original
//! implementation's `stateMachine`/`stateTransitions` table
//! (`original_source/statemachine.go`): a single event-loop task owns the
//! socket writer and walks the table below; a separate network-reader
//! task only reads and decodes PDUs, posting events back; handler tasks
//! spawned by the [`crate::dispatcher::Dispatcher`] only ever request
//! work through a cloned downcall sender, never touching the socket
//! directly.
//!
//! The synchronous-dial sub-states (part of sta04/sta02 in the original,
//! where the transport connection itself is still being opened) are
//! folded into [`Association::new_requestor`]/[`Association::new_acceptor`]
//! since `tokio::net::TcpStream::connect`/`accept` are awaited by the
//! caller before an `Association` exists at all; this crate's state
//! machine begins already holding a connected stream, picking up the
//! table at sta04/sta02 respectively.

mod actions;

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use std::sync::Arc;

use crate::access::{AcceptAny, AccessControl};
use crate::context::ContextManager;
use crate::dimse::fragment::Assembler;
use crate::dispatcher::{DownCallEvent, Dispatcher};
use crate::fault::FaultInjector;
use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJSource,
    AssociationRQ, PDataValue,
};

/// Association Request/Release Timer: 10 seconds, per PS3.8 9.1.5.
pub const ARTIM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This side issued the A-ASSOCIATE-RQ (service user).
    Requestor,
    /// This side accepted the A-ASSOCIATE-RQ (service provider).
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum State {
    Sta1,
    Sta2,
    Sta3,
    Sta4,
    Sta5,
    Sta6,
    Sta7,
    Sta8,
    Sta9,
    Sta10,
    Sta11,
    Sta12,
    Sta13,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            State::Sta1 => 1,
            State::Sta2 => 2,
            State::Sta3 => 3,
            State::Sta4 => 4,
            State::Sta5 => 5,
            State::Sta6 => 6,
            State::Sta7 => 7,
            State::Sta8 => 8,
            State::Sta9 => 9,
            State::Sta10 => 10,
            State::Sta11 => 11,
            State::Sta12 => 12,
            State::Sta13 => 13,
        };
        write!(f, "sta{:02}", n)
    }
}

/// One of the 19 events defined by PS3.8 9.2.3, carrying whatever payload
/// the original's dynamically-typed `stateEvent` struct held for that
/// particular event.
#[derive(Debug)]
pub enum Event {
    /// evt02: connection established (user side).
    Connected,
    /// evt03: A-ASSOCIATE-AC PDU received.
    AssociateAc(AssociationAC),
    /// evt04: A-ASSOCIATE-RJ PDU received.
    AssociateRj(AssociationRJ),
    /// evt06: A-ASSOCIATE-RQ PDU received.
    AssociateRq(AssociationRQ),
    /// evt07: local A-ASSOCIATE response primitive (accept).
    LocalAccept,
    /// evt08: local A-ASSOCIATE response primitive (reject).
    LocalReject,
    /// evt09: P-DATA request primitive (a handler wants to send a DIMSE
    /// message).
    Downcall(DownCallEvent),
    /// evt10: P-DATA-TF PDU received.
    PData(Vec<PDataValue>),
    /// evt11: local A-RELEASE request primitive.
    LocalRelease,
    /// evt12: A-RELEASE-RQ PDU received.
    ReleaseRq,
    /// evt13: A-RELEASE-RP PDU received.
    ReleaseRp,
    /// evt14: local A-RELEASE response primitive.
    LocalReleaseConfirm,
    /// evt15: local A-ABORT request primitive.
    LocalAbort,
    /// evt16: A-ABORT PDU received.
    AbortPdu(AbortRQSource),
    /// evt17: transport connection closed.
    TransportClosed,
    /// evt18: ARTIM timer expired.
    ArtimExpired,
    /// evt19: unrecognized or invalid PDU received.
    InvalidPdu,
}

/// A handle used by the façade to drive an association from outside the
/// event-loop task: post local primitives (release, abort) and observe
/// handshake completion / final teardown.
#[derive(Clone)]
pub struct Handle {
    pub(crate) local_tx: mpsc::Sender<Event>,
    pub(crate) handshake_rx: watch::Receiver<bool>,
    pub(crate) closed_rx: watch::Receiver<bool>,
    pub(crate) context_rx: watch::Receiver<Option<Arc<ContextManager>>>,
    pub(crate) reject_rx: watch::Receiver<Option<(AssociationRJResult, AssociationRJSource)>>,
}

impl Handle {
    pub async fn request_release(&self) {
        let _ = self.local_tx.send(Event::LocalRelease).await;
    }

    pub async fn request_abort(&self) {
        let _ = self.local_tx.send(Event::LocalAbort).await;
    }

    /// Wait until the association has completed A-ASSOCIATE negotiation
    /// (sta06) or been torn down without ever reaching it.
    pub async fn wait_for_handshake(&mut self) -> bool {
        loop {
            if *self.handshake_rx.borrow() {
                return true;
            }
            if *self.closed_rx.borrow() {
                return false;
            }
            if self.handshake_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    pub async fn wait_for_close(&mut self) {
        while !*self.closed_rx.borrow() {
            if self.closed_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The negotiated context manager, available once the handshake has
    /// completed. `None` before that point or if the association never
    /// reached sta06.
    pub fn context_manager(&self) -> Option<Arc<ContextManager>> {
        self.context_rx.borrow().clone()
    }

    /// The reason the peer rejected the association, if an A-ASSOCIATE-RJ
    /// was the cause of a failed handshake. `None` if the handshake
    /// succeeded, or failed for a reason other than an explicit rejection
    /// (transport closed, A-ABORT, ARTIM timeout).
    pub fn rejection(&self) -> Option<(AssociationRJResult, AssociationRJSource)> {
        self.reject_rx.borrow().clone()
    }
}

/// Parameters fixed for the lifetime of one association, set at
/// construction from the façade's options.
pub struct AssociationParams {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub implementation_class_uid: String,
    pub implementation_version_name: String,
    pub sop_classes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    pub local_max_pdu_size: u32,
    pub access_control: Arc<dyn AccessControl>,
}

impl Default for AssociationParams {
    fn default() -> Self {
        AssociationParams {
            calling_ae_title: "UNKNOWN-CALLING-AE".to_string(),
            called_ae_title: "UNKNOWN-CALLED-AE".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            implementation_class_uid: crate::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            sop_classes: Vec::new(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            local_max_pdu_size: crate::pdu::reader::DEFAULT_MAX_PDU,
            access_control: Arc::new(AcceptAny),
        }
    }
}

/// Drives one association's state machine to completion.
///
/// Owns the socket writer and is the only task that ever writes to it;
/// PDUs arrive as [`Event`]s from a paired network-reader task spawned at
/// construction.
pub struct Association<W> {
    state: State,
    role: Role,
    writer: W,
    params: AssociationParams,
    pub(crate) context_manager: ContextManager,
    assembler: crate::dimse::fragment::Assembler,
    dispatcher: Dispatcher,
    artim_deadline: Option<Instant>,
    handshake_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
    pub(crate) context_tx: watch::Sender<Option<Arc<ContextManager>>>,
    pub(crate) reject_tx: watch::Sender<Option<(AssociationRJResult, AssociationRJSource)>>,
    local_rx: mpsc::Receiver<Event>,
    network_rx: mpsc::Receiver<Event>,
    pub(crate) fault_injector: Option<FaultInjector>,
}

impl<W> Association<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Build a requestor-side association over an already-connected
    /// stream, split into its read and write halves. Spawns the
    /// network-reader task and performs AE-1+AE-2 inline (sta04 is
    /// transient, since the connect already completed).
    pub fn new_requestor<R>(
        reader: R,
        writer: W,
        params: AssociationParams,
        dispatcher: Dispatcher,
    ) -> (Self, Handle)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (network_tx, network_rx) = mpsc::channel(32);
        let (local_tx, local_rx) = mpsc::channel(32);
        let (handshake_tx, handshake_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (context_tx, context_rx) = watch::channel(None);
        let (reject_tx, reject_rx) = watch::channel(None);

        spawn_network_reader(reader, params.local_max_pdu_size, network_tx);

        let assoc = Association {
            state: State::Sta4,
            role: Role::Requestor,
            writer,
            params,
            context_manager: ContextManager::new(),
            assembler: Assembler::new(),
            dispatcher,
            artim_deadline: None,
            handshake_tx,
            closed_tx,
            context_tx,
            reject_tx,
            local_rx,
            network_rx,
            fault_injector: None,
        };
        let handle = Handle {
            local_tx,
            handshake_rx,
            closed_rx,
            context_rx,
            reject_rx,
        };
        (assoc, handle)
    }

    /// Build an acceptor-side association over an accepted connection.
    /// Performs AE-5 inline, entering sta02.
    pub fn new_acceptor<R>(
        reader: R,
        writer: W,
        params: AssociationParams,
        dispatcher: Dispatcher,
    ) -> (Self, Handle)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (network_tx, network_rx) = mpsc::channel(32);
        let (local_tx, local_rx) = mpsc::channel(32);
        let (handshake_tx, handshake_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (context_tx, context_rx) = watch::channel(None);
        let (reject_tx, reject_rx) = watch::channel(None);

        spawn_network_reader(reader, params.local_max_pdu_size, network_tx);

        let assoc = Association {
            state: State::Sta2,
            role: Role::Acceptor,
            writer,
            params,
            context_manager: ContextManager::new(),
            assembler: Assembler::new(),
            dispatcher,
            artim_deadline: Some(Instant::now() + ARTIM_TIMEOUT),
            handshake_tx,
            closed_tx,
            context_tx,
            reject_tx,
            local_rx,
            network_rx,
            fault_injector: None,
        };
        let handle = Handle {
            local_tx,
            handshake_rx,
            closed_rx,
            context_rx,
            reject_rx,
        };
        (assoc, handle)
    }

    /// Install a fault injector, consulted before every outbound PDU send.
    /// Test-only in practice; see [`crate::fault`].
    pub fn with_fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    /// Consume the machine, running the event loop until it reaches
    /// sta01 with the transport closed.
    pub async fn run(mut self) {
        if self.role == Role::Requestor {
            self.state = self.dispatch(Event::Connected).await;
        }

        loop {
            if self.state == State::Sta1 {
                break;
            }

            let event = tokio::select! {
                biased;

                Some(event) = self.local_rx.recv() => event,
                Some(event) = self.network_rx.recv() => event,
                _ = artim_sleep(self.artim_deadline) => Event::ArtimExpired,
                else => Event::TransportClosed,
            };

            self.state = self.dispatch(event).await;
        }

        let _ = self.closed_tx.send(true);
    }

    async fn dispatch(&mut self, event: Event) -> State {
        actions::transition(self, event).await
    }
}

async fn artim_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(instant) => sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

fn spawn_network_reader<R>(mut reader: R, max_pdu_size: u32, tx: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match crate::pdu::reader_async::read_pdu(&mut reader, max_pdu_size, false).await {
                Ok(crate::pdu::Pdu::AssociationRQ(rq)) => {
                    if tx.send(Event::AssociateRq(rq)).await.is_err() {
                        return;
                    }
                }
                Ok(crate::pdu::Pdu::AssociationAC(ac)) => {
                    if tx.send(Event::AssociateAc(ac)).await.is_err() {
                        return;
                    }
                }
                Ok(crate::pdu::Pdu::AssociationRJ(rj)) => {
                    if tx.send(Event::AssociateRj(rj)).await.is_err() {
                        return;
                    }
                }
                Ok(crate::pdu::Pdu::PData { data }) => {
                    if tx.send(Event::PData(data)).await.is_err() {
                        return;
                    }
                }
                Ok(crate::pdu::Pdu::ReleaseRQ) => {
                    if tx.send(Event::ReleaseRq).await.is_err() {
                        return;
                    }
                }
                Ok(crate::pdu::Pdu::ReleaseRP) => {
                    if tx.send(Event::ReleaseRp).await.is_err() {
                        return;
                    }
                }
                Ok(crate::pdu::Pdu::AbortRQ { source }) => {
                    if tx.send(Event::AbortPdu(source)).await.is_err() {
                        return;
                    }
                    return;
                }
                Ok(crate::pdu::Pdu::Unknown { pdu_type, .. }) => {
                    tracing::warn!(pdu_type, "received unrecognized PDU type");
                    let _ = tx.send(Event::InvalidPdu).await;
                }
                Err(crate::pdu::reader::Error::NoPduAvailable { .. }) => {
                    let _ = tx.send(Event::TransportClosed).await;
                    return;
                }
                Err(source) => {
                    tracing::warn!(%source, "failed to read PDU");
                    let _ = tx.send(Event::InvalidPdu).await;
                    return;
                }
            }
        }
    });
}
