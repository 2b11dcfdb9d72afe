//! High-level `AssociationUser`/`AssociationProvider` API, built on top of
//! the state machine and dispatcher.
//!
//! Grounded on the original implementation's `ServiceUser`/`ServiceProvider`
//! (`serviceuser.go`/`serviceprovider.go`) for the operations themselves,
//! and `runCStoreOnAssociation` (`cstore.go`) for the shared C-STORE
//! delivery helper used by both `c_store` and C-GET/C-MOVE's relay. The
//! builder shape (`with_abstract_syntax`, `with_transfer_syntax`,
//! `.establish*`) follows the teacher's `ClientAssociationOptions`/
//! `ServerAssociationOptions` (`association/client.rs`, `association/server.rs`),
//! generalized from a blocking single-context API to the async
//! multi-context one this crate's state machine provides.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::{FileDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use futures::Stream;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::access::{AcceptAny, AccessControl};
use crate::context::{ContextManager, PresentationContext};
use crate::dimse::{CommandField, Message, Priority, Status, Suboperations};
use crate::dispatcher::{DownCallEvent, Dispatcher, ServiceCommand};
use crate::fault::FaultInjector;
use crate::pdu::{AssociationRJResult, AssociationRJSource};
use crate::state_machine::{Association, AssociationParams, Handle, Role};

const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The presentation hierarchy level a C-FIND/C-GET/C-MOVE query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrLevel {
    Patient,
    Study,
    Series,
}

impl QrLevel {
    fn as_str(self) -> &'static str {
        match self {
            QrLevel::Patient => "PATIENT",
            QrLevel::Study => "STUDY",
            QrLevel::Series => "SERIES",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "STUDY" => QrLevel::Study,
            "SERIES" => QrLevel::Series,
            _ => QrLevel::Patient,
        }
    }
}

/// Connection-level information made available to provider handlers:
/// the peer's negotiated PDU size, implementation identity, and whether
/// the transport is running over TLS.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub peer_max_pdu_size: u32,
    pub peer_implementation_class_uid: Option<String>,
    pub peer_implementation_version_name: Option<String>,
    pub tls: bool,
}

impl ConnectionState {
    fn from_context_manager(cm: &ContextManager, tls: bool) -> Self {
        ConnectionState {
            peer_max_pdu_size: cm.peer_max_pdu_size,
            peer_implementation_class_uid: cm.peer_implementation_class_uid.clone(),
            peer_implementation_version_name: cm.peer_implementation_version_name.clone(),
            tls,
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FacadeError {
    #[snafu(display("failed to connect or complete the handshake"))]
    ConnectionFailed { source: std::io::Error },

    /// the association was closed before the operation completed
    ConnectionClosed,

    #[snafu(display("association rejected: {:?} / {:?}", result, source))]
    HandshakeRejected {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },

    #[snafu(display("remote returned status {:#06x}: {}", status_code, comment))]
    RemoteStatus { status_code: u16, comment: String },

    #[snafu(display("failed to encode outgoing data"))]
    Encode {
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("failed to decode incoming data"))]
    Decode {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("operation timed out"))]
    Timeout,

    #[snafu(display("no presentation context accepted for abstract syntax {}", abstract_syntax_uid))]
    NoAcceptedContext { abstract_syntax_uid: String },

    #[snafu(display("response carried no Status element"))]
    NoStatus,

    #[cfg(feature = "async-tls")]
    #[snafu(display("TLS was requested but no tls_config was provided"))]
    TlsConfigMissing,

    #[cfg(feature = "async-tls")]
    #[snafu(display("TLS handshake failed"))]
    TlsHandshake { source: std::io::Error },

    #[cfg(feature = "async-tls")]
    #[snafu(display("{} is not a valid TLS server name", name))]
    InvalidServerName { name: String },
}

pub type Result<T, E = FacadeError> = std::result::Result<T, E>;

/// Bring up the writer/reader split, the downcall bridge task, the
/// dispatcher, and the state machine, common to both `establish_async` and
/// `accept_async`.
fn spawn_association<S>(
    stream: S,
    params: AssociationParams,
    role: Role,
    fault_injector: Option<FaultInjector>,
) -> (Dispatcher, Handle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    let (downcall_tx, mut downcall_rx) = mpsc::channel::<DownCallEvent>(32);
    let dispatcher = Dispatcher::new(downcall_tx);

    let (mut assoc, handle) = match role {
        Role::Requestor => {
            Association::new_requestor(reader, writer, params, dispatcher.clone())
        }
        Role::Acceptor => Association::new_acceptor(reader, writer, params, dispatcher.clone()),
    };
    if let Some(injector) = fault_injector {
        assoc = assoc.with_fault_injector(injector);
    }

    let bridge_local_tx = handle.local_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = downcall_rx.recv().await {
            if bridge_local_tx
                .send(crate::state_machine::Event::Downcall(event))
                .await
                .is_err()
            {
                return;
            }
        }
    });

    let run_handle = tokio::spawn(assoc.run());

    (dispatcher, handle, run_handle)
}

fn transfer_syntax_for(uid: &str) -> Result<&'static TransferSyntax> {
    TransferSyntaxRegistry.get(uid).with_context(|| DecodeSnafu {
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("unsupported transfer syntax {uid}"),
        )) as Box<dyn std::error::Error + Send + Sync>,
    })
}

fn remote_status_err(status: &Status) -> FacadeError {
    FacadeError::RemoteStatus {
        status_code: status.code,
        comment: status.comment.clone().unwrap_or_default(),
    }
}

fn encode_dataset(obj: &InMemDicomObject, ts: &TransferSyntax) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    obj.write_dataset_with_ts(&mut body, ts)
        .map_err(Box::new)
        .context(EncodeSnafu)?;
    Ok(body)
}

fn decode_dataset(data: Vec<u8>, ts: &TransferSyntax) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(std::io::Cursor::new(data), ts)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        .context(DecodeSnafu)
}

fn query_retrieve_level(filter: &InMemDicomObject) -> QrLevel {
    filter
        .element(tags::QUERY_RETRIEVE_LEVEL)
        .ok()
        .and_then(|e| e.to_str().ok().map(|s| s.into_owned()))
        .map(|s| QrLevel::from_str(&s))
        .unwrap_or(QrLevel::Patient)
}

fn set_query_retrieve_level(filter: &mut InMemDicomObject, level: QrLevel) {
    if filter.element(tags::QUERY_RETRIEVE_LEVEL).is_err() {
        filter.put_str(tags::QUERY_RETRIEVE_LEVEL, dicom_core::VR::CS, level.as_str());
    }
}

// ---------------------------------------------------------------------
// Requestor side
// ---------------------------------------------------------------------

/// A DICOM association builder for a requestor node (service class user).
///
/// Grounded on the teacher's `ClientAssociationOptions`, generalized to the
/// async multi-presentation-context state machine.
#[derive(Clone)]
pub struct ClientAssociationOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    max_pdu_length: u32,
    fault_injector: Option<FaultInjector>,
    #[cfg(feature = "async-tls")]
    tls_config: Option<Arc<rustls::ClientConfig>>,
    #[cfg(feature = "async-tls")]
    server_name: Option<String>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: crate::pdu::reader::DEFAULT_MAX_PDU,
            fault_injector: None,
            #[cfg(feature = "async-tls")]
            tls_config: None,
            #[cfg(feature = "async-tls")]
            server_name: None,
        }
    }
}

impl ClientAssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calling_ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.calling_ae_title = value.into();
        self
    }

    pub fn called_ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.called_ae_title = value.into();
        self
    }

    pub fn with_abstract_syntax<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.abstract_syntax_uids.push(value.into());
        self
    }

    pub fn with_transfer_syntax<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.transfer_syntax_uids.push(value.into());
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Install a fault injector, consulted before every outbound PDU send.
    /// Test-only in practice; see [`crate::fault`].
    pub fn with_fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    /// Set the TLS configuration used by [`establish_tls`](Self::establish_tls)
    /// and [`establish_tls_async`](Self::establish_tls_async).
    #[cfg(feature = "async-tls")]
    pub fn tls_config(mut self, config: impl Into<Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// The server name presented during the TLS handshake. Defaults to the
    /// called AE title if unset.
    #[cfg(feature = "async-tls")]
    pub fn server_name<T: Into<String>>(mut self, value: T) -> Self {
        self.server_name = Some(value.into());
        self
    }

    /// Connect to `addr` and negotiate an association over it.
    pub async fn establish<A: ToSocketAddrs>(self, addr: A) -> Result<AssociationUser> {
        let stream = TcpStream::connect(addr)
            .await
            .context(ConnectionFailedSnafu)?;
        self.establish_async(stream).await
    }

    /// Negotiate an association over an already-connected stream (a plain
    /// `TcpStream`, a TLS stream, or an in-memory `tokio::io::duplex` half
    /// for tests).
    pub async fn establish_async<S>(self, stream: S) -> Result<AssociationUser>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut transfer_syntax_uids = self.transfer_syntax_uids;
        if transfer_syntax_uids.is_empty() {
            transfer_syntax_uids.push("1.2.840.10008.1.2.1".into()); // Explicit VR LE
            transfer_syntax_uids.push("1.2.840.10008.1.2".into()); // Implicit VR LE
        }

        let params = AssociationParams {
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            implementation_class_uid: crate::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            sop_classes: self
                .abstract_syntax_uids
                .iter()
                .map(|s| s.to_string())
                .collect(),
            transfer_syntaxes: transfer_syntax_uids.iter().map(|s| s.to_string()).collect(),
            local_max_pdu_size: self.max_pdu_length,
            access_control: Arc::new(AcceptAny),
        };

        let (dispatcher, mut handle, run_handle) =
            spawn_association(stream, params, Role::Requestor, self.fault_injector);

        if !handle.wait_for_handshake().await {
            if let Some((result, source)) = handle.rejection() {
                return HandshakeRejectedSnafu { result, source }.fail();
            }
            return ConnectionClosedSnafu.fail();
        }

        let context_manager = handle.context_manager().context(ConnectionClosedSnafu)?;

        Ok(AssociationUser {
            handle,
            dispatcher,
            context_manager,
            _run_handle: run_handle,
        })
    }

    /// Connect to `addr` over TLS and negotiate an association.
    #[cfg(feature = "async-tls")]
    pub async fn establish_tls<A: ToSocketAddrs>(self, addr: A) -> Result<AssociationUser> {
        let stream = TcpStream::connect(addr)
            .await
            .context(ConnectionFailedSnafu)?;
        self.establish_tls_async(stream).await
    }

    /// Perform the TLS handshake over an already-connected stream, then
    /// negotiate an association. Grounded on the teacher's
    /// `establish_tls_async` (`association/server.rs` carries the
    /// equivalent acceptor-side wiring; this crate is async-only, so there
    /// is no synchronous counterpart).
    #[cfg(feature = "async-tls")]
    pub async fn establish_tls_async<S>(self, stream: S) -> Result<AssociationUser>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        use rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let tls_config = self.tls_config.clone().context(TlsConfigMissingSnafu)?;
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| self.called_ae_title.to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| FacadeError::InvalidServerName { name })?
            .to_owned();

        let connector = TlsConnector::from(tls_config);
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .context(TlsHandshakeSnafu)?;

        self.establish_async(tls_stream).await
    }
}

/// An established association, from the requestor's perspective.
pub struct AssociationUser {
    handle: Handle,
    dispatcher: Dispatcher,
    context_manager: Arc<ContextManager>,
    _run_handle: JoinHandle<()>,
}

impl AssociationUser {
    fn context_for(&self, abstract_syntax_uid: &str) -> Result<PresentationContext> {
        self.context_manager
            .lookup_by_abstract_syntax_uid(abstract_syntax_uid)
            .map(|c| c.clone())
            .map_err(|_| FacadeError::NoAcceptedContext {
                abstract_syntax_uid: abstract_syntax_uid.to_string(),
            })
    }

    async fn new_command(&self, context: PresentationContext) -> Result<ServiceCommand> {
        self.dispatcher
            .new_command(context)
            .await
            .map_err(|_| FacadeError::ConnectionClosed)
    }

    /// Perform a C-ECHO: verify connectivity with the peer.
    pub async fn c_echo(&self) -> Result<()> {
        let context = self.context_for("1.2.840.10008.1.1")?;
        let mut command = self.new_command(context).await?;

        command
            .send_message(Message::c_echo_rq(command.message_id()), None)
            .await
            .map_err(|_| FacadeError::ConnectionClosed)?;

        let reply = command.recv().await.context(ConnectionClosedSnafu)?;
        self.dispatcher.delete_command(&command).await;

        let status = reply.command.status().context(NoStatusSnafu)?;
        if status.is_success() {
            Ok(())
        } else {
            Err(remote_status_err(&status))
        }
    }

    /// Perform a C-STORE, sending `dataset` to the peer.
    pub async fn c_store(&self, dataset: &FileDicomObject<InMemDicomObject>) -> Result<()> {
        let sop_class_uid = dataset.meta().media_storage_sop_class_uid().to_string();
        let sop_instance_uid = dataset.meta().media_storage_sop_instance_uid().to_string();
        let context = self.context_for(&sop_class_uid)?;
        let ts = transfer_syntax_for(&context.transfer_syntax_uid)?;
        let body = encode_dataset(dataset, ts)?;

        run_c_store_on_command(
            &self.dispatcher,
            context,
            &sop_class_uid,
            &sop_instance_uid,
            Priority::Medium,
            None,
            body,
        )
        .await
    }

    /// Perform a C-FIND query, streaming one result element set per match.
    pub fn c_find<'a>(
        &'a self,
        sop_class_uid: &str,
        level: QrLevel,
        mut filter: InMemDicomObject,
    ) -> impl Stream<Item = Result<InMemDicomObject>> + 'a {
        let sop_class_uid = sop_class_uid.to_string();
        async_stream::try_stream! {
            let context = self.context_for(&sop_class_uid)?;
            let ts = transfer_syntax_for(&context.transfer_syntax_uid)?;
            set_query_retrieve_level(&mut filter, level);
            let body = encode_dataset(&filter, ts)?;

            let mut command = self.new_command(context).await?;
            command
                .send_message(
                    Message::c_find_rq(command.message_id(), &sop_class_uid, Priority::Medium),
                    Some(body),
                )
                .await
                .map_err(|_| FacadeError::ConnectionClosed)?;

            loop {
                let reply = command.recv().await.context(ConnectionClosedSnafu)?;
                let status = reply.command.status().context(NoStatusSnafu)?;
                if status.is_pending() {
                    let data = reply.data.unwrap_or_default();
                    let elements = decode_dataset(data, ts)?;
                    yield elements;
                } else if status.is_success() {
                    break;
                } else {
                    Err(remote_status_err(&status))?;
                    break;
                }
            }
            self.dispatcher.delete_command(&command).await;
        }
    }

    /// Perform a C-GET query: matches are delivered in-association via
    /// C-STORE sub-operations, each routed through `handler`.
    pub async fn c_get<F, Fut>(
        &self,
        sop_class_uid: &str,
        level: QrLevel,
        mut filter: InMemDicomObject,
        handler: F,
    ) -> Result<Suboperations>
    where
        F: Fn(String, String, String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        let context = self.context_for(sop_class_uid)?;
        let ts = transfer_syntax_for(&context.transfer_syntax_uid)?;
        set_query_retrieve_level(&mut filter, level);
        let body = encode_dataset(&filter, ts)?;

        let handler = Arc::new(handler);
        self.dispatcher
            .register_callback(
                CommandField::C_STORE_RQ,
                Arc::new(move |command: Message, data: Option<Vec<u8>>, service: ServiceCommand| {
                    let handler = Arc::clone(&handler);
                    Box::pin(async move {
                        let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
                        let sop_instance_uid =
                            command.affected_sop_instance_uid().unwrap_or_default();
                        let ts_uid = service.context().transfer_syntax_uid.clone();
                        let status = handler(
                            ts_uid,
                            sop_class_uid.clone(),
                            sop_instance_uid.clone(),
                            data.unwrap_or_default(),
                        )
                        .await;
                        let reply = Message::c_store_rsp(
                            command.message_id().unwrap_or_default(),
                            &sop_class_uid,
                            &sop_instance_uid,
                            &status,
                        );
                        let _ = service.send_message(reply, None).await;
                    }) as Pin<Box<dyn Future<Output = ()> + Send>>
                }),
            )
            .await;

        let mut command = self.new_command(context).await?;
        command
            .send_message(
                Message::c_get_rq(command.message_id(), sop_class_uid, Priority::Medium),
                Some(body),
            )
            .await
            .map_err(|_| FacadeError::ConnectionClosed)?;

        let mut last_subops = Suboperations::default();
        let result = loop {
            let reply = command.recv().await.context(ConnectionClosedSnafu)?;
            let status = reply.command.status().context(NoStatusSnafu)?;
            last_subops = reply.command.suboperations();
            if status.is_pending() {
                continue;
            } else if status.is_success() {
                break Ok(last_subops);
            } else {
                break Err(remote_status_err(&status));
            }
        };
        self.dispatcher.delete_command(&command).await;
        self.dispatcher
            .unregister_callback(CommandField::C_STORE_RQ)
            .await;
        result
    }

    /// Perform a C-MOVE query: matches are relayed by the peer to
    /// `destination_ae_title`, reporting progress per response.
    pub fn c_move<'a>(
        &'a self,
        sop_class_uid: &str,
        level: QrLevel,
        mut filter: InMemDicomObject,
        destination_ae_title: &str,
    ) -> impl Stream<Item = Result<Suboperations>> + 'a {
        let sop_class_uid = sop_class_uid.to_string();
        let destination_ae_title = destination_ae_title.to_string();
        async_stream::try_stream! {
            let context = self.context_for(&sop_class_uid)?;
            let ts = transfer_syntax_for(&context.transfer_syntax_uid)?;
            set_query_retrieve_level(&mut filter, level);
            let body = encode_dataset(&filter, ts)?;

            let mut command = self.new_command(context).await?;
            command
                .send_message(
                    Message::c_move_rq(
                        command.message_id(),
                        &sop_class_uid,
                        Priority::Medium,
                        &destination_ae_title,
                    ),
                    Some(body),
                )
                .await
                .map_err(|_| FacadeError::ConnectionClosed)?;

            loop {
                let reply = command.recv().await.context(ConnectionClosedSnafu)?;
                let status = reply.command.status().context(NoStatusSnafu)?;
                let subops = reply.command.suboperations();
                if status.is_pending() {
                    yield subops;
                } else if status.is_success() {
                    yield subops;
                    break;
                } else {
                    Err(remote_status_err(&status))?;
                    break;
                }
            }
            self.dispatcher.delete_command(&command).await;
        }
    }

    /// Gracefully release the association.
    pub async fn release(&self) -> Result<()> {
        self.handle.request_release().await;
        Ok(())
    }

    /// Wait for the association to reach its terminal state.
    pub async fn wait_for_close(&mut self) {
        self.handle.wait_for_close().await;
    }
}

/// Shared C-STORE delivery: allocates a command, sends `CStoreRq` with
/// `data`, and waits for the single `CStoreRsp`. Grounded on the original
/// implementation's `runCStoreOnAssociation` (`cstore.go`), used by both
/// `AssociationUser::c_store` and the provider's C-MOVE relay.
#[allow(clippy::too_many_arguments)]
async fn run_c_store_on_command(
    dispatcher: &Dispatcher,
    context: PresentationContext,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: Priority,
    move_originator: Option<(&str, u16)>,
    data: Vec<u8>,
) -> Result<()> {
    let mut command = dispatcher
        .new_command(context)
        .await
        .map_err(|_| FacadeError::ConnectionClosed)?;

    command
        .send_message(
            Message::c_store_rq(
                command.message_id(),
                sop_class_uid,
                sop_instance_uid,
                priority,
                move_originator,
            ),
            Some(data),
        )
        .await
        .map_err(|_| FacadeError::ConnectionClosed)?;

    let reply = command.recv().await.context(ConnectionClosedSnafu)?;
    dispatcher.delete_command(&command).await;

    let reply_status = reply.command.status().context(NoStatusSnafu)?;
    if reply_status.is_success() {
        Ok(())
    } else {
        Err(remote_status_err(&reply_status))
    }
}

// ---------------------------------------------------------------------
// Acceptor side
// ---------------------------------------------------------------------

type StoreHandler = Arc<
    dyn Fn(ConnectionState, String, String, String, Vec<u8>) -> Pin<Box<dyn Future<Output = Status> + Send>>
        + Send
        + Sync,
>;
type EchoHandler =
    Arc<dyn Fn(ConnectionState) -> Pin<Box<dyn Future<Output = Status> + Send>> + Send + Sync>;
type FindHandler = Arc<
    dyn Fn(ConnectionState, QrLevel, InMemDicomObject) -> Pin<Box<dyn Future<Output = Vec<(InMemDicomObject, Status)>> + Send>>
        + Send
        + Sync,
>;
type MoveHandler = Arc<
    dyn Fn(ConnectionState, QrLevel, InMemDicomObject) -> Pin<Box<dyn Future<Output = Vec<FileDicomObject<InMemDicomObject>>> + Send>>
        + Send
        + Sync,
>;

/// A DICOM association builder for an acceptor node (service class
/// provider). Grounded on the teacher's `ServerAssociationOptions`,
/// generalized the same way as [`ClientAssociationOptions`].
#[derive(Clone)]
pub struct ServerAssociationOptions {
    ae_title: Cow<'static, str>,
    abstract_syntax_uids: Vec<Cow<'static, str>>,
    transfer_syntax_uids: Vec<Cow<'static, str>>,
    max_pdu_length: u32,
    access_control: Arc<dyn AccessControl>,
    remote_ae_map: HashMap<String, std::net::SocketAddr>,
    on_c_echo: Option<EchoHandler>,
    on_c_store: Option<StoreHandler>,
    on_c_find: Option<FindHandler>,
    on_c_move: Option<MoveHandler>,
    fault_injector: Option<FaultInjector>,
    #[cfg(feature = "async-tls")]
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl Default for ServerAssociationOptions {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_title: "ANY-SCP".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            max_pdu_length: crate::pdu::reader::DEFAULT_MAX_PDU,
            access_control: Arc::new(AcceptAny),
            remote_ae_map: HashMap::new(),
            on_c_echo: None,
            on_c_store: None,
            on_c_find: None,
            on_c_move: None,
            fault_injector: None,
            #[cfg(feature = "async-tls")]
            tls_config: None,
        }
    }
}

impl ServerAssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.ae_title = value.into();
        self
    }

    pub fn with_abstract_syntax<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.abstract_syntax_uids.push(value.into());
        self
    }

    pub fn with_transfer_syntax<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.transfer_syntax_uids.push(value.into());
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Replace the access control policy. The default accepts any
    /// requester ([`AcceptAny`]).
    pub fn access_control(mut self, policy: Arc<dyn AccessControl>) -> Self {
        self.access_control = policy;
        self
    }

    /// Register a destination AE title for C-MOVE relaying.
    pub fn with_remote_ae<T: Into<String>>(
        mut self,
        ae_title: T,
        addr: std::net::SocketAddr,
    ) -> Self {
        self.remote_ae_map.insert(ae_title.into(), addr);
        self
    }

    pub fn on_c_echo<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        self.on_c_echo = Some(Arc::new(move |cs| Box::pin(handler(cs))));
        self
    }

    pub fn on_c_store<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState, String, String, String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Status> + Send + 'static,
    {
        self.on_c_store = Some(Arc::new(move |cs, ts, sc, si, data| {
            Box::pin(handler(cs, ts, sc, si, data))
        }));
        self
    }

    pub fn on_c_find<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState, QrLevel, InMemDicomObject) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<(InMemDicomObject, Status)>> + Send + 'static,
    {
        self.on_c_find = Some(Arc::new(move |cs, level, filter| {
            Box::pin(handler(cs, level, filter))
        }));
        self
    }

    /// Register the C-MOVE query handler. Matches are relayed by opening
    /// a fresh outbound association to the AE title named in the
    /// C-MOVE-RQ's `MoveDestination`, resolved through
    /// [`with_remote_ae`](Self::with_remote_ae), and issuing one C-STORE
    /// per returned dataset.
    pub fn on_c_move<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionState, QrLevel, InMemDicomObject) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<FileDicomObject<InMemDicomObject>>> + Send + 'static,
    {
        self.on_c_move = Some(Arc::new(move |cs, level, filter| {
            Box::pin(handler(cs, level, filter))
        }));
        self
    }

    /// Install a fault injector, consulted before every outbound PDU send.
    /// Test-only in practice; see [`crate::fault`].
    pub fn with_fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault_injector = Some(injector);
        self
    }

    /// Set the TLS configuration used by [`accept_tls_async`](Self::accept_tls_async).
    #[cfg(feature = "async-tls")]
    pub fn tls_config(mut self, config: impl Into<Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Bind a listener and accept connections until the process is
    /// stopped, spawning one association per incoming connection.
    pub async fn listen<A: ToSocketAddrs>(self, bind_addr: A) -> Result<AssociationProvider> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .context(ConnectionFailedSnafu)?;
        Ok(AssociationProvider {
            options: self,
            listener: Some(listener),
        })
    }

    /// Negotiate an association as acceptor over an already-accepted
    /// stream (or an in-memory `tokio::io::duplex` half for tests).
    pub async fn accept_async<S>(self, stream: S) -> Result<AssociationProvider>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let provider = AssociationProvider {
            options: self.clone(),
            listener: None,
        };
        provider.run_one(stream, false).await?;
        Ok(provider)
    }

    /// Perform the TLS handshake over an already-accepted TCP stream, then
    /// negotiate an association as acceptor. Grounded on the teacher's
    /// `establish_tls_async` (`association/server.rs`).
    #[cfg(feature = "async-tls")]
    pub async fn accept_tls_async(self, stream: TcpStream) -> Result<AssociationProvider> {
        use tokio_rustls::TlsAcceptor;

        let tls_config = self.tls_config.clone().context(TlsConfigMissingSnafu)?;
        let acceptor = TlsAcceptor::from(tls_config);
        let tls_stream = acceptor.accept(stream).await.context(TlsHandshakeSnafu)?;

        let provider = AssociationProvider {
            options: self.clone(),
            listener: None,
        };
        provider.run_one(tls_stream, true).await?;
        Ok(provider)
    }
}

/// A running (or about-to-run) association provider.
pub struct AssociationProvider {
    options: ServerAssociationOptions,
    listener: Option<TcpListener>,
}

impl AssociationProvider {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener
            .as_ref()
            .expect("local_addr is only available after .listen()")
            .local_addr()
    }

    /// Accept connections forever, spawning one association task per
    /// connection.
    pub async fn run(self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .expect(".run() requires a bound listener; use .listen() first");
        loop {
            let (stream, _addr) = listener.accept().await.context(ConnectionFailedSnafu)?;
            let options = self.options.clone();
            tokio::spawn(async move {
                let provider = AssociationProvider {
                    options,
                    listener: None,
                };
                if let Err(source) = provider.run_one(stream, false).await {
                    tracing::warn!(%source, "association ended with an error");
                }
            });
        }
    }

    async fn run_one<S>(&self, stream: S, tls: bool) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let params = AssociationParams {
            calling_ae_title: "UNKNOWN-CALLING-AE".to_string(),
            called_ae_title: self.options.ae_title.to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            implementation_class_uid: crate::IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            sop_classes: self
                .options
                .abstract_syntax_uids
                .iter()
                .map(|s| s.to_string())
                .collect(),
            transfer_syntaxes: if self.options.transfer_syntax_uids.is_empty() {
                vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ]
            } else {
                self.options
                    .transfer_syntax_uids
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            },
            local_max_pdu_size: self.options.max_pdu_length,
            access_control: Arc::clone(&self.options.access_control),
        };

        let (dispatcher, mut handle, run_handle) = spawn_association(
            stream,
            params,
            Role::Acceptor,
            self.options.fault_injector.clone(),
        );

        if !handle.wait_for_handshake().await {
            return ConnectionClosedSnafu.fail();
        }
        let context_manager = handle.context_manager().context(ConnectionClosedSnafu)?;
        let connection_state = ConnectionState::from_context_manager(&context_manager, tls);

        if let Some(on_c_echo) = self.options.on_c_echo.clone() {
            let connection_state = connection_state.clone();
            dispatcher
                .register_callback(
                    CommandField::C_ECHO_RQ,
                    Arc::new(move |command: Message, _data, service: ServiceCommand| {
                        let on_c_echo = Arc::clone(&on_c_echo);
                        let connection_state = connection_state.clone();
                        Box::pin(async move {
                            let status = on_c_echo(connection_state).await;
                            let reply = Message::c_echo_rsp(
                                command.message_id().unwrap_or_default(),
                                &status,
                            );
                            let _ = service.send_message(reply, None).await;
                        }) as Pin<Box<dyn Future<Output = ()> + Send>>
                    }),
                )
                .await;
        }

        if let Some(on_c_store) = self.options.on_c_store.clone() {
            let connection_state = connection_state.clone();
            dispatcher
                .register_callback(
                    CommandField::C_STORE_RQ,
                    Arc::new(move |command: Message, data, service: ServiceCommand| {
                        let on_c_store = Arc::clone(&on_c_store);
                        let connection_state = connection_state.clone();
                        Box::pin(async move {
                            let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
                            let sop_instance_uid =
                                command.affected_sop_instance_uid().unwrap_or_default();
                            let ts_uid = service.context().transfer_syntax_uid.clone();
                            let status = on_c_store(
                                connection_state,
                                ts_uid,
                                sop_class_uid.clone(),
                                sop_instance_uid.clone(),
                                data.unwrap_or_default(),
                            )
                            .await;
                            let reply = Message::c_store_rsp(
                                command.message_id().unwrap_or_default(),
                                &sop_class_uid,
                                &sop_instance_uid,
                                &status,
                            );
                            let _ = service.send_message(reply, None).await;
                        }) as Pin<Box<dyn Future<Output = ()> + Send>>
                    }),
                )
                .await;
        }

        if let Some(on_c_find) = self.options.on_c_find.clone() {
            let connection_state = connection_state.clone();
            dispatcher
                .register_callback(
                    CommandField::C_FIND_RQ,
                    Arc::new(move |command: Message, data, service: ServiceCommand| {
                        let on_c_find = Arc::clone(&on_c_find);
                        let connection_state = connection_state.clone();
                        Box::pin(async move {
                            let ts_uid = service.context().transfer_syntax_uid.clone();
                            let ts = match transfer_syntax_for(&ts_uid) {
                                Ok(ts) => ts,
                                Err(_) => return,
                            };
                            let filter = match decode_dataset(data.unwrap_or_default(), ts) {
                                Ok(obj) => obj,
                                Err(_) => InMemDicomObject::new_empty(),
                            };
                            let level = query_retrieve_level(&filter);
                            let sop_class_uid =
                                command.affected_sop_class_uid().unwrap_or_default();
                            let matches = on_c_find(connection_state, level, filter).await;
                            let message_id = command.message_id().unwrap_or_default();
                            for (elements, _status) in &matches {
                                let body = match encode_dataset(elements, ts) {
                                    Ok(body) => body,
                                    Err(_) => continue,
                                };
                                let reply = Message::c_find_rsp(
                                    message_id,
                                    &sop_class_uid,
                                    &Status::pending(),
                                );
                                let _ = service.send_message(reply, Some(body)).await;
                            }
                            let final_reply =
                                Message::c_find_rsp(message_id, &sop_class_uid, &Status::success());
                            let _ = service.send_message(final_reply, None).await;
                        }) as Pin<Box<dyn Future<Output = ()> + Send>>
                    }),
                )
                .await;
        }

        if let Some(on_c_move) = self.options.on_c_move.clone() {
            let connection_state = connection_state.clone();
            let remote_ae_map = self.options.remote_ae_map.clone();
            let ae_title = self.options.ae_title.to_string();
            dispatcher
                .register_callback(
                    CommandField::C_MOVE_RQ,
                    Arc::new(move |command: Message, data, service: ServiceCommand| {
                        let on_c_move = Arc::clone(&on_c_move);
                        let connection_state = connection_state.clone();
                        let remote_ae_map = remote_ae_map.clone();
                        let ae_title = ae_title.clone();
                        Box::pin(async move {
                            run_c_move_relay(
                                on_c_move,
                                connection_state,
                                remote_ae_map,
                                ae_title,
                                command,
                                data,
                                service,
                            )
                            .await;
                        }) as Pin<Box<dyn Future<Output = ()> + Send>>
                    }),
                )
                .await;
        }

        let _ = run_handle.await;
        Ok(())
    }
}

/// Handle one C-MOVE-RQ: run the query handler, resolve the destination
/// AE title to an address, relay each matched dataset via a fresh
/// outbound C-STORE association, and report cumulative progress.
/// Grounded on the original implementation's CMove handler
/// (`serviceprovider.go`), which performs the same resolve-then-relay
/// sequence on its own goroutine per request.
async fn run_c_move_relay(
    on_c_move: MoveHandler,
    connection_state: ConnectionState,
    remote_ae_map: HashMap<String, std::net::SocketAddr>,
    calling_ae_title: String,
    command: Message,
    data: Option<Vec<u8>>,
    service: ServiceCommand,
) {
    let message_id = command.message_id().unwrap_or_default();
    let sop_class_uid = command.affected_sop_class_uid().unwrap_or_default();
    let ts_uid = service.context().transfer_syntax_uid.clone();
    let destination_ae_title = command.move_destination().unwrap_or_default();

    let ts = match transfer_syntax_for(&ts_uid) {
        Ok(ts) => ts,
        Err(_) => return,
    };
    let filter = match decode_dataset(data.unwrap_or_default(), ts) {
        Ok(obj) => obj,
        Err(_) => InMemDicomObject::new_empty(),
    };
    let level = query_retrieve_level(&filter);

    let Some(destination) = remote_ae_map.get(&destination_ae_title).copied() else {
        let reply = Message::c_move_rsp(
            message_id,
            &sop_class_uid,
            &Status::failure(0xa801, "move destination unknown"),
            Suboperations::default(),
        );
        let _ = service.send_message(reply, None).await;
        return;
    };

    let matches = on_c_move(connection_state, level, filter).await;
    let total = matches.len() as u16;

    let association = match ClientAssociationOptions::new()
        .calling_ae_title(calling_ae_title)
        .called_ae_title(destination_ae_title)
        .with_abstract_syntax(sop_class_uid.clone())
        .with_transfer_syntax(ts_uid)
        .establish(destination)
        .await
    {
        Ok(a) => a,
        Err(_) => {
            let reply = Message::c_move_rsp(
                message_id,
                &sop_class_uid,
                &Status::failure(0xa702, "unable to connect to move destination"),
                Suboperations::default(),
            );
            let _ = service.send_message(reply, None).await;
            return;
        }
    };

    let mut completed = 0u16;
    let mut failed = 0u16;
    for dataset in &matches {
        let result = association.c_store(dataset).await;
        match result {
            Ok(()) => completed += 1,
            Err(_) => failed += 1,
        }
        let remaining = total - completed - failed;
        let subops = Suboperations {
            remaining,
            completed,
            failed,
            warning: None,
        };
        let reply = Message::c_move_rsp(message_id, &sop_class_uid, &Status::pending(), subops);
        let _ = service.send_message(reply, None).await;
    }
    let _ = association.release().await;

    let final_subops = Suboperations {
        remaining: 0,
        completed,
        failed,
        warning: None,
    };
    let final_status = if failed == 0 {
        Status::success()
    } else {
        Status::failure(0xa702, "one or more sub-operations failed")
    };
    let reply = Message::c_move_rsp(message_id, &sop_class_uid, &final_status, final_subops);
    let _ = service.send_message(reply, None).await;
}
