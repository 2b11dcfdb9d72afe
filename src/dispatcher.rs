//! Multiplexes reassembled DIMSE messages onto per-command handler tasks.
//!
//! Grounded on the original implementation's `serviceDispatcher`
//! (`servicedispatcher.go`): each DIMSE command (request + its eventual
//! response, matched by Message ID) gets its own upcall channel; a new
//! command spawns the registered callback for its `CommandField`, and
//! further messages with the same Message ID are forwarded to the
//! already-running handler instead of starting a second one.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::{mpsc, Mutex};

use crate::context::{ContextManager, PresentationContext};
use crate::dimse::fragment::Assembled;
use crate::dimse::{status, CommandField, Message, Status, Suboperations};

/// Upcall channel capacity per command, matching the original's buffered
/// channel of 128 entries.
const UPCALL_BUFFER: usize = 128;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("no callback registered for command field {:?}", field))]
    NoCallback { field: CommandField },

    #[snafu(display("presentation context lookup failed"))]
    Context { source: crate::context::Error },

    #[snafu(display("dispatcher is shutting down"))]
    Closed,

    #[snafu(display("no free DIMSE message id available"))]
    NoMessageId,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What a [`ServiceCommand`] asks the association's state machine to do:
/// currently only "encode and send this DIMSE message", corresponding to
/// the original's evt09 downcall.
#[derive(Debug)]
pub enum DownCallEvent {
    SendDimse {
        context_id: u8,
        command: Message,
        data: Option<Vec<u8>>,
    },
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A handler for request messages of a given [`CommandField`].
///
/// Registered once per command type; invoked in its own task for every
/// new Message ID seen for that command.
pub type ServiceCallback =
    Arc<dyn Fn(Message, Option<Vec<u8>>, ServiceCommand) -> BoxFuture + Send + Sync>;

/// One in-flight DIMSE command: the request that started it, and a
/// channel carrying every subsequent reassembled message sharing its
/// Message ID (used by multi-response services like C-FIND/C-GET/C-MOVE).
pub struct ServiceCommand {
    message_id: u16,
    context: PresentationContext,
    downcall_tx: mpsc::Sender<DownCallEvent>,
    upcall_rx: mpsc::Receiver<Assembled>,
}

impl ServiceCommand {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn context(&self) -> &PresentationContext {
        &self.context
    }

    /// Hand a response (or further request, for C-CANCEL) to the state
    /// machine to encode and send on the wire.
    pub async fn send_message(&self, command: Message, data: Option<Vec<u8>>) -> Result<()> {
        self.downcall_tx
            .send(DownCallEvent::SendDimse {
                context_id: self.context.id,
                command,
                data,
            })
            .await
            .ok()
            .context(ClosedSnafu)
    }

    /// Wait for the next reassembled message sharing this command's
    /// Message ID. Returns `None` once the dispatcher has closed the
    /// channel (association torn down, or the handler is done and no
    /// more messages are expected).
    pub async fn recv(&mut self) -> Option<Assembled> {
        self.upcall_rx.recv().await
    }
}

struct Inner {
    active_commands: HashMap<u16, mpsc::Sender<Assembled>>,
    callbacks: HashMap<CommandField, ServiceCallback>,
    last_message_id: u16,
    closed: bool,
}

/// Multiplexes the association's inbound DIMSE stream across concurrently
/// running command handlers.
#[derive(Clone)]
pub struct Dispatcher {
    downcall_tx: mpsc::Sender<DownCallEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl Dispatcher {
    pub fn new(downcall_tx: mpsc::Sender<DownCallEvent>) -> Self {
        Dispatcher {
            downcall_tx,
            inner: Arc::new(Mutex::new(Inner {
                active_commands: HashMap::new(),
                callbacks: HashMap::new(),
                last_message_id: 0,
                closed: false,
            })),
        }
    }

    pub async fn register_callback(&self, field: CommandField, callback: ServiceCallback) {
        self.inner.lock().await.callbacks.insert(field, callback);
    }

    pub async fn unregister_callback(&self, field: CommandField) {
        self.inner.lock().await.callbacks.remove(&field);
    }

    /// Allocate a fresh outbound command: a Message ID not currently in
    /// use, bound to `context`. Used by the façade to start a request
    /// (C-ECHO, C-STORE, C-FIND, C-GET, C-MOVE) and by C-GET/C-MOVE
    /// handlers that issue C-STORE sub-operations on the same
    /// association.
    pub async fn new_command(&self, context: PresentationContext) -> Result<ServiceCommand> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return ClosedSnafu.fail();
        }

        let start = inner.last_message_id.wrapping_add(1);
        let mut id = start;
        loop {
            if !inner.active_commands.contains_key(&id) {
                break;
            }
            id = id.wrapping_add(1);
            if id == start {
                return NoMessageIdSnafu.fail();
            }
        }
        inner.last_message_id = id;

        let (upcall_tx, upcall_rx) = mpsc::channel(UPCALL_BUFFER);
        inner.active_commands.insert(id, upcall_tx);
        drop(inner);

        Ok(ServiceCommand {
            message_id: id,
            context,
            downcall_tx: self.downcall_tx.clone(),
            upcall_rx,
        })
    }

    /// Release the Message ID held by `command`, once its caller is done
    /// waiting for responses.
    pub async fn delete_command(&self, command: &ServiceCommand) {
        self.inner
            .lock()
            .await
            .active_commands
            .remove(&command.message_id);
    }

    /// Dispatch one reassembled `(command, data)` pair arriving from the
    /// network-reader task.
    ///
    /// If its Message ID matches an already-running command, the message
    /// is forwarded to that command's handler task. Otherwise a callback
    /// is looked up by `command.command_field` and spawned in a new task,
    /// which owns the command for the rest of its lifetime.
    pub async fn handle_event(&self, context_manager: &ContextManager, event: Assembled) -> Result<()> {
        let context = context_manager
            .lookup_by_context_id(event.context_id)
            .context(ContextSnafu)?
            .clone();
        let message_id = match event.command.message_id() {
            Ok(id) => id,
            Err(_) => event
                .command
                .message_id_being_responded_to()
                .unwrap_or_default(),
        };

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return ClosedSnafu.fail();
        }

        if let Some(tx) = inner.active_commands.get(&message_id) {
            let tx = tx.clone();
            drop(inner);
            // Best effort: if the handler has already finished and
            // dropped its receiver, the message is simply not delivered.
            let _ = tx.send(event).await;
            return Ok(());
        }

        let callback = inner
            .callbacks
            .get(&event.command.command_field)
            .cloned()
            .context(NoCallbackSnafu {
                field: event.command.command_field,
            })?;

        let (upcall_tx, upcall_rx) = mpsc::channel(UPCALL_BUFFER);
        inner.active_commands.insert(message_id, upcall_tx);
        drop(inner);

        let command = event.command.clone();
        let data = event.data.clone();
        let command_field = command.command_field;
        let sop_class_uid = command.affected_sop_class_uid().ok();
        let sop_instance_uid = command.affected_sop_instance_uid();
        let context_id = context.id;
        let downcall_tx = self.downcall_tx.clone();
        let service_command = ServiceCommand {
            message_id,
            context,
            downcall_tx: self.downcall_tx.clone(),
            upcall_rx,
        };

        let inner_for_cleanup = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move {
                callback(command, data, service_command).await;
            })
            .catch_unwind()
            .await;

            if outcome.is_err() {
                tracing::error!(
                    ?command_field,
                    message_id,
                    "DIMSE handler panicked without replying; sending UNRECOGNIZED_OPERATION"
                );
                if let Some(sop_class_uid) = sop_class_uid.as_deref() {
                    if let Some(reply) = unrecognized_operation_reply(
                        command_field,
                        message_id,
                        sop_class_uid,
                        sop_instance_uid.as_deref(),
                    ) {
                        let _ = downcall_tx
                            .send(DownCallEvent::SendDimse {
                                context_id,
                                command: reply,
                                data: None,
                            })
                            .await;
                    }
                }
            }

            let mut inner = inner_for_cleanup.lock().await;
            inner.active_commands.remove(&message_id);
        });

        Ok(())
    }

    /// Shut down the dispatcher: close every active command's upcall
    /// channel (handlers observe `recv() == None` and wind down) and
    /// refuse to start new ones.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.active_commands.clear();
    }
}

/// A fallback response for a request whose handler panicked before it could
/// send one itself, so the peer's waiter doesn't hang until teardown.
fn unrecognized_operation_reply(
    command_field: CommandField,
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: Option<&str>,
) -> Option<Message> {
    let status = Status::failure(status::UNRECOGNIZED_OPERATION, "handler panicked");
    match command_field {
        CommandField::C_ECHO_RQ => Some(Message::c_echo_rsp(message_id, &status)),
        CommandField::C_STORE_RQ => Some(Message::c_store_rsp(
            message_id,
            sop_class_uid,
            sop_instance_uid.unwrap_or_default(),
            &status,
        )),
        CommandField::C_FIND_RQ => Some(Message::c_find_rsp(message_id, sop_class_uid, &status)),
        CommandField::C_GET_RQ => Some(Message::c_get_rsp(
            message_id,
            sop_class_uid,
            &status,
            Suboperations::default(),
        )),
        CommandField::C_MOVE_RQ => Some(Message::c_move_rsp(
            message_id,
            sop_class_uid,
            &status,
            Suboperations::default(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AcceptancePolicy, ContextManager, PresentationContextDecision};
    use crate::pdu::PresentationContextProposed;

    fn echo_context_manager() -> ContextManager {
        let mut cm = ContextManager::new();
        let proposed = vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }];
        let policy: Box<AcceptancePolicy> = Box::new(|_, ts| PresentationContextDecision::Accept {
            transfer_syntax_uid: ts[0].clone(),
        });
        cm.on_associate_request(&proposed, &policy).unwrap();
        cm
    }

    #[tokio::test]
    async fn new_command_spawns_registered_callback() {
        let (downcall_tx, _downcall_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(downcall_tx);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        dispatcher
            .register_callback(
                CommandField::C_ECHO_RQ,
                Arc::new(move |command: Message, _data, _cs| {
                    let message_id = command.message_id().unwrap();
                    let done_tx = Arc::clone(&done_tx);
                    Box::pin(async move {
                        if let Some(tx) = done_tx.lock().await.take() {
                            let _ = tx.send(message_id);
                        }
                    })
                }),
            )
            .await;

        let cm = echo_context_manager();
        let event = Assembled {
            context_id: 1,
            command: Message::c_echo_rq(42),
            data: None,
        };
        dispatcher.handle_event(&cm, event).await.unwrap();

        let message_id = done_rx.await.unwrap();
        assert_eq!(message_id, 42);
    }

    #[tokio::test]
    async fn missing_callback_is_an_error() {
        let (downcall_tx, _downcall_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(downcall_tx);
        let cm = echo_context_manager();
        let event = Assembled {
            context_id: 1,
            command: Message::c_echo_rq(1),
            data: None,
        };
        let err = dispatcher.handle_event(&cm, event).await;
        assert!(matches!(err, Err(Error::NoCallback { .. })));
    }
}
