//! Presentation context negotiation and lookup.
//!
//! Grounded on the original implementation's `contextManager`
//! (`contextmanager.go`): a bidirectional map between context IDs and
//! negotiated (abstract syntax, transfer syntax) pairs, plus the peer's
//! advertised maximum PDU size and implementation identity.

use std::collections::HashMap;

use snafu::{OptionExt, Snafu};

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    PduVariableItem, UserVariableItem,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("unknown presentation context id {}", id))]
    UnknownContext { id: u8 },

    #[snafu(display("unknown abstract syntax {}", uid))]
    UnknownSyntax { uid: String },

    #[snafu(display("presentation context {} was rejected by the peer", id))]
    Rejected { id: u8 },

    #[snafu(display("presentation context request is missing an abstract syntax"))]
    MissingAbstractSyntax,

    #[snafu(display("presentation context request is missing a transfer syntax"))]
    MissingTransferSyntax,

    #[snafu(display("association response referenced unknown context id {}", id))]
    UnmatchedResponse { id: u8 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A negotiated presentation context, after either side has applied its
/// acceptance decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax_uid: String,
    pub transfer_syntax_uid: String,
    pub result: PresentationContextResultReason,
}

impl PresentationContext {
    pub fn is_accepted(&self) -> bool {
        matches!(self.result, PresentationContextResultReason::Acceptance)
    }
}

/// The acceptance decision for one proposed presentation context, returned
/// by a provider-side policy closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationContextDecision {
    /// Accept, using this transfer syntax (it must be one of those
    /// proposed for the context).
    Accept { transfer_syntax_uid: String },
    Reject(PresentationContextResultReason),
}

/// A policy deciding whether to accept a proposed presentation context and
/// with which transfer syntax.
///
/// The default implementation (see [`ContextManager::on_associate_request`])
/// accepts any abstract syntax and picks the first proposed transfer
/// syntax, matching the original implementation's SCP behavior; this is
/// exposed as an overridable closure rather than hard-wired.
pub type AcceptancePolicy =
    dyn Fn(&str, &[String]) -> PresentationContextDecision + Send + Sync;

pub fn default_policy() -> Box<AcceptancePolicy> {
    Box::new(|_abstract_syntax, transfer_syntaxes| {
        match crate::transfer_syntax::choose_supported(transfer_syntaxes.iter().map(String::as_str))
        {
            Some(ts) => PresentationContextDecision::Accept {
                transfer_syntax_uid: ts.to_string(),
            },
            None => PresentationContextDecision::Reject(
                PresentationContextResultReason::TransferSyntaxesNotSupported,
            ),
        }
    })
}

/// Per-association bookkeeping of negotiated presentation contexts.
#[derive(Debug, Clone)]
pub struct ContextManager {
    by_id: HashMap<u8, PresentationContext>,
    by_abstract_syntax: HashMap<String, u8>,
    /// requester-side bookkeeping: context id -> proposed context, kept
    /// until the A-ASSOCIATE-AC/RJ arrives so the response can be matched
    /// against what was actually proposed.
    pending_requests: HashMap<u8, PresentationContextProposed>,
    pub peer_max_pdu_size: u32,
    pub peer_implementation_class_uid: Option<String>,
    pub peer_implementation_version_name: Option<String>,
}

impl Default for ContextManager {
    fn default() -> Self {
        ContextManager {
            by_id: HashMap::new(),
            by_abstract_syntax: HashMap::new(),
            pending_requests: HashMap::new(),
            peer_max_pdu_size: crate::pdu::reader::DEFAULT_MAX_PDU,
            peer_implementation_class_uid: None,
            peer_implementation_version_name: None,
        }
    }
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requester side: build the presentation context items (and remember
    /// them) for an A-ASSOCIATE-RQ proposing one context per abstract
    /// syntax, each offering the full list of transfer syntaxes.
    pub fn generate_associate_request(
        &mut self,
        abstract_syntax_uids: &[String],
        transfer_syntax_uids: &[String],
    ) -> Vec<PresentationContextProposed> {
        self.pending_requests.clear();
        let mut proposed = Vec::with_capacity(abstract_syntax_uids.len());
        let mut id = 1u8;
        for abstract_syntax in abstract_syntax_uids {
            let item = PresentationContextProposed {
                id,
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntaxes: transfer_syntax_uids.to_vec(),
            };
            self.pending_requests.insert(id, item.clone());
            proposed.push(item);
            id += 2;
        }
        proposed
    }

    /// Provider side: decide on each proposed context using `policy`,
    /// record the outcome, and build the response items.
    pub fn on_associate_request(
        &mut self,
        proposed: &[PresentationContextProposed],
        policy: &AcceptancePolicy,
    ) -> Result<Vec<PresentationContextResult>> {
        let mut results = Vec::with_capacity(proposed.len());
        for context in proposed {
            if context.abstract_syntax.is_empty() {
                return MissingAbstractSyntaxSnafu.fail();
            }
            if context.transfer_syntaxes.is_empty() {
                return MissingTransferSyntaxSnafu.fail();
            }

            let decision = policy(&context.abstract_syntax, &context.transfer_syntaxes);
            let (reason, transfer_syntax_uid) = match decision {
                PresentationContextDecision::Accept { transfer_syntax_uid } => {
                    (PresentationContextResultReason::Acceptance, transfer_syntax_uid)
                }
                PresentationContextDecision::Reject(reason) => (reason, String::new()),
            };

            let entry = PresentationContext {
                id: context.id,
                abstract_syntax_uid: context.abstract_syntax.clone(),
                transfer_syntax_uid: transfer_syntax_uid.clone(),
                result: reason.clone(),
            };
            if matches!(reason, PresentationContextResultReason::Acceptance) {
                self.by_abstract_syntax
                    .insert(entry.abstract_syntax_uid.clone(), entry.id);
            }
            self.by_id.insert(entry.id, entry);

            results.push(PresentationContextResult {
                id: context.id,
                reason,
                transfer_syntax: transfer_syntax_uid,
            });
        }
        Ok(results)
    }

    /// Requester side: match the A-ASSOCIATE-AC's results against the
    /// contexts proposed earlier, recording the negotiated outcome.
    ///
    /// A response whose transfer syntax was not among those proposed is
    /// tolerated (recorded as-is) but logged, matching the original
    /// implementation's behavior.
    pub fn on_associate_response(&mut self, results: &[PresentationContextResult]) -> Result<()> {
        for result in results {
            let proposed = self
                .pending_requests
                .get(&result.id)
                .context(UnmatchedResponseSnafu { id: result.id })?;

            if matches!(result.reason, PresentationContextResultReason::Acceptance)
                && !proposed.transfer_syntaxes.contains(&result.transfer_syntax)
            {
                tracing::warn!(
                    context_id = result.id,
                    transfer_syntax = %result.transfer_syntax,
                    "peer accepted a transfer syntax that was not proposed"
                );
            }

            let entry = PresentationContext {
                id: result.id,
                abstract_syntax_uid: proposed.abstract_syntax.clone(),
                transfer_syntax_uid: result.transfer_syntax.clone(),
                result: result.reason.clone(),
            };
            if matches!(result.reason, PresentationContextResultReason::Acceptance) {
                self.by_abstract_syntax
                    .insert(entry.abstract_syntax_uid.clone(), entry.id);
            }
            self.by_id.insert(entry.id, entry);
        }
        self.pending_requests.clear();
        Ok(())
    }

    /// Record peer user-information items (max PDU size, implementation
    /// identity) observed in an A-ASSOCIATE-RQ/AC.
    pub fn record_user_variables(&mut self, items: &[UserVariableItem]) {
        for item in items {
            match item {
                UserVariableItem::MaxLength(max) => self.peer_max_pdu_size = *max,
                UserVariableItem::ImplementationClassUID(uid) => {
                    self.peer_implementation_class_uid = Some(uid.clone());
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    self.peer_implementation_version_name = Some(name.clone());
                }
                _ => {}
            }
        }
    }

    pub fn lookup_by_context_id(&self, id: u8) -> Result<&PresentationContext> {
        let entry = self.by_id.get(&id).context(UnknownContextSnafu { id })?;
        if !entry.is_accepted() {
            return RejectedSnafu { id }.fail();
        }
        Ok(entry)
    }

    pub fn lookup_by_abstract_syntax_uid(&self, uid: &str) -> Result<&PresentationContext> {
        let id = self
            .by_abstract_syntax
            .get(uid)
            .copied()
            .context(UnknownSyntaxSnafu { uid })?;
        self.lookup_by_context_id(id)
    }

    pub fn accepted_contexts(&self) -> impl Iterator<Item = &PresentationContext> {
        self.by_id.values().filter(|c| c.is_accepted())
    }
}

/// Helper used by both requester and provider code paths to pull the
/// negotiable items (application context name aside) out of an
/// A-ASSOCIATE-RQ/AC's variable item list, for callers that parse the PDU
/// fields directly rather than going through [`ContextManager`].
pub fn split_user_variables(items: Vec<PduVariableItem>) -> Vec<UserVariableItem> {
    items
        .into_iter()
        .filter_map(|item| match item {
            PduVariableItem::UserVariables(vars) => Some(vars),
            _ => None,
        })
        .flatten()
        .collect()
}
