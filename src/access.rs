//! Application-entity access control policies for the association
//! provider.
//!
//! Extracted and generalized from the teacher's
//! `association::server::AccessControl` trait: a pluggable decision of
//! whether to accept an incoming A-ASSOCIATE-RQ, independent of
//! presentation-context negotiation.

use crate::pdu::{AssociationRJServiceUserReason, UserIdentity};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and
/// [`AcceptCalledAeTitle`], but users are free to implement their own.
pub trait AccessControl: Send + Sync {
    /// Obtain the decision of whether to accept an incoming association
    /// request based on the recorded application entity titles and/or
    /// user identity.
    ///
    /// Returns `Ok(())` if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests that match
/// the called AE title with the node's own AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_any_always_ok() {
        assert!(AcceptAny.check_access("A", "B", "C", None).is_ok());
    }

    #[test]
    fn accept_called_ae_title_checks_match() {
        assert!(AcceptCalledAeTitle
            .check_access("MYAE", "OTHER", "MYAE", None)
            .is_ok());
        assert!(AcceptCalledAeTitle
            .check_access("MYAE", "OTHER", "WRONG", None)
            .is_err());
    }
}
