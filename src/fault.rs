//! Per-association fault injection.
//!
//! Grounded on the original implementation's `FaultInjector`
//! (`faultinjector.go`): that type was a pair of process-wide singletons
//! (`userFaults`/`providerFaults`) consulted by the state machine on every
//! send. Here the same hook is kept but scoped to one [`Association`][assoc]
//! instead of living behind a global, per §9 Design Notes ("Global mutable
//! state").
//!
//! [assoc]: crate::state_machine::Association

use std::sync::Arc;

use crate::state_machine::Event;

/// What the event loop should do after consulting the fault injector for an
/// event it is about to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Proceed as normal.
    Continue,
    /// Act as though the transport closed instead of handling this event.
    Disconnect,
}

/// A per-association fault injector, consulted by the state machine before
/// every outbound send. Tests use this to simulate a mid-transfer
/// disconnect (dropping a PDU instead of writing it) without needing a real
/// flaky socket.
pub type FaultInjector = Arc<dyn Fn(&Event) -> FaultAction + Send + Sync>;

/// A fault injector that always disconnects, regardless of the event.
///
/// Mirrors the original's fuzzing injector's blunt instrument
/// (`faultInjectorDisconnect`) without the byte-mutation behavior, which has
/// no equivalent in this crate's typed PDU model.
pub fn always_disconnect() -> FaultInjector {
    Arc::new(|_event: &Event| FaultAction::Disconnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_disconnect_ignores_the_event() {
        let injector = always_disconnect();
        assert_eq!(injector(&Event::Connected), FaultAction::Disconnect);
        assert_eq!(injector(&Event::LocalRelease), FaultAction::Disconnect);
    }
}
