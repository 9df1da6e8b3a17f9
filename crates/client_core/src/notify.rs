/// Best-effort cue on inbound message (audio bell or similar).
///
/// Non-critical side effect: implementations must not block and must
/// swallow their own failures.
pub trait InboundNotifier: Send + Sync {
    fn message_received(&self);
}

/// Default notifier that does nothing.
pub struct SilentNotifier;

impl InboundNotifier for SilentNotifier {
    fn message_received(&self) {}
}
