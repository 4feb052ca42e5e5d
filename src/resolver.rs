//! The resolver capability that feeds the pool its backend membership.
//!
//! A resolver turns a logical service name into a living set of backends:
//! it pushes `added`/`removed` deltas into the pool through a
//! [`BackendSink`] and marks when its initial sweep is complete. DNS
//! SRV/A-record pollers, service-discovery watchers, and fixed lists are all
//! the same capability; [`StaticResolver`] covers the fixed-list case.

use tokio::sync::mpsc;

use crate::options::Backend;

/// Membership change pushed by a resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ResolverChange {
    Added(Backend),
    Removed(Backend),
    /// The resolver's view is complete; absence of backends is now
    /// meaningful.
    Steady,
}

/// The pool's receiving end for one resolver's membership stream.
#[derive(Clone, Debug)]
pub struct BackendSink {
    sender: mpsc::UnboundedSender<ResolverChange>,
}

impl BackendSink {
    /// Report a backend that joined the service.
    pub fn added(&self, backend: Backend) {
        // The pool dropping its receiver just means the membership no longer
        // matters.
        let _ = self.sender.send(ResolverChange::Added(backend));
    }

    /// Report a backend that left the service.
    pub fn removed(&self, backend: Backend) {
        let _ = self.sender.send(ResolverChange::Removed(backend));
    }

    /// Report that the initial membership sweep is complete.
    pub fn steady(&self) {
        let _ = self.sender.send(ResolverChange::Steady);
    }
}

pub(crate) fn channel() -> (BackendSink, mpsc::UnboundedReceiver<ResolverChange>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (BackendSink { sender }, receiver)
}

/// A source of backend membership for one logical service.
pub trait Resolver: Send + Sync + 'static {
    /// Begin producing membership events on `sink`. Implementations that poll
    /// should spawn their own task and hold the sink there.
    fn start(&self, sink: BackendSink);

    /// Stop producing events. Called once when the pool stops.
    fn stop(&self) {}
}

/// A resolver for services with a fixed backend list.
#[derive(Clone, Debug)]
pub struct StaticResolver {
    backends: Vec<Backend>,
}

impl StaticResolver {
    /// A resolver that reports exactly `backends` and immediately reaches
    /// steady state.
    pub fn new(backends: impl IntoIterator<Item = Backend>) -> Self {
        Self {
            backends: backends.into_iter().collect(),
        }
    }
}

impl Resolver for StaticResolver {
    fn start(&self, sink: BackendSink) {
        for backend in &self.backends {
            sink.added(backend.clone());
        }
        sink.steady();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn static_resolver_reports_backends_then_steady() {
        let (sink, mut rx) = channel();
        let resolver = StaticResolver::new(vec![
            Backend::new("a.example.com", 100),
            Backend::new("b.example.com", 200),
        ]);
        resolver.start(sink);

        assert_eq!(
            rx.try_recv().unwrap(),
            ResolverChange::Added(Backend::new("a.example.com", 100))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ResolverChange::Added(Backend::new("b.example.com", 200)),
        );
        assert_eq!(rx.try_recv().unwrap(), ResolverChange::Steady);
        assert!(rx.try_recv().is_err());
    }
}
