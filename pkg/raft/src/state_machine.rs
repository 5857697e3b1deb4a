/// The application half of a replica. `apply` is invoked on every server, in commit
/// order, with the opaque payload the originating client submitted; the returned
/// bytes answer that client on the origin server and are discarded everywhere else
///
/// Implementations must be deterministic: replicas only stay identical because they
/// all apply the same payloads in the same order
pub trait StateMachine: Send + Sync + 'static {
	fn apply(&self, payload: &[u8]) -> Vec<u8>;
}
