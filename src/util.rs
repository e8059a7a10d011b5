//! Small shared helpers.

/// Boxed future used by every object-safe async trait in this crate
/// (`ProcessExecutor`, `DirectoryTransport`, `RemoteStore`, ...) so none of
/// them need an async-trait-style proc macro.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
