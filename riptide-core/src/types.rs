//! Types and traits used across riptide.

/// Values which may move through a flow
#[diagnostic::on_unimplemented(message = "Type must be `Send + 'static` to move through a flow")]
pub trait Element: Send + 'static {}
impl<T: Send + 'static> Element for T {}

/// What to do when a producer outruns the requests of its consumer at a
/// boundary that cannot push back (the cold push adapter in
/// [crate::sources]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    /// Signal [crate::error::FlowError::MissingBackpressure] and cancel.
    Error,
    /// Silently drop the newest item.
    Drop,
    /// Keep only the most recent undelivered item.
    Latest,
    /// Buffer everything in an unbounded queue.
    Buffer,
}
