//! Codec module - serialization for the application-error envelope.
//!
//! Frame args are opaque byte strings end to end; the only structured
//! payload this core owns is the `$jsError` envelope carried in the
//! `arg1` of application-error responses.

mod envelope;

pub use envelope::{ErrorEnvelope, WireError, ENVELOPE_KEY};
