//! Wire-level stream event protocol, shared between the engine (`loom`) and
//! the transport (`serve`) without either depending on the other's internals.
//!
//! Defines [`StreamEvent`] (spec §4.5/§6.1 taxonomy), [`StreamErrorKind`]
//! (spec §7 error taxonomy), and [`EnvelopeState`] for stamping
//! `workspace_id`/`event_id` onto outgoing frames.

pub mod envelope;
pub mod error_kind;
pub mod event;

pub use envelope::EnvelopeState;
pub use error_kind::StreamErrorKind;
pub use event::StreamEvent;
