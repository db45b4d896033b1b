//! Config Entries
//!
//! The [`ConfigEntry`] value platforms are set up from. Storing entries and
//! driving their setup lives outside this crate.

pub mod entry;

pub use entry::{ConfigEntry, ConfigEntryDisabledBy, ConfigEntrySource};
