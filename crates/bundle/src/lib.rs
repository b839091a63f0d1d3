//! Keel bundle: the declarative set of resource definitions describing the
//! agent's desired footprint, and its instantiation into [`KubeObject`]s.
//!
//! [`KubeObject`]: keel_core::KubeObject

#![forbid(unsafe_code)]

mod contents;
mod instantiate;
mod source;

pub use contents::{BundleContents, DirContents, MemContents, TrackingContents};
pub use instantiate::{instantiate, parse_documents};
pub use source::{load_bundle, BundleSource, LocalBundleSource};
