//! # extop-api
//!
//! Custom resource types and object identity for the extension operator.
//!
//! ## Resources
//!
//! - `Extension` (`dynatrace.com/v1alpha1`): declares the extensions that
//!   should be installed on every node. Namespaced, short name `ext`.
//!
//! ## Identity
//!
//! Every `Extension` and the DaemonSet it owns are addressed by the same
//! [`ObjectKey`], a `(namespace, name)` pair rendered as `namespace/name`.

mod error;
mod extension;
mod key;

pub use error::KeyError;
pub use extension::*;
pub use key::ObjectKey;
