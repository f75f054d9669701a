//! Secret handling re-exports, so callers do not depend on `secrecy`
//! directly.

pub use secrecy::{ExposeSecret, SecretString};
