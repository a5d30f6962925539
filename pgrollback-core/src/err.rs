//! Error handling for the pgrollback crates.
//!
//! We lean on anyhow for error propagation and context chains.
//! Typed error payloads are attached with `Error::new` and recovered
//! by downcast where the protocol layer needs to distinguish them.

pub use anyhow::{anyhow, bail, ensure, Context, Error, Result};
