//! Store named configuration files in container image registries.
//!
//! Payloads are pushed as a small custom manifest. Registries that refuse
//! unknown manifest types get a two layer image instead, whose only layer
//! is a tar archive of the files. Pulls read either form.

pub mod codec;
pub mod context;
pub mod credentials;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod negotiator;
pub mod options;
pub mod reference;
pub mod registry;
pub mod storage;

pub use codec::Payload;
pub use context::Context;
pub use digest::Digest;
pub use error::{Error, Result};
pub use negotiator::Labels;
pub use options::RegistryOptions;
pub use reference::ParsedReference;
pub use storage::Storage;
