//! Event types handed to the presentation layer.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host
//! shell (GUI, CLI, web bridge) can forward them as JSON without
//! re-mapping fields.

pub mod events;
