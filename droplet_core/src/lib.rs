//! Core types shared by every stage of the Droplet pipeline.
//!
//! This crate is dependency-light on purpose: the parser, compiler, VM, and
//! CLI all build on the value representation, source locations, and the
//! unified error type defined here.

pub mod error;
pub mod location;
pub mod value;

pub use error::{DropletError, DropletResult};
pub use location::SourceLocation;
pub use value::{ObjRef, Value};
