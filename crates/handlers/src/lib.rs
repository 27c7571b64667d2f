//! `handlers` crate: the `TaskHandler` trait, the type-tag registry, and
//! built-in handler implementations.
//!
//! Every handler, built-in or user-supplied, must implement
//! [`TaskHandler`]. Agent workers dispatch execution through this trait
//! object, looked up by the task's type tag in a [`HandlerRegistry`].

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::{HandlerError, RegistryError};
pub use registry::HandlerRegistry;
pub use traits::{TaskContext, TaskHandler};
