//! Domain model module declarations.

pub mod event;
pub mod message;
pub mod session;
pub mod workspace;
