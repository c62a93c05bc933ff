//! Agent Client Protocol (ACP) stream handling.
//!
//! Each agent process is driven by one [`client::AcpClient`], which owns a
//! reader task over the process's stdout and a writer task over its stdin.
//!
//! - `codec`: newline framing with a per-line ceiling.
//! - `message`: JSON-RPC envelope, ACP params, inbound classification.
//! - `reader`: inbound routing and request correlation.
//! - `writer`: outbound serialization.
//! - `client`: request primitives (`session/new`, `session/prompt`, `session/cancel`).

pub mod client;
pub mod codec;
pub mod message;
pub mod reader;
pub mod writer;
