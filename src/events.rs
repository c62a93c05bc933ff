//! Typed events flowing from protocol clients and the process supervisor
//! to the session coordinator.
//!
//! Every producer holds a clone of one [`tokio::sync::mpsc::Sender`]; the
//! coordinator's event loop is the single consumer. Events for one session
//! are delivered in the order their producer emitted them.

use serde_json::Value;

use crate::acp::message::RpcError;

/// Outcome of one `session/prompt` turn, reported after the response.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The agent answered with a result (usually carrying `stopReason`).
    Completed {
        /// Raw result object from the response.
        result: Value,
    },
    /// The turn failed: agent error, timeout, or closed stream.
    Failed {
        /// Human-readable failure description.
        message: String,
    },
}

/// Events consumed by the session coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// `session/update` notification (`params` carries `update.sessionUpdate`).
    SessionUpdate {
        /// Orchestrator session the client belongs to.
        session_id: String,
        /// Raw notification params.
        params: Value,
    },
    /// Any other agent notification.
    Notification {
        /// Orchestrator session.
        session_id: String,
        /// Notification method.
        method: String,
        /// Raw params, `Value::Null` when absent.
        params: Value,
    },
    /// An error object arrived outside any request/response pairing.
    ProtocolError {
        /// Orchestrator session.
        session_id: String,
        /// JSON-RPC error payload.
        error: RpcError,
    },
    /// A stdout line could not be parsed as JSON.
    ParseError {
        /// Orchestrator session.
        session_id: String,
        /// Offending line.
        line: String,
        /// Parser message.
        error: String,
    },
    /// The agent's stdout reached EOF or failed.
    StreamClosed {
        /// Orchestrator session.
        session_id: String,
    },
    /// The agent process exited.
    ProcessExited {
        /// Orchestrator session.
        session_id: String,
        /// Exit code, absent when killed by a signal.
        exit_code: Option<i32>,
        /// Terminating signal on unix.
        signal: Option<i32>,
        /// `true` when the exit followed an explicit terminate request.
        expected: bool,
    },
    /// One line the agent wrote to stderr.
    ProcessStderr {
        /// Orchestrator session.
        session_id: String,
        /// Line text.
        message: String,
    },
    /// Waiting on the agent process failed.
    ProcessError {
        /// Orchestrator session.
        session_id: String,
        /// Failure description.
        error: String,
    },
    /// A prompt turn finished; queued after that turn's update events.
    TurnEnded {
        /// Orchestrator session.
        session_id: String,
        /// Turn result.
        outcome: TurnOutcome,
    },
}
