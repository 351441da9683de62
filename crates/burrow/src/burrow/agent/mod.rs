//! Agent side of the tunnel: runs next to the local service, keeps one
//! WebSocket open to the relay and answers forwarded requests.

pub mod connector;
pub mod dialer;
pub mod executor;
pub mod probe;
pub mod status;

pub use connector::{Agent, AgentOptions};
pub use status::AgentStatus;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid input: {0}")]
    InputValidation(String),
    #[error("could not reach relay after {attempts} attempts: {reason}")]
    Connect { attempts: u32, reason: String },
    #[error("registration rejected ({code}): {message}")]
    Registration { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("disconnected")]
    Disconnected,
}
