use std::fmt;

/// Connection status shown to whoever drives the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Validating,
    Probing,
    Connecting { attempt: u32, max: u32 },
    Registering,
    Connected { public_url: String },
    Error(String),
    Disconnected,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Idle => f.write_str("Idle"),
            AgentStatus::Validating => f.write_str("Validating input..."),
            AgentStatus::Probing => f.write_str("Detecting local service protocol..."),
            AgentStatus::Connecting { attempt, max } => {
                write!(f, "Connecting to relay (attempt {attempt}/{max})...")
            }
            AgentStatus::Registering => f.write_str("Registering tunnel..."),
            AgentStatus::Connected { public_url } => write!(f, "Connected: {public_url}"),
            AgentStatus::Error(msg) => write!(f, "Error: {msg}"),
            AgentStatus::Disconnected => f.write_str("Disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text() {
        assert_eq!(
            AgentStatus::Connecting { attempt: 2, max: 5 }.to_string(),
            "Connecting to relay (attempt 2/5)..."
        );
        assert_eq!(
            AgentStatus::Connected {
                public_url: "http://relay/demo/".into()
            }
            .to_string(),
            "Connected: http://relay/demo/"
        );
        assert_eq!(AgentStatus::Disconnected.to_string(), "Disconnected");
    }
}
