use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message sent to the guest agent.
///
/// `id` is the correlation id echoed back in the matching [`AgentResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub id: String,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl AgentRequest {
    /// Wrap `body` with a fresh correlation id.
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    Execute {
        command: String,
        #[serde(default)]
        env: HashMap<String, String>,
        timeout_secs: u64,
    },
    Ping,
    Shutdown,
}

/// Message written back by the guest agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub id: String,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Execute {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Pong,
    ShutdownAck,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = AgentRequest {
            id: "abc".to_string(),
            body: RequestBody::Execute {
                command: "dir".to_string(),
                env: HashMap::new(),
                timeout_secs: 5,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["type"], "execute");
        assert_eq!(json["command"], "dir");
        assert_eq!(json["timeout_secs"], 5);
    }

    #[test]
    fn test_response_parses_agent_output() {
        let line = r#"{"id":"abc","type":"execute","exit_code":3,"stdout":"x","stderr":""}"#;
        let response: AgentResponse = serde_json::from_str(line).unwrap();
        assert_eq!(response.id, "abc");
        assert_eq!(
            response.body,
            ResponseBody::Execute {
                exit_code: 3,
                stdout: "x".to_string(),
                stderr: String::new(),
            }
        );

        let ack: AgentResponse = serde_json::from_str(r#"{"id":"z","type":"shutdown_ack"}"#).unwrap();
        assert_eq!(ack.body, ResponseBody::ShutdownAck);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = AgentRequest::new(RequestBody::Ping);
        let b = AgentRequest::new(RequestBody::Ping);
        assert_ne!(a.id, b.id);
    }
}
