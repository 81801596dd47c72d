//! Action rendering and response handling

use crate::{
    constants::*,
    error::{AmiError, AmiResult},
};
use indexmap::IndexMap;

/// Reply to an action
#[derive(Debug, Clone)]
pub struct AmiResponse {
    headers: IndexMap<String, String>,
    success: bool,
}

impl AmiResponse {
    pub fn new(headers: IndexMap<String, String>) -> Self {
        let success = matches!(
            headers.get(HEADER_RESPONSE).map(|s| s.as_str()),
            Some(RESPONSE_SUCCESS) | Some(RESPONSE_GOODBYE)
        );
        Self { headers, success }
    }

    /// `Response: Success` (or `Goodbye` for Logoff)
    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Human-readable `Message:` header
    pub fn message(&self) -> Option<&str> {
        self.header(HEADER_MESSAGE)
    }

    /// Convert to result based on success status
    pub fn into_result(self) -> AmiResult<Self> {
        if self.success {
            Ok(self)
        } else {
            let message = self
                .message()
                .unwrap_or("Action failed")
                .to_string();
            Err(AmiError::protocol_error(message))
        }
    }
}

/// Renders one action frame
pub struct ActionBuilder {
    action: String,
    headers: IndexMap<String, String>,
}

impl ActionBuilder {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            headers: IndexMap::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Render as `Action: X\r\nKey: Value\r\n...\r\n\r\n`
    pub fn build(self) -> String {
        let mut result = format!("{}: {}{}", HEADER_ACTION, self.action, LINE_TERMINATOR);
        for (key, value) in &self.headers {
            result.push_str(&format!("{}: {}{}", key, value, LINE_TERMINATOR));
        }
        result.push_str(LINE_TERMINATOR);
        result
    }
}

/// Actions the tracker sends
#[derive(Debug, Clone)]
pub enum AmiAction {
    /// Authenticate and subscribe to event classes
    Login {
        username: String,
        secret: String,
        events: String,
    },
    /// Keepalive
    Ping,
    /// Polite disconnect, answered with `Response: Goodbye`
    Logoff,
}

impl AmiAction {
    /// Convert action to wire format string
    pub fn to_wire_format(&self) -> String {
        match self {
            AmiAction::Login {
                username,
                secret,
                events,
            } => ActionBuilder::new("Login")
                .header("Username", username)
                .header("Secret", secret)
                .header("Events", events)
                .build(),
            AmiAction::Ping => ActionBuilder::new("Ping").build(),
            AmiAction::Logoff => ActionBuilder::new("Logoff").build(),
        }
    }

    /// Name for logs; never includes the secret
    pub fn name(&self) -> &str {
        match self {
            AmiAction::Login { .. } => "Login",
            AmiAction::Ping => "Ping",
            AmiAction::Logoff => "Logoff",
        }
    }
}
