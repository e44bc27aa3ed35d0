use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Who wrote a message: the person on the phone, the automated bot, or a
/// human agent answering on the bot's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    #[default]
    User,
    Bot,
    Agent,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::User => "user",
            SenderRole::Bot => "bot",
            SenderRole::Agent => "agent",
        }
    }

    /// Human readable label shown next to each message bubble.
    pub fn label(&self) -> &'static str {
        match self {
            SenderRole::User => "User",
            SenderRole::Bot => "Bot",
            SenderRole::Agent => "Agent",
        }
    }

    /// Outbound messages are the ones the business side sent.
    pub fn is_outbound(&self) -> bool {
        !matches!(self, SenderRole::User)
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(SenderRole::User),
            "bot" => Ok(SenderRole::Bot),
            "agent" => Ok(SenderRole::Agent),
            other => Err(format!("unknown sender type '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Agent".parse::<SenderRole>().unwrap(), SenderRole::Agent);
        assert_eq!(" bot ".parse::<SenderRole>().unwrap(), SenderRole::Bot);
        assert!("robot".parse::<SenderRole>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&SenderRole::Agent).unwrap();
        assert_eq!(json, "\"agent\"");
        assert!(SenderRole::Bot.is_outbound());
        assert!(!SenderRole::User.is_outbound());
    }
}
