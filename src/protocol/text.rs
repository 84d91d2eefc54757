//! Text command protocol for the stream transport
//!
//! One command per CRLF-terminated line, case-sensitive keywords:
//! ```text
//! AUTH <username> AS <displayName> USING <secret>
//! JOIN <channelId> AS <displayName>
//! MSG FROM <displayName> IS <text>
//! ERR ...
//! BYE
//! ```
//! Dispatch is on the first whitespace-delimited token; a recognized keyword
//! with the wrong shape is reported separately from an unknown command so the
//! caller can answer with the matching error line.

/// Display name the server signs its own notices with
pub const SERVER_DISPLAY_NAME: &str = "Server";

/// Longest accepted command line, delimiter excluded
pub const MAX_LINE_LENGTH: usize = 65_535;

/// A parsed inbound text command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextCommand {
    Auth {
        username: String,
        display_name: String,
        secret: String,
    },
    Join {
        channel_id: String,
        display_name: String,
    },
    Msg {
        display_name: String,
        content: String,
    },
    /// Client-reported error; the payload is not interpreted
    Err,
    Bye,
}

/// Why a line failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextParseError {
    BadAuth,
    BadJoin,
    BadMsg,
    Unknown,
}

impl TextParseError {
    /// The error line sent back to the client
    pub fn reply_line(&self) -> &'static str {
        match self {
            TextParseError::BadAuth => "ERR FROM Server IS Wrong auth format",
            TextParseError::BadJoin | TextParseError::BadMsg => {
                "ERR FROM Server IS Wrong msg format"
            }
            TextParseError::Unknown => "ERR FROM Server IS Unknown command",
        }
    }
}

impl TextCommand {
    /// Parse one line (without its CRLF terminator)
    pub fn parse(line: &str) -> Result<TextCommand, TextParseError> {
        match line.split_whitespace().next().unwrap_or("") {
            "AUTH" => parse_auth(line).ok_or(TextParseError::BadAuth),
            "JOIN" => parse_join(line).ok_or(TextParseError::BadJoin),
            "MSG" => parse_msg(line).ok_or(TextParseError::BadMsg),
            "ERR" => Ok(TextCommand::Err),
            "BYE" => Ok(TextCommand::Bye),
            _ => Err(TextParseError::Unknown),
        }
    }
}

fn parse_auth(line: &str) -> Option<TextCommand> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["AUTH", username, "AS", display_name, "USING", secret] => Some(TextCommand::Auth {
            username: username.to_string(),
            display_name: display_name.to_string(),
            secret: secret.to_string(),
        }),
        _ => None,
    }
}

fn parse_join(line: &str) -> Option<TextCommand> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["JOIN", channel_id, "AS", display_name] => Some(TextCommand::Join {
            channel_id: channel_id.to_string(),
            display_name: display_name.to_string(),
        }),
        _ => None,
    }
}

fn parse_msg(line: &str) -> Option<TextCommand> {
    // Content may contain spaces, so this one is parsed structurally
    let rest = line.strip_prefix("MSG FROM ")?;
    let (display_name, rest) = rest.split_once(' ')?;
    let content = rest.strip_prefix("IS ")?;
    if display_name.is_empty() || content.is_empty() {
        return None;
    }
    Some(TextCommand::Msg {
        display_name: display_name.to_string(),
        content: content.to_string(),
    })
}

/// Render a positive reply line
pub fn reply_ok(text: &str) -> String {
    format!("REPLY OK IS {text}")
}

/// Render a server error line
pub fn server_error(text: &str) -> String {
    format!("ERR FROM Server IS {text}")
}

/// Render a chat message line
pub fn chat_message(display_name: &str, content: &str) -> String {
    format!("MSG FROM {display_name} IS {content}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth() {
        let cmd = TextCommand::parse("AUTH alice AS Alice USING s3cret").unwrap();
        assert_eq!(
            cmd,
            TextCommand::Auth {
                username: "alice".into(),
                display_name: "Alice".into(),
                secret: "s3cret".into(),
            }
        );
    }

    #[test]
    fn test_parse_auth_wrong_shape() {
        assert_eq!(
            TextCommand::parse("AUTH alice Alice s3cret"),
            Err(TextParseError::BadAuth)
        );
        assert_eq!(
            TextCommand::parse("AUTH alice AS Alice"),
            Err(TextParseError::BadAuth)
        );
        assert_eq!(
            TextCommand::parse("AUTH alice AS Alice USING s3cret extra"),
            Err(TextParseError::BadAuth)
        );
    }

    #[test]
    fn test_parse_join() {
        let cmd = TextCommand::parse("JOIN roomX AS Alice").unwrap();
        assert_eq!(
            cmd,
            TextCommand::Join {
                channel_id: "roomX".into(),
                display_name: "Alice".into(),
            }
        );
        assert_eq!(
            TextCommand::parse("JOIN roomX Alice"),
            Err(TextParseError::BadJoin)
        );
    }

    #[test]
    fn test_parse_msg_preserves_spaces() {
        let cmd = TextCommand::parse("MSG FROM Alice IS hello there, world").unwrap();
        assert_eq!(
            cmd,
            TextCommand::Msg {
                display_name: "Alice".into(),
                content: "hello there, world".into(),
            }
        );
    }

    #[test]
    fn test_parse_msg_wrong_shape() {
        assert_eq!(
            TextCommand::parse("MSG Alice hello"),
            Err(TextParseError::BadMsg)
        );
        assert_eq!(
            TextCommand::parse("MSG FROM Alice hello"),
            Err(TextParseError::BadMsg)
        );
        assert_eq!(TextCommand::parse("MSG FROM "), Err(TextParseError::BadMsg));
    }

    #[test]
    fn test_parse_err_and_bye() {
        assert_eq!(
            TextCommand::parse("ERR FROM Client IS something"),
            Ok(TextCommand::Err)
        );
        assert_eq!(TextCommand::parse("BYE"), Ok(TextCommand::Bye));
    }

    #[test]
    fn test_parse_unknown_and_case_sensitivity() {
        assert_eq!(TextCommand::parse(""), Err(TextParseError::Unknown));
        assert_eq!(TextCommand::parse("HELLO"), Err(TextParseError::Unknown));
        assert_eq!(
            TextCommand::parse("auth alice AS Alice USING x"),
            Err(TextParseError::Unknown)
        );
    }

    #[test]
    fn test_error_reply_lines() {
        assert_eq!(
            TextParseError::BadAuth.reply_line(),
            "ERR FROM Server IS Wrong auth format"
        );
        assert_eq!(
            TextParseError::BadJoin.reply_line(),
            "ERR FROM Server IS Wrong msg format"
        );
        assert_eq!(
            TextParseError::Unknown.reply_line(),
            "ERR FROM Server IS Unknown command"
        );
    }

    #[test]
    fn test_renderers() {
        assert_eq!(reply_ok("Auth success"), "REPLY OK IS Auth success");
        assert_eq!(
            server_error("Unknown command"),
            "ERR FROM Server IS Unknown command"
        );
        assert_eq!(
            chat_message("Server", "Alice has joined default"),
            "MSG FROM Server IS Alice has joined default"
        );
    }
}
