//! IRC message codec.
//!
//! Grammar: `[@tag=value;tag2 ][:prefix ]COMMAND[ middle...][ :trailing]`.
//! Lines are CRLF-terminated on the wire; [`Message::encode`] appends the
//! terminator and [`Message::parse`] strips it.

use std::collections::BTreeMap;
use std::fmt;

/// IRCv3 message tags. Ordered so that serialization is deterministic.
pub type Tags = BTreeMap<String, String>;

/// Longest line accepted from the wire: 8191 bytes of tags plus a 512 byte body.
pub const MAX_LINE_LEN: usize = 8191 + 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("line has no command")]
    MissingCommand,
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("line is {0} bytes long")]
    TooLong(usize),
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("cannot encode {0:?} on the wire")]
    Unencodable(String),
}

/// A parsed IRC message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub tags: Tags,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    /// Always introduce the last parameter with `:`, even when it would
    /// parse without one (`QUIT :bye`, `USER u 0 * :name`).
    pub force_trailing: bool,
}

impl Message {
    pub fn new<I, S>(command: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.to_string(),
            params: params.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_trailing(mut self) -> Self {
        self.force_trailing = true;
        self
    }

    /// Parse one line, with or without its CRLF terminator.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE_LEN {
            return Err(ParseError::TooLong(line.len()));
        }
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_str, tail) = tagged.split_once(' ').ok_or(ParseError::MissingCommand)?;
            rest = tail.trim_start_matches(' ');
            parse_tags(tag_str)
        } else {
            Tags::new()
        };

        let prefix = if let Some(prefixed) = rest.strip_prefix(':') {
            let (pfx, tail) = prefixed.split_once(' ').ok_or(ParseError::MissingCommand)?;
            rest = tail.trim_start_matches(' ');
            Some(pfx.to_string())
        } else {
            None
        };

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        if !command.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ParseError::InvalidCommand(command.to_string()));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((middle, tail)) => {
                    params.push(middle.to_string());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            force_trailing: false,
        })
    }

    /// Serialize to a wire line including the CRLF terminator.
    ///
    /// Fails if any field would break framing: CR, LF or NUL anywhere, or a
    /// space or leading `:` in a parameter that is not the last one.
    pub fn encode(&self) -> Result<String, ParseError> {
        let forbidden = |s: &str| s.contains(['\r', '\n', '\0']);
        if self.command.is_empty() || !self.command.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ParseError::InvalidCommand(self.command.clone()));
        }
        if let Some(prefix) = &self.prefix
            && (prefix.is_empty() || prefix.contains(' ') || forbidden(prefix))
        {
            return Err(ParseError::Unencodable(prefix.clone()));
        }
        for (key, value) in &self.tags {
            if key.is_empty() || key.contains([' ', ';', '=']) || forbidden(key) || value.contains('\0') {
                return Err(ParseError::Unencodable(key.clone()));
            }
        }
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let bad_middle = i != last && (param.is_empty() || param.contains(' ') || param.starts_with(':'));
            if forbidden(param) || bad_middle {
                return Err(ParseError::Unencodable(param.clone()));
            }
        }
        Ok(format!("{self}\r\n"))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            let is_last = i == self.params.len() - 1;
            if is_last
                && (self.force_trailing
                    || param.contains(' ')
                    || param.starts_with(':')
                    || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Parse IRCv3 tag string: `key=value;key2=value2`
fn parse_tags(tag_str: &str) -> Tags {
    let mut tags = Tags::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => tags.insert(key.to_string(), unescape_tag_value(value)),
            None => tags.insert(pair.to_string(), String::new()),
        };
    }
    tags
}

/// `\:` → `;`, `\s` → space, `\\` → `\`, `\r` → CR, `\n` → LF.
/// An unknown escape drops the backslash; a trailing lone backslash is dropped.
fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => result.push(';'),
            Some('s') => result.push(' '),
            Some('\\') => result.push('\\'),
            Some('r') => result.push('\r'),
            Some('n') => result.push('\n'),
            Some(other) => result.push(other),
            None => {}
        }
    }
    result
}

fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let msg = Message::parse("NICK alice\r\n").unwrap();
        assert!(msg.tags.is_empty());
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
    }

    #[test]
    fn parse_cap_ls_continuation() {
        let msg = Message::parse(":example.com CAP * LS * :multi-prefix sasl=PLAIN").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("example.com"));
        assert_eq!(msg.command, "CAP");
        assert_eq!(msg.params, vec!["*", "LS", "*", "multi-prefix sasl=PLAIN"]);
    }

    #[test]
    fn parse_with_tags_and_prefix() {
        let msg = Message::parse("@time=2024-01-01T00:00:00Z;msgid=abc :alice!a@host PRIVMSG #chan :hi there").unwrap();
        assert_eq!(msg.tags.get("time").unwrap(), "2024-01-01T00:00:00Z");
        assert_eq!(msg.tags.get("msgid").unwrap(), "abc");
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.params, vec!["#chan", "hi there"]);
    }

    #[test]
    fn parse_lowercase_command_is_normalized() {
        let msg = Message::parse("privmsg #chan hi").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn parse_collapses_repeated_spaces() {
        let msg = Message::parse(":srv  001   dan  :Welcome home").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["dan", "Welcome home"]);
    }

    #[test]
    fn parse_escaped_tag_value() {
        let msg = Message::parse("@label=a\\sb\\:c\\\\ PING x").unwrap();
        assert_eq!(msg.tags.get("label").unwrap(), "a b;c\\");
    }

    #[test]
    fn parse_rejects_junk() {
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse("   "), Err(ParseError::Empty));
        assert_eq!(Message::parse(":prefix-only"), Err(ParseError::MissingCommand));
        assert_eq!(Message::parse("@a=b"), Err(ParseError::MissingCommand));
        assert!(matches!(Message::parse("PRIV-MSG x"), Err(ParseError::InvalidCommand(_))));
        let long = format!("PRIVMSG #c :{}", "x".repeat(MAX_LINE_LEN));
        assert!(matches!(Message::parse(&long), Err(ParseError::TooLong(_))));
    }

    #[test]
    fn encode_registration_commands() {
        assert_eq!(Message::new("CAP", ["LS", "302"]).encode().unwrap(), "CAP LS 302\r\n");
        assert_eq!(Message::new("CAP", ["END"]).encode().unwrap(), "CAP END\r\n");
        assert_eq!(
            Message::new("USER", ["c", "0", "*", "Test Client  "]).with_trailing().encode().unwrap(),
            "USER c 0 * :Test Client  \r\n"
        );
        assert_eq!(Message::new("QUIT", ["bye"]).with_trailing().encode().unwrap(), "QUIT :bye\r\n");
        assert_eq!(Message::new("QUIT", [""]).encode().unwrap(), "QUIT :\r\n");
    }

    #[test]
    fn encode_tags_are_sorted_and_escaped() {
        let mut tags = Tags::new();
        tags.insert("z".to_string(), "a b".to_string());
        tags.insert("a".to_string(), String::new());
        let msg = Message::new("TAGMSG", ["#chan"]).with_tags(tags).with_prefix("me");
        assert_eq!(msg.encode().unwrap(), "@a;z=a\\sb :me TAGMSG #chan\r\n");
    }

    #[test]
    fn encode_refuses_line_injection() {
        let msg = Message::new("PRIVMSG", ["#chan", "hi\r\nQUIT"]);
        assert!(matches!(msg.encode(), Err(ParseError::Unencodable(_))));
        let msg = Message::new("MODE", ["#chan", "+o x", "nick"]);
        assert!(matches!(msg.encode(), Err(ParseError::Unencodable(_))));
    }

    #[test]
    fn reparse_preserves_trailing_spaces() {
        let line = Message::new("USER", ["c", "0", "*", " spaced  "]).with_trailing().encode().unwrap();
        let msg = Message::parse(&line).unwrap();
        assert_eq!(msg.params[3], " spaced  ");
    }
}
