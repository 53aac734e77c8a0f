//! IMAP response framing and the handful of parsers the gate needs.
//!
//! A frame is one complete server response: the text lines plus any
//! `{N}` literals they announce, read in full.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::channels::transport::{MailboxInfo, MessageUid};

/// One complete server response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Response text with literal payloads removed (the `{N}` markers stay).
    pub text: String,
    /// Literal payloads in the order they appeared.
    pub literals: Vec<Vec<u8>>,
}

/// Completion status of a tagged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl ResponseFrame {
    /// Build a literal-free frame from text.
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            literals: Vec::new(),
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.text.starts_with('+')
    }

    pub fn is_tagged(&self, tag: &str) -> bool {
        self.text
            .strip_prefix(tag)
            .is_some_and(|rest| rest.starts_with(' '))
    }

    /// Status word following the tag (or `*`).
    pub fn status(&self) -> Option<Status> {
        let word = self.text.split_whitespace().nth(1)?;
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Status::Ok),
            "NO" => Some(Status::No),
            "BAD" => Some(Status::Bad),
            _ => None,
        }
    }

    pub fn is_bye(&self) -> bool {
        self.untagged_words()
            .is_some_and(|mut w| w.next().is_some_and(|s| s.eq_ignore_ascii_case("BYE")))
    }

    /// `* <n> EXISTS`
    pub fn exists_count(&self) -> Option<u32> {
        self.numbered("EXISTS")
    }

    /// Sequence number of an untagged `* <n> EXPUNGE`.
    pub fn expunged_seq(&self) -> Option<u32> {
        self.numbered("EXPUNGE")
    }

    fn numbered(&self, keyword: &str) -> Option<u32> {
        let mut words = self.untagged_words()?;
        let number = words.next()?.parse().ok()?;
        words
            .next()
            .filter(|w| w.eq_ignore_ascii_case(keyword))
            .map(|_| number)
    }

    /// Whether this is an untagged `FETCH` response.
    pub fn is_fetch(&self) -> bool {
        self.untagged_words().is_some_and(|mut w| {
            w.next().is_some_and(|n| n.parse::<u32>().is_ok())
                && w.next().is_some_and(|s| s.eq_ignore_ascii_case("FETCH"))
        })
    }

    /// Words after the leading `*`, if the frame is untagged.
    fn untagged_words(&self) -> Option<std::str::SplitWhitespace<'_>> {
        let rest = self.text.strip_prefix("* ")?;
        Some(rest.split_whitespace())
    }
}

/// Read one response frame. `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<ResponseFrame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = ResponseFrame::default();
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            if frame.text.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-response",
            ));
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        frame.text.push_str(text);

        match literal_length(text) {
            Some(len) => {
                let mut literal = vec![0u8; len];
                reader.read_exact(&mut literal).await?;
                frame.literals.push(literal);
            }
            None => return Ok(Some(frame)),
        }
    }
}

/// Length of the literal announced at the end of a line, e.g. `{123}`.
pub fn literal_length(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` responses.
pub fn parse_search(frames: &[ResponseFrame]) -> Vec<MessageUid> {
    frames
        .iter()
        .filter_map(|f| f.untagged_words())
        .filter_map(|mut words| {
            words
                .next()
                .filter(|w| w.eq_ignore_ascii_case("SEARCH"))
                .map(|_| words)
        })
        .flatten()
        .filter_map(|w| w.parse().ok().map(MessageUid))
        .collect()
}

/// Mailbox status from a `SELECT` response.
pub fn parse_select(frames: &[ResponseFrame]) -> MailboxInfo {
    let mut info = MailboxInfo::default();
    for frame in frames {
        if let Some(count) = frame.exists_count() {
            info.exists = count;
        }
        if let Some(value) = response_code_value(&frame.text, "UIDVALIDITY") {
            info.uid_validity = Some(value);
        }
    }
    info
}

/// Numeric argument of a bracketed response code such as `[UIDVALIDITY 42]`.
fn response_code_value(text: &str, code: &str) -> Option<u32> {
    let start = text.find('[')?;
    let end = text[start..].find(']')? + start;
    let mut parts = text[start + 1..end].split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case(code) {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Whether a `CAPABILITY` response advertises `capability`.
pub fn has_capability(frames: &[ResponseFrame], capability: &str) -> bool {
    frames.iter().any(|f| {
        f.untagged_words().is_some_and(|mut words| {
            words
                .next()
                .is_some_and(|w| w.eq_ignore_ascii_case("CAPABILITY"))
                && words.any(|w| w.eq_ignore_ascii_case(capability))
        })
    })
}

/// The message body from a `UID FETCH ... BODY.PEEK[]` response.
pub fn take_fetch_body(frames: Vec<ResponseFrame>) -> Option<Vec<u8>> {
    frames
        .into_iter()
        .filter(ResponseFrame::is_fetch)
        .find_map(|f| f.literals.into_iter().next())
}

/// Quote a string argument, escaping `\` and `"`.
pub fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for ch in value.chars() {
        if ch == '\\' || ch == '"' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Generates `A1`, `A2`, ... command tags.
#[derive(Debug, Default)]
pub struct TagGenerator {
    next: u32,
}

impl TagGenerator {
    pub fn next_tag(&mut self) -> String {
        self.next += 1;
        format!("A{}", self.next)
    }
}
