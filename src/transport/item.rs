use std::fmt::{Display, Formatter};

use crate::SvnError;

use super::wire::WireEncoder;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
/// One `ra_svn` s-expression item.
///
/// Editor commands travel as `( word ( params... ) )` lists of these.
pub enum SvnItem {
    /// A protocol word token.
    Word(String),
    /// A protocol number token.
    Number(u64),
    /// A protocol string token (raw bytes; may not be valid UTF-8).
    String(Vec<u8>),
    /// A protocol list token.
    List(Vec<SvnItem>),
    /// A protocol boolean token.
    Bool(bool),
}

impl SvnItem {
    /// Returns the word, if this is a word.
    pub fn as_word(&self) -> Option<&str> {
        match self {
            SvnItem::Word(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number, if this is a number.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SvnItem::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string as UTF-8, if this is a string holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SvnItem::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SvnItem::String(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the elements, if this is a list.
    pub fn as_list(&self) -> Option<&[SvnItem]> {
        match self {
            SvnItem::List(items) => Some(items),
            _ => None,
        }
    }
}

impl Display for SvnItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SvnItem::Word(w) => write!(f, "{w}"),
            SvnItem::Number(n) => write!(f, "{n}"),
            SvnItem::String(s) => write!(f, "<{} bytes>", s.len()),
            SvnItem::List(items) => write!(f, "({} items)", items.len()),
            SvnItem::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Appends the wire form of `item` to `out`.
pub fn encode_item(item: &SvnItem, out: &mut Vec<u8>) {
    let mut enc = WireEncoder::new(out);
    encode_item_with(&mut enc, item);
}

fn encode_item_with(enc: &mut WireEncoder<'_>, item: &SvnItem) {
    match item {
        SvnItem::Word(w) => enc.word(w),
        SvnItem::Number(n) => enc.number(*n),
        SvnItem::Bool(b) => enc.bool(*b),
        SvnItem::String(s) => enc.string_bytes(s),
        SvnItem::List(items) => {
            enc.list_start();
            for item in items {
                encode_item_with(enc, item);
            }
            enc.list_end();
        }
    }
}

/// Parses one item from the front of `input`.
///
/// Returns the item and the number of bytes it used, or `None` when `input`
/// ends before the item does. Leading whitespace is skipped.
pub fn parse_item(input: &[u8]) -> Result<Option<(SvnItem, usize)>, SvnError> {
    let mut reader = ItemReader { input, pos: 0 };
    let Some(item) = reader.item()? else {
        return Ok(None);
    };
    Ok(Some((item, reader.pos)))
}

struct ItemReader<'b> {
    input: &'b [u8],
    pos: usize,
}

impl ItemReader<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Consumes the whitespace every token is terminated by.
    fn require_ws(&mut self) -> Result<Option<()>, SvnError> {
        match self.peek() {
            None => Ok(None),
            Some(b) if b.is_ascii_whitespace() => {
                self.pos += 1;
                Ok(Some(()))
            }
            Some(_) => Err(SvnError::Protocol("expected whitespace".into())),
        }
    }

    fn item(&mut self) -> Result<Option<SvnItem>, SvnError> {
        self.skip_ws();
        match self.peek() {
            None => Ok(None),
            Some(b'(') => self.list(),
            Some(_) => self.atom(),
        }
    }

    fn list(&mut self) -> Result<Option<SvnItem>, SvnError> {
        self.pos += 1;
        if self.require_ws()?.is_none() {
            return Ok(None);
        }

        let mut stack: Vec<Vec<SvnItem>> = vec![Vec::new()];
        loop {
            self.skip_ws();
            match self.peek() {
                None => return Ok(None),
                Some(b')') => {
                    self.pos += 1;
                    if self.require_ws()?.is_none() {
                        return Ok(None);
                    }
                    let completed = stack
                        .pop()
                        .ok_or_else(|| SvnError::Protocol("list stack underflow".into()))?;
                    let item = SvnItem::List(completed);
                    match stack.last_mut() {
                        Some(parent) => parent.push(item),
                        None => return Ok(Some(item)),
                    }
                }
                Some(b'(') => {
                    self.pos += 1;
                    if self.require_ws()?.is_none() {
                        return Ok(None);
                    }
                    stack.push(Vec::new());
                }
                Some(_) => {
                    let Some(atom) = self.atom()? else {
                        return Ok(None);
                    };
                    stack
                        .last_mut()
                        .ok_or_else(|| SvnError::Protocol("list stack underflow".into()))?
                        .push(atom);
                }
            }
        }
    }

    fn atom(&mut self) -> Result<Option<SvnItem>, SvnError> {
        match self.peek() {
            None => Ok(None),
            Some(b'0'..=b'9') => {
                let Some(n) = self.digits()? else {
                    return Ok(None);
                };
                if self.peek() == Some(b':') {
                    self.pos += 1;
                    let len = usize::try_from(n)
                        .map_err(|_| SvnError::Protocol("string length overflow".into()))?;
                    let end = self
                        .pos
                        .checked_add(len)
                        .ok_or_else(|| SvnError::Protocol("string length overflow".into()))?;
                    if end > self.input.len() {
                        return Ok(None);
                    }
                    let bytes = self.input[self.pos..end].to_vec();
                    self.pos = end;
                    if self.require_ws()?.is_none() {
                        return Ok(None);
                    }
                    Ok(Some(SvnItem::String(bytes)))
                } else {
                    if self.require_ws()?.is_none() {
                        return Ok(None);
                    }
                    Ok(Some(SvnItem::Number(n)))
                }
            }
            Some(_) => {
                let Some(word) = self.word()? else {
                    return Ok(None);
                };
                let item = match word.as_str() {
                    "true" => SvnItem::Bool(true),
                    "false" => SvnItem::Bool(false),
                    _ => SvnItem::Word(word),
                };
                if self.require_ws()?.is_none() {
                    return Ok(None);
                }
                Ok(Some(item))
            }
        }
    }

    fn digits(&mut self) -> Result<Option<u64>, SvnError> {
        let mut n = 0u64;
        loop {
            let Some(b) = self.peek() else {
                return Ok(None);
            };
            if !b.is_ascii_digit() {
                return Ok(Some(n));
            }
            self.pos += 1;
            n = n
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as u64))
                .ok_or_else(|| SvnError::Protocol("number overflow".into()))?;
        }
    }

    fn word(&mut self) -> Result<Option<String>, SvnError> {
        let start = self.pos;
        loop {
            let Some(b) = self.peek() else {
                return Ok(None);
            };
            if b.is_ascii_whitespace() {
                break;
            }
            if b == b'(' || b == b')' || b == b':' {
                return Err(SvnError::Protocol("invalid word token".into()));
            }
            self.pos += 1;
        }
        String::from_utf8(self.input[start..self.pos].to_vec())
            .map(Some)
            .map_err(|_| SvnError::Protocol("non-utf8 word".into()))
    }
}
