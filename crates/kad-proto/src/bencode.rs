//! Stream-based, non-recursive bencode parser and canonical encoder.
//!
//! Bencode is the dictionary/list/integer/byte-string language used for
//! every on-wire RPC message and every persisted file this node reads or
//! writes. The parser is single-pass and keeps an explicit stack of open
//! containers instead of recursing, so nesting depth is governed by a
//! configured limit ([`ParserLimits::max_depth`]) rather than the call
//! stack.
//!
//! On output, dict entries are always emitted in ascending
//! byte-lexicographic key order (bencode's canonical form) -- this falls
//! out for free because dicts are represented with a [`BTreeMap`] keyed by
//! the raw key bytes.

use std::collections::BTreeMap;

/// A parsed bencode value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BencValue {
    /// A signed 64-bit integer (`i<...>e`).
    Int(i64),
    /// A length-prefixed byte string; may contain arbitrary binary data.
    Bytes(Vec<u8>),
    /// An ordered list of values.
    List(Vec<BencValue>),
    /// A dict, sorted by key for canonical output; duplicate keys are
    /// rejected at parse time.
    Dict(BTreeMap<Vec<u8>, BencValue>),
}

impl BencValue {
    /// Convenience constructor for a byte-string value from a `&str`.
    pub fn str(s: &str) -> Self {
        BencValue::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencValue]> {
        match self {
            BencValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencValue>> {
        match self {
            BencValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dict entry by string key.
    pub fn get(&self, key: &str) -> Option<&BencValue> {
        self.as_dict()?.get(key.as_bytes())
    }
}

/// Decode/encode error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid character at offset {0}")]
    InvalidChar(usize),
    #[error("integer overflow at offset {0}")]
    IntOverflow(usize),
    #[error("string exceeds maximum length of {max} bytes at offset {offset}")]
    StringTooLong { offset: usize, max: usize },
    #[error("nesting deeper than {max} at offset {offset}")]
    NestingTooDeep { offset: usize, max: usize },
    #[error("duplicate dict key at offset {0}")]
    DuplicateKey(usize),
    #[error("dict key was not a byte string at offset {0}")]
    NonStringKey(usize),
    #[error("trailing data after top-level value at offset {0}")]
    TrailingData(usize),
    #[error("unclosed container")]
    UnclosedContainer,
    #[error("empty input")]
    Empty,
}

/// Limits enforced by the parser. Defaults match the wire protocol's
/// constraints (§4.2 of the node's operating spec): nesting no deeper
/// than 32, and a generous per-string cap sized for a 1400-byte datagram.
#[derive(Clone, Copy, Debug)]
pub struct ParserLimits {
    pub max_depth: usize,
    pub max_string_len: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_string_len: 4096,
        }
    }
}

/// Decode exactly one top-level bencode value from `buf`, rejecting any
/// trailing bytes.
pub fn decode(buf: &[u8]) -> Result<BencValue, BencodeError> {
    decode_with_limits(buf, ParserLimits::default())
}

/// Decode with explicit [`ParserLimits`].
pub fn decode_with_limits(buf: &[u8], limits: ParserLimits) -> Result<BencValue, BencodeError> {
    if buf.is_empty() {
        return Err(BencodeError::Empty);
    }
    let mut parser = Parser::new(buf, limits);
    parser.run()
}

/// Canonically encode a value: dict keys in ascending byte order.
pub fn encode(value: &BencValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &BencValue, out: &mut Vec<u8>) {
    match value {
        BencValue::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        BencValue::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        BencValue::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        BencValue::Dict(map) => {
            out.push(b'd');
            // BTreeMap iterates in ascending key order already.
            for (k, v) in map {
                encode_into(&BencValue::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// One open container on the parser's explicit stack.
enum Frame {
    List(Vec<BencValue>),
    /// A dict being built; `pending_key` holds a parsed key awaiting its
    /// value.
    Dict {
        map: BTreeMap<Vec<u8>, BencValue>,
        pending_key: Option<Vec<u8>>,
    },
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: ParserLimits,
    stack: Vec<Frame>,
    root: Option<BencValue>,
}

impl<'a> Parser<'a> {
    fn new(buf: &'a [u8], limits: ParserLimits) -> Self {
        Self {
            buf,
            pos: 0,
            limits,
            stack: Vec::new(),
            root: None,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn run(&mut self) -> Result<BencValue, BencodeError> {
        loop {
            if self.stack.is_empty() {
                if let Some(root) = self.root.take() {
                    // Top-level value complete; anything else is trailing data.
                    if self.pos != self.buf.len() {
                        return Err(BencodeError::TrailingData(self.pos));
                    }
                    return Ok(root);
                }
            }

            let c = match self.peek() {
                Some(c) => c,
                None => {
                    if !self.stack.is_empty() {
                        return Err(BencodeError::UnclosedContainer);
                    }
                    return Err(BencodeError::UnexpectedEof(self.pos));
                }
            };

            match c {
                b'e' => {
                    self.pos += 1;
                    let frame = self.stack.pop().ok_or(BencodeError::InvalidChar(self.pos - 1))?;
                    let value = match frame {
                        Frame::List(items) => BencValue::List(items),
                        Frame::Dict { map, pending_key } => {
                            if pending_key.is_some() {
                                return Err(BencodeError::UnexpectedEof(self.pos));
                            }
                            BencValue::Dict(map)
                        }
                    };
                    self.deliver(value)?;
                }
                b'i' => {
                    let v = self.parse_int()?;
                    self.deliver(BencValue::Int(v))?;
                }
                b'l' => {
                    self.push_frame(Frame::List(Vec::new()))?;
                }
                b'd' => {
                    self.push_frame(Frame::Dict {
                        map: BTreeMap::new(),
                        pending_key: None,
                    })?;
                }
                b'0'..=b'9' => {
                    let bytes = self.parse_bytestring()?;
                    self.deliver_bytes(bytes)?;
                }
                _ => return Err(BencodeError::InvalidChar(self.pos)),
            }
        }
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), BencodeError> {
        self.pos += 1; // eat 'l' or 'd'
        if self.stack.len() >= self.limits.max_depth {
            return Err(BencodeError::NestingTooDeep {
                offset: self.pos - 1,
                max: self.limits.max_depth,
            });
        }
        self.stack.push(frame);
        Ok(())
    }

    /// Deliver a just-parsed bencode string, which may be a dict key, a
    /// dict value, a list item, or (at top level) a byte-string root value.
    fn deliver_bytes(&mut self, bytes: Vec<u8>) -> Result<(), BencodeError> {
        if let Some(Frame::Dict { pending_key, .. }) = self.stack.last_mut() {
            if pending_key.is_none() {
                *pending_key = Some(bytes);
                return Ok(());
            }
        }
        self.deliver(BencValue::Bytes(bytes))
    }

    /// Deliver a fully-formed value (container close, integer, or a string
    /// that wasn't consumed as a pending dict key) to its destination.
    fn deliver(&mut self, value: BencValue) -> Result<(), BencodeError> {
        match self.stack.last_mut() {
            Some(Frame::List(items)) => {
                items.push(value);
                Ok(())
            }
            Some(Frame::Dict { map, pending_key }) => {
                let key = pending_key
                    .take()
                    .ok_or(BencodeError::NonStringKey(self.pos))?;
                if map.insert(key, value).is_some() {
                    return Err(BencodeError::DuplicateKey(self.pos));
                }
                Ok(())
            }
            None => {
                if self.root.is_some() {
                    return Err(BencodeError::TrailingData(self.pos));
                }
                self.root = Some(value);
                Ok(())
            }
        }
    }

    fn parse_int(&mut self) -> Result<i64, BencodeError> {
        let start = self.pos;
        self.pos += 1; // eat 'i'
        let mut sign: i64 = 1;
        if self.peek() == Some(b'-') {
            sign = -1;
            self.pos += 1;
        }
        let mut saw_digit = false;
        let mut acc: i64 = 0;
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(d @ b'0'..=b'9') => {
                    saw_digit = true;
                    let digit = (d - b'0') as i64;
                    if acc > (i64::MAX - digit) / 10 {
                        return Err(BencodeError::IntOverflow(start));
                    }
                    acc = acc * 10 + digit;
                    self.pos += 1;
                }
                Some(_) => return Err(BencodeError::InvalidChar(self.pos)),
                None => return Err(BencodeError::UnexpectedEof(self.pos)),
            }
        }
        if !saw_digit {
            return Err(BencodeError::InvalidChar(self.pos));
        }
        Ok(acc * sign)
    }

    fn parse_bytestring(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.peek() {
                Some(b':') => {
                    self.pos += 1;
                    break;
                }
                Some(d @ b'0'..=b'9') => {
                    let digit = (d - b'0') as usize;
                    len = len
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or(BencodeError::IntOverflow(start))?;
                    self.pos += 1;
                }
                Some(_) => return Err(BencodeError::InvalidChar(self.pos)),
                None => return Err(BencodeError::UnexpectedEof(self.pos)),
            }
        }
        if len > self.limits.max_string_len {
            return Err(BencodeError::StringTooLong {
                offset: start,
                max: self.limits.max_string_len,
            });
        }
        if self.pos + len > self.buf.len() {
            return Err(BencodeError::UnexpectedEof(self.pos));
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }
}
