//! Minimal reader for the serialized-object payloads observed on the wire.
//!
//! The protocol's peers exchange Python pickle (protocol 4) blobs whose
//! top-level object is a dict of string keys. Rule matching only needs that
//! mapping projected out, so this reader implements the opcode subset that
//! the observed traffic actually uses: scalar values, strings, bytes,
//! lists, tuples and nested dicts. Anything outside the subset fails the
//! parse; the caller then treats the payload as an opaque blob and relays
//! the raw bytes untouched.
//!
//! This is strictly a *reader*. The proxy never re-serializes objects;
//! altered traffic is produced by splicing raw byte ranges.

use std::fmt;
use thiserror::Error;

/// Leading bytes of a protocol-4 blob: PROTO 4 followed by FRAME.
pub const PICKLE_SIGNATURE: [u8; 3] = [0x80, 0x04, 0x95];

/// Upper bound on the value stack and memo, to keep a hostile blob from
/// ballooning memory before the parse fails.
const MAX_OBJECTS: usize = 1 << 20;

/// A deserialized value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
}

impl Value {
    /// Project a string out of the value, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Dict lookup by string key. Last write wins, matching pickle's
    /// SETITEM semantics on duplicate keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs
                .iter()
                .rev()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) | Value::Tuple(items) => {
                write!(f, "[{} items]", items.len())
            }
            Value::Dict(pairs) => write!(f, "{{{} entries}}", pairs.len()),
        }
    }
}

/// Reasons a blob fell outside the supported subset.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickleError {
    #[error("truncated pickle stream")]
    Truncated,
    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),
    #[error("malformed pickle stream: {0}")]
    Malformed(&'static str),
    #[error("pickle stream exceeds object limit")]
    TooLarge,
}

/// Parse a pickle blob into a [`Value`].
///
/// The caller is expected to have sniffed [`PICKLE_SIGNATURE`] already;
/// the signature bytes are consumed here as ordinary opcodes.
pub fn parse(data: &[u8]) -> Result<Value, PickleError> {
    Reader::new(data).run()
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: Vec<Value>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: Vec::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self.pos.checked_add(n).ok_or(PickleError::Truncated)?;
        if end > self.data.len() {
            return Err(PickleError::Truncated);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32_le(&mut self) -> Result<u32, PickleError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64_le(&mut self) -> Result<u64, PickleError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn push(&mut self, value: Value) -> Result<(), PickleError> {
        if self.stack.len() >= MAX_OBJECTS {
            return Err(PickleError::TooLarge);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        self.stack
            .pop()
            .ok_or(PickleError::Malformed("pop on empty stack"))
    }

    /// Detach everything above the most recent mark.
    fn pop_to_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self
            .marks
            .pop()
            .ok_or(PickleError::Malformed("no mark on stack"))?;
        Ok(self.stack.split_off(mark))
    }

    fn memo_put(&mut self, index: usize, value: Value) -> Result<(), PickleError> {
        if index >= MAX_OBJECTS {
            return Err(PickleError::TooLarge);
        }
        if index >= self.memo.len() {
            self.memo.resize(index + 1, Value::None);
        }
        self.memo[index] = value;
        Ok(())
    }

    fn memo_get(&self, index: usize) -> Result<Value, PickleError> {
        self.memo
            .get(index)
            .cloned()
            .ok_or(PickleError::Malformed("memo reference out of range"))
    }

    fn run(mut self) -> Result<Value, PickleError> {
        loop {
            let op = self.take_u8()?;
            match op {
                // Protocol framing.
                0x80 => {
                    self.take_u8()?;
                }
                0x95 => {
                    self.take_u64_le()?;
                }
                b'.' => {
                    let top = self.pop()?;
                    return Ok(top);
                }

                // Containers.
                b'}' => self.push(Value::Dict(Vec::new()))?,
                b']' => self.push(Value::List(Vec::new()))?,
                b')' => self.push(Value::Tuple(Vec::new()))?,
                b'(' => self.marks.push(self.stack.len()),
                b't' => {
                    let items = self.pop_to_mark()?;
                    self.push(Value::Tuple(items))?;
                }
                0x85..=0x87 => {
                    let n = (op - 0x84) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::Malformed("short stack for tuple"));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.push(Value::Tuple(items))?;
                }
                b'a' => {
                    let item = self.pop()?;
                    match self.stack.last_mut() {
                        Some(Value::List(items)) => items.push(item),
                        _ => return Err(PickleError::Malformed("APPEND on non-list")),
                    }
                }
                b'e' => {
                    let items = self.pop_to_mark()?;
                    match self.stack.last_mut() {
                        Some(Value::List(list)) => list.extend(items),
                        _ => return Err(PickleError::Malformed("APPENDS on non-list")),
                    }
                }
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => pairs.push((key, value)),
                        _ => return Err(PickleError::Malformed("SETITEM on non-dict")),
                    }
                }
                b'u' => {
                    let items = self.pop_to_mark()?;
                    if items.len() % 2 != 0 {
                        return Err(PickleError::Malformed("odd SETITEMS count"));
                    }
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => {
                            let mut it = items.into_iter();
                            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                                pairs.push((k, v));
                            }
                        }
                        _ => return Err(PickleError::Malformed("SETITEMS on non-dict")),
                    }
                }

                // Memo.
                0x94 => {
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or(PickleError::Malformed("MEMOIZE on empty stack"))?;
                    let index = self.memo.len();
                    self.memo_put(index, top)?;
                }
                b'q' => {
                    let index = self.take_u8()? as usize;
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or(PickleError::Malformed("BINPUT on empty stack"))?;
                    self.memo_put(index, top)?;
                }
                b'r' => {
                    let index = self.take_u32_le()? as usize;
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or(PickleError::Malformed("LONG_BINPUT on empty stack"))?;
                    self.memo_put(index, top)?;
                }
                b'h' => {
                    let index = self.take_u8()? as usize;
                    let value = self.memo_get(index)?;
                    self.push(value)?;
                }
                b'j' => {
                    let index = self.take_u32_le()? as usize;
                    let value = self.memo_get(index)?;
                    self.push(value)?;
                }

                // Strings and bytes.
                0x8c => {
                    let len = self.take_u8()? as usize;
                    let raw = self.take(len)?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|_| PickleError::Malformed("invalid utf-8 in unicode"))?;
                    self.push(Value::Str(s.to_owned()))?;
                }
                b'X' => {
                    let len = self.take_u32_le()? as usize;
                    let raw = self.take(len)?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|_| PickleError::Malformed("invalid utf-8 in unicode"))?;
                    self.push(Value::Str(s.to_owned()))?;
                }
                0x8d => {
                    let len = self.take_u64_le()?;
                    let len = usize::try_from(len).map_err(|_| PickleError::TooLarge)?;
                    let raw = self.take(len)?;
                    let s = std::str::from_utf8(raw)
                        .map_err(|_| PickleError::Malformed("invalid utf-8 in unicode"))?;
                    self.push(Value::Str(s.to_owned()))?;
                }
                b'C' => {
                    let len = self.take_u8()? as usize;
                    let raw = self.take(len)?;
                    self.push(Value::Bytes(raw.to_vec()))?;
                }
                b'B' => {
                    let len = self.take_u32_le()? as usize;
                    let raw = self.take(len)?;
                    self.push(Value::Bytes(raw.to_vec()))?;
                }
                0x8e => {
                    let len = self.take_u64_le()?;
                    let len = usize::try_from(len).map_err(|_| PickleError::TooLarge)?;
                    let raw = self.take(len)?;
                    self.push(Value::Bytes(raw.to_vec()))?;
                }

                // Numbers and singletons.
                b'K' => {
                    let v = self.take_u8()?;
                    self.push(Value::Int(v as i64))?;
                }
                b'M' => {
                    let b = self.take(2)?;
                    self.push(Value::Int(u16::from_le_bytes([b[0], b[1]]) as i64))?;
                }
                b'J' => {
                    let b = self.take(4)?;
                    self.push(Value::Int(
                        i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64
                    ))?;
                }
                0x8a => {
                    let len = self.take_u8()? as usize;
                    let raw = self.take(len)?;
                    if len > 8 {
                        return Err(PickleError::Malformed("LONG1 wider than 64 bits"));
                    }
                    let mut buf = if raw.last().is_some_and(|b| b & 0x80 != 0) {
                        [0xffu8; 8]
                    } else {
                        [0u8; 8]
                    };
                    buf[..len].copy_from_slice(raw);
                    self.push(Value::Int(i64::from_le_bytes(buf)))?;
                }
                b'G' => {
                    let b = self.take(8)?;
                    self.push(Value::Float(f64::from_be_bytes([
                        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                    ])))?;
                }
                0x88 => self.push(Value::Bool(true))?,
                0x89 => self.push(Value::Bool(false))?,
                b'N' => self.push(Value::None)?,

                other => return Err(PickleError::UnsupportedOpcode(other)),
            }
        }
    }
}

/// Build a protocol-4 blob for a dict of string keys and string values,
/// the way `pickle.dumps(d, protocol=4)` lays one out. Test fixture shared
/// with the framing and rule tests.
#[cfg(test)]
pub(crate) fn dict_blob(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut body = vec![b'}', 0x94, b'('];
    for (k, v) in pairs {
        for s in [k, v] {
            body.push(0x8c);
            body.push(s.len() as u8);
            body.extend_from_slice(s.as_bytes());
            body.push(0x94);
        }
    }
    body.push(b'u');
    body.push(b'.');

    let mut blob = vec![0x80, 0x04, 0x95];
    blob.extend_from_slice(&(body.len() as u64).to_le_bytes());
    blob.extend_from_slice(&body);
    blob
}
