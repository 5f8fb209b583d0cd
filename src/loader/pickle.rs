//! A small unpickler for the object graphs written by `torch.save`.
//!
//! It executes the pickle opcode stream into a [`Value`] tree. Classes are
//! never instantiated: `NEWOBJ`/`BUILD` pairs become [`Value::Object`], unknown
//! `REDUCE` calls become [`Value::Call`] and persistent ids are kept as
//! [`Value::PersistentId`] for the torch layer to resolve.
//!
//! A memo slot stays bound to its stack position until the value leaves the
//! stack, so `GET` after `NEWOBJ, PUT, BUILD` sees the built object. This is
//! how shared modules (one `SiLU` referenced by every `Conv`) come back whole.

use crate::ir::Tensor;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PickleError {
    #[error("Unexpected end of pickle data at offset {0}")]
    UnexpectedEof(usize),
    #[error("Unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("Stack underflow at offset {0}")]
    StackUnderflow(usize),
    #[error("Missing mark at offset {0}")]
    MissingMark(usize),
    #[error("Memo entry {0} not found")]
    MissingMemo(usize),
    #[error("Invalid pickle: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Global {
        module: String,
        name: String,
    },
    Call {
        callable: Box<Value>,
        args: Vec<Value>,
    },
    Object {
        module: String,
        name: String,
        args: Vec<Value>,
        state: Box<Value>,
    },
    PersistentId(Box<Value>),
    Tensor(Tensor),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a tuple or list.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Looks up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(items) => items
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// `module.name` of an object or global.
    pub fn qualified_name(&self) -> Option<String> {
        match self {
            Value::Object { module, name, .. } | Value::Global { module, name } => {
                Some(format!("{}.{}", module, name))
            }
            _ => None,
        }
    }
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

pub struct Unpickler<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<usize, Value>,
    /// `(stack position, memo index)` of memoized values still on the stack.
    live: Vec<(usize, usize)>,
}

/// Runs a complete pickle and returns the object it describes.
pub fn from_slice(data: &[u8]) -> Result<Value, PickleError> {
    Unpickler::new(data).load()
}

impl<'a> Unpickler<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            live: Vec::new(),
        }
    }

    pub fn load(mut self) -> Result<Value, PickleError> {
        loop {
            let offset = self.pos;
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    let version = self.read_u8()?;
                    if version > 5 {
                        return Err(PickleError::Invalid(format!("unsupported protocol {}", version)));
                    }
                }
                op::FRAME => {
                    self.read_bytes(8)?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    if self.marks.last() == Some(&self.stack.len()) {
                        self.marks.pop();
                    } else {
                        self.pop()?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                op::NONE => self.stack.push(Value::None),
                op::NEWTRUE => self.stack.push(Value::Bool(true)),
                op::NEWFALSE => self.stack.push(Value::Bool(false)),
                op::INT => {
                    let line = self.read_line()?;
                    let value = match line.as_str() {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(parse_text(text, offset)?),
                    };
                    self.stack.push(value);
                }
                op::LONG => {
                    let line = self.read_line()?;
                    let value = parse_text(line.trim_end_matches('L'), offset)?;
                    self.stack.push(Value::Int(value));
                }
                op::BININT => {
                    let bytes = self.read_array::<4>()?;
                    self.stack.push(Value::Int(i32::from_le_bytes(bytes) as i64));
                }
                op::BININT1 => {
                    let value = self.read_u8()?;
                    self.stack.push(Value::Int(value as i64));
                }
                op::BININT2 => {
                    let bytes = self.read_array::<2>()?;
                    self.stack.push(Value::Int(u16::from_le_bytes(bytes) as i64));
                }
                op::LONG1 => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Int(decode_long(bytes)?));
                }
                op::LONG4 => {
                    let len = self.read_len4()?;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(Value::Int(decode_long(bytes)?));
                }
                op::FLOAT => {
                    let line = self.read_line()?;
                    let value = line
                        .parse::<f64>()
                        .map_err(|_| PickleError::Invalid(format!("bad float {:?}", line)))?;
                    self.stack.push(Value::Float(value));
                }
                op::BINFLOAT => {
                    let bytes = self.read_array::<8>()?;
                    self.stack.push(Value::Float(f64::from_be_bytes(bytes)));
                }
                op::STRING => {
                    let line = self.read_line()?;
                    let unquoted = line
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| line.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                        .unwrap_or(&line);
                    self.stack.push(Value::String(unquoted.to_string()));
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    self.stack.push(Value::String(line));
                }
                op::BINSTRING => {
                    let len = self.read_len4()?;
                    let text = self.read_string(len)?;
                    self.stack.push(Value::String(text));
                }
                op::SHORT_BINSTRING | op::SHORT_BINUNICODE => {
                    let len = self.read_u8()? as usize;
                    let text = self.read_string(len)?;
                    self.stack.push(Value::String(text));
                }
                op::BINUNICODE => {
                    let len = self.read_len4()?;
                    let text = self.read_string(len)?;
                    self.stack.push(Value::String(text));
                }
                op::BINUNICODE8 => {
                    let len = self.read_len8()?;
                    let text = self.read_string(len)?;
                    self.stack.push(Value::String(text));
                }
                op::SHORT_BINBYTES => {
                    let len = self.read_u8()? as usize;
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                op::BINBYTES => {
                    let len = self.read_len4()?;
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let len = self.read_len8()?;
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                op::EMPTY_TUPLE => self.stack.push(Value::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::StackUnderflow(offset));
                    }
                    let items = self.take_from(self.stack.len() - n);
                    self.stack.push(Value::Tuple(items));
                }
                op::EMPTY_LIST => self.stack.push(Value::List(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.extend_top(vec![item], offset)?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items, offset)?;
                }
                op::EMPTY_DICT => self.stack.push(Value::Dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    let pairs = into_pairs(items, offset)?;
                    self.stack.push(Value::Dict(pairs));
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![(key, value)], offset)?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = into_pairs(items, offset)?;
                    self.set_items(pairs, offset)?;
                }
                op::EMPTY_SET => self.stack.push(Value::Set(Vec::new())),
                op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    match self.stack.last_mut() {
                        Some(Value::Set(set)) => set.extend(items),
                        _ => return Err(PickleError::Invalid(format!("ADDITEMS on non-set at {}", offset))),
                    }
                }
                op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Set(items));
                }
                op::GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    self.stack.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::String(module), Value::String(name)) => {
                            self.stack.push(Value::Global { module, name })
                        }
                        _ => return Err(PickleError::Invalid(format!("STACK_GLOBAL without strings at {}", offset))),
                    }
                }
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let args = match args {
                        Value::Tuple(items) => items,
                        other => return Err(PickleError::Invalid(format!("REDUCE args {:?} at {}", other, offset))),
                    };
                    self.stack.push(reduce(callable, args));
                }
                op::NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let args = args.as_seq().map(|a| a.to_vec()).unwrap_or_default();
                    self.stack.push(new_object(class, args, offset)?);
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let args = args.as_seq().map(|a| a.to_vec()).unwrap_or_default();
                    self.stack.push(new_object(class, args, offset)?);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    // the target keeps its stack slot, and with it its memo entries
                    let target = self.pop_unsettled()?;
                    self.stack.push(build(target, state, offset)?);
                }
                op::PERSID => {
                    let line = self.read_line()?;
                    self.stack.push(Value::PersistentId(Box::new(Value::String(line))));
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    self.stack.push(Value::PersistentId(Box::new(pid)));
                }
                op::PUT => {
                    let line = self.read_line()?;
                    let index = parse_text(&line, offset)? as usize;
                    self.memoize(index)?;
                }
                op::BINPUT => {
                    let index = self.read_u8()? as usize;
                    self.memoize(index)?;
                }
                op::LONG_BINPUT => {
                    let index = self.read_len4()?;
                    self.memoize(index)?;
                }
                op::MEMOIZE => {
                    let index = self.memo.len() + self.live.len();
                    self.memoize(index)?;
                }
                op::GET => {
                    let line = self.read_line()?;
                    let index = parse_text(&line, offset)? as usize;
                    self.recall(index)?;
                }
                op::BINGET => {
                    let index = self.read_u8()? as usize;
                    self.recall(index)?;
                }
                op::LONG_BINGET => {
                    let index = self.read_len4()?;
                    self.recall(index)?;
                }
                opcode => return Err(PickleError::UnknownOpcode { opcode, offset }),
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8, PickleError> {
        let byte = *self.data.get(self.pos).ok_or(PickleError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(PickleError::UnexpectedEof(self.pos))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_len4(&mut self) -> Result<usize, PickleError> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?) as usize)
    }

    fn read_len8(&mut self) -> Result<usize, PickleError> {
        let len = u64::from_le_bytes(self.read_array::<8>()?);
        usize::try_from(len).map_err(|_| PickleError::Invalid(format!("length {} too large", len)))
    }

    fn read_string(&mut self, len: usize) -> Result<String, PickleError> {
        let offset = self.pos;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| PickleError::Invalid(format!("invalid utf-8 string at {}", offset)))
    }

    fn read_line(&mut self) -> Result<String, PickleError> {
        let start = self.pos;
        let newline = self.data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::UnexpectedEof(start))?;
        self.pos = start + newline + 1;
        let line = &self.data[start..start + newline];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(String::from_utf8_lossy(line).into_owned())
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        self.settle(self.stack.len().saturating_sub(1));
        self.pop_unsettled()
    }

    /// Pops without finalizing memo entries that point at the popped slot.
    fn pop_unsettled(&mut self) -> Result<Value, PickleError> {
        if let Some(&mark) = self.marks.last() {
            if mark == self.stack.len() {
                return Err(PickleError::StackUnderflow(self.pos));
            }
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow(self.pos))
    }

    fn take_from(&mut self, start: usize) -> Vec<Value> {
        self.settle(start);
        self.stack.split_off(start)
    }

    /// Copies every live memo value at or above stack position `from` into
    /// the memo. Called right before those slots are popped.
    fn settle(&mut self, from: usize) {
        let stack = &self.stack;
        let memo = &mut self.memo;
        self.live.retain(|&(pos, index)| {
            if pos < from {
                return true;
            }
            if let Some(value) = stack.get(pos) {
                memo.insert(index, value.clone());
            }
            false
        });
    }

    fn top(&self) -> Result<&Value, PickleError> {
        self.stack.last().ok_or(PickleError::StackUnderflow(self.pos))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(self.pos))?;
        if mark > self.stack.len() {
            return Err(PickleError::MissingMark(self.pos));
        }
        Ok(self.take_from(mark))
    }

    fn memoize(&mut self, index: usize) -> Result<(), PickleError> {
        let pos = self
            .stack
            .len()
            .checked_sub(1)
            .ok_or(PickleError::StackUnderflow(self.pos))?;
        self.memo.remove(&index);
        self.live.retain(|&(_, i)| i != index);
        self.live.push((pos, index));
        Ok(())
    }

    fn recall(&mut self, index: usize) -> Result<(), PickleError> {
        let value = match self.live.iter().find(|&&(_, i)| i == index) {
            Some(&(pos, _)) => self.stack.get(pos).cloned(),
            None => self.memo.get(&index).cloned(),
        }
        .ok_or(PickleError::MissingMemo(index))?;
        self.stack.push(value);
        Ok(())
    }

    fn extend_top(&mut self, items: Vec<Value>, offset: usize) -> Result<(), PickleError> {
        match self.stack.last_mut() {
            Some(Value::List(list)) => {
                list.extend(items);
                Ok(())
            }
            Some(Value::Set(set)) => {
                set.extend(items);
                Ok(())
            }
            _ => Err(PickleError::Invalid(format!("APPEND on non-list at {}", offset))),
        }
    }

    fn set_items(&mut self, pairs: Vec<(Value, Value)>, offset: usize) -> Result<(), PickleError> {
        match self.stack.last_mut() {
            Some(Value::Dict(dict)) => {
                for (key, value) in pairs {
                    insert_item(dict, key, value);
                }
                Ok(())
            }
            Some(Value::Object { state, .. }) => {
                if state.is_none() {
                    **state = Value::Dict(Vec::new());
                }
                match state.as_mut() {
                    Value::Dict(dict) => {
                        for (key, value) in pairs {
                            insert_item(dict, key, value);
                        }
                        Ok(())
                    }
                    _ => Err(PickleError::Invalid(format!("SETITEM on object with non-dict state at {}", offset))),
                }
            }
            _ => Err(PickleError::Invalid(format!("SETITEM on non-dict at {}", offset))),
        }
    }
}

fn parse_text(text: &str, offset: usize) -> Result<i64, PickleError> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| PickleError::Invalid(format!("bad integer {:?} at {}", text, offset)))
}

/// Little-endian two's complement, as written by LONG1/LONG4.
fn decode_long(bytes: &[u8]) -> Result<i64, PickleError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(PickleError::Invalid(format!("{}-byte integer does not fit in i64", bytes.len())));
    }
    let mut buf = if bytes[bytes.len() - 1] & 0x80 != 0 { [0xffu8; 8] } else { [0u8; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

fn into_pairs(items: Vec<Value>, offset: usize) -> Result<Vec<(Value, Value)>, PickleError> {
    if items.len() % 2 != 0 {
        return Err(PickleError::Invalid(format!("odd number of dict items at {}", offset)));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn insert_item(dict: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    match dict.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => dict.push((key, value)),
    }
}

fn is_global(value: &Value, modules: &[&str], names: &[&str]) -> bool {
    matches!(value, Value::Global { module, name } if modules.contains(&module.as_str()) && names.contains(&name.as_str()))
}

fn reduce(callable: Value, mut args: Vec<Value>) -> Value {
    if is_global(&callable, &["collections"], &["OrderedDict"]) {
        let items = match args.pop() {
            Some(Value::List(pairs)) | Some(Value::Tuple(pairs)) => pairs
                .into_iter()
                .filter_map(|pair| match pair {
                    Value::Tuple(mut kv) | Value::List(mut kv) if kv.len() == 2 => {
                        let value = kv.pop()?;
                        let key = kv.pop()?;
                        Some((key, value))
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        return Value::Dict(items);
    }
    if is_global(&callable, &["builtins", "__builtin__"], &["set", "frozenset"]) {
        let items = match args.pop() {
            Some(Value::List(items)) | Some(Value::Tuple(items)) | Some(Value::Set(items)) => items,
            _ => Vec::new(),
        };
        return Value::Set(items);
    }
    if is_global(&callable, &["copyreg", "copy_reg"], &["_reconstructor"]) {
        if let Some(Value::Global { module, name }) = args.first().cloned() {
            return Value::Object {
                module,
                name,
                args: Vec::new(),
                state: Box::new(Value::None),
            };
        }
    }
    Value::Call {
        callable: Box::new(callable),
        args,
    }
}

fn new_object(class: Value, args: Vec<Value>, offset: usize) -> Result<Value, PickleError> {
    match class {
        Value::Global { module, name } => {
            if module == "collections" && name == "OrderedDict" {
                return Ok(Value::Dict(Vec::new()));
            }
            Ok(Value::Object {
                module,
                name,
                args,
                state: Box::new(Value::None),
            })
        }
        other => Err(PickleError::Invalid(format!("NEWOBJ on {:?} at {}", other, offset))),
    }
}

fn build(target: Value, state: Value, offset: usize) -> Result<Value, PickleError> {
    // (dict_state, slots_state) pairs are flattened into one dict.
    let state = match state {
        Value::Tuple(mut parts) if parts.len() == 2 => {
            let slots = parts.pop().unwrap_or(Value::None);
            let dict = parts.pop().unwrap_or(Value::None);
            match (dict, slots) {
                (Value::Dict(mut d), Value::Dict(s)) => {
                    d.extend(s);
                    Value::Dict(d)
                }
                (Value::None, slots) => slots,
                (dict, Value::None) => dict,
                (dict, slots) => Value::Tuple(vec![dict, slots]),
            }
        }
        other => other,
    };

    match target {
        Value::Object {
            module,
            name,
            args,
            state: previous,
        } => {
            let merged = match (*previous, state) {
                (Value::Dict(mut old), Value::Dict(new)) => {
                    for (key, value) in new {
                        insert_item(&mut old, key, value);
                    }
                    Value::Dict(old)
                }
                (_, new) => new,
            };
            Ok(Value::Object {
                module,
                name,
                args,
                state: Box::new(merged),
            })
        }
        Value::Dict(mut items) => match state {
            Value::Dict(new) => {
                for (key, value) in new {
                    insert_item(&mut items, key, value);
                }
                Ok(Value::Dict(items))
            }
            Value::None => Ok(Value::Dict(items)),
            other => Err(PickleError::Invalid(format!("BUILD of dict with {:?} at {}", other, offset))),
        },
        Value::Call { callable, args } => match *callable {
            Value::Global { module, name } => Ok(Value::Object {
                module,
                name,
                args,
                state: Box::new(state),
            }),
            other => Err(PickleError::Invalid(format!("BUILD on call of {:?} at {}", other, offset))),
        },
        other => Err(PickleError::Invalid(format!("BUILD on {:?} at {}", other, offset))),
    }
}
