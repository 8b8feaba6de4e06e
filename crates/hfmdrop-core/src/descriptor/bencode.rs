//! Bencode 编解码
//!
//! 描述文件的线格式:
//! - 整数: `i<十进制>e`
//! - 字节串: `<长度>:<字节>`
//! - 列表: `l<元素>e`
//! - 字典: `d<键><值>e`，键按字节序排列
//!
//! 解码器是严格的：拒绝前导零、`-0`、未排序或重复的键以及尾随数据，
//! 保证同一个描述文件只有一种编码，从而内容 ID 稳定。

use std::collections::BTreeMap;

/// Bencode 错误
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Unexpected byte 0x{byte:02x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },

    #[error("Invalid integer at offset {0}")]
    InvalidInteger(usize),

    #[error("Dictionary keys not sorted or duplicated at offset {0}")]
    UnsortedKeys(usize),

    #[error("Trailing data at offset {0}")]
    TrailingData(usize),

    #[error("Nesting too deep")]
    TooDeep,
}

/// 嵌套深度上限，防止恶意输入耗尽栈
const MAX_DEPTH: usize = 64;

/// Bencode 值
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// 字典取值（非字典返回 None）
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    /// 编码为字节
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => encode_bytes(b, out),
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                // BTreeMap 迭代顺序即字节序
                for (key, value) in entries {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// 解码完整输入，必须恰好包含一个值
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder { input, pos: 0 };
    let value = decoder.value(0)?;
    if decoder.pos != input.len() {
        return Err(BencodeError::TrailingData(decoder.pos));
    }
    Ok(value)
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let i = self.integer(b'e')?;
                Ok(Value::Int(i))
            }
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                let mut last_key: Option<Vec<u8>> = None;
                while self.peek()? != b'e' {
                    let key_offset = self.pos;
                    let key = self.bytes()?;
                    if last_key.as_ref().is_some_and(|last| *last >= key) {
                        return Err(BencodeError::UnsortedKeys(key_offset));
                    }
                    let value = self.value(depth + 1)?;
                    last_key = Some(key.clone());
                    entries.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => Ok(Value::Bytes(self.bytes()?)),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    /// 读取整数直到终止符（终止符被消费）
    fn integer(&mut self, terminator: u8) -> Result<i64, BencodeError> {
        let start = self.pos;
        let rest = &self.input[start..];
        let len = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or(BencodeError::UnexpectedEof)?;
        let digits = &rest[..len];

        let valid = match digits {
            [] | [b'-'] => false,
            [b'-', b'0', ..] => false,
            [b'0', _, ..] => false,
            [b'-', tail @ ..] => tail.iter().all(u8::is_ascii_digit),
            _ => digits.iter().all(u8::is_ascii_digit),
        };
        if !valid {
            return Err(BencodeError::InvalidInteger(start));
        }

        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger(start))?;
        self.pos = start + len + 1;
        Ok(value)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let offset = self.pos;
        if !self.peek()?.is_ascii_digit() {
            return Err(BencodeError::UnexpectedByte {
                byte: self.peek()?,
                offset,
            });
        }
        let len = self.integer(b':')?;
        let len = usize::try_from(len).map_err(|_| BencodeError::InvalidInteger(offset))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }
}
