//! Decoder for BERT (Erlang external term format) management API payloads.
//!
//! Terms are mapped onto the same [`serde_json::Value`] model the JSON
//! decoder produces, so exporters do not care which wire encoding was used.

use serde_json::{Map, Number, Value};
use thiserror::Error;

const VERSION: u8 = 131;

/// Maximum term nesting accepted from the wire.
pub const MAX_DEPTH: usize = 128;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BertError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("unsupported term format version {0}")]
    BadVersion(u8),
    #[error("unsupported term tag {tag} at byte {offset}")]
    UnsupportedTag { tag: u8, offset: usize },
    #[error("invalid float literal")]
    InvalidFloat,
    #[error("{0} trailing bytes after term")]
    TrailingBytes(usize),
    #[error("terms nested deeper than {MAX_DEPTH} levels at byte {0}")]
    TooDeep(usize),
}

/// Intermediate term representation.
#[derive(Debug, Clone, PartialEq)]
enum Term {
    Int(i64),
    Big(f64),
    Float(f64),
    Atom(String),
    Binary(String),
    Tuple(Vec<Term>),
    List(Vec<Term>),
    Map(Vec<(Term, Term)>),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BertError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(BertError::UnexpectedEof(self.pos))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, BertError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BertError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BertError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn text(&mut self, n: usize) -> Result<String, BertError> {
        Ok(String::from_utf8_lossy(self.take(n)?).into_owned())
    }

    fn terms(&mut self, n: usize) -> Result<Vec<Term>, BertError> {
        // Lengths come off the wire; don't trust them for preallocation.
        let mut items = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            items.push(self.term()?);
        }
        Ok(items)
    }

    fn term(&mut self) -> Result<Term, BertError> {
        if self.depth >= MAX_DEPTH {
            return Err(BertError::TooDeep(self.pos));
        }
        self.depth += 1;
        let term = self.term_at_depth();
        self.depth -= 1;
        term
    }

    fn term_at_depth(&mut self) -> Result<Term, BertError> {
        let offset = self.pos;
        let tag = self.u8()?;
        let term = match tag {
            SMALL_INTEGER_EXT => Term::Int(i64::from(self.u8()?)),
            INTEGER_EXT => Term::Int(i64::from(self.u32()? as i32)),
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Term::Float(f64::from_be_bytes(raw))
            }
            FLOAT_EXT => {
                let raw = self.take(31)?;
                let literal = String::from_utf8_lossy(raw);
                let literal = literal.trim_end_matches('\0').trim();
                Term::Float(literal.parse().map_err(|_| BertError::InvalidFloat)?)
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                Term::Atom(self.text(len)?)
            }
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                Term::Atom(self.text(len)?)
            }
            SMALL_TUPLE_EXT => {
                let arity = self.u8()? as usize;
                Term::Tuple(self.terms(arity)?)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                Term::Tuple(self.terms(arity)?)
            }
            NIL_EXT => Term::List(Vec::new()),
            STRING_EXT => {
                let len = self.u16()? as usize;
                Term::Binary(self.text(len)?)
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let mut items = self.terms(len)?;
                // Improper lists keep their tail as a final element.
                match self.term()? {
                    Term::List(tail) if tail.is_empty() => {}
                    tail => items.push(tail),
                }
                Term::List(items)
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Term::Binary(self.text(len)?)
            }
            SMALL_BIG_EXT => {
                let n = self.u8()? as usize;
                self.big(n)?
            }
            LARGE_BIG_EXT => {
                let n = self.u32()? as usize;
                self.big(n)?
            }
            MAP_EXT => {
                let arity = self.u32()? as usize;
                let mut pairs = Vec::with_capacity(arity.min(1024));
                for _ in 0..arity {
                    let key = self.term()?;
                    let value = self.term()?;
                    pairs.push((key, value));
                }
                Term::Map(pairs)
            }
            tag => return Err(BertError::UnsupportedTag { tag, offset }),
        };
        Ok(term)
    }

    /// Little-endian magnitude with a sign byte.
    fn big(&mut self, n: usize) -> Result<Term, BertError> {
        let negative = self.u8()? != 0;
        let digits = self.take(n)?;

        if n <= 8 {
            let mut raw = [0u8; 8];
            raw[..n].copy_from_slice(digits);
            let magnitude = u64::from_le_bytes(raw);
            if !negative && magnitude <= i64::MAX as u64 {
                return Ok(Term::Int(magnitude as i64));
            }
            if negative && magnitude <= i64::MAX as u64 {
                return Ok(Term::Int(-(magnitude as i64)));
            }
        }

        let magnitude = digits
            .iter()
            .rev()
            .fold(0.0f64, |acc, d| acc * 256.0 + f64::from(*d));
        Ok(Term::Big(if negative { -magnitude } else { magnitude }))
    }
}

/// Decode a full BERT payload.
pub fn decode(bytes: &[u8]) -> Result<Value, BertError> {
    let mut reader = Reader {
        buf: bytes,
        pos: 0,
        depth: 0,
    };
    let version = reader.u8()?;
    if version != VERSION {
        return Err(BertError::BadVersion(version));
    }

    let term = reader.term()?;
    let remaining = bytes.len() - reader.pos;
    if remaining > 0 {
        return Err(BertError::TrailingBytes(remaining));
    }

    Ok(to_json(term))
}

fn key_of(term: &Term) -> Option<String> {
    match term {
        Term::Atom(s) | Term::Binary(s) => Some(s.clone()),
        _ => None,
    }
}

/// A non-empty list of `{Key, Value}` pairs with textual keys.
fn is_proplist(items: &[Term]) -> bool {
    !items.is_empty()
        && items.iter().all(|item| match item {
            Term::Tuple(pair) => pair.len() == 2 && key_of(&pair[0]).is_some(),
            _ => false,
        })
}

fn to_object(pairs: impl IntoIterator<Item = (Term, Term)>) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        let key = match key_of(&key) {
            Some(k) => k,
            None => to_json(key).to_string(),
        };
        map.insert(key, to_json(value));
    }
    Value::Object(map)
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn to_json(term: Term) -> Value {
    match term {
        Term::Int(i) => Value::Number(i.into()),
        Term::Big(f) | Term::Float(f) => float(f),
        Term::Atom(atom) => match atom.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "undefined" | "null" | "nil" => Value::Null,
            _ => Value::String(atom),
        },
        Term::Binary(s) => Value::String(s),
        Term::Tuple(items) => bert_tuple(items),
        Term::List(items) if is_proplist(&items) => to_object(items.into_iter().map(|item| {
            match item {
                Term::Tuple(mut pair) => {
                    let value = pair.pop().unwrap_or(Term::List(Vec::new()));
                    let key = pair.pop().unwrap_or(Term::List(Vec::new()));
                    (key, value)
                }
                other => (Term::Atom(String::new()), other),
            }
        })),
        Term::List(items) => Value::Array(items.into_iter().map(to_json).collect()),
        Term::Map(pairs) => to_object(pairs),
    }
}

/// BERT complex types are tagged tuples such as `{bert, nil}`.
fn bert_tuple(items: Vec<Term>) -> Value {
    let kind = match (items.first(), items.get(1)) {
        (Some(Term::Atom(tag)), Some(Term::Atom(kind))) if tag == "bert" => Some(kind.clone()),
        _ => None,
    };

    match kind.as_deref() {
        Some("nil") => Value::Null,
        Some("true") => Value::Bool(true),
        Some("false") => Value::Bool(false),
        Some("dict") => match items.into_iter().nth(2) {
            Some(Term::List(entries)) => to_object(entries.into_iter().filter_map(|e| match e {
                Term::Tuple(mut pair) if pair.len() == 2 => {
                    let value = pair.pop()?;
                    let key = pair.pop()?;
                    Some((key, value))
                }
                _ => None,
            })),
            _ => Value::Object(Map::new()),
        },
        _ => Value::Array(items.into_iter().map(to_json).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bin(s: &str) -> Vec<u8> {
        let mut out = vec![BINARY_EXT];
        out.extend((s.len() as u32).to_be_bytes());
        out.extend(s.as_bytes());
        out
    }

    fn atom(s: &str) -> Vec<u8> {
        let mut out = vec![SMALL_ATOM_UTF8_EXT, s.len() as u8];
        out.extend(s.as_bytes());
        out
    }

    fn small(n: u8) -> Vec<u8> {
        vec![SMALL_INTEGER_EXT, n]
    }

    fn tuple(items: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![SMALL_TUPLE_EXT, items.len() as u8];
        for item in items {
            out.extend(item);
        }
        out
    }

    fn list(items: &[Vec<u8>]) -> Vec<u8> {
        if items.is_empty() {
            return vec![NIL_EXT];
        }
        let mut out = vec![LIST_EXT];
        out.extend((items.len() as u32).to_be_bytes());
        for item in items {
            out.extend(item);
        }
        out.push(NIL_EXT);
        out
    }

    fn payload(term: Vec<u8>) -> Vec<u8> {
        let mut out = vec![VERSION];
        out.extend(term);
        out
    }

    #[test]
    fn test_decode_queue_listing() {
        let queue = list(&[
            tuple(&[bin("name"), bin("orders")]),
            tuple(&[bin("vhost"), bin("/")]),
            tuple(&[atom("durable"), atom("true")]),
            tuple(&[bin("messages"), small(12)]),
            tuple(&[bin("policy"), atom("undefined")]),
        ]);
        let value = decode(&payload(list(&[queue]))).unwrap();

        assert_eq!(
            value,
            json!([{
                "name": "orders",
                "vhost": "/",
                "durable": true,
                "messages": 12,
                "policy": null
            }])
        );
    }

    #[test]
    fn test_decode_numbers() {
        let mut int = vec![INTEGER_EXT];
        int.extend((-5i32).to_be_bytes());
        assert_eq!(decode(&payload(int)).unwrap(), json!(-5));

        let mut float = vec![NEW_FLOAT_EXT];
        float.extend(2.5f64.to_be_bytes());
        assert_eq!(decode(&payload(float)).unwrap(), json!(2.5));

        // 2^40 as a small big
        let big = vec![SMALL_BIG_EXT, 6, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(decode(&payload(big)).unwrap(), json!(1u64 << 40));
    }

    #[test]
    fn test_decode_bert_complex_types() {
        let nil = tuple(&[atom("bert"), atom("nil")]);
        assert_eq!(decode(&payload(nil)).unwrap(), Value::Null);

        let dict = tuple(&[
            atom("bert"),
            atom("dict"),
            list(&[tuple(&[atom("status"), bin("ok")])]),
        ]);
        assert_eq!(decode(&payload(dict)).unwrap(), json!({"status": "ok"}));
    }

    #[test]
    fn test_decode_map() {
        let mut map = vec![MAP_EXT];
        map.extend(1u32.to_be_bytes());
        map.extend(bin("cluster_name"));
        map.extend(bin("rabbit@node1"));
        assert_eq!(
            decode(&payload(map)).unwrap(),
            json!({"cluster_name": "rabbit@node1"})
        );
    }

    #[test]
    fn test_plain_list_stays_array() {
        let value = decode(&payload(list(&[small(1), small(2)]))).unwrap();
        assert_eq!(value, json!([1, 2]));
        assert_eq!(decode(&payload(list(&[]))).unwrap(), json!([]));
    }

    #[test]
    fn test_errors() {
        assert_eq!(decode(&[]), Err(BertError::UnexpectedEof(0)));
        assert_eq!(decode(&[130, NIL_EXT]), Err(BertError::BadVersion(130)));
        assert!(matches!(
            decode(&[VERSION, 1]),
            Err(BertError::UnsupportedTag { tag: 1, .. })
        ));
        assert!(matches!(
            decode(&[VERSION, BINARY_EXT, 0, 0, 0, 9, b'a']),
            Err(BertError::UnexpectedEof(_))
        ));
        assert_eq!(
            decode(&[VERSION, NIL_EXT, NIL_EXT]),
            Err(BertError::TrailingBytes(1))
        );
    }

    fn nested_lists(levels: usize) -> Vec<u8> {
        let mut out = vec![VERSION];
        for _ in 0..levels {
            out.extend([LIST_EXT, 0, 0, 0, 1]);
        }
        out.push(NIL_EXT);
        out.extend(std::iter::repeat_n(NIL_EXT, levels));
        out
    }

    #[test]
    fn test_deep_nesting_rejected() {
        assert!(matches!(
            decode(&nested_lists(20_000)),
            Err(BertError::TooDeep(_))
        ));
    }

    #[test]
    fn test_nesting_within_limit() {
        let value = decode(&nested_lists(MAX_DEPTH - 1)).unwrap();

        let mut depth = 0;
        let mut current = &value;
        while let Value::Array(items) = current {
            depth += 1;
            match items.first() {
                Some(inner) => current = inner,
                None => break,
            }
        }
        assert_eq!(depth, MAX_DEPTH);
    }
}
