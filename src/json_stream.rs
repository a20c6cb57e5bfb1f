//! Streaming byte-oriented JSON decoder (component A).
//!
//! Ported from the byte-state-machine design in `json_stream.py`: each state
//! is a function of the next byte, with no backtracking and fixed per-value
//! memory beyond the value under construction. Unlike the Python original
//! (generator-based, driven by a caller pulling characters), this decoder
//! owns a `Read` and exposes an iterator of complete top-level values, which
//! is the shape the standalone executor (component B's re-exec target)
//! actually needs: read one request object off stdin.

use std::io::Read;

use serde_json::{Map, Number, Value};

use crate::error::DecodeError;

/// Reads whitespace-separated JSON values off a byte stream, emitting each
/// completed value exactly once and leaving trailing bytes unconsumed.
pub struct JsonStream<R> {
    inner: R,
    offset: u64,
    peeked: Option<u8>,
}

impl<R: Read> JsonStream<R> {
    pub fn new(inner: R) -> Self {
        JsonStream {
            inner,
            offset: 0,
            peeked: None,
        }
    }

    /// Decode and return the next top-level value, or `Ok(None)` on clean
    /// EOF between values.
    pub fn next_value(&mut self) -> Result<Option<Value>, DecodeError> {
        self.skip_whitespace()?;
        match self.peek()? {
            None => Ok(None),
            Some(_) => self.parse_value().map(Some),
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, DecodeError> {
        if let Some(b) = self.peeked.take() {
            self.offset += 1;
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        match self.inner.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => {
                self.offset += 1;
                Ok(Some(buf[0]))
            }
            Err(e) => Err(DecodeError::Io(e)),
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, DecodeError> {
        if self.peeked.is_none() {
            let mut buf = [0u8; 1];
            self.peeked = match self.inner.read(&mut buf) {
                Ok(0) => None,
                Ok(_) => Some(buf[0]),
                Err(e) => return Err(DecodeError::Io(e)),
            };
        }
        Ok(self.peeked)
    }

    fn skip_whitespace(&mut self) -> Result<(), DecodeError> {
        while let Some(b) = self.peek()? {
            if matches!(b, 0x09 | 0x0a | 0x0d | 0x20) {
                self.read_byte()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value, DecodeError> {
        match self.peek()?.ok_or(DecodeError::UnexpectedEof { offset: self.offset })? {
            b'{' => self.parse_object(),
            b'[' => self.parse_array(),
            b'"' => self.parse_string().map(Value::String),
            b't' => self.parse_literal(b"true", Value::Bool(true)),
            b'f' => self.parse_literal(b"false", Value::Bool(false)),
            b'n' => self.parse_literal(b"null", Value::Null),
            b'-' | b'0'..=b'9' => self.parse_number(),
            b => Err(DecodeError::UnexpectedByte {
                byte: b,
                offset: self.offset,
                expected: "value start",
            }),
        }
    }

    fn parse_literal(&mut self, expected: &'static [u8], value: Value) -> Result<Value, DecodeError> {
        for &want in expected {
            match self.read_byte()? {
                Some(got) if got == want => {}
                Some(got) => {
                    return Err(DecodeError::UnexpectedByte {
                        byte: got,
                        offset: self.offset,
                        expected: "literal",
                    })
                }
                None => return Err(DecodeError::UnexpectedEof { offset: self.offset }),
            }
        }
        Ok(value)
    }

    fn parse_object(&mut self) -> Result<Value, DecodeError> {
        self.read_byte()?; // consume '{'
        let mut map = Map::new();
        self.skip_whitespace()?;
        if self.peek()? == Some(b'}') {
            self.read_byte()?;
            return Ok(Value::Object(map));
        }
        loop {
            self.skip_whitespace()?;
            let key = self.parse_string()?;
            self.skip_whitespace()?;
            self.consume_exact(b':')?;
            self.skip_whitespace()?;
            let value = self.parse_value()?;
            map.insert(key, value);
            self.skip_whitespace()?;
            match self.read_byte()? {
                Some(b',') => continue,
                Some(b'}') => break,
                Some(b) => {
                    return Err(DecodeError::UnexpectedByte {
                        byte: b,
                        offset: self.offset,
                        expected: "',' or '}'",
                    })
                }
                None => return Err(DecodeError::UnexpectedEof { offset: self.offset }),
            }
        }
        Ok(Value::Object(map))
    }

    fn parse_array(&mut self) -> Result<Value, DecodeError> {
        self.read_byte()?; // consume '['
        let mut items = Vec::new();
        self.skip_whitespace()?;
        if self.peek()? == Some(b']') {
            self.read_byte()?;
            return Ok(Value::Array(items));
        }
        loop {
            self.skip_whitespace()?;
            items.push(self.parse_value()?);
            self.skip_whitespace()?;
            match self.read_byte()? {
                Some(b',') => continue,
                Some(b']') => break,
                Some(b) => {
                    return Err(DecodeError::UnexpectedByte {
                        byte: b,
                        offset: self.offset,
                        expected: "',' or ']'",
                    })
                }
                None => return Err(DecodeError::UnexpectedEof { offset: self.offset }),
            }
        }
        Ok(Value::Array(items))
    }

    fn consume_exact(&mut self, want: u8) -> Result<(), DecodeError> {
        match self.read_byte()? {
            Some(b) if b == want => Ok(()),
            Some(b) => Err(DecodeError::UnexpectedByte {
                byte: b,
                offset: self.offset,
                expected: "specific delimiter",
            }),
            None => Err(DecodeError::UnexpectedEof { offset: self.offset }),
        }
    }

    fn parse_string(&mut self) -> Result<String, DecodeError> {
        self.consume_exact(b'"')?;
        let mut bytes = Vec::new();
        loop {
            let b = self.read_byte()?.ok_or(DecodeError::UnexpectedEof { offset: self.offset })?;
            match b {
                b'"' => break,
                b'\\' => self.parse_escape(&mut bytes)?,
                0x00..=0x1f => {
                    return Err(DecodeError::UnexpectedByte {
                        byte: b,
                        offset: self.offset,
                        expected: "unescaped control bytes are not allowed in strings",
                    })
                }
                0x00..=0x7f => bytes.push(b),
                _ => self.parse_utf8_continuation(b, &mut bytes)?,
            }
        }
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset: self.offset })
    }

    fn parse_escape(&mut self, bytes: &mut Vec<u8>) -> Result<(), DecodeError> {
        let b = self.read_byte()?.ok_or(DecodeError::UnexpectedEof { offset: self.offset })?;
        match b {
            b'"' => bytes.push(b'"'),
            b'\\' => bytes.push(b'\\'),
            b'/' => bytes.push(b'/'),
            b'b' => bytes.push(0x08),
            b'f' => bytes.push(0x0c),
            b'n' => bytes.push(b'\n'),
            b'r' => bytes.push(b'\r'),
            b't' => bytes.push(b'\t'),
            b'u' => {
                let cp = self.parse_hex4()?;
                let ch = if (0xd800..=0xdbff).contains(&cp) {
                    self.consume_exact(b'\\')?;
                    self.consume_exact(b'u')?;
                    let low = self.parse_hex4()?;
                    if !(0xdc00..=0xdfff).contains(&low) {
                        return Err(DecodeError::InvalidUnicodeEscape { offset: self.offset });
                    }
                    let combined = 0x10000 + ((cp - 0xd800) << 10) + (low - 0xdc00);
                    char::from_u32(combined)
                } else {
                    char::from_u32(cp)
                }
                .ok_or(DecodeError::InvalidUnicodeEscape { offset: self.offset })?;
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            _ => {
                return Err(DecodeError::UnexpectedByte {
                    byte: b,
                    offset: self.offset,
                    expected: r#"one of \" \\ \/ \b \f \n \r \t \u"#,
                })
            }
        }
        Ok(())
    }

    fn parse_hex4(&mut self) -> Result<u32, DecodeError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let b = self.read_byte()?.ok_or(DecodeError::UnexpectedEof { offset: self.offset })?;
            let digit = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                b'A'..=b'F' => b - b'A' + 10,
                _ => return Err(DecodeError::InvalidUnicodeEscape { offset: self.offset }),
            };
            value = (value << 4) | digit as u32;
        }
        Ok(value)
    }

    /// Decode the remaining bytes of a 2/3/4-byte UTF-8 sequence given the
    /// already-consumed lead byte.
    fn parse_utf8_continuation(&mut self, lead: u8, bytes: &mut Vec<u8>) -> Result<(), DecodeError> {
        let extra = if lead & 0xe0 == 0xc0 {
            1
        } else if lead & 0xf0 == 0xe0 {
            2
        } else if lead & 0xf8 == 0xf0 {
            3
        } else {
            return Err(DecodeError::InvalidUtf8 { offset: self.offset });
        };
        bytes.push(lead);
        for _ in 0..extra {
            let cont = self.read_byte()?.ok_or(DecodeError::UnexpectedEof { offset: self.offset })?;
            if cont & 0xc0 != 0x80 {
                return Err(DecodeError::InvalidUtf8 { offset: self.offset });
            }
            bytes.push(cont);
        }
        Ok(())
    }

    fn parse_number(&mut self) -> Result<Value, DecodeError> {
        let mut text = String::new();
        let mut is_float = false;

        if self.peek()? == Some(b'-') {
            text.push('-');
            self.read_byte()?;
        }
        self.consume_digits(&mut text)?;
        if self.peek()? == Some(b'.') {
            is_float = true;
            text.push('.');
            self.read_byte()?;
            self.consume_digits(&mut text)?;
        }
        if matches!(self.peek()?, Some(b'e') | Some(b'E')) {
            is_float = true;
            text.push('e');
            self.read_byte()?;
            if matches!(self.peek()?, Some(b'+') | Some(b'-')) {
                text.push(self.read_byte()?.unwrap() as char);
            }
            self.consume_digits(&mut text)?;
        }

        if is_float {
            let f: f64 = text.parse().map_err(|_| DecodeError::UnexpectedByte {
                byte: 0,
                offset: self.offset,
                expected: "well-formed float",
            })?;
            Ok(Value::Number(Number::from_f64(f).ok_or(DecodeError::UnexpectedByte {
                byte: 0,
                offset: self.offset,
                expected: "finite float",
            })?))
        } else {
            let i: i64 = text.parse().map_err(|_| DecodeError::UnexpectedByte {
                byte: 0,
                offset: self.offset,
                expected: "well-formed integer",
            })?;
            Ok(Value::Number(Number::from(i)))
        }
    }

    fn consume_digits(&mut self, text: &mut String) -> Result<(), DecodeError> {
        let mut any = false;
        while let Some(b) = self.peek()? {
            if b.is_ascii_digit() {
                text.push(b as char);
                self.read_byte()?;
                any = true;
            } else {
                break;
            }
        }
        if !any {
            return Err(DecodeError::UnexpectedByte {
                byte: self.peek()?.unwrap_or(0),
                offset: self.offset,
                expected: "digit",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<Value> {
        let mut stream = JsonStream::new(input.as_bytes());
        let mut out = Vec::new();
        while let Some(v) = stream.next_value().unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn decodes_scalars() {
        let mut stream = JsonStream::new(b"null".as_slice());
        assert_eq!(stream.next_value().unwrap(), Some(Value::Null));
        let mut stream = JsonStream::new(b"true".as_slice());
        assert_eq!(stream.next_value().unwrap(), Some(Value::Bool(true)));
        let mut stream = JsonStream::new(b"-12.5e1".as_slice());
        assert_eq!(stream.next_value().unwrap().unwrap().as_f64(), Some(-125.0));
    }

    #[test]
    fn decodes_string_with_escapes_and_utf8() {
        let mut stream = JsonStream::new("\"a\\n\\u00e9\\u00e9\"".as_bytes());
        let v = stream.next_value().unwrap().unwrap();
        assert_eq!(v.as_str(), Some("a\n\u{e9}\u{e9}"));
    }

    #[test]
    fn decodes_surrogate_pair() {
        let mut stream = JsonStream::new("\"\\ud83d\\ude00\"".as_bytes());
        let v = stream.next_value().unwrap().unwrap();
        assert_eq!(v.as_str(), Some("\u{1f600}"));
    }

    #[test]
    fn rejects_unescaped_control_byte() {
        let mut stream = JsonStream::new(b"\"a\nb\"".as_slice());
        assert!(stream.next_value().is_err());
    }

    #[test]
    fn scenario_6_newline_delimited_objects_with_trailing_garbage() {
        let mut stream = JsonStream::new(b"{\"item\":1}\n{\"item\":2}#".as_slice());
        let first = stream.next_value().unwrap().unwrap();
        let second = stream.next_value().unwrap().unwrap();
        assert_eq!(first["item"], 1);
        assert_eq!(second["item"], 2);
        assert!(stream.next_value().is_err());
    }

    #[test]
    fn decode_encode_round_trip() {
        for sample in [
            serde_json::json!({"a": [1,2,3], "b": null, "c": "x\ny"}),
            serde_json::json!([true, false, 1.5, -2]),
            serde_json::json!("plain string"),
            serde_json::json!(0),
        ] {
            let encoded = serde_json::to_string(&sample).unwrap();
            let decoded = decode_all(&encoded);
            assert_eq!(decoded, vec![sample]);
        }
    }

    #[test]
    fn eof_inside_value_is_an_error() {
        let mut stream = JsonStream::new(b"{\"a\":".as_slice());
        assert!(stream.next_value().is_err());
    }

    #[test]
    fn clean_eof_between_values() {
        let mut stream = JsonStream::new(b"   ".as_slice());
        assert_eq!(stream.next_value().unwrap(), None);
    }
}
