//! Printed s-expression values and incremental framing.
//!
//! Every wire message is one printed compound value. The reader
//! consumes exactly one complete form per call and leaves anything
//! truncated in its buffer until more bytes arrive, so a short read
//! never corrupts the stream; only a malformed form is an error.

use std::fmt;

use crate::error::Error;

/// A printable value.
///
/// `nil` is the empty list, both when read and when printed. A dotted
/// form whose tail is itself a list is normalized into a plain list on
/// read, so `Dotted` tails are always atoms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sexp {
    Int(i64),
    Str(String),
    Sym(String),
    List(Vec<Sexp>),
    Dotted(Vec<Sexp>, Box<Sexp>),
}

impl Sexp {
    /// The empty list.
    pub fn nil() -> Sexp {
        return Sexp::List(Vec::new());
    }

    /// Encode a boolean as `t` or `nil`.
    pub fn from_bool(value: bool) -> Sexp {
        if value {
            return Sexp::Sym("t".to_string());
        }
        return Sexp::nil();
    }

    pub fn is_nil(&self) -> bool {
        return matches!(self, Sexp::List(items) if items.is_empty());
    }

    /// Everything except `nil` is true.
    pub fn truthy(&self) -> bool {
        return !self.is_nil();
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Sexp::Int(value) => return Some(*value),
            _ => return None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Sexp::Str(value) => return Some(value),
            _ => return None,
        }
    }

    pub fn as_sym(&self) -> Option<&str> {
        match self {
            Sexp::Sym(value) => return Some(value),
            _ => return None,
        }
    }

    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => return Some(items),
            _ => return None,
        }
    }
}

fn write_string(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    write!(f, "\"")?;
    for c in value.chars() {
        match c {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            _ => write!(f, "{}", c)?,
        }
    }
    return write!(f, "\"");
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Int(value) => return write!(f, "{}", value),
            Sexp::Str(value) => return write_string(f, value),
            Sexp::Sym(name) => return write!(f, "{}", name),
            Sexp::List(items) => {
                if items.is_empty() {
                    return write!(f, "nil");
                }
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                return write!(f, ")");
            }
            Sexp::Dotted(items, tail) => {
                write!(f, "(")?;
                for item in items {
                    write!(f, "{} ", item)?;
                }
                return write!(f, ". {})", tail);
            }
        }
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Why a parse attempt did not produce a value.
enum ParseFail {
    /// The input ends inside a form; feed more bytes and retry.
    Incomplete,
    /// The input cannot be a printed form.
    Invalid(String),
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Parser<'a> {
        return Parser { input, pos: 0 };
    }

    fn rest(&self) -> &'a str {
        return &self.input[self.pos..];
    }

    fn peek(&self) -> Option<char> {
        return self.rest().chars().next();
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        return Some(c);
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.bump();
        }
    }

    fn is_delimiter(c: char) -> bool {
        return c.is_whitespace() || c == '(' || c == ')' || c == '"';
    }

    /// Parse one value starting at the cursor.
    fn value(&mut self) -> Result<Sexp, ParseFail> {
        self.skip_whitespace();
        match self.peek() {
            None => return Err(ParseFail::Incomplete),
            Some('(') => return self.list(),
            Some('"') => return self.string(),
            Some(')') => return Err(ParseFail::Invalid("unexpected )".to_string())),
            Some(_) => return self.atom(),
        }
    }

    fn list(&mut self) -> Result<Sexp, ParseFail> {
        self.bump(); // (
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(ParseFail::Incomplete),
                Some(')') => {
                    self.bump();
                    return Ok(Sexp::List(items));
                }
                Some('.') if self.dot_is_separator() => {
                    if items.is_empty() {
                        return Err(ParseFail::Invalid("dot without head".to_string()));
                    }
                    self.bump();
                    let tail = self.value()?;
                    self.skip_whitespace();
                    match self.peek() {
                        None => return Err(ParseFail::Incomplete),
                        Some(')') => self.bump(),
                        Some(c) => {
                            return Err(ParseFail::Invalid(format!("expected ) after tail, found {}", c)));
                        }
                    };
                    // A list tail splices: (a . (b c)) is (a b c).
                    match tail {
                        Sexp::List(rest) => {
                            items.extend(rest);
                            return Ok(Sexp::List(items));
                        }
                        Sexp::Dotted(rest, end) => {
                            items.extend(rest);
                            return Ok(Sexp::Dotted(items, end));
                        }
                        atom => return Ok(Sexp::Dotted(items, Box::new(atom))),
                    }
                }
                Some(_) => items.push(self.value()?),
            }
        }
    }

    /// A `.` only separates a tail when followed by a delimiter;
    /// otherwise it begins an ordinary atom.
    fn dot_is_separator(&self) -> bool {
        let mut chars = self.rest().chars();
        chars.next(); // the dot
        match chars.next() {
            None => return true, // incomplete either way
            Some(c) => return Parser::is_delimiter(c),
        }
    }

    fn string(&mut self) -> Result<Sexp, ParseFail> {
        self.bump(); // "
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseFail::Incomplete),
                Some('"') => return Ok(Sexp::Str(out)),
                Some('\\') => match self.bump() {
                    None => return Err(ParseFail::Incomplete),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn atom(&mut self) -> Result<Sexp, ParseFail> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if Parser::is_delimiter(c) {
                break;
            }
            self.bump();
        }
        let token = &self.input[start..self.pos];
        // A token at the very end of the buffer may be a truncated
        // longer token; wait for a delimiter.
        if self.pos == self.input.len() {
            return Err(ParseFail::Incomplete);
        }
        if let Ok(value) = token.parse::<i64>() {
            return Ok(Sexp::Int(value));
        }
        if token == "nil" {
            return Ok(Sexp::nil());
        }
        return Ok(Sexp::Sym(token.to_string()));
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Incremental frame reader over a byte stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        return FrameReader { buf: Vec::new() };
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete form off the buffer.
    ///
    /// `Ok(None)` means the buffer holds no complete form yet; the
    /// buffered bytes are untouched. An error means the stream cannot
    /// be a sequence of printed forms.
    pub fn next_form(&mut self) -> Result<Option<Sexp>, Error> {
        // A partially received multibyte character stays buffered.
        let text = match std::str::from_utf8(&self.buf) {
            Ok(text) => text,
            Err(e) if e.error_len().is_none() => {
                std::str::from_utf8(&self.buf[..e.valid_up_to()]).unwrap_or("")
            }
            Err(_) => return Err(Error::Protocol("frame is not utf-8".to_string())),
        };
        let mut parser = Parser::new(text);
        match parser.value() {
            Ok(form) => {
                let used = parser.pos;
                self.buf.drain(..used);
                return Ok(Some(form));
            }
            Err(ParseFail::Incomplete) => return Ok(None),
            Err(ParseFail::Invalid(why)) => return Err(Error::Protocol(why)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Sexp {
        let mut reader = FrameReader::new();
        reader.feed(input.as_bytes());
        return reader.next_form().unwrap().unwrap();
    }

    #[test]
    fn atoms() {
        assert_eq!(parse("42 "), Sexp::Int(42));
        assert_eq!(parse("-7 "), Sexp::Int(-7));
        assert_eq!(parse("hello "), Sexp::Sym("hello".to_string()));
        assert_eq!(parse("nil "), Sexp::nil());
        assert_eq!(parse("\"hi\""), Sexp::Str("hi".to_string()));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(parse(r#""a\"b\\c""#), Sexp::Str("a\"b\\c".to_string()));
        assert_eq!(parse("\"a\\nb\""), Sexp::Str("a\nb".to_string()));
    }

    #[test]
    fn lists() {
        assert_eq!(
            parse("(insert \"buf\" 3)"),
            Sexp::List(vec![
                Sexp::Sym("insert".to_string()),
                Sexp::Str("buf".to_string()),
                Sexp::Int(3),
            ])
        );
        assert_eq!(parse("()"), Sexp::nil());
        assert_eq!(parse("(a (b c))").to_string(), "(a (b c))");
    }

    #[test]
    fn dotted_pairs() {
        assert_eq!(
            parse("(5 . \"abc\")"),
            Sexp::Dotted(vec![Sexp::Int(5)], Box::new(Sexp::Str("abc".to_string())))
        );
        // A nil tail is just a proper list.
        assert_eq!(
            parse("(1 2 . nil)"),
            Sexp::List(vec![Sexp::Int(1), Sexp::Int(2)])
        );
        // A list tail splices.
        assert_eq!(
            parse("(1 . (2 3))"),
            Sexp::List(vec![Sexp::Int(1), Sexp::Int(2), Sexp::Int(3)])
        );
    }

    #[test]
    fn print_round_trip() {
        let forms = [
            "(hello \"alice\")",
            "(1 2 . t)",
            "(a nil \"x \\\"y\\\"\" (3 . b))",
            "-12",
        ];
        for text in forms {
            let form = parse(text);
            let printed = form.to_string();
            assert_eq!(parse(&printed), form, "survives printing: {}", text);
        }
    }

    #[test]
    fn incremental_byte_feed() {
        let input = "(cursor \"buf\" 1 0 \"AAAA\" 0 nil)";
        let mut reader = FrameReader::new();
        for byte in input.as_bytes() {
            assert_eq!(reader.next_form().unwrap(), None);
            reader.feed(&[*byte]);
        }
        let form = reader.next_form().unwrap().unwrap();
        assert_eq!(form.to_string(), input);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let mut reader = FrameReader::new();
        reader.feed(b"(a 1)(b 2) ");
        assert_eq!(reader.next_form().unwrap().unwrap().to_string(), "(a 1)");
        assert_eq!(reader.next_form().unwrap().unwrap().to_string(), "(b 2)");
        assert_eq!(reader.next_form().unwrap(), None);
    }

    #[test]
    fn split_multibyte_character() {
        let text = "(\"é\")";
        let bytes = text.as_bytes();
        let mut reader = FrameReader::new();
        reader.feed(&bytes[..3]); // cuts the é in half
        assert_eq!(reader.next_form().unwrap(), None);
        reader.feed(&bytes[3..]);
        assert_eq!(
            reader.next_form().unwrap().unwrap(),
            Sexp::List(vec![Sexp::Str("é".to_string())])
        );
    }

    #[test]
    fn invalid_forms_error() {
        let mut reader = FrameReader::new();
        reader.feed(b")");
        assert!(reader.next_form().is_err());

        let mut reader = FrameReader::new();
        reader.feed(b"(. 1)");
        assert!(reader.next_form().is_err());

        let mut reader = FrameReader::new();
        reader.feed(b"(1 . 2 3)");
        assert!(reader.next_form().is_err());
    }

    #[test]
    fn whitespace_only_is_not_a_frame() {
        let mut reader = FrameReader::new();
        reader.feed(b"   \n\t ");
        assert_eq!(reader.next_form().unwrap(), None);
    }
}
