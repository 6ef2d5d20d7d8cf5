//! Machine-readable log line codec.
//!
//! The archive log is a line-oriented format shared by the live engine and
//! the recovery loader:
//!
//! ```text
//! [2026-08-01 12:34:56] TAG key1=value1 key2=value2 ...
//! ```
//!
//! The timestamp is UTC, the tag matches `[A-Z0-9_-]+`, keys match
//! `[a-zA-Z0-9_-]+`, and values are Python-style literals: bare words,
//! integers, floats, quoted strings, flat tuples, and one-level dicts.
//! Strings are emitted in repr form (single-quoted unless the content
//! forces double quotes) with non-ASCII characters escaped, so the output
//! is pure ASCII and survives any log pipeline. Unparseable lines are
//! skipped by the reader rather than reported.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;

/// A literal value in a log line parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Flat tuple of scalars.
    Tuple(Vec<Value>),
    /// Dict whose keys and values are scalars or tuples.
    Dict(Vec<(Value, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        // Ids larger than i64::MAX do not occur in practice (the top bits
        // are a millisecond timestamp), but saturate rather than wrap.
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            None => Value::Null,
            Some(x) => x.into(),
        }
    }
}

fn push_str_repr(out: &mut String, s: &str) {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (' '..='\u{7e}').contains(&c) => out.push(c),
            c => {
                let n = c as u32;
                if n <= 0xff {
                    out.push_str(&format!("\\x{n:02x}"));
                } else if n <= 0xffff {
                    out.push_str(&format!("\\u{n:04x}"));
                } else {
                    out.push_str(&format!("\\U{n:08x}"));
                }
            }
        }
    }
    out.push(quote);
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                let s = format!("{x}");
                if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
                    f.write_str(&s)
                } else {
                    write!(f, "{s}.0")
                }
            }
            Value::Str(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                push_str_repr(&mut out, s);
                f.write_str(&out)
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// A parsed machine-readable log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: String,
    pub tag: String,
    pub values: BTreeMap<String, Value>,
}

impl LogLine {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }
}

const BARE_FORBIDDEN: &str = "\"'()[]{},:";

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Scanner { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    /// Skip whitespace, returning whether any was consumed.
    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
        self.pos > start
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if pred(c)) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn parse_quoted(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            let c = self.bump()?;
            if c == quote {
                return Some(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let esc = self.bump()?;
            match esc {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                '0' => out.push('\0'),
                'a' => out.push('\u{7}'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                'v' => out.push('\u{b}'),
                '\\' | '\'' | '"' => out.push(esc),
                'x' => out.push(self.parse_hex_escape(2)?),
                'u' => out.push(self.parse_hex_escape(4)?),
                'U' => out.push(self.parse_hex_escape(8)?),
                other => {
                    // Python keeps unrecognized escapes verbatim.
                    out.push('\\');
                    out.push(other);
                }
            }
        }
    }

    fn parse_hex_escape(&mut self, digits: usize) -> Option<char> {
        let mut n: u32 = 0;
        for _ in 0..digits {
            let c = self.bump()?;
            n = n.checked_mul(16)?.checked_add(c.to_digit(16)?)?;
        }
        char::from_u32(n)
    }

    fn parse_scalar(&mut self) -> Option<Value> {
        match self.peek()? {
            '"' | '\'' => self.parse_quoted().map(Value::Str),
            'u' if matches!(self.rest().chars().nth(1), Some('"' | '\'')) => {
                self.bump();
                self.parse_quoted().map(Value::Str)
            }
            _ => {
                let word = self.take_while(|c| {
                    !c.is_whitespace() && !BARE_FORBIDDEN.contains(c)
                });
                if word.is_empty() {
                    return None;
                }
                Some(classify_word(word))
            }
        }
    }

    fn parse_tuple(&mut self) -> Option<Value> {
        if !self.eat('(') {
            return None;
        }
        let mut items = Vec::new();
        self.skip_ws();
        if self.eat(')') {
            return Some(Value::Tuple(items));
        }
        loop {
            items.push(self.parse_scalar()?);
            self.skip_ws();
            if self.eat(',') {
                self.skip_ws();
                if self.eat(')') {
                    break;
                }
            } else if self.eat(')') {
                break;
            } else {
                return None;
            }
        }
        Some(Value::Tuple(items))
    }

    fn parse_scalar_or_tuple(&mut self) -> Option<Value> {
        if self.peek() == Some('(') {
            self.parse_tuple()
        } else {
            self.parse_scalar()
        }
    }

    fn parse_dict(&mut self) -> Option<Value> {
        if !self.eat('{') {
            return None;
        }
        let mut entries = Vec::new();
        self.skip_ws();
        if self.eat('}') {
            return Some(Value::Dict(entries));
        }
        loop {
            let key = self.parse_scalar_or_tuple()?;
            self.skip_ws();
            if !self.eat(':') {
                return None;
            }
            self.skip_ws();
            let val = self.parse_scalar_or_tuple()?;
            entries.push((key, val));
            self.skip_ws();
            if self.eat(',') {
                self.skip_ws();
                if self.eat('}') {
                    break;
                }
            } else if self.eat('}') {
                break;
            } else {
                return None;
            }
        }
        Some(Value::Dict(entries))
    }

    fn parse_value(&mut self) -> Option<Value> {
        match self.peek()? {
            '(' => self.parse_tuple(),
            '{' => self.parse_dict(),
            _ => self.parse_scalar(),
        }
    }
}

fn is_integer(s: &str) -> bool {
    let body = s.strip_prefix(['+', '-']).unwrap_or(s);
    !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit())
}

fn is_float(s: &str) -> bool {
    let body = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (mantissa, exp) = match body.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (body, None),
    };
    let mantissa_ok = match mantissa.split_once('.') {
        Some((int, frac)) => {
            !int.is_empty()
                && !frac.is_empty()
                && int.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
        None => !mantissa.is_empty() && mantissa.bytes().all(|b| b.is_ascii_digit()),
    };
    let exp_ok = match exp {
        None => true,
        Some(e) => {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            !e.is_empty() && e.bytes().all(|b| b.is_ascii_digit())
        }
    };
    mantissa_ok && exp_ok
}

fn classify_word(word: &str) -> Value {
    match word {
        "None" | "Ellipsis" => Value::Null,
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        _ if is_integer(word) => word
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| word.parse::<f64>().map(Value::Float))
            .unwrap_or_else(|_| Value::Str(word.to_string())),
        _ if is_float(word) => word
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Str(word.to_string())),
        _ => Value::Str(word.to_string()),
    }
}

/// Parse one machine-readable log line.
///
/// Returns `None` for anything that does not match the grammar, including
/// lines with trailing garbage after the last parameter; callers are
/// expected to skip those silently.
pub fn parse_line(line: &str) -> Option<LogLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut sc = Scanner::new(line);
    if !sc.eat('[') {
        return None;
    }
    let ts = sc.take_while(|c| c.is_ascii_digit() || " Z:-".contains(c));
    if ts.is_empty() || !sc.eat(']') {
        return None;
    }
    if !sc.skip_ws() {
        return None;
    }
    let tag = sc.take_while(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || "_-".contains(c));
    if tag.is_empty() {
        return None;
    }
    let timestamp = ts.to_string();
    let tag = tag.to_string();
    let mut values = BTreeMap::new();
    loop {
        let had_ws = sc.skip_ws();
        if sc.at_end() {
            break;
        }
        if !had_ws {
            return None;
        }
        let key = sc.take_while(|c| c.is_ascii_alphanumeric() || "_-".contains(c));
        if key.is_empty() || !sc.eat('=') {
            return None;
        }
        let val = sc.parse_value()?;
        match sc.peek() {
            None => {}
            Some(c) if c.is_whitespace() => {}
            Some(_) => return None,
        }
        values.insert(key.to_string(), val);
    }
    Some(LogLine {
        timestamp,
        tag,
        values,
    })
}

/// Render a parsed line back into its canonical textual form (without the
/// timestamp brackets).
pub fn format_fields(tag: &str, values: &BTreeMap<String, Value>) -> String {
    let mut out = String::from(tag);
    for (k, v) in values {
        out.push(' ');
        out.push_str(k);
        out.push('=');
        out.push_str(&v.to_string());
    }
    out
}

/// Shared handle to the archive log sink.
///
/// Every line is prefixed with a UTC timestamp and flushed immediately; a
/// disabled logger swallows everything. Clones share the sink.
#[derive(Clone)]
pub struct Logger {
    sink: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl Logger {
    pub fn stdout() -> Self {
        Logger {
            sink: Some(Arc::new(Mutex::new(Box::new(std::io::stdout())))),
        }
    }

    pub fn to_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Logger {
            sink: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn disabled() -> Self {
        Logger { sink: None }
    }

    /// Write one log line. `msg` should already be in `TAG key=value ...`
    /// form; the timestamp prefix is added here.
    pub fn log(&self, msg: &str) {
        let Some(sink) = &self.sink else { return };
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let mut out = sink.lock().expect("log sink poisoned");
        let _ = writeln!(out, "[{stamp}] {msg}");
        let _ = out.flush();
    }

    /// Log an error in the machine-readable exception form.
    pub fn log_exception(&self, tag: &str, err: &dyn std::error::Error) {
        let mut msg = format!("{tag} reason={}", Value::Str(err.to_string()));
        if let Some(cause) = err.source() {
            msg.push_str(&format!(" cause={}", Value::Str(cause.to_string())));
        }
        self.log(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(line: &str) -> LogLine {
        parse_line(line).unwrap_or_else(|| panic!("line should parse: {line}"))
    }

    #[test]
    fn test_parse_basic_line() {
        let line = parse_ok("[2026-08-01 10:00:00] POST id='00000000000004A2' count=3");
        assert_eq!(line.tag, "POST");
        assert_eq!(line.timestamp, "2026-08-01 10:00:00");
        assert_eq!(line.get_str("id"), Some("00000000000004A2"));
        assert_eq!(line.get("count"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_parse_constants_and_numbers() {
        let line = parse_ok("[2026-08-01 10:00:00] T a=None b=True c=False d=-17 e=2.5 f=1e3");
        assert_eq!(line.get("a"), Some(&Value::Null));
        assert_eq!(line.get("b"), Some(&Value::Bool(true)));
        assert_eq!(line.get("c"), Some(&Value::Bool(false)));
        assert_eq!(line.get("d"), Some(&Value::Int(-17)));
        assert_eq!(line.get("e"), Some(&Value::Float(2.5)));
        assert_eq!(line.get("f"), Some(&Value::Float(1000.0)));
    }

    #[test]
    fn test_parse_bare_word() {
        let line = parse_ok("[2026-08-01 10:00:00] SCRIBE version=v1.5.5");
        assert_eq!(line.get_str("version"), Some("v1.5.5"));
    }

    #[test]
    fn test_parse_quoted_escapes() {
        let line = parse_ok(r#"[2026-08-01 10:00:00] T a='it\'s' b=u'x\n\t' c="q" d='\xe9€'"#);
        assert_eq!(line.get_str("a"), Some("it's"));
        assert_eq!(line.get_str("b"), Some("x\n\t"));
        assert_eq!(line.get_str("c"), Some("q"));
        assert_eq!(line.get_str("d"), Some("\u{e9}\u{20ac}"));
    }

    #[test]
    fn test_parse_tuple_and_dict() {
        let line = parse_ok("[2026-08-01 10:00:00] T t=(1,'a',) d={'k':(1,2),'n':None}");
        assert_eq!(
            line.get("t"),
            Some(&Value::Tuple(vec![Value::Int(1), Value::Str("a".into())]))
        );
        assert_eq!(
            line.get("d"),
            Some(&Value::Dict(vec![
                (
                    Value::Str("k".into()),
                    Value::Tuple(vec![Value::Int(1), Value::Int(2)])
                ),
                (Value::Str("n".into()), Value::Null),
            ]))
        );
    }

    #[test]
    fn test_reject_malformed_lines() {
        assert!(parse_line("no brackets here").is_none());
        assert!(parse_line("[2026-08-01] lowercase k=1").is_none());
        assert!(parse_line("[2026-08-01 10:00:00] TAG k=1 trailing=").is_none());
        assert!(parse_line("[2026-08-01 10:00:00] TAG k='unterminated").is_none());
        assert!(parse_line("[2026-08-01 10:00:00] TAG k=1garbage()").is_none());
    }

    #[test]
    fn test_format_round_trip() {
        let lines = [
            "POST id='00000000000004A2' nick='bob' parent=None text='hi there'",
            "LOGSEND log-count=0 to='0000000000000001'",
            "T d={'a':1,'b':(2,3)} t=(1,2) x=-4",
        ];
        for body in lines {
            let parsed = parse_ok(&format!("[2026-08-01 10:00:00] {body}"));
            assert_eq!(format_fields(&parsed.tag, &parsed.values), body);
        }
    }

    #[test]
    fn test_string_repr_escaping() {
        assert_eq!(Value::Str("it's".into()).to_string(), "\"it's\"");
        assert_eq!(Value::Str("a\nb".into()).to_string(), "'a\\nb'");
        assert_eq!(Value::Str("caf\u{e9}".into()).to_string(), "'caf\\xe9'");
        assert_eq!(Value::Str("\u{20ac}".into()).to_string(), "'\\u20ac'");
        assert_eq!(Value::Str("\u{1f600}".into()).to_string(), "'\\U0001f600'");
        // Escaped output parses back to the original.
        let line = format!("[2026-08-01 10:00:00] T s={}", Value::Str("caf\u{e9}'\"".into()));
        assert_eq!(parse_ok(&line).get_str("s"), Some("caf\u{e9}'\""));
    }

    #[test]
    fn test_float_repr_keeps_point() {
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
    }

    #[test]
    fn test_logger_writes_and_prefixes() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct Buf(Arc<Mutex<Vec<u8>>>);
        impl Write for Buf {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buf = Buf(Arc::new(Mutex::new(Vec::new())));
        let logger = Logger::to_writer(buf.clone());
        logger.log("OPENED");
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let parsed = parse_line(text.trim_end()).expect("logger output should parse");
        assert_eq!(parsed.tag, "OPENED");
    }
}
