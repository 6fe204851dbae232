//! Reference value model implementing the serialization contract.
//!
//! Values use a tagged, line-framed text encoding. Every value starts with a
//! header line whose first character names its kind:
//!
//! ```text
//! I 42            integer
//! R 0.5           real (shortest round-trip form, inf/-inf/NaN allowed)
//! B 1             boolean
//! S 5             string: byte length, then the bytes, then a newline
//! hello
//! X 3             external object handle, framed like a string
//! obj
//! A 2 2 3         array: dimension count, dimensions, then elements
//! C 2             record: field count, then fields
//! ```

use crate::config::EvalOptions;
use crate::contract::{CallSite, ResponseReader, Value, ValueType, Variable, serialize_to_string};
use crate::error::{EvalError, Result};
use crate::worker::ProcessCommunicator;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

/// Largest string or handle accepted from an evaluator (bytes).
const MAX_STRING_LEN: usize = 256 * 1024 * 1024;

/// Largest array accepted from an evaluator (elements).
const MAX_ARRAY_ELEMENTS: usize = 64 * 1024 * 1024;

/// Deepest nesting of arrays and records accepted from an evaluator.
const MAX_DEPTH: usize = 64;

/// An evaluated value.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Integer(i64),
    Real(f64),
    Boolean(bool),
    String(String),
    /// Handle identifying external object state held by an evaluator.
    ExternalObject(String),
    /// Row-major array; `elements.len()` equals the product of `dims`.
    Array {
        dims: Vec<usize>,
        elements: Vec<EvalValue>,
    },
    Record(Vec<EvalValue>),
}

/// Static type of an [`EvalValue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalType {
    Integer,
    Real,
    Boolean,
    String,
    ExternalObject,
    /// Array of any shape with the given element type.
    Array(Box<EvalType>),
    Record(Vec<EvalType>),
}

impl EvalValue {
    /// One-dimensional array.
    pub fn vector(elements: Vec<EvalValue>) -> Self {
        Self::Array {
            dims: vec![elements.len()],
            elements,
        }
    }

    /// Array with explicit dimensions. Returns `None` if the element count
    /// does not match the shape.
    pub fn array(dims: Vec<usize>, elements: Vec<EvalValue>) -> Option<Self> {
        let expected = element_count(&dims)?;
        (expected == elements.len()).then_some(Self::Array { dims, elements })
    }

    /// The type this value has. Arrays take the type of their first element.
    pub fn value_type(&self) -> EvalType {
        match self {
            Self::Integer(_) => EvalType::Integer,
            Self::Real(_) => EvalType::Real,
            Self::Boolean(_) => EvalType::Boolean,
            Self::String(_) => EvalType::String,
            Self::ExternalObject(_) => EvalType::ExternalObject,
            Self::Array { elements, .. } => EvalType::Array(Box::new(
                elements
                    .first()
                    .map(Self::value_type)
                    .unwrap_or(EvalType::Real),
            )),
            Self::Record(fields) => EvalType::Record(fields.iter().map(Self::value_type).collect()),
        }
    }

    /// Numeric view used by arithmetic on the evaluator side.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            Self::Boolean(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    /// Parse a `TYPE:VALUE` literal such as `real:1.5`, `int:3`,
    /// `string:abc` or `real[]:1,2,3`.
    pub fn parse_typed(text: &str) -> std::result::Result<Self, String> {
        let (ty, literal) = text
            .split_once(':')
            .ok_or_else(|| format!("expected TYPE:VALUE, got '{}'", text))?;
        let ty: EvalType = ty.parse()?;
        ty.parse_literal(literal)
    }

    fn tag(&self) -> char {
        match self {
            Self::Integer(_) => 'I',
            Self::Real(_) => 'R',
            Self::Boolean(_) => 'B',
            Self::String(_) => 'S',
            Self::ExternalObject(_) => 'X',
            Self::Array { .. } => 'A',
            Self::Record(_) => 'C',
        }
    }
}

impl Value for EvalValue {
    fn marked_external_object(&self) -> Option<&str> {
        match self {
            Self::ExternalObject(handle) => Some(handle),
            _ => None,
        }
    }

    fn serialize(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Integer(i) => writeln!(out, "I {}", i),
            Self::Real(r) => writeln!(out, "R {:?}", r),
            Self::Boolean(b) => writeln!(out, "B {}", u8::from(*b)),
            Self::String(s) | Self::ExternalObject(s) => {
                writeln!(out, "{} {}", self.tag(), s.len())?;
                out.write_all(s.as_bytes())?;
                out.write_all(b"\n")
            }
            Self::Array { dims, elements } => {
                if element_count(dims) != Some(elements.len()) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "array shape {:?} does not match {} elements",
                            dims,
                            elements.len()
                        ),
                    ));
                }
                write!(out, "A {}", dims.len())?;
                for d in dims {
                    write!(out, " {}", d)?;
                }
                writeln!(out)?;
                for element in elements {
                    element.serialize(&mut *out)?;
                }
                Ok(())
            }
            Self::Record(fields) => {
                writeln!(out, "C {}", fields.len())?;
                for field in fields {
                    field.serialize(&mut *out)?;
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Display for EvalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::String(s) => write!(f, "{:?}", s),
            Self::ExternalObject(h) => write!(f, "<object {}>", h),
            Self::Array { elements, .. } => write_list(f, "[", elements, "]"),
            Self::Record(fields) => write_list(f, "(", fields, ")"),
        }
    }
}

fn write_list(
    f: &mut std::fmt::Formatter<'_>,
    open: &str,
    items: &[EvalValue],
    close: &str,
) -> std::fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

impl EvalType {
    fn tag(&self) -> char {
        match self {
            Self::Integer => 'I',
            Self::Real => 'R',
            Self::Boolean => 'B',
            Self::String => 'S',
            Self::ExternalObject => 'X',
            Self::Array(_) => 'A',
            Self::Record(_) => 'C',
        }
    }

    /// Value a variable of this type has before it is evaluated.
    pub fn default_value(&self) -> EvalValue {
        match self {
            Self::Integer => EvalValue::Integer(0),
            Self::Real => EvalValue::Real(0.0),
            Self::Boolean => EvalValue::Boolean(false),
            Self::String => EvalValue::String(String::new()),
            Self::ExternalObject => EvalValue::ExternalObject(String::new()),
            Self::Array(_) => EvalValue::vector(Vec::new()),
            Self::Record(fields) => {
                EvalValue::Record(fields.iter().map(Self::default_value).collect())
            }
        }
    }

    fn parse_literal(&self, literal: &str) -> std::result::Result<EvalValue, String> {
        let bad = |e: String| format!("invalid {} literal '{}': {}", self, literal, e);
        match self {
            Self::Integer => literal.trim().parse().map(EvalValue::Integer).map_err(|e| bad(e.to_string())),
            Self::Real => literal.trim().parse().map(EvalValue::Real).map_err(|e| bad(e.to_string())),
            Self::Boolean => match literal.trim() {
                "true" | "1" => Ok(EvalValue::Boolean(true)),
                "false" | "0" => Ok(EvalValue::Boolean(false)),
                _ => Err(bad("expected true or false".into())),
            },
            Self::String => Ok(EvalValue::String(literal.to_string())),
            Self::ExternalObject => Ok(EvalValue::ExternalObject(literal.to_string())),
            Self::Array(elem) => {
                let elements = if literal.trim().is_empty() {
                    Vec::new()
                } else {
                    literal
                        .split(',')
                        .map(|item| elem.parse_literal(item))
                        .collect::<std::result::Result<_, _>>()?
                };
                Ok(EvalValue::vector(elements))
            }
            Self::Record(_) => Err(bad("records cannot be given on the command line".into())),
        }
    }
}

impl std::fmt::Display for EvalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => f.write_str("int"),
            Self::Real => f.write_str("real"),
            Self::Boolean => f.write_str("bool"),
            Self::String => f.write_str("string"),
            Self::ExternalObject => f.write_str("object"),
            Self::Array(elem) => write!(f, "{}[]", elem),
            Self::Record(fields) => {
                f.write_str("record(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl FromStr for EvalType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(elem) = s.strip_suffix("[]") {
            return Ok(Self::Array(Box::new(elem.parse()?)));
        }
        match s.to_lowercase().as_str() {
            "int" | "integer" => Ok(Self::Integer),
            "real" | "float" => Ok(Self::Real),
            "bool" | "boolean" => Ok(Self::Boolean),
            "string" | "str" => Ok(Self::String),
            "object" | "external" => Ok(Self::ExternalObject),
            _ => Err(format!(
                "Unknown type: '{}'. Valid options: int, real, bool, string, object, <type>[]",
                s
            )),
        }
    }
}

impl ValueType for EvalType {
    type Value = EvalValue;

    fn deserialize(&self, com: &mut ProcessCommunicator) -> Result<EvalValue> {
        read_value(com, Some(self))
    }
}

/// Read one value. With `expected`, the value must match that type.
pub fn read_value<R: ResponseReader + ?Sized>(
    reader: &mut R,
    expected: Option<&EvalType>,
) -> Result<EvalValue> {
    let header = reader.next_line()?;
    decode_value(&header, reader, expected, 0)
}

/// Decode one value whose header line has already been read.
pub fn read_value_after<R: ResponseReader + ?Sized>(
    header: &str,
    reader: &mut R,
    expected: Option<&EvalType>,
) -> Result<EvalValue> {
    decode_value(header, reader, expected, 0)
}

fn malformed(msg: impl Into<String>) -> EvalError {
    EvalError::Malformed(msg.into())
}

fn parse_field<T: FromStr>(field: &str, header: &str) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| malformed(format!("cannot parse value header '{}'", header)))
}

fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn decode_value<R: ResponseReader + ?Sized>(
    header: &str,
    reader: &mut R,
    expected: Option<&EvalType>,
    depth: usize,
) -> Result<EvalValue> {
    if depth > MAX_DEPTH {
        return Err(malformed("value nesting too deep"));
    }

    let (tag, rest) = header.split_once(' ').unwrap_or((header, ""));
    let mut chars = tag.chars();
    let tag = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => return Err(malformed(format!("expected a value, got '{}'", header))),
    };
    if let Some(ty) = expected
        && ty.tag() != tag
    {
        return Err(malformed(format!("expected {} value, got '{}'", ty, header)));
    }

    match tag {
        'I' => Ok(EvalValue::Integer(parse_field(rest, header)?)),
        'R' => Ok(EvalValue::Real(parse_field(rest, header)?)),
        'B' => match rest.trim() {
            "0" => Ok(EvalValue::Boolean(false)),
            "1" => Ok(EvalValue::Boolean(true)),
            _ => Err(malformed(format!("invalid boolean '{}'", header))),
        },
        'S' | 'X' => {
            let len: usize = parse_field(rest, header)?;
            if len > MAX_STRING_LEN {
                return Err(malformed(format!("string length {} too large", len)));
            }
            let bytes = reader.next_bytes(len)?;
            let terminator = reader.next_line()?;
            if !terminator.is_empty() {
                return Err(malformed("string not followed by a newline"));
            }
            let text = String::from_utf8(bytes).map_err(|e| malformed(e.to_string()))?;
            Ok(if tag == 'S' {
                EvalValue::String(text)
            } else {
                EvalValue::ExternalObject(text)
            })
        }
        'A' => {
            let mut fields = rest.split_whitespace();
            let ndims: usize = parse_field(fields.next().unwrap_or(""), header)?;
            let dims = fields
                .map(|d| parse_field::<usize>(d, header))
                .collect::<Result<Vec<_>>>()?;
            if dims.len() != ndims {
                return Err(malformed(format!(
                    "array header '{}' declares {} dimensions",
                    header, ndims
                )));
            }
            let count = element_count(&dims)
                .filter(|&n| n <= MAX_ARRAY_ELEMENTS)
                .ok_or_else(|| malformed(format!("array {:?} too large", dims)))?;
            let elem_type = match expected {
                Some(EvalType::Array(elem)) => Some(elem.as_ref()),
                _ => None,
            };
            let mut elements = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let line = reader.next_line()?;
                elements.push(decode_value(&line, reader, elem_type, depth + 1)?);
            }
            Ok(EvalValue::Array { dims, elements })
        }
        'C' => {
            let count: usize = parse_field(rest, header)?;
            let field_types = match expected {
                Some(EvalType::Record(types)) => {
                    if types.len() != count {
                        return Err(malformed(format!(
                            "expected record with {} fields, got {}",
                            types.len(),
                            count
                        )));
                    }
                    Some(types)
                }
                _ => None,
            };
            if count > MAX_ARRAY_ELEMENTS {
                return Err(malformed(format!("record with {} fields too large", count)));
            }
            let mut fields = Vec::with_capacity(count.min(4096));
            for i in 0..count {
                let line = reader.next_line()?;
                let ty = field_types.map(|types| &types[i]);
                fields.push(decode_value(&line, reader, ty, depth + 1)?);
            }
            Ok(EvalValue::Record(fields))
        }
        other => Err(malformed(format!("unknown value tag '{}'", other))),
    }
}

/// A model variable holding an input value or an evaluation result.
#[derive(Debug)]
pub struct Var {
    name: String,
    ty: EvalType,
    value: Mutex<Option<EvalValue>>,
}

impl Var {
    /// Variable with a known value; its type is taken from the value.
    pub fn input(name: impl Into<String>, value: EvalValue) -> Self {
        Self {
            name: name.into(),
            ty: value.value_type(),
            value: Mutex::new(Some(value)),
        }
    }

    /// Variable of the given type awaiting an evaluation result.
    pub fn output(name: impl Into<String>, ty: EvalType) -> Self {
        Self {
            name: name.into(),
            ty,
            value: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value stored by the last evaluation (or given as input).
    pub fn cached(&self) -> Option<EvalValue> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the stored value.
    pub fn clear(&self) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Variable for Var {
    type Value = EvalValue;
    type Type = EvalType;

    fn ceval(&self) -> EvalValue {
        self.cached().unwrap_or_else(|| self.ty.default_value())
    }

    fn value_type(&self) -> &EvalType {
        &self.ty
    }

    fn cache_value(&self, value: EvalValue) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }
}

/// A call of an external function, built from parts.
#[derive(Debug)]
pub struct ExternalCall {
    name: String,
    options: EvalOptions,
    library_directory: PathBuf,
    library: Vec<String>,
    external_object: Option<Var>,
    external_objects: Vec<Var>,
    args: Vec<Var>,
    args_serialized: Option<String>,
    return_arg_serialized: Option<String>,
    results: Vec<Var>,
}

impl ExternalCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: EvalOptions::default(),
            library_directory: PathBuf::new(),
            library: Vec::new(),
            external_object: None,
            external_objects: Vec::new(),
            args: Vec::new(),
            args_serialized: None,
            return_arg_serialized: None,
            results: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: EvalOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_library(mut self, directory: impl Into<PathBuf>, library: Vec<String>) -> Self {
        self.library_directory = directory.into();
        self.library = library;
        self
    }

    /// External object whose state is sent first on every call.
    pub fn with_external_object(mut self, handle: impl Into<String>) -> Self {
        self.external_object = Some(Var::input(
            "external_object",
            EvalValue::ExternalObject(handle.into()),
        ));
        self
    }

    /// Additional external object argument.
    pub fn with_external_object_arg(mut self, var: Var) -> Self {
        self.external_objects.push(var);
        self
    }

    pub fn with_arg(mut self, var: Var) -> Self {
        self.args.push(var);
        self
    }

    pub fn with_args(mut self, values: impl IntoIterator<Item = EvalValue>) -> Self {
        let start = self.args.len();
        for (i, value) in values.into_iter().enumerate() {
            self.args.push(Var::input(format!("arg{}", start + i), value));
        }
        self
    }

    pub fn with_result(mut self, var: Var) -> Self {
        self.results.push(var);
        self
    }

    pub fn with_results(mut self, types: impl IntoIterator<Item = EvalType>) -> Self {
        let start = self.results.len();
        for (i, ty) in types.into_iter().enumerate() {
            self.results.push(Var::output(format!("out{}", start + i), ty));
        }
        self
    }

    /// Precompute the argument text once so repeated calls reuse it.
    pub fn with_cached_args(mut self) -> Result<Self> {
        let values: Vec<EvalValue> = self.args.iter().map(Var::ceval).collect();
        self.args_serialized = Some(serialize_to_string(values.iter())?);
        Ok(self)
    }

    /// Text sent verbatim after the arguments.
    pub fn with_return_arg_serialized(mut self, text: impl Into<String>) -> Self {
        self.return_arg_serialized = Some(text.into());
        self
    }

    pub fn results(&self) -> &[Var] {
        &self.results
    }

    /// Values stored in the result variables.
    pub fn result_values(&self) -> Vec<Option<EvalValue>> {
        self.results.iter().map(Var::cached).collect()
    }
}

impl CallSite for ExternalCall {
    type Var = Var;

    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &EvalOptions {
        &self.options
    }

    fn library_directory(&self) -> &Path {
        &self.library_directory
    }

    fn library(&self) -> &[String] {
        &self.library
    }

    fn cached_external_object(&self) -> Option<&Var> {
        self.external_object.as_ref()
    }

    fn external_objects_to_serialize(&self) -> &[Var] {
        &self.external_objects
    }

    fn function_args_to_serialize(&self) -> &[Var] {
        &self.args
    }

    fn function_args_serialized(&self) -> Option<&str> {
        self.args_serialized.as_deref()
    }

    fn function_return_arg_serialized(&self) -> Option<&str> {
        self.return_arg_serialized.as_deref()
    }

    fn vars_to_deserialize(&self) -> &[Var] {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory token source over an encoded buffer.
    struct BufferReader {
        data: VecDeque<u8>,
    }

    impl BufferReader {
        fn new(bytes: &[u8]) -> Self {
            Self {
                data: bytes.iter().copied().collect(),
            }
        }
    }

    impl ResponseReader for BufferReader {
        fn next_line(&mut self) -> Result<String> {
            let pos = self
                .data
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| EvalError::Transport("unexpected end of stream".into()))?;
            let line: Vec<u8> = self.data.drain(..=pos).collect();
            Ok(String::from_utf8_lossy(&line[..pos]).into_owned())
        }

        fn next_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
            if self.data.len() < len {
                return Err(EvalError::Transport("unexpected end of stream".into()));
            }
            Ok(self.data.drain(..len).collect())
        }
    }

    fn encode(value: &EvalValue) -> Vec<u8> {
        let mut buf = Vec::new();
        value.serialize(&mut buf).unwrap();
        buf
    }

    fn sample_values() -> Vec<EvalValue> {
        vec![
            EvalValue::Integer(-17),
            EvalValue::Real(0.1),
            EvalValue::Real(1e300),
            EvalValue::Real(f64::NEG_INFINITY),
            EvalValue::Boolean(true),
            EvalValue::String("multi\nline \"text\" ✓".into()),
            EvalValue::String(String::new()),
            EvalValue::ExternalObject("obj-7".into()),
            EvalValue::array(
                vec![2, 2],
                vec![
                    EvalValue::Real(1.0),
                    EvalValue::Real(2.0),
                    EvalValue::Real(3.0),
                    EvalValue::Real(4.0),
                ],
            )
            .unwrap(),
            EvalValue::Record(vec![
                EvalValue::Integer(1),
                EvalValue::vector(vec![EvalValue::String("a".into())]),
            ]),
        ]
    }

    #[test]
    fn test_encoding_is_tagged() {
        assert_eq!(encode(&EvalValue::Integer(42)), b"I 42\n");
        assert_eq!(encode(&EvalValue::Real(1.0)), b"R 1.0\n");
        assert_eq!(encode(&EvalValue::Boolean(false)), b"B 0\n");
        assert_eq!(encode(&EvalValue::String("hi".into())), b"S 2\nhi\n");
        assert_eq!(
            encode(&EvalValue::vector(vec![EvalValue::Integer(1), EvalValue::Integer(2)])),
            b"A 1 2\nI 1\nI 2\n"
        );
    }

    #[test]
    fn test_sequence_round_trip_with_types() {
        let values = sample_values();
        let mut buf = Vec::new();
        for v in &values {
            v.serialize(&mut buf).unwrap();
        }
        buf.extend_from_slice(b"READY\n");

        let mut reader = BufferReader::new(&buf);
        for v in &values {
            let decoded = read_value(&mut reader, Some(&v.value_type())).unwrap();
            assert_eq!(&decoded, v);
        }
        assert_eq!(reader.next_line().unwrap(), "READY");
    }

    #[test]
    fn test_untyped_decode() {
        let value = EvalValue::Record(vec![EvalValue::Boolean(true), EvalValue::Real(2.5)]);
        let mut reader = BufferReader::new(&encode(&value));
        assert_eq!(read_value(&mut reader, None).unwrap(), value);
    }

    #[test]
    fn test_nan_round_trip() {
        let mut reader = BufferReader::new(&encode(&EvalValue::Real(f64::NAN)));
        match read_value(&mut reader, Some(&EvalType::Real)).unwrap() {
            EvalValue::Real(r) => assert!(r.is_nan()),
            other => panic!("Expected Real, got {:?}", other),
        }
    }

    #[test]
    fn test_type_mismatch_is_malformed() {
        let mut reader = BufferReader::new(b"I 3\n");
        let err = read_value(&mut reader, Some(&EvalType::Real)).unwrap_err();
        assert!(matches!(err, EvalError::Malformed(_)));
        assert!(err.to_string().contains("expected real"));
    }

    #[test]
    fn test_record_field_count_mismatch() {
        let mut reader = BufferReader::new(b"C 1\nI 3\n");
        let ty = EvalType::Record(vec![EvalType::Integer, EvalType::Integer]);
        assert!(matches!(
            read_value(&mut reader, Some(&ty)),
            Err(EvalError::Malformed(_))
        ));
    }

    #[test]
    fn test_malformed_headers() {
        for input in [
            &b"R abc\n"[..],
            b"B 2\n",
            b"Q 1\n",
            b"READY\n",
            b"A 2 3\n",
            b"S 2\nhiX\n",
            b"A 1 99999999999999999999\n",
        ] {
            let mut reader = BufferReader::new(input);
            let err = read_value(&mut reader, None).unwrap_err();
            assert!(
                matches!(err, EvalError::Malformed(_)),
                "input {:?} gave {:?}",
                String::from_utf8_lossy(input),
                err
            );
        }
    }

    #[test]
    fn test_truncated_string_is_transport_error() {
        let mut reader = BufferReader::new(b"S 10\nabc");
        assert!(matches!(
            read_value(&mut reader, None),
            Err(EvalError::Transport(_))
        ));
    }

    #[test]
    fn test_inconsistent_array_refuses_to_serialize() {
        let bad = EvalValue::Array {
            dims: vec![3],
            elements: vec![EvalValue::Integer(1)],
        };
        let mut buf = Vec::new();
        assert!(bad.serialize(&mut buf).is_err());
        assert!(EvalValue::array(vec![3], vec![EvalValue::Integer(1)]).is_none());
    }

    #[test]
    fn test_marked_external_object() {
        assert_eq!(
            EvalValue::ExternalObject("h1".into()).marked_external_object(),
            Some("h1")
        );
        assert_eq!(EvalValue::String("h1".into()).marked_external_object(), None);
    }

    #[test]
    fn test_parse_typed_literals() {
        assert_eq!(EvalValue::parse_typed("int:3").unwrap(), EvalValue::Integer(3));
        assert_eq!(EvalValue::parse_typed("real:1.5").unwrap(), EvalValue::Real(1.5));
        assert_eq!(EvalValue::parse_typed("bool:true").unwrap(), EvalValue::Boolean(true));
        assert_eq!(
            EvalValue::parse_typed("string:a:b").unwrap(),
            EvalValue::String("a:b".into())
        );
        assert_eq!(
            EvalValue::parse_typed("real[]:1,2").unwrap(),
            EvalValue::vector(vec![EvalValue::Real(1.0), EvalValue::Real(2.0)])
        );
        assert!(EvalValue::parse_typed("int:x").is_err());
        assert!(EvalValue::parse_typed("complex:1").is_err());
        assert!(EvalValue::parse_typed("nocolon").is_err());
    }

    #[test]
    fn test_type_from_str_and_display() {
        assert_eq!("Real".parse::<EvalType>().unwrap(), EvalType::Real);
        let nested: EvalType = "int[][]".parse().unwrap();
        assert_eq!(nested.to_string(), "int[][]");
        assert!("matrix".parse::<EvalType>().is_err());
    }

    #[test]
    fn test_var_caching() {
        let var = Var::output("y", EvalType::Real);
        assert_eq!(var.cached(), None);
        assert_eq!(var.ceval(), EvalValue::Real(0.0));

        var.cache_value(EvalValue::Real(2.0));
        assert_eq!(var.ceval(), EvalValue::Real(2.0));

        var.clear();
        assert_eq!(var.cached(), None);
    }

    #[test]
    fn test_external_call_cached_args() {
        let call = ExternalCall::new("add")
            .with_args([EvalValue::Real(1.0), EvalValue::Integer(2)])
            .with_cached_args()
            .unwrap();
        assert_eq!(call.function_args_serialized(), Some("R 1.0\nI 2\n"));
        assert_eq!(call.function_args_to_serialize().len(), 2);
    }

    #[test]
    fn test_display() {
        let value = EvalValue::Record(vec![
            EvalValue::vector(vec![EvalValue::Integer(1), EvalValue::Integer(2)]),
            EvalValue::String("x".into()),
        ]);
        assert_eq!(value.to_string(), "([1, 2], \"x\")");
    }
}
