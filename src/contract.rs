//! Capability traits connecting the pool to a model representation.
//!
//! The pool and communicator are written once against these traits. Each
//! value owns its wire encoding, each type owns its decoding, and a call site
//! describes what to send and where to store the results.

use crate::config::EvalOptions;
use crate::error::Result;
use crate::worker::ProcessCommunicator;
use std::io::{self, Write};
use std::path::Path;

/// An evaluated datum that can be sent to an evaluator.
pub trait Value {
    /// Handle of the external object this value denotes, if it is one.
    fn marked_external_object(&self) -> Option<&str>;

    /// Write a self-delimiting encoding of this value.
    ///
    /// Must write only its own bytes; the next value follows directly.
    fn serialize(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Static type able to rebuild a [`Value`] from an evaluator's response.
pub trait ValueType {
    type Value: Value;

    /// Read exactly one value of this type, leaving the stream at the start
    /// of the next value or control token.
    fn deserialize(&self, com: &mut ProcessCommunicator) -> Result<Self::Value>;
}

/// A value-producing node whose evaluation result can be cached.
pub trait Variable {
    type Value: Value;
    type Type: ValueType<Value = Self::Value>;

    /// Current computed value.
    fn ceval(&self) -> Self::Value;

    /// Static type of the variable.
    fn value_type(&self) -> &Self::Type;

    /// Store an evaluation result for this variable.
    fn cache_value(&self, value: Self::Value);
}

/// One point in a model needing evaluation of an external function.
pub trait CallSite {
    type Var: Variable;

    fn name(&self) -> &str;

    /// Options governing this call site.
    fn options(&self) -> &EvalOptions;

    /// Maximum live evaluator processes for the pool serving this call site.
    fn process_limit(&self) -> usize {
        self.options().process_limit
    }

    /// Launch the generic evaluator instead of the compiled artifact.
    fn dynamic_evaluator_enabled(&self) -> bool {
        self.options().dynamic_evaluator
    }

    /// Base path library artifacts are resolved against.
    fn library_directory(&self) -> &Path;

    /// Ordered library artifacts.
    fn library(&self) -> &[String];

    /// External object whose state must be sent with every call.
    fn cached_external_object(&self) -> Option<&Self::Var>;

    fn external_objects_to_serialize(&self) -> &[Self::Var];

    fn function_args_to_serialize(&self) -> &[Self::Var];

    /// Pre-serialized argument text, sent verbatim instead of the arguments.
    fn function_args_serialized(&self) -> Option<&str>;

    /// Pre-serialized return argument text, sent verbatim after the arguments.
    fn function_return_arg_serialized(&self) -> Option<&str>;

    /// Variables receiving the results, in response order.
    fn vars_to_deserialize(&self) -> &[Self::Var];
}

/// Source of framed tokens for decoders.
///
/// Implemented by the communicator on the pool side and by the evaluator's
/// stdin reader on the worker side, so both share one decoder.
pub trait ResponseReader {
    /// Next newline-terminated line, without the newline.
    fn next_line(&mut self) -> Result<String>;

    /// Exactly `len` raw bytes.
    fn next_bytes(&mut self, len: usize) -> Result<Vec<u8>>;
}

/// Serialize values into a string, e.g. to precompute
/// [`CallSite::function_args_serialized`].
pub fn serialize_to_string<'a, V, I>(values: I) -> io::Result<String>
where
    V: Value + 'a,
    I: IntoIterator<Item = &'a V>,
{
    let mut buf = Vec::new();
    for value in values {
        value.serialize(&mut buf)?;
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
