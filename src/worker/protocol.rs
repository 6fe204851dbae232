//! Session protocol between the pool and evaluator processes.
//!
//! Control messages are single newline-terminated lines. Values between
//! them use the tagged encoding of [`crate::model`].
//!
//! ```text
//! evaluator:  START
//! pool:       EVAL <function>
//!             <values...>
//!             END
//! evaluator:  RESULT <n>          | ERROR <message>
//!             <n values...>       |
//!             READY               | READY
//! pool:       EXIT
//! ```

/// Bare control tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Evaluator finished starting up.
    Start,
    /// End of a request.
    End,
    /// Evaluator is ready for the next request.
    Ready,
    /// Ask the evaluator to exit.
    Exit,
}

impl Token {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::End => "END",
            Self::Ready => "READY",
            Self::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header line opening a request from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkRequest {
    /// Evaluate the named function; argument values follow until `END`.
    Eval { function: String },
    /// Graceful shutdown request.
    Exit,
}

/// Header line opening a response from the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkResponse {
    /// `count` result values follow, then `READY`.
    Result { count: usize },
    /// The function failed; `READY` follows.
    Error { message: String },
}

impl WorkRequest {
    /// Create an evaluation request.
    pub fn eval(function: impl Into<String>) -> Self {
        Self::Eval {
            function: function.into(),
        }
    }

    /// Serialize to a protocol line (with newline).
    ///
    /// Line breaks in the function name are replaced so the header stays one line.
    pub fn to_line(&self) -> String {
        match self {
            Self::Eval { function } => format!("EVAL {}\n", single_line(function)),
            Self::Exit => format!("{}\n", Token::Exit),
        }
    }

    /// Parse a protocol line.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if line == Token::Exit.as_str() {
            return Some(Self::Exit);
        }
        line.strip_prefix("EVAL ")
            .filter(|name| !name.is_empty())
            .map(Self::eval)
    }
}

impl WorkResponse {
    /// Create a successful result header.
    pub fn result(count: usize) -> Self {
        Self::Result { count }
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a protocol line (with newline).
    pub fn to_line(&self) -> String {
        match self {
            Self::Result { count } => format!("RESULT {}\n", count),
            Self::Error { message } => format!("ERROR {}\n", single_line(message)),
        }
    }

    /// Parse a protocol line.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim_end();
        if let Some(count) = line.strip_prefix("RESULT ") {
            return count.trim().parse().ok().map(Self::result);
        }
        if line == "ERROR" {
            return Some(Self::error(""));
        }
        line.strip_prefix("ERROR ").map(Self::error)
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_request_eval() {
        let req = WorkRequest::eval("Modelica.Math.sin");
        let line = req.to_line();
        assert_eq!(line, "EVAL Modelica.Math.sin\n");

        let parsed = WorkRequest::from_line(&line).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_work_request_exit() {
        let line = WorkRequest::Exit.to_line();
        assert_eq!(WorkRequest::from_line(&line), Some(WorkRequest::Exit));
    }

    #[test]
    fn test_work_request_rejects_garbage() {
        assert_eq!(WorkRequest::from_line("EVAL "), None);
        assert_eq!(WorkRequest::from_line("HELLO"), None);
    }

    #[test]
    fn test_function_name_kept_on_one_line() {
        let line = WorkRequest::eval("bad\nname").to_line();
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_work_response_result() {
        let line = WorkResponse::result(3).to_line();
        assert_eq!(line, "RESULT 3\n");
        assert_eq!(WorkResponse::from_line(&line), Some(WorkResponse::result(3)));
        assert_eq!(WorkResponse::from_line("RESULT many"), None);
    }

    #[test]
    fn test_work_response_error() {
        let resp = WorkResponse::error("division by zero\nat line 3");
        let line = resp.to_line();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        match WorkResponse::from_line(&line).unwrap() {
            WorkResponse::Error { message } => {
                assert_eq!(message, "division by zero at line 3");
            }
            other => panic!("Expected Error variant, got {:?}", other),
        }
    }

    #[test]
    fn test_tokens() {
        assert_eq!(Token::Start.to_string(), "START");
        assert_eq!(Token::End.as_str(), "END");
        assert_eq!(Token::Ready.as_str(), "READY");
        assert_eq!(Token::Exit.as_str(), "EXIT");
    }
}
