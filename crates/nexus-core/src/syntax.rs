//! Python syntax check for the `validate_code` tool. Parsing only; nothing
//! is compiled or run.

use rustpython_parser::{parse, Mode};
use serde::{Deserialize, Serialize};

const SOURCE_PATH: &str = "<submission>";

/// Where and why the parser gave up. `line` and `column` are 1-based,
/// `column` counted in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxIssue {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

pub fn check_syntax(source: &str) -> Result<(), SyntaxIssue> {
    match parse(source, Mode::Module, SOURCE_PATH) {
        Ok(_) => Ok(()),
        Err(e) => {
            let (line, column) = position(source, usize::from(e.offset));
            Err(SyntaxIssue {
                message: e.error.to_string(),
                line,
                column,
            })
        }
    }
}

fn position(source: &str, offset: usize) -> (usize, usize) {
    let mut end = offset.min(source.len());
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    let before = &source[..end];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    (line, before[line_start..].chars().count() + 1)
}
