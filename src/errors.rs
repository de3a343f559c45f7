use std::fmt;

use thiserror::Error;

/// A front-end diagnostic (lexical, syntax or semantic) tied to a source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub message: String,
    pub line: usize,
    pub context: Option<String>,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    pub fn new(line: usize, message: &str) -> Self {
        Diagnostic {
            message: message.to_string(),
            line,
            context: None,
            suggestion: None,
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    /// Terminal rendering used by the CLI.
    pub fn render(&self, severity: Severity) -> String {
        const RED: &str = "\x1b[1;31m";
        const YELLOW: &str = "\x1b[1;33m";
        const BLUE: &str = "\x1b[1;34m";
        const GREEN: &str = "\x1b[1;32m";
        const RESET: &str = "\x1b[0m";
        const BOLD: &str = "\x1b[1m";

        let (color, label) = match severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
        };

        let location = if self.line > 0 { format!("Line {}: ", self.line) } else { String::new() };
        let mut out = format!(
            "{}{}{}: {}{}{}{}\n",
            color, label, RESET, BOLD, location, self.message, RESET
        );

        if let Some(ref ctx) = self.context {
            let gutter = self.line.to_string().len();
            out.push_str(&format!("  {:width$} {}|{}\n", "", BLUE, RESET, width = gutter));
            out.push_str(&format!("  {}{}{} {}|{} {}\n", BLUE, self.line, RESET, BLUE, RESET, ctx));
        }

        if let Some(ref suggestion) = self.suggestion {
            out.push_str(&format!("  {}help{}: did you mean `{}{}{}`?\n", GREEN, RESET, YELLOW, suggestion, RESET));
        }

        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // line 0 means the whole program
        if self.line > 0 {
            write!(f, "Line {}: ", self.line)?;
        }
        f.write_str(&self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " (did you mean '{}'?)", suggestion)?;
        }
        if let Some(ref ctx) = self.context {
            write!(f, "\n  Context: {}", ctx)?;
        }
        Ok(())
    }
}

/// Faults raised while stepping a program. Any of these halts the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("cannot execute a line that failed to parse: {0}")]
    UnparsedLine(String),

    #[error("undefined function '{0}'")]
    UndefinedFunction(String),

    #[error("undefined method '{0}'")]
    UndefinedMethod(String),

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("unknown car '{0}'")]
    UnknownAgent(String),

    #[error("no car is available to receive '{0}'")]
    NoDefaultAgent(String),

    #[error("'{name}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("cannot use 'self' outside of a method context")]
    SelfOutsideMethod,

    #[error("'break' used outside of a loop")]
    BreakOutsideLoop,

    #[error("'continue' used outside of a loop")]
    ContinueOutsideLoop,

    #[error("'return' used outside of a function or method")]
    ReturnOutsideFunction,

    #[error("cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("loop exceeded {0} iterations")]
    LoopLimit(u64),
}

pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let a_chars: Vec<char> = a_lower.chars().collect();
    let b_chars: Vec<char> = b_lower.chars().collect();

    let m = a_chars.len();
    let n = b_chars.len();

    if m == 0 { return n; }
    if n == 0 { return m; }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut row = vec![0usize; n + 1];

    for i in 1..=m {
        row[0] = i;
        for j in 1..=n {
            let cost = if a_chars[i - 1] == b_chars[j - 1] { 0 } else { 1 };
            row[j] = (prev[j] + 1)
                .min(row[j - 1] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }

    prev[n]
}

/// Closest candidate to `word`, if any is within a small edit distance.
pub fn find_similar_name(word: &str, candidates: &[&str]) -> Option<String> {
    // Short names are usually intentional (x, i, go)
    if word.len() <= 2 {
        return None;
    }

    let mut best_match: Option<(&str, usize)> = None;

    for &candidate in candidates {
        let len_diff = word.len().abs_diff(candidate.len());
        if len_diff > 2 {
            continue;
        }

        let distance = levenshtein_distance(word, candidate);
        if distance == 0 {
            // Only the casing differs
            if word != candidate {
                return Some(candidate.to_string());
            }
            return None;
        }

        let max_distance = if word.len() >= 4 { 2 } else { 1 };
        if distance <= max_distance && best_match.map_or(true, |(_, d)| distance < d) {
            best_match = Some((candidate, distance));
        }
    }

    best_match.map(|(s, _)| s.to_string())
}

pub struct SourceFile {
    lines: Vec<String>,
}

impl SourceFile {
    pub fn new(content: &str) -> Self {
        SourceFile {
            lines: content.lines().map(|s| s.to_string()).collect(),
        }
    }

    pub fn get_line(&self, line_num: usize) -> Option<&str> {
        if line_num > 0 && line_num <= self.lines.len() {
            Some(&self.lines[line_num - 1])
        } else {
            None
        }
    }

    /// Trimmed source line for error context, `None` for blank or missing lines.
    pub fn excerpt(&self, line_num: usize) -> Option<&str> {
        self.get_line(line_num)
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein_distance("honk", "honk"), 0);
        assert_eq!(levenshtein_distance("turnLeft", "turnLft"), 1);
        assert_eq!(levenshtein_distance("moveForward", "moveFrward"), 1);
        assert_eq!(levenshtein_distance("", "abc"), 3);
    }

    #[test]
    fn test_find_similar() {
        let names = ["moveForward", "turnLeft", "turnRight", "honk"];
        assert_eq!(find_similar_name("moveFowrard", &names), Some("moveForward".to_string()));
        assert_eq!(find_similar_name("turnleft", &names), Some("turnLeft".to_string()));
        assert_eq!(find_similar_name("honk", &names), None);
        assert_eq!(find_similar_name("fly", &names), None);
    }

    #[test]
    fn test_display_format() {
        let d = Diagnostic::new(3, "Undefined function 'fly'").with_context("fly();");
        assert_eq!(d.to_string(), "Line 3: Undefined function 'fly'\n  Context: fly();");
        let d = Diagnostic::new(0, "Car 'carB' is never used");
        assert_eq!(d.to_string(), "Car 'carB' is never used");
    }

    #[test]
    fn test_excerpt_skips_blank_lines() {
        let src = SourceFile::new("int x = 1;\n\n   moveForward();  ");
        assert_eq!(src.excerpt(1), Some("int x = 1;"));
        assert_eq!(src.excerpt(2), None);
        assert_eq!(src.excerpt(3), Some("moveForward();"));
        assert_eq!(src.excerpt(9), None);
    }
}
