use std::collections::HashMap;
use std::rc::Rc;

use super::value::Value;
use crate::parser::ast::{Block, ForStmt, WhileStmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Main,
    Function,
    Method,
    IfThen,
    IfElseIf,
    IfElse,
    While,
    For,
    SwitchCase,
    Try,
}

impl ContextKind {
    pub fn name(&self) -> &'static str {
        match self {
            ContextKind::Main => "main",
            ContextKind::Function => "function",
            ContextKind::Method => "method",
            ContextKind::IfThen => "if-then",
            ContextKind::IfElseIf => "if-elseif",
            ContextKind::IfElse => "if-else",
            ContextKind::While => "while",
            ContextKind::For => "for",
            ContextKind::SwitchCase => "switch-case",
            ContextKind::Try => "try",
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, ContextKind::While | ContextKind::For)
    }

    /// Function and method contexts own a variable scope and stop unwinding.
    pub fn is_routine(&self) -> bool {
        matches!(self, ContextKind::Function | ContextKind::Method)
    }
}

/// Identity of the loop statement a context was entered from.
#[derive(Debug, Clone)]
pub enum LoopRef {
    While(Rc<WhileStmt>),
    For(Rc<ForStmt>),
}

impl LoopRef {
    pub fn same_loop(&self, other: &LoopRef) -> bool {
        match (self, other) {
            (LoopRef::While(a), LoopRef::While(b)) => Rc::ptr_eq(a, b),
            (LoopRef::For(a), LoopRef::For(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// What popping a context does to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The parent moves on to its next line.
    Advance,
    /// The parent re-runs its current statement, now with this context's
    /// return value available as a recorded call result.
    Replay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub ty: String,
    pub value: Value,
}

/// A reified stack frame. Contexts live in the engine's stack; `parent` is
/// the index of the enclosing context in that stack.
#[derive(Debug, Clone)]
pub struct Context {
    pub kind: ContextKind,
    pub lines: Block,
    pub cursor: usize,
    pub parent: Option<usize>,
    pub bindings: Option<HashMap<String, Binding>>,
    pub loop_ref: Option<LoopRef>,
    pub agent: Option<String>,
    pub return_value: Option<Value>,
    pub has_returned: bool,
    pub resume: Resume,
    /// Results of calls already made by the statement at `cursor`.
    pub replay: Vec<Value>,
    pub iterations: u64,
    pub increment_done: bool,
    /// Source line of the construct that opened this context.
    pub line: usize,
}

impl Context {
    pub fn main(lines: Block) -> Self {
        Context::new(ContextKind::Main, lines, None, 0)
    }

    pub fn new(kind: ContextKind, lines: Block, parent: Option<usize>, line: usize) -> Self {
        Context {
            kind,
            lines,
            cursor: 0,
            parent,
            bindings: if kind.is_routine() { Some(HashMap::new()) } else { None },
            loop_ref: None,
            agent: None,
            return_value: None,
            has_returned: false,
            resume: Resume::Advance,
            replay: Vec::new(),
            iterations: 0,
            increment_done: false,
            line,
        }
    }

    pub fn with_loop(mut self, loop_ref: LoopRef) -> Self {
        self.loop_ref = Some(loop_ref);
        self.iterations = 1;
        self
    }

    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_resume(mut self, resume: Resume) -> Self {
        self.resume = resume;
        self
    }

    /// Skip comment-only lines; true when nothing executable remains.
    pub fn seek_statement(&mut self) -> bool {
        while self.cursor < self.lines.len() && self.lines[self.cursor].is_comment_only() {
            self.cursor += 1;
        }
        self.cursor >= self.lines.len()
    }

    /// Mark the body as run to completion so the next step takes the
    /// end-of-block path.
    pub fn exhaust(&mut self) {
        self.cursor = self.lines.len();
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
        self.replay.clear();
        self.increment_done = false;
        self.iterations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::{Expr, ExprKind, Line};

    fn while_stmt() -> Rc<WhileStmt> {
        Rc::new(WhileStmt {
            condition: Expr { kind: ExprKind::Bool(true), line: 1 },
            body: Vec::<Line>::new().into(),
        })
    }

    #[test]
    fn test_loop_identity() {
        let a = while_stmt();
        let b = while_stmt();
        assert!(LoopRef::While(a.clone()).same_loop(&LoopRef::While(a)));
        assert!(!LoopRef::While(b).same_loop(&LoopRef::While(while_stmt())));
    }

    #[test]
    fn test_only_routines_have_scopes() {
        let body: Block = Vec::<Line>::new().into();
        assert!(Context::new(ContextKind::Function, body.clone(), Some(0), 1).bindings.is_some());
        assert!(Context::new(ContextKind::While, body.clone(), Some(0), 1).bindings.is_none());
        assert!(Context::main(body).bindings.is_none());
    }

    #[test]
    fn test_seek_skips_comments() {
        let lines: Block = vec![
            Line { statement: None, comment: Some("a".into()), line: 1 },
            Line { statement: None, comment: Some("b".into()), line: 2 },
        ]
        .into();
        let mut ctx = Context::main(lines);
        assert!(ctx.seek_statement());
        assert_eq!(ctx.cursor, 2);
    }
}
