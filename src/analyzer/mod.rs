use std::collections::HashSet;

use crate::engine::dispatch::Builtin;
use crate::errors::{find_similar_name, Diagnostic};
use crate::parser::ast::*;
use crate::parser::{self, ParseResult};

/// How commands name their receiver, fixed by the number of cars in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// One car: bare `moveForward();` calls only.
    Single,
    /// Several cars: `carA.moveForward();` and `self.turnLeft();` only.
    Multi,
}

impl AddressingMode {
    pub fn for_agent_count(count: usize) -> Self {
        if count > 1 {
            AddressingMode::Multi
        } else {
            AddressingMode::Single
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Routine signature collected before the walk.
#[derive(Debug, Clone)]
struct Signature {
    name: String,
    arity: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Scope {
    loops: usize,
    switches: usize,
    in_routine: bool,
    in_method: bool,
}

pub struct Analyzer {
    pub mode: AddressingMode,
    pub agents: Vec<String>,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    functions: Vec<Signature>,
    methods: Vec<Signature>,
    used_agents: HashSet<String>,
    saw_bare: Option<usize>,
    saw_qualified: Option<usize>,
}

impl Analyzer {
    pub fn new(agents: &[&str]) -> Self {
        Analyzer {
            mode: AddressingMode::for_agent_count(agents.len()),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            errors: Vec::new(),
            warnings: Vec::new(),
            functions: Vec::new(),
            methods: Vec::new(),
            used_agents: HashSet::new(),
            saw_bare: None,
            saw_qualified: None,
        }
    }

    /// Check `program` without touching it. Running it twice gives the same
    /// result.
    pub fn validate(&mut self, program: &Program) -> Validation {
        self.errors.clear();
        self.warnings.clear();
        self.functions.clear();
        self.methods.clear();
        self.used_agents.clear();
        self.saw_bare = None;
        self.saw_qualified = None;

        // First pass: routine signatures, so calls may precede declarations
        self.collect_routines(&program.lines);

        self.check_lines(&program.lines, Scope::default());
        self.check_program_wide();

        Validation {
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        }
    }

    fn collect_routines(&mut self, lines: &[Line]) {
        for stmt in lines.iter().filter_map(|l| l.statement.as_ref()) {
            self.collect_from_statement(stmt);
        }
    }

    fn collect_from_statement(&mut self, stmt: &Statement) {
        match &stmt.kind {
            StatementKind::FunctionDecl(decl) => {
                self.functions.push(Signature { name: decl.name.clone(), arity: decl.params.len() });
                self.collect_routines(&decl.body);
            }
            StatementKind::ClassDecl { methods, .. } => {
                for method in methods {
                    self.methods.push(Signature { name: method.name.clone(), arity: method.params.len() });
                    self.collect_routines(&method.body);
                }
            }
            StatementKind::If(stmt) => {
                self.collect_routines(&stmt.then_block);
                for (_, block) in &stmt.else_ifs {
                    self.collect_routines(block);
                }
                if let Some(block) = &stmt.else_block {
                    self.collect_routines(block);
                }
            }
            StatementKind::While(stmt) => self.collect_routines(&stmt.body),
            StatementKind::For(stmt) => self.collect_routines(&stmt.body),
            StatementKind::Switch(stmt) => {
                for case in &stmt.cases {
                    self.collect_routines(&case.body);
                }
                if let Some(block) = &stmt.default {
                    self.collect_routines(block);
                }
            }
            StatementKind::TryCatch { body, handler, .. } => {
                self.collect_routines(body);
                self.collect_routines(handler);
            }
            _ => {}
        }
    }

    fn error(&mut self, line: usize, message: String) {
        self.errors.push(Diagnostic::new(line, &message));
    }

    fn warning(&mut self, line: usize, message: String) {
        self.warnings.push(Diagnostic::new(line, &message));
    }

    fn check_lines(&mut self, lines: &[Line], scope: Scope) {
        for stmt in lines.iter().filter_map(|l| l.statement.as_ref()) {
            self.check_statement(stmt, scope);
        }
    }

    fn check_block(&mut self, block: &[Line], line: usize, what: &str, scope: Scope) {
        if block.iter().all(Line::is_comment_only) {
            self.warning(line, format!("Empty {} body", what));
        }
        self.check_lines(block, scope);
    }

    fn check_statement(&mut self, stmt: &Statement, scope: Scope) {
        let line = stmt.line;
        match &stmt.kind {
            StatementKind::VarDecl { init, .. } => {
                if let Some(expr) = init {
                    self.check_expr(expr, scope);
                }
            }

            StatementKind::Assignment { value, .. } => self.check_expr(value, scope),

            StatementKind::FunctionDecl(decl) => {
                if Builtin::from_name(&decl.name).is_some() {
                    self.warning(decl.line, format!("Function '{}' shadows a built-in function", decl.name));
                }
                let inner = Scope { in_routine: true, ..Scope::default() };
                self.check_block(&decl.body, decl.line, "function", inner);
            }

            StatementKind::ClassDecl { methods, .. } => {
                for method in methods {
                    if Builtin::from_name(&method.name).is_some() {
                        self.warning(method.line, format!("Method '{}' shadows a built-in method", method.name));
                    }
                    let inner = Scope { in_routine: true, in_method: true, ..Scope::default() };
                    self.check_block(&method.body, method.line, "method", inner);
                }
            }

            StatementKind::Call(call) => self.check_call(call, line, scope),

            StatementKind::If(stmt) => {
                self.check_expr(&stmt.condition, scope);
                self.check_block(&stmt.then_block, line, "if", scope);
                for (condition, block) in &stmt.else_ifs {
                    self.check_expr(condition, scope);
                    self.check_block(block, condition.line, "else if", scope);
                }
                if let Some(block) = &stmt.else_block {
                    self.check_block(block, line, "else", scope);
                }
            }

            StatementKind::While(stmt) => {
                self.check_expr(&stmt.condition, scope);
                if stmt.condition.kind.is_true_literal() {
                    self.warning(line, "'while (true)' loop only ends when every car has crashed".to_string());
                }
                let inner = Scope { loops: scope.loops + 1, ..scope };
                self.check_block(&stmt.body, line, "while", inner);
            }

            StatementKind::For(stmt) => {
                if let Some(init) = &stmt.init {
                    self.check_statement(init, scope);
                }
                if let Some(condition) = &stmt.condition {
                    self.check_expr(condition, scope);
                }
                if let Some(increment) = &stmt.increment {
                    self.check_statement(increment, scope);
                }
                let inner = Scope { loops: scope.loops + 1, ..scope };
                self.check_block(&stmt.body, line, "for", inner);
            }

            StatementKind::Switch(stmt) => {
                self.check_expr(&stmt.subject, scope);
                let inner = Scope { switches: scope.switches + 1, ..scope };
                for case in &stmt.cases {
                    self.check_expr(&case.value, scope);
                    self.check_lines(&case.body, inner);
                }
                if let Some(block) = &stmt.default {
                    self.check_lines(block, inner);
                }
            }

            StatementKind::TryCatch { body, handler, .. } => {
                self.check_block(body, line, "try", scope);
                self.warning(line, "'catch' block never runs: runtime errors stop the program".to_string());
                self.check_lines(handler, scope);
            }

            StatementKind::Return(value) => {
                if !scope.in_routine {
                    self.error(line, "'return' used outside of a function or method".to_string());
                }
                if let Some(expr) = value {
                    self.check_expr(expr, scope);
                }
            }

            StatementKind::Break => {
                if scope.loops == 0 && scope.switches == 0 {
                    self.error(line, "'break' used outside of a loop or switch".to_string());
                }
            }

            StatementKind::Continue => {
                if scope.loops == 0 {
                    self.error(line, "'continue' used outside of a loop".to_string());
                }
            }

            // already reported by the parser
            StatementKind::ErrorPlaceholder(_) => {}
        }
    }

    fn check_expr(&mut self, expr: &Expr, scope: Scope) {
        match &expr.kind {
            ExprKind::Binary { left, right, .. } => {
                self.check_expr(left, scope);
                self.check_expr(right, scope);
            }
            ExprKind::Call(call) => self.check_call(call, expr.line, scope),
            _ => {}
        }
    }

    fn check_call(&mut self, call: &Call, line: usize, scope: Scope) {
        for arg in &call.args {
            self.check_expr(arg, scope);
        }

        match &call.target {
            CallTarget::Implicit => {
                self.saw_bare.get_or_insert(line);
                if self.mode == AddressingMode::Multi {
                    self.error(
                        line,
                        format!(
                            "'{}()' needs a car: with several cars use car.{}() or self.{}()",
                            call.name, call.name, call.name
                        ),
                    );
                    return;
                }
                self.check_function_name(call, line);
            }
            _ if self.mode == AddressingMode::Single => {
                self.saw_qualified.get_or_insert(line);
                self.error(
                    line,
                    format!("'{}' is only allowed with several cars: call {}() directly", call, call.name),
                );
            }
            CallTarget::Named(object) => {
                self.saw_qualified.get_or_insert(line);
                if !self.agents.iter().any(|a| a == object) {
                    let names: Vec<&str> = self.agents.iter().map(String::as_str).collect();
                    let mut diagnostic = Diagnostic::new(
                        line,
                        &format!("Unknown car '{}'. Available cars: {}", object, names.join(", ")),
                    );
                    if let Some(suggestion) = find_similar_name(object, &names) {
                        diagnostic = diagnostic.with_suggestion(&suggestion);
                    }
                    self.errors.push(diagnostic);
                    return;
                }
                self.used_agents.insert(object.clone());
                self.check_method_name(call, object, line);
            }
            CallTarget::SelfRef => {
                self.saw_qualified.get_or_insert(line);
                if !scope.in_method {
                    self.error(line, "cannot use 'self' outside of a method".to_string());
                    return;
                }
                self.check_method_name(call, "self", line);
            }
        }
    }

    fn check_function_name(&mut self, call: &Call, line: usize) {
        if Builtin::from_name(&call.name).is_some() {
            self.check_arity(&call.name, 0, call.args.len(), line);
            return;
        }
        let arity = self.functions.iter().find(|f| f.name == call.name).map(|f| f.arity);
        match arity {
            Some(expected) => self.check_arity(&call.name, expected, call.args.len(), line),
            None => {
                let mut known: Vec<&str> = Builtin::names().collect();
                known.extend(self.functions.iter().map(|f| f.name.as_str()));
                let mut diagnostic = Diagnostic::new(
                    line,
                    &format!("Undefined function '{}'. Available functions: {}", call.name, known.join(", ")),
                );
                if let Some(suggestion) = find_similar_name(&call.name, &known) {
                    diagnostic = diagnostic.with_suggestion(&suggestion);
                }
                self.errors.push(diagnostic);
            }
        }
    }

    fn check_method_name(&mut self, call: &Call, object: &str, line: usize) {
        let label = format!("{}.{}", object, call.name);
        if Builtin::from_name(&call.name).is_some() {
            self.check_arity(&label, 0, call.args.len(), line);
            return;
        }
        let arity = self.methods.iter().find(|m| m.name == call.name).map(|m| m.arity);
        match arity {
            Some(expected) => self.check_arity(&label, expected, call.args.len(), line),
            None => {
                let mut known: Vec<&str> = Builtin::names().collect();
                known.extend(self.methods.iter().map(|m| m.name.as_str()));
                let mut diagnostic = Diagnostic::new(
                    line,
                    &format!(
                        "Undefined method '{}' for car '{}'. Available methods: {}",
                        call.name,
                        object,
                        known.join(", ")
                    ),
                );
                if let Some(suggestion) = find_similar_name(&call.name, &known) {
                    diagnostic = diagnostic.with_suggestion(&suggestion);
                }
                self.errors.push(diagnostic);
            }
        }
    }

    fn check_arity(&mut self, label: &str, expected: usize, got: usize, line: usize) {
        if expected != got {
            self.error(line, format!("'{}' expects {} argument(s), got {}", label, expected, got));
        }
    }

    fn check_program_wide(&mut self) {
        if self.mode == AddressingMode::Multi {
            for agent in self.agents.clone() {
                if !self.used_agents.contains(&agent) {
                    self.warning(0, format!("Car '{}' is never used", agent));
                }
            }
        }

        if let (Some(bare), Some(qualified)) = (self.saw_bare, self.saw_qualified) {
            self.warning(
                bare.min(qualified),
                "Program mixes bare calls and car.method() calls".to_string(),
            );
        }
    }
}

/// Validate `program` for the given cars.
pub fn validate(program: &Program, agents: &[&str]) -> Validation {
    Analyzer::new(agents).validate(program)
}

/// Parse `source` and validate it for `agents`. Lines that failed to parse
/// are skipped by validation, so the rest of the program is still checked.
pub fn check(source: &str, agents: &[&str]) -> ParseResult {
    let mut result = parser::parse(source);
    let validation = validate(&result.program, agents);
    result.errors.extend(validation.errors);
    result.warnings = validation.warnings;
    result.valid = result.errors.is_empty();
    result
}
