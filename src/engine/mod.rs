//! Step-resumable interpreter.
//!
//! All execution state lives in an explicit stack of [`Context`]s owned by
//! the [`Engine`]. Each call to [`Engine::step`] performs one transition:
//! it runs one statement of the current context, or closes the context when
//! its lines are used up. Nothing is suspended on the host stack between
//! steps, so a driver can render a frame after every visible command.

pub mod context;
pub mod dispatch;
pub mod value;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::errors::RuntimeError;
use crate::parser::ast::*;
use context::{Binding, Context, ContextKind, LoopRef, Resume};
use dispatch::{AgentRegistry, Builtin};
use value::{apply_binary, Value};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Fault once any single loop activation runs more iterations than
    /// this. `None` leaves loops unbounded.
    pub max_loop_iterations: Option<u64>,
    /// Log every transition to stderr.
    pub trace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Call `step` again right away.
    Continue,
    /// A visible command ran; wait one animation tick.
    Paused,
    Complete,
    Error,
}

impl StepStatus {
    pub fn name(&self) -> &'static str {
        match self {
            StepStatus::Continue => "CONTINUE",
            StepStatus::Paused => "PAUSED",
            StepStatus::Complete => "COMPLETE",
            StepStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub status: StepStatus,
    pub current_line: Option<usize>,
    pub context_kind: Option<&'static str>,
    pub command_name: Option<String>,
    pub error: Option<String>,
}

impl StepResult {
    fn complete(line: Option<usize>) -> Self {
        StepResult {
            status: StepStatus::Complete,
            current_line: line,
            context_kind: None,
            command_name: None,
            error: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, StepStatus::Complete | StepStatus::Error)
    }
}

/// How executing one statement left the stack.
enum Flow {
    /// Finished; the cursor moves on.
    Done,
    /// Entered a block, loop or routine body.
    Pushed,
    /// A user routine was entered mid-expression; the statement runs again
    /// once it returns.
    Suspended,
    /// `break`, `continue` or `return` rearranged the stack.
    Unwound,
}

enum Invocation {
    Value(Value),
    Entered,
}

pub struct Engine {
    stack: Vec<Context>,
    globals: BTreeMap<String, Binding>,
    functions: HashMap<String, Rc<FunctionDecl>>,
    methods: HashMap<String, Rc<FunctionDecl>>,
    registry: AgentRegistry,
    config: EngineConfig,
    running: bool,
    replay_cursor: usize,
    command: Option<&'static str>,
    delayed: bool,
    line: usize,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            stack: Vec::new(),
            globals: BTreeMap::new(),
            functions: HashMap::new(),
            methods: HashMap::new(),
            registry: AgentRegistry::new(),
            config,
            running: false,
            replay_cursor: 0,
            command: None,
            delayed: false,
            line: 0,
        }
    }

    /// `new` followed by `initialize`.
    pub fn load(program: &Program, registry: AgentRegistry, config: EngineConfig) -> Self {
        let mut engine = Engine::new(config);
        engine.initialize(program, registry);
        engine
    }

    /// Load `program` and take ownership of the agents it drives. Function
    /// and class declarations are registered up front, so routines may be
    /// called before the line that declares them.
    pub fn initialize(&mut self, program: &Program, registry: AgentRegistry) {
        self.stack.clear();
        self.globals.clear();
        self.functions.clear();
        self.methods.clear();
        self.registry = registry;
        self.hoist(&program.lines);

        let lines: Block = program.lines.clone().into();
        self.stack.push(Context::main(lines));
        self.running = true;
        self.replay_cursor = 0;
        self.line = 0;

        self.trace(format_args!(
            "initialized: {} function(s), {} method(s), agents {:?}",
            self.functions.len(),
            self.methods.len(),
            self.registry.names()
        ));
    }

    fn hoist(&mut self, lines: &[Line]) {
        for stmt in lines.iter().filter_map(|l| l.statement.as_ref()) {
            match &stmt.kind {
                StatementKind::FunctionDecl(decl) => {
                    self.functions.insert(decl.name.clone(), Rc::clone(decl));
                    self.hoist(&decl.body);
                }
                StatementKind::ClassDecl { methods, .. } => {
                    for method in methods {
                        self.methods.insert(method.name.clone(), Rc::clone(method));
                        self.hoist(&method.body);
                    }
                }
                StatementKind::If(stmt) => {
                    self.hoist(&stmt.then_block);
                    for (_, block) in &stmt.else_ifs {
                        self.hoist(block);
                    }
                    if let Some(block) = &stmt.else_block {
                        self.hoist(block);
                    }
                }
                StatementKind::While(stmt) => self.hoist(&stmt.body),
                StatementKind::For(stmt) => self.hoist(&stmt.body),
                StatementKind::Switch(stmt) => {
                    for case in &stmt.cases {
                        self.hoist(&case.body);
                    }
                    if let Some(block) = &stmt.default {
                        self.hoist(block);
                    }
                }
                StatementKind::TryCatch { body, handler, .. } => {
                    self.hoist(body);
                    self.hoist(handler);
                }
                _ => {}
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Halt; every later `step` reports `Complete`.
    pub fn stop(&mut self) {
        self.trace(format_args!("stopped"));
        self.running = false;
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AgentRegistry {
        &mut self.registry
    }

    /// Snapshot of the global variable table.
    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.globals
            .iter()
            .map(|(name, binding)| (name.clone(), binding.value.clone()))
            .collect()
    }

    pub fn context_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn current_context_kind(&self) -> Option<ContextKind> {
        self.stack.last().map(|ctx| ctx.kind)
    }

    pub fn contexts(&self) -> &[Context] {
        &self.stack
    }

    pub fn current_line(&self) -> usize {
        self.line
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        if self.config.trace {
            eprintln!("[carlang] {}", args);
        }
    }

    /// Advance execution by one transition.
    pub fn step(&mut self) -> StepResult {
        if !self.running || self.stack.is_empty() {
            self.running = false;
            return StepResult::complete(None);
        }

        if self.registry.all_crashed() {
            self.trace(format_args!("all agents crashed, halting"));
            self.running = false;
            return StepResult::complete(Some(self.line));
        }

        self.command = None;
        self.delayed = false;

        match self.transition() {
            Ok(mut result) => {
                if self.running && self.registry.all_crashed() {
                    self.trace(format_args!("all agents crashed, halting"));
                    self.running = false;
                    result.status = StepStatus::Complete;
                }
                result
            }
            Err(err) => {
                self.running = false;
                let message = format!("Line {}: {}", self.line, err);
                self.trace(format_args!("error: {}", message));
                StepResult {
                    status: StepStatus::Error,
                    current_line: Some(self.line),
                    context_kind: self.current_context_kind().map(|k| k.name()),
                    command_name: self.command.map(String::from),
                    error: Some(message),
                }
            }
        }
    }

    fn result(&self, kind: ContextKind) -> StepResult {
        let status = if self.delayed { StepStatus::Paused } else { StepStatus::Continue };
        StepResult {
            status,
            current_line: Some(self.line),
            context_kind: Some(kind.name()),
            command_name: self.command.map(String::from),
            error: None,
        }
    }

    fn transition(&mut self) -> Result<StepResult, RuntimeError> {
        let top = self.stack.len() - 1;
        let kind = self.stack[top].kind;

        if self.stack[top].seek_statement() {
            return self.finish_block(top);
        }

        let lines = Rc::clone(&self.stack[top].lines);
        let Some(stmt) = lines[self.stack[top].cursor].statement.as_ref() else {
            return Ok(self.result(kind));
        };

        self.line = stmt.line;
        self.replay_cursor = 0;
        self.trace(format_args!(
            "line {} [{}] {} (depth {})",
            stmt.line,
            kind.name(),
            stmt.kind.name(),
            self.stack.len()
        ));

        if let Flow::Done = self.execute(stmt)? {
            let ctx = &mut self.stack[top];
            ctx.cursor += 1;
            ctx.replay.clear();
        }

        Ok(self.result(kind))
    }

    /// The current context has no lines left.
    fn finish_block(&mut self, top: usize) -> Result<StepResult, RuntimeError> {
        let kind = self.stack[top].kind;

        if kind.is_loop() {
            self.replay_cursor = 0;
            match self.loop_continues(top)? {
                Some(true) => {
                    self.stack[top].restart();
                    self.check_iterations(top)?;
                }
                Some(false) => self.pop_context(),
                None => {}
            }
            return Ok(self.result(kind));
        }

        if self.stack.len() == 1 {
            self.stack.pop();
            self.running = false;
            self.trace(format_args!("program complete"));
            return Ok(StepResult::complete(Some(self.line)));
        }

        self.pop_context();
        Ok(self.result(kind))
    }

    /// Decide whether an exhausted loop runs again. `None` means a call in
    /// the loop header is still in progress.
    fn loop_continues(&mut self, top: usize) -> Result<Option<bool>, RuntimeError> {
        let Some(loop_ref) = self.stack[top].loop_ref.clone() else {
            return Ok(Some(false));
        };

        match loop_ref {
            LoopRef::While(stmt) => {
                self.line = stmt.condition.line;
                Ok(self.eval(&stmt.condition)?.map(|v| v.is_truthy()))
            }
            LoopRef::For(stmt) => {
                if !self.stack[top].increment_done {
                    if let Some(increment) = &stmt.increment {
                        self.line = increment.line;
                        if let Flow::Suspended = self.execute(increment)? {
                            return Ok(None);
                        }
                    }
                    let ctx = &mut self.stack[top];
                    ctx.increment_done = true;
                    ctx.replay.clear();
                    self.replay_cursor = 0;
                }
                match &stmt.condition {
                    Some(condition) => {
                        self.line = condition.line;
                        Ok(self.eval(condition)?.map(|v| v.is_truthy()))
                    }
                    None => Ok(Some(true)),
                }
            }
        }
    }

    fn check_iterations(&self, index: usize) -> Result<(), RuntimeError> {
        match self.config.max_loop_iterations {
            Some(max) if self.stack[index].iterations > max => Err(RuntimeError::LoopLimit(max)),
            _ => Ok(()),
        }
    }

    /// Pop the current context and hand control back to its parent.
    fn pop_context(&mut self) {
        let Some(ctx) = self.stack.pop() else {
            return;
        };
        self.trace(format_args!("leave {} opened at line {}", ctx.kind.name(), ctx.line));
        if let Some(parent) = self.stack.last_mut() {
            match ctx.resume {
                Resume::Advance => {
                    parent.cursor += 1;
                    parent.replay.clear();
                }
                Resume::Replay => parent.replay.push(ctx.return_value.unwrap_or(Value::Null)),
            }
        }
    }

    fn push_block(&mut self, kind: ContextKind, lines: &Block, line: usize, loop_ref: Option<LoopRef>) -> Result<(), RuntimeError> {
        let parent = self.stack.len().checked_sub(1);
        if let Some(ctx) = self.stack.last_mut() {
            ctx.replay.clear();
        }

        let mut ctx = Context::new(kind, Rc::clone(lines), parent, line);
        if let Some(loop_ref) = loop_ref {
            ctx = ctx.with_loop(loop_ref);
        }
        self.stack.push(ctx);

        if kind.is_loop() {
            self.check_iterations(self.stack.len() - 1)?;
        }
        Ok(())
    }

    fn execute(&mut self, stmt: &Statement) -> Result<Flow, RuntimeError> {
        match &stmt.kind {
            StatementKind::VarDecl { ty, name, init } => {
                let value = match init {
                    Some(expr) => match self.eval(expr)? {
                        Some(v) => v,
                        None => return Ok(Flow::Suspended),
                    },
                    None => Value::Null,
                };
                self.declare(name, ty, value);
                Ok(Flow::Done)
            }

            StatementKind::Assignment { name, value } => {
                let Some(value) = self.eval(value)? else {
                    return Ok(Flow::Suspended);
                };
                self.assign(name, value);
                Ok(Flow::Done)
            }

            // registered by `initialize`
            StatementKind::FunctionDecl(_) | StatementKind::ClassDecl { .. } => Ok(Flow::Done),

            StatementKind::Call(call) => {
                let Some(args) = self.eval_args(&call.args)? else {
                    return Ok(Flow::Suspended);
                };
                match self.invoke(call, args, Resume::Advance)? {
                    Invocation::Value(_) => Ok(Flow::Done),
                    Invocation::Entered => Ok(Flow::Pushed),
                }
            }

            StatementKind::If(stmt_if) => {
                let Some(condition) = self.eval(&stmt_if.condition)? else {
                    return Ok(Flow::Suspended);
                };
                if condition.is_truthy() {
                    self.push_block(ContextKind::IfThen, &stmt_if.then_block, stmt.line, None)?;
                    return Ok(Flow::Pushed);
                }
                for (cond, block) in &stmt_if.else_ifs {
                    let Some(value) = self.eval(cond)? else {
                        return Ok(Flow::Suspended);
                    };
                    if value.is_truthy() {
                        self.push_block(ContextKind::IfElseIf, block, cond.line, None)?;
                        return Ok(Flow::Pushed);
                    }
                }
                match &stmt_if.else_block {
                    Some(block) => {
                        self.push_block(ContextKind::IfElse, block, stmt.line, None)?;
                        Ok(Flow::Pushed)
                    }
                    None => Ok(Flow::Done),
                }
            }

            StatementKind::While(stmt_while) => {
                let Some(condition) = self.eval(&stmt_while.condition)? else {
                    return Ok(Flow::Suspended);
                };
                if !condition.is_truthy() {
                    return Ok(Flow::Done);
                }
                let loop_ref = LoopRef::While(Rc::clone(stmt_while));
                self.push_block(ContextKind::While, &stmt_while.body, stmt.line, Some(loop_ref))?;
                Ok(Flow::Pushed)
            }

            StatementKind::For(stmt_for) => {
                if let Some(init) = &stmt_for.init {
                    if let Flow::Suspended = self.execute(init)? {
                        return Ok(Flow::Suspended);
                    }
                }
                let proceed = match &stmt_for.condition {
                    Some(condition) => match self.eval(condition)? {
                        Some(v) => v.is_truthy(),
                        None => return Ok(Flow::Suspended),
                    },
                    None => true,
                };
                if !proceed {
                    return Ok(Flow::Done);
                }
                let loop_ref = LoopRef::For(Rc::clone(stmt_for));
                self.push_block(ContextKind::For, &stmt_for.body, stmt.line, Some(loop_ref))?;
                Ok(Flow::Pushed)
            }

            StatementKind::Switch(stmt_switch) => {
                let Some(subject) = self.eval(&stmt_switch.subject)? else {
                    return Ok(Flow::Suspended);
                };
                let body = stmt_switch
                    .cases
                    .iter()
                    .find(|case| Value::from_literal(&case.value.kind).as_ref() == Some(&subject))
                    .map(|case| &case.body)
                    .or(stmt_switch.default.as_ref());
                match body {
                    Some(body) => {
                        self.push_block(ContextKind::SwitchCase, body, stmt.line, None)?;
                        Ok(Flow::Pushed)
                    }
                    None => Ok(Flow::Done),
                }
            }

            // Runtime faults halt the engine, so only the body ever runs.
            StatementKind::TryCatch { body, .. } => {
                self.push_block(ContextKind::Try, body, stmt.line, None)?;
                Ok(Flow::Pushed)
            }

            StatementKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => match self.eval(expr)? {
                        Some(v) => v,
                        None => return Ok(Flow::Suspended),
                    },
                    None => Value::Null,
                };
                self.unwind_return(value)?;
                Ok(Flow::Unwound)
            }

            StatementKind::Break => {
                let target = self.loop_target(true).ok_or(RuntimeError::BreakOutsideLoop)?;
                self.stack.truncate(target + 1);
                self.pop_context();
                Ok(Flow::Unwound)
            }

            StatementKind::Continue => {
                let target = self.loop_target(false).ok_or(RuntimeError::ContinueOutsideLoop)?;
                self.stack.truncate(target + 1);
                self.stack[target].exhaust();
                Ok(Flow::Unwound)
            }

            StatementKind::ErrorPlaceholder(message) => Err(RuntimeError::UnparsedLine(message.clone())),
        }
    }

    /// Indices from the current context out to `main`, following `parent`.
    fn chain(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.stack.len().checked_sub(1), move |&i| self.stack[i].parent)
    }

    /// Nearest loop (or, for `break`, switch case) that can be left without
    /// crossing a function or method boundary.
    fn loop_target(&self, include_switch: bool) -> Option<usize> {
        for i in self.chain() {
            let kind = self.stack[i].kind;
            if kind.is_loop() || (include_switch && kind == ContextKind::SwitchCase) {
                return Some(i);
            }
            if kind.is_routine() {
                return None;
            }
        }
        None
    }

    fn unwind_return(&mut self, value: Value) -> Result<(), RuntimeError> {
        let target = self
            .chain()
            .find(|&i| self.stack[i].kind.is_routine())
            .ok_or(RuntimeError::ReturnOutsideFunction)?;

        self.stack.truncate(target + 1);
        let ctx = &mut self.stack[target];
        ctx.return_value = Some(value);
        ctx.has_returned = true;
        self.pop_context();
        Ok(())
    }

    fn scope_index(&self) -> Option<usize> {
        self.chain().find(|&i| self.stack[i].bindings.is_some())
    }

    fn lookup(&self, name: &str) -> Result<Value, RuntimeError> {
        let local = self
            .scope_index()
            .and_then(|i| self.stack[i].bindings.as_ref())
            .and_then(|bindings| bindings.get(name));

        local
            .or_else(|| self.globals.get(name))
            .map(|binding| binding.value.clone())
            .ok_or_else(|| RuntimeError::UndefinedVariable(name.to_string()))
    }

    /// Bind in the innermost function or method scope, else globally.
    fn declare(&mut self, name: &str, ty: &str, value: Value) {
        let binding = Binding { ty: ty.to_string(), value };
        match self.scope_index() {
            Some(i) => {
                if let Some(bindings) = self.stack[i].bindings.as_mut() {
                    bindings.insert(name.to_string(), binding);
                }
            }
            None => {
                self.globals.insert(name.to_string(), binding);
            }
        }
    }

    fn assign(&mut self, name: &str, value: Value) {
        if let Some(i) = self.scope_index() {
            if let Some(binding) = self.stack[i].bindings.as_mut().and_then(|b| b.get_mut(name)) {
                binding.value = value;
                return;
            }
        }
        if let Some(binding) = self.globals.get_mut(name) {
            binding.value = value;
            return;
        }
        let ty = value.type_name();
        self.declare(name, ty, value);
    }

    /// Evaluate an expression. `Ok(None)` means a user routine was entered
    /// and the enclosing statement must wait for it.
    fn eval(&mut self, expr: &Expr) -> Result<Option<Value>, RuntimeError> {
        let value = match &expr.kind {
            ExprKind::Number(n) => Value::Number(*n),
            ExprKind::Str(s) => Value::Str(s.clone()),
            ExprKind::Bool(b) => Value::Bool(*b),
            ExprKind::Null => Value::Null,
            ExprKind::Identifier(name) => self.lookup(name)?,
            ExprKind::Binary { op, left, right } => {
                let Some(left) = self.eval(left)? else {
                    return Ok(None);
                };
                let Some(right) = self.eval(right)? else {
                    return Ok(None);
                };
                apply_binary(*op, &left, &right)?
            }
            ExprKind::Call(call) => return self.eval_call(call),
        };
        Ok(Some(value))
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Option<Vec<Value>>, RuntimeError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match self.eval(arg)? {
                Some(v) => values.push(v),
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    /// Calls inside expressions are recorded on the current context, so
    /// re-running the statement after a routine returns reuses earlier
    /// results instead of dispatching the same command twice.
    fn eval_call(&mut self, call: &Call) -> Result<Option<Value>, RuntimeError> {
        let Some(args) = self.eval_args(&call.args)? else {
            return Ok(None);
        };

        if let Some(value) = self.take_replayed() {
            return Ok(Some(value));
        }

        match self.invoke(call, args, Resume::Replay)? {
            Invocation::Value(value) => {
                if let Some(ctx) = self.stack.last_mut() {
                    ctx.replay.push(value.clone());
                    self.replay_cursor += 1;
                }
                Ok(Some(value))
            }
            Invocation::Entered => Ok(None),
        }
    }

    fn take_replayed(&mut self) -> Option<Value> {
        let value = self.stack.last()?.replay.get(self.replay_cursor)?.clone();
        self.replay_cursor += 1;
        Some(value)
    }

    fn invoke(&mut self, call: &Call, args: Vec<Value>, resume: Resume) -> Result<Invocation, RuntimeError> {
        match &call.target {
            CallTarget::Implicit => {
                if let Some(builtin) = Builtin::from_name(&call.name) {
                    let agent = self.implicit_agent(&call.name)?;
                    return self.dispatch(builtin, &agent, args.len()).map(Invocation::Value);
                }
                let decl = self
                    .functions
                    .get(&call.name)
                    .cloned()
                    .ok_or_else(|| RuntimeError::UndefinedFunction(call.name.clone()))?;
                self.enter(ContextKind::Function, &decl, args, None, resume)?;
                Ok(Invocation::Entered)
            }
            CallTarget::Named(object) => {
                if !self.registry.contains(object) {
                    return Err(RuntimeError::UnknownAgent(object.clone()));
                }
                self.invoke_on(object.clone(), call, args, resume)
            }
            CallTarget::SelfRef => {
                let agent = self.nearest_agent().ok_or(RuntimeError::SelfOutsideMethod)?;
                self.invoke_on(agent, call, args, resume)
            }
        }
    }

    fn invoke_on(&mut self, agent: String, call: &Call, args: Vec<Value>, resume: Resume) -> Result<Invocation, RuntimeError> {
        if let Some(builtin) = Builtin::from_name(&call.name) {
            return self.dispatch(builtin, &agent, args.len()).map(Invocation::Value);
        }

        let decl = self
            .methods
            .get(&call.name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedMethod(call.name.clone()))?;

        if self.registry.get(&agent).is_some_and(|a| a.is_crashed()) {
            self.trace(format_args!("skipping {}.{}(): agent crashed", agent, call.name));
            return Ok(Invocation::Value(Value::Null));
        }

        self.enter(ContextKind::Method, &decl, args, Some(agent), resume)?;
        Ok(Invocation::Entered)
    }

    /// Agent bound by the nearest enclosing method call, if any.
    fn nearest_agent(&self) -> Option<String> {
        self.chain().find_map(|i| self.stack[i].agent.clone())
    }

    fn implicit_agent(&self, command: &str) -> Result<String, RuntimeError> {
        self.nearest_agent()
            .or_else(|| self.registry.default_name().map(String::from))
            .ok_or_else(|| RuntimeError::NoDefaultAgent(command.to_string()))
    }

    fn dispatch(&mut self, builtin: Builtin, agent_name: &str, argc: usize) -> Result<Value, RuntimeError> {
        if argc != builtin.arity() {
            return Err(RuntimeError::ArityMismatch {
                name: builtin.name().to_string(),
                expected: builtin.arity(),
                got: argc,
            });
        }

        let agent = self
            .registry
            .get_mut(agent_name)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent_name.to_string()))?;
        let value = builtin.invoke(&mut **agent);

        self.command = Some(builtin.name());
        if builtin.is_delayed() {
            self.delayed = true;
        }
        self.trace(format_args!("{}.{}() -> {}", agent_name, builtin.name(), value));
        Ok(value)
    }

    fn enter(
        &mut self,
        kind: ContextKind,
        decl: &FunctionDecl,
        args: Vec<Value>,
        agent: Option<String>,
        resume: Resume,
    ) -> Result<(), RuntimeError> {
        if args.len() != decl.params.len() {
            return Err(RuntimeError::ArityMismatch {
                name: decl.name.clone(),
                expected: decl.params.len(),
                got: args.len(),
            });
        }

        let parent = self.stack.len().checked_sub(1);
        if resume == Resume::Advance {
            if let Some(ctx) = self.stack.last_mut() {
                ctx.replay.clear();
            }
        }

        let mut ctx = Context::new(kind, Rc::clone(&decl.body), parent, decl.line)
            .with_agent(agent)
            .with_resume(resume);
        if let Some(bindings) = ctx.bindings.as_mut() {
            for (param, value) in decl.params.iter().zip(args) {
                bindings.insert(param.name.clone(), Binding { ty: param.ty.clone(), value });
            }
        }

        self.trace(format_args!("enter {} '{}' at depth {}", kind.name(), decl.name, self.stack.len() + 1));
        self.stack.push(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch::{Agent, Compass};
    use super::*;
    use crate::parser::parse;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Recorder {
        name: String,
        log: Log,
        fuel: Option<usize>,
        crashed: bool,
        heading: Compass,
    }

    impl Recorder {
        fn record(&self, what: &str) {
            self.log.borrow_mut().push(format!("{}.{}", self.name, what));
        }
    }

    impl Agent for Recorder {
        fn move_forward(&mut self) -> bool {
            if self.fuel == Some(0) {
                self.crash();
                return false;
            }
            if let Some(fuel) = self.fuel.as_mut() {
                *fuel -= 1;
            }
            self.record("moveForward");
            true
        }
        fn move_backward(&mut self) -> bool {
            self.record("moveBackward");
            true
        }
        fn turn_left(&mut self) {
            self.heading = self.heading.left();
            self.record("turnLeft");
        }
        fn turn_right(&mut self) {
            self.heading = self.heading.right();
            self.record("turnRight");
        }
        fn honk(&mut self) {
            self.record("honk");
        }
        fn crash(&mut self) {
            self.crashed = true;
        }
        fn is_crashed(&self) -> bool {
            self.crashed
        }
        fn is_road_ahead(&self) -> bool {
            true
        }
        fn is_cow_ahead(&self) -> bool {
            false
        }
        fn is_safe_to_move(&self) -> bool {
            !self.crashed
        }
        fn is_at_finish(&self) -> bool {
            false
        }
        fn current_direction(&self) -> Compass {
            self.heading
        }
        fn direction_to_finish(&self) -> Option<Compass> {
            None
        }
    }

    fn engine_with(source: &str, agents: &[(&str, Option<usize>)], config: EngineConfig) -> (Engine, Log) {
        let result = parse(source);
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = AgentRegistry::new();
        for (name, fuel) in agents {
            registry.register(
                name,
                Box::new(Recorder {
                    name: name.to_string(),
                    log: Rc::clone(&log),
                    fuel: *fuel,
                    crashed: false,
                    heading: Compass::North,
                }),
            );
        }

        let mut engine = Engine::new(config);
        engine.initialize(&result.program, registry);
        (engine, log)
    }

    fn engine_for(source: &str) -> (Engine, Log) {
        engine_with(source, &[("mainCar", None)], EngineConfig::default())
    }

    fn run(engine: &mut Engine) -> Vec<StepResult> {
        let mut results = Vec::new();
        for _ in 0..10_000 {
            let result = engine.step();
            let finished = result.is_finished();
            results.push(result);
            if finished {
                break;
            }
        }
        results
    }

    fn statuses(results: &[StepResult]) -> Vec<StepStatus> {
        results.iter().map(|r| r.status).collect()
    }

    fn count(log: &Log, entry: &str) -> usize {
        log.borrow().iter().filter(|e| *e == entry).count()
    }

    use StepStatus::{Complete, Continue, Paused};

    #[test]
    fn test_for_loop_pauses_after_each_move() {
        let (mut engine, log) = engine_for("for (int i = 0; i < 3; i = i + 1) { moveForward(); }");

        let mut results = Vec::new();
        for _ in 0..7 {
            results.push(engine.step());
        }
        assert_eq!(
            statuses(&results),
            vec![Continue, Paused, Continue, Paused, Continue, Paused, Continue]
        );
        for paused in results.iter().filter(|r| r.status == Paused) {
            assert_eq!(paused.command_name.as_deref(), Some("moveForward"));
            assert_eq!(paused.context_kind, Some("for"));
        }

        // the loop context has been popped
        assert_eq!(engine.context_depth(), 1);
        assert_eq!(engine.current_context_kind(), Some(ContextKind::Main));
        assert_eq!(engine.step().status, Complete);
        assert_eq!(count(&log, "mainCar.moveForward"), 3);
        assert_eq!(engine.variables().get("i"), Some(&Value::Number(3.0)));
    }

    #[test]
    fn test_while_example_moves_twice() {
        let (mut engine, log) = engine_for("int x = 2; while (x > 0) { moveForward(); x = x - 1; }");
        let results = run(&mut engine);
        assert_eq!(results.last().map(|r| r.status), Some(Complete));
        assert_eq!(statuses(&results).iter().filter(|s| **s == Paused).count(), 2);
        assert_eq!(*log.borrow(), vec!["mainCar.moveForward", "mainCar.moveForward"]);
    }

    #[test]
    fn test_stepping_is_deterministic() {
        let source = "int n = 0;\nwhile (n < 4) {\n  if (n % 2 == 0) { turnLeft(); } else { moveForward(); }\n  n = n + 1;\n}";
        let (mut first, first_log) = engine_for(source);
        let (mut second, second_log) = engine_for(source);
        assert_eq!(statuses(&run(&mut first)), statuses(&run(&mut second)));
        assert_eq!(*first_log.borrow(), *second_log.borrow());
        assert_eq!(first.variables(), second.variables());
    }

    #[test]
    fn test_crashed_agent_is_skipped() {
        let source = "carA.moveForward();\ncarA.moveForward();\ncarA.moveForward();\ncarB.moveForward();\ncarB.moveForward();";
        let (mut engine, log) = engine_with(source, &[("carA", Some(1)), ("carB", None)], EngineConfig::default());
        let results = run(&mut engine);
        assert_eq!(statuses(&results), vec![Paused, Paused, Paused, Paused, Paused, Complete]);
        assert_eq!(
            *log.borrow(),
            vec!["carA.moveForward", "carB.moveForward", "carB.moveForward"]
        );
        assert!(engine.registry().get("carA").is_some_and(|a| a.is_crashed()));
        assert!(!engine.registry().get("carB").is_some_and(|a| a.is_crashed()));
    }

    #[test]
    fn test_all_crashed_completes_immediately() {
        let source = "carA.moveForward();\ncarB.moveForward();\ncarB.moveForward();\ncarB.turnLeft();\ncarB.turnLeft();";
        let (mut engine, log) = engine_with(source, &[("carA", Some(0)), ("carB", Some(1))], EngineConfig::default());
        let results = run(&mut engine);
        assert_eq!(statuses(&results), vec![Paused, Paused, Complete]);
        assert_eq!(count(&log, "carB.turnLeft"), 0);
        assert_eq!(engine.step().status, Complete);
    }

    #[test]
    fn test_self_resolves_to_the_receiver() {
        let source = "class Car {\n  void customTurnAround() {\n    self.turnLeft();\n    self.turnLeft();\n  }\n  void spin() {\n    self.customTurnAround();\n  }\n}\ncarA.customTurnAround();\ncarB.customTurnAround();\ncarB.spin();";
        let (mut engine, log) = engine_with(source, &[("carA", None), ("carB", None)], EngineConfig::default());
        let results = run(&mut engine);
        assert_eq!(results.last().map(|r| r.status), Some(Complete));
        assert_eq!(
            *log.borrow(),
            vec![
                "carA.turnLeft",
                "carA.turnLeft",
                "carB.turnLeft",
                "carB.turnLeft",
                "carB.turnLeft",
                "carB.turnLeft",
            ]
        );
        assert_eq!(
            engine.registry().get("carA").map(|a| a.current_direction()),
            Some(Compass::South)
        );
    }

    #[test]
    fn test_bare_command_in_method_targets_receiver() {
        let source = "class Car { void shout() { honk(); } }\ncarB.shout();";
        let (mut engine, log) = engine_with(source, &[("carA", None), ("carB", None)], EngineConfig::default());
        run(&mut engine);
        assert_eq!(*log.borrow(), vec!["carB.honk"]);
    }

    #[test]
    fn test_method_on_crashed_agent_is_skipped() {
        let source = "class Car { void go() { self.moveForward(); } }\ncarA.moveForward();\ncarA.go();\ncarB.go();";
        let (mut engine, log) = engine_with(source, &[("carA", Some(0)), ("carB", None)], EngineConfig::default());
        let results = run(&mut engine);
        assert_eq!(results.last().map(|r| r.status), Some(Complete));
        assert_eq!(*log.borrow(), vec!["carB.moveForward"]);
    }

    #[test]
    fn test_break_and_continue() {
        let source = "int n = 0;\nwhile (true) {\n  n = n + 1;\n  if (n == 2) { continue; }\n  if (n > 3) { break; }\n  moveForward();\n}\nhonk();";
        let (mut engine, log) = engine_for(source);
        let results = run(&mut engine);
        assert_eq!(results.last().map(|r| r.status), Some(Complete));
        assert_eq!(
            *log.borrow(),
            vec!["mainCar.moveForward", "mainCar.moveForward", "mainCar.honk"]
        );
        assert_eq!(engine.variables().get("n"), Some(&Value::Number(4.0)));
    }

    #[test]
    fn test_continue_in_for_runs_increment() {
        let source = "int hits = 0;\nfor (int i = 0; i < 4; i = i + 1) {\n  if (i % 2 == 1) { continue; }\n  hits = hits + 1;\n}";
        let (mut engine, _) = engine_for(source);
        run(&mut engine);
        assert_eq!(engine.variables().get("hits"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_return_from_inside_loop() {
        let source = "int third() {\n  int i = 0;\n  while (true) {\n    i = i + 1;\n    if (i == 3) { return i; }\n  }\n}\nint t = third();";
        let (mut engine, _) = engine_for(source);
        let results = run(&mut engine);
        assert_eq!(results.last().map(|r| r.status), Some(Complete));
        let vars = engine.variables();
        assert_eq!(vars.get("t"), Some(&Value::Number(3.0)));
        assert!(!vars.contains_key("i"));
    }

    #[test]
    fn test_calls_inside_expressions_resume() {
        let source = "int steps() { return 2; }\nint count = steps() + steps() + 1;\nfor (int i = 0; i < steps(); i = i + 1) { moveForward(); }";
        let (mut engine, log) = engine_for(source);
        let results = run(&mut engine);
        assert_eq!(results.last().map(|r| r.status), Some(Complete));
        assert_eq!(engine.variables().get("count"), Some(&Value::Number(5.0)));
        assert_eq!(count(&log, "mainCar.moveForward"), 2);
    }

    #[test]
    fn test_visible_command_in_called_function_runs_once() {
        let source = "bool go() {\n  moveForward();\n  return isRoadAhead();\n}\nbool ok = go();\nif (go()) { honk(); }";
        let (mut engine, log) = engine_for(source);
        run(&mut engine);
        assert_eq!(
            *log.borrow(),
            vec!["mainCar.moveForward", "mainCar.moveForward", "mainCar.honk"]
        );
        assert_eq!(engine.variables().get("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_parameters_are_local() {
        let source = "int twice(int n) { int r = n * 2; return r; }\nint n = 5;\nint m = twice(n + 1);";
        let (mut engine, _) = engine_for(source);
        run(&mut engine);
        let vars = engine.variables();
        assert_eq!(vars.get("m"), Some(&Value::Number(12.0)));
        assert_eq!(vars.get("n"), Some(&Value::Number(5.0)));
        assert!(!vars.contains_key("r"));
    }

    #[test]
    fn test_routines_are_hoisted() {
        let (mut engine, log) = engine_for("go();\nvoid go() { honk(); }");
        run(&mut engine);
        assert_eq!(*log.borrow(), vec!["mainCar.honk"]);
    }

    #[test]
    fn test_switch_picks_matching_case() {
        let source = "int d = 2;\nswitch (d) {\n  case 1: turnLeft(); break;\n  case 2: turnRight(); break;\n  default: honk();\n}\nswitch (\"x\") { case 1: turnLeft(); break; default: honk(); }";
        let (mut engine, log) = engine_for(source);
        run(&mut engine);
        assert_eq!(*log.borrow(), vec!["mainCar.turnRight", "mainCar.honk"]);
    }

    #[test]
    fn test_loop_limit_faults() {
        let config = EngineConfig { max_loop_iterations: Some(5), trace: false };
        let (mut engine, log) = engine_with("while (true) { turnLeft(); }", &[("mainCar", None)], config);
        let results = run(&mut engine);
        let last = results.last().unwrap();
        assert_eq!(last.status, StepStatus::Error);
        assert_eq!(last.error.as_deref(), Some("Line 1: loop exceeded 5 iterations"));
        assert_eq!(count(&log, "mainCar.turnLeft"), 5);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_unbounded_loops_by_default() {
        let (mut engine, _) = engine_for("while (true) { turnLeft(); }");
        for _ in 0..5_000 {
            assert!(!engine.step().is_finished());
        }
    }

    #[test]
    fn test_stop_completes() {
        let (mut engine, log) = engine_for("while (true) { moveForward(); }");
        engine.step();
        engine.step();
        engine.stop();
        assert_eq!(engine.step().status, Complete);
        assert_eq!(count(&log, "mainCar.moveForward"), 1);
    }

    #[test]
    fn test_self_outside_method_is_fatal() {
        let (mut engine, _) = engine_with("turnLeft();\nself.honk();", &[("carA", None), ("carB", None)], EngineConfig::default());
        let results = run(&mut engine);
        let last = results.last().unwrap();
        assert_eq!(last.status, StepStatus::Error);
        assert_eq!(
            last.error.as_deref(),
            Some("Line 2: cannot use 'self' outside of a method context")
        );
        assert_eq!(engine.step().status, Complete);
    }

    #[test]
    fn test_runtime_faults() {
        let cases = [
            ("void f(int a) { honk(); }\nf();", "Line 2: 'f' expects 1 argument(s), got 0"),
            ("int y = x + 1;", "Line 1: undefined variable 'x'"),
            ("int z = 4 / 0;", "Line 1: division by zero"),
            ("fly();", "Line 1: undefined function 'fly'"),
            ("honk(1);", "Line 1: 'honk' expects 0 argument(s), got 1"),
            ("ghost.honk();", "Line 1: unknown car 'ghost'"),
        ];
        for (source, expected) in cases {
            let (mut engine, _) = engine_for(source);
            let last = run(&mut engine).pop().unwrap();
            assert_eq!(last.error.as_deref(), Some(expected), "source {:?}", source);
        }
    }

    #[test]
    fn test_break_cannot_leave_a_function() {
        let (mut engine, _) = engine_for("void f() { break; }\nwhile (true) { f(); }");
        let last = run(&mut engine).pop().unwrap();
        assert_eq!(last.error.as_deref(), Some("Line 1: 'break' used outside of a loop"));
    }

    #[test]
    fn test_unparsed_line_is_fatal() {
        let result = parse("honk();\nint = 3;\nhonk();");
        assert_eq!(result.errors.len(), 1);
        let mut registry = AgentRegistry::new();
        registry.register(
            "mainCar",
            Box::new(Recorder {
                name: "mainCar".into(),
                log: Rc::new(RefCell::new(Vec::new())),
                fuel: None,
                crashed: false,
                heading: Compass::North,
            }),
        );
        let mut engine = Engine::new(EngineConfig::default());
        engine.initialize(&result.program, registry);
        let results = run(&mut engine);
        assert_eq!(statuses(&results), vec![Paused, StepStatus::Error]);
        assert_eq!(results[1].current_line, Some(2));
    }

    #[test]
    fn test_fresh_loop_context_per_entry() {
        let source = "for (int i = 0; i < 2; i = i + 1) {\n  while (false) { honk(); }\n  turnLeft();\n}";
        let (mut engine, _) = engine_for(source);
        let mut seen: Vec<LoopRef> = Vec::new();
        loop {
            let result = engine.step();
            if let Some(loop_ref) = engine.contexts().last().and_then(|c| c.loop_ref.clone()) {
                if !seen.iter().any(|s| s.same_loop(&loop_ref)) {
                    seen.push(loop_ref);
                }
            }
            if result.is_finished() {
                break;
            }
        }
        // the inner while never runs, only the for loop gets a context
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], LoopRef::For(_)));
    }

    #[test]
    fn test_long_operator_chain_evaluates() {
        let source = format!("int x = 1{};", " + 1".repeat(40));
        let (mut engine, _) = engine_for(&source);
        run(&mut engine);
        assert_eq!(engine.variables().get("x"), Some(&Value::Number(41.0)));
    }

    #[test]
    fn test_contexts_remember_their_opening_line() {
        let source = "int n = 1;\nwhile (n > 0) {\n  n = n - 1;\n  honk();\n}";
        let (mut engine, _) = engine_for(source);
        engine.step();
        engine.step();
        assert_eq!(engine.current_context_kind(), Some(ContextKind::While));
        assert_eq!(engine.contexts().last().map(|c| c.line), Some(2));
    }
}
