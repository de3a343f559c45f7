use std::fmt;
use std::rc::Rc;

/// Statement sequences are shared between the tree and live execution
/// contexts, so blocks are reference-counted slices.
pub type Block = Rc<[Line]>;

#[derive(Debug, Clone)]
pub struct Program {
    pub lines: Vec<Line>,
}

/// One logical source line: a statement, a trailing comment, or both.
#[derive(Debug, Clone)]
pub struct Line {
    pub statement: Option<Statement>,
    pub comment: Option<String>,
    pub line: usize,
}

impl Line {
    pub fn is_comment_only(&self) -> bool {
        self.statement.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    VarDecl {
        ty: String,
        name: String,
        init: Option<Expr>,
    },

    Assignment {
        name: String,
        value: Expr,
    },

    FunctionDecl(Rc<FunctionDecl>),

    ClassDecl {
        name: String,
        methods: Vec<Rc<FunctionDecl>>,
    },

    Call(Call),

    If(IfStmt),

    While(Rc<WhileStmt>),

    For(Rc<ForStmt>),

    Switch(SwitchStmt),

    TryCatch {
        body: Block,
        error_name: String,
        handler: Block,
    },

    Return(Option<Expr>),

    Break,

    Continue,

    /// Stands in for input the parser had to skip.
    ErrorPlaceholder(String),
}

impl StatementKind {
    pub fn name(&self) -> &'static str {
        match self {
            StatementKind::VarDecl { .. } => "VariableDeclaration",
            StatementKind::Assignment { .. } => "Assignment",
            StatementKind::FunctionDecl(_) => "FunctionDeclaration",
            StatementKind::ClassDecl { .. } => "ClassDeclaration",
            StatementKind::Call(call) if call.target == CallTarget::Implicit => "FunctionCall",
            StatementKind::Call(_) => "MethodCall",
            StatementKind::If(_) => "IfStatement",
            StatementKind::While(_) => "WhileStatement",
            StatementKind::For(_) => "ForStatement",
            StatementKind::Switch(_) => "SwitchStatement",
            StatementKind::TryCatch { .. } => "TryCatch",
            StatementKind::Return(_) => "ReturnStatement",
            StatementKind::Break => "BreakStatement",
            StatementKind::Continue => "ContinueStatement",
            StatementKind::ErrorPlaceholder(_) => "Error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub ty: String,
    pub name: String,
}

/// A function, or a method when it appears inside a class body.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub return_type: String,
    pub name: String,
    pub params: Vec<Param>,
    pub body: Block,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct IfStmt {
    pub condition: Expr,
    pub then_block: Block,
    pub else_ifs: Vec<(Expr, Block)>,
    pub else_block: Option<Block>,
}

#[derive(Debug, Clone)]
pub struct WhileStmt {
    pub condition: Expr,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct ForStmt {
    pub init: Option<Box<Statement>>,
    pub condition: Option<Expr>,
    pub increment: Option<Box<Statement>>,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub struct SwitchStmt {
    pub subject: Expr,
    pub cases: Vec<SwitchCase>,
    pub default: Option<Block>,
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: Expr,
    pub body: Block,
}

/// Who receives a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// `name(args)`
    Implicit,
    /// `car.name(args)`
    Named(String),
    /// `self.name(args)`
    SelfRef,
}

impl CallTarget {
    pub fn is_qualified(&self) -> bool {
        !matches!(self, CallTarget::Implicit)
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub target: CallTarget,
    pub name: String,
    pub args: Vec<Expr>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            CallTarget::Implicit => write!(f, "{}()", self.name),
            CallTarget::Named(object) => write!(f, "{}.{}()", object, self.name),
            CallTarget::SelfRef => write!(f, "self.{}()", self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call(Call),
}

impl ExprKind {
    pub fn is_true_literal(&self) -> bool {
        matches!(self, ExprKind::Bool(true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}
