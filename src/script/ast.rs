//! Syntax tree produced by the parser.

use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Let {
        name: String,
        value: Option<Expression>,
        constant: bool,
    },
    Expression(Expression),
    If {
        condition: Expression,
        then_branch: Box<Statement>,
        else_branch: Option<Box<Statement>>,
    },
    ForOf {
        name: String,
        iterable: Expression,
        body: Box<Statement>,
    },
    Return(Option<Expression>),
    Break,
    Continue,
    Throw(Expression),
    Block(Vec<Statement>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Vec<Statement>),
    /// Arrow function with an expression body.
    Expression(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: FunctionBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    NotEqual,
    StrictEqual,
    StrictNotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateSegment {
    Text(String),
    Expr(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Template(Vec<TemplateSegment>),
    Regex {
        pattern: String,
        flags: String,
    },
    Array(Vec<Expression>),
    Object(Vec<(String, Expression)>),
    Identifier(String),
    Member {
        object: Box<Expression>,
        property: String,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Call {
        callee: Box<Expression>,
        args: Vec<Expression>,
    },
    Function(Rc<FunctionDef>),
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expression>,
        value: Box<Expression>,
    },
}

impl Expression {
    /// Short source-like rendering used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Expression::Identifier(name) => name.clone(),
            Expression::Member { object, property } => {
                format!("{}.{}", object.describe(), property)
            }
            Expression::Index { object, .. } => format!("{}[...]", object.describe()),
            Expression::Call { callee, .. } => format!("{}(...)", callee.describe()),
            Expression::Str(s) => format!("{s:?}"),
            Expression::Number(n) => n.to_string(),
            _ => "expression".to_string(),
        }
    }
}
