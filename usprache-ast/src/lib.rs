#![forbid(unsafe_code)]

mod builder;

pub use builder::ProgramBuilder;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a construct in the program sources.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SrcLoc {
    pub file_index: u32,
    pub line: u32,
    pub column: u32,
}

impl SrcLoc {
    pub fn new(file_index: u32, line: u32, column: u32) -> Self {
        Self {
            file_index,
            line,
            column,
        }
    }

    pub fn at(line: u32, column: u32) -> Self {
        Self::new(0, line, column)
    }
}

impl fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_index, self.line, self.column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mutability {
    Imut,
    Mut,
}

impl Mutability {
    pub fn is_mut(self) -> bool {
        matches!(self, Mutability::Mut)
    }
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::Imut => f.write_str("imut"),
            Mutability::Mut => f.write_str("mut"),
        }
    }
}

/// Index into a [`TypeTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineKind {
    Generator,
    Async,
}

/// Coroutine function: `ret` is the coroutine object, `yields` is what
/// `yield` and `return` inside the body hand out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoroutineDecl {
    pub kind: CoroutineKind,
    pub yields: ReturnDecl,
}

/// Inner reference tags of a type whose layout is only known after template
/// instantiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InnerReferenceCount {
    Unresolved,
    /// One entry per tag, in tag order.
    Resolved(Vec<Mutability>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeId,
    /// `Some` for reference fields.
    pub reference: Option<Mutability>,
    /// Tag letters attached to the field, e.g. `"a"` or `"ba"`.
    pub tags: Option<String>,
    pub loc: SrcLoc,
}

impl FieldDecl {
    pub fn value(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
            reference: None,
            tags: None,
            loc: SrcLoc::default(),
        }
    }

    pub fn reference(name: impl Into<String>, ty: TypeId, mutability: Mutability) -> Self {
        Self {
            reference: Some(mutability),
            ..Self::value(name, ty)
        }
    }

    pub fn tagged(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SrcLoc::at(line, column);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    /// Explicitly declared tag set of the whole struct.
    pub tags: Option<String>,
    pub loc: SrcLoc,
}

impl StructDecl {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDecl>) -> Self {
        Self {
            name: name.into(),
            fields,
            tags: None,
            loc: SrcLoc::default(),
        }
    }

    pub fn tagged(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SrcLoc::at(line, column);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Fundamental,
    Struct(StructDecl),
    Tuple(Vec<TypeId>),
    Array { element: TypeId, len: u64 },
    /// Template-dependent type with an externally supplied tag count.
    Dependent(InnerReferenceCount),
    Coroutine {
        kind: CoroutineKind,
        inner_references: Vec<Mutability>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeTable {
    types: Vec<TypeDef>,
}

impl TypeTable {
    pub fn push(&mut self, def: TypeDef) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(def);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeDef> {
        self.types.get(id.index())
    }

    pub fn name(&self, id: TypeId) -> &str {
        self.get(id).map(|d| d.name.as_str()).unwrap_or("<unknown>")
    }

    pub fn struct_decl(&self, id: TypeId) -> Option<&StructDecl> {
        match self.get(id).map(|d| &d.kind) {
            Some(TypeKind::Struct(decl)) => Some(decl),
            _ => None,
        }
    }

    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|d| d.name == name)
            .map(|i| TypeId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, d)| (TypeId(i as u32), d))
    }
}

/// Reference notation as written in a function signature, before validation.
///
/// Param references are written as a param digit followed by `_` (the param
/// itself), a tag letter, or `...` (every tag of the param type):
/// `"0_"`, `"1a"`, `"0..."`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawNotation {
    pub pollution: Vec<RawPollution>,
    pub return_references: Option<Vec<String>>,
    pub return_inner_references: Option<Vec<Vec<String>>>,
    pub loc: SrcLoc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPollution {
    pub dst: String,
    pub src: String,
    pub mutability: Mutability,
}

impl RawNotation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pollution(
        mut self,
        dst: impl Into<String>,
        src: impl Into<String>,
        mutability: Mutability,
    ) -> Self {
        self.pollution.push(RawPollution {
            dst: dst.into(),
            src: src.into(),
            mutability,
        });
        self
    }

    pub fn return_references<S: Into<String>>(mut self, refs: impl IntoIterator<Item = S>) -> Self {
        self.return_references = Some(refs.into_iter().map(Into::into).collect());
        self
    }

    /// Adds the sources for the next inner reference tag of the return value.
    pub fn return_inner<S: Into<String>>(mut self, refs: impl IntoIterator<Item = S>) -> Self {
        self.return_inner_references
            .get_or_insert_with(Vec::new)
            .push(refs.into_iter().map(Into::into).collect());
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SrcLoc::at(line, column);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeId,
    /// `Some` for reference params.
    pub reference: Option<Mutability>,
    /// Mutability of the local variable of a value param.
    pub mutability: Mutability,
    pub loc: SrcLoc,
}

impl ParamDecl {
    pub fn value(name: impl Into<String>, ty: TypeId, mutability: Mutability) -> Self {
        Self {
            name: name.into(),
            ty,
            reference: None,
            mutability,
            loc: SrcLoc::default(),
        }
    }

    pub fn reference(name: impl Into<String>, ty: TypeId, mutability: Mutability) -> Self {
        Self {
            name: name.into(),
            ty,
            reference: Some(mutability),
            mutability,
            loc: SrcLoc::default(),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReturnDecl {
    pub ty: TypeId,
    pub reference: Option<Mutability>,
}

impl ReturnDecl {
    pub fn value(ty: TypeId) -> Self {
        Self {
            ty,
            reference: None,
        }
    }

    pub fn reference(ty: TypeId, mutability: Mutability) -> Self {
        Self {
            ty,
            reference: Some(mutability),
        }
    }
}

/// Instantiation point of a template function body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateInstance {
    pub template_name: String,
    pub parameters: String,
    pub loc: SrcLoc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<ParamDecl>,
    /// `None` for functions returning nothing.
    pub ret: Option<ReturnDecl>,
    /// `None` selects the default notation.
    pub notation: Option<RawNotation>,
    /// `None` for prototypes.
    pub body: Option<Block>,
    pub coroutine: Option<CoroutineDecl>,
    pub template: Option<TemplateInstance>,
    pub loc: SrcLoc,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: None,
            notation: None,
            body: None,
            coroutine: None,
            template: None,
            loc: SrcLoc::default(),
        }
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, ret: ReturnDecl) -> Self {
        self.ret = Some(ret);
        self
    }

    pub fn notation(mut self, notation: RawNotation) -> Self {
        self.notation = Some(notation);
        self
    }

    pub fn body(mut self, body: Block) -> Self {
        self.body = Some(body);
        self
    }

    pub fn coroutine(mut self, kind: CoroutineKind, yields: ReturnDecl) -> Self {
        self.coroutine = Some(CoroutineDecl { kind, yields });
        self
    }

    pub fn instantiated_from(
        mut self,
        template_name: impl Into<String>,
        parameters: impl Into<String>,
        loc: SrcLoc,
    ) -> Self {
        self.template = Some(TemplateInstance {
            template_name: template_name.into(),
            parameters: parameters.into(),
            loc,
        });
        self
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SrcLoc::at(line, column);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub types: TypeTable,
    pub functions: Vec<FunctionDecl>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub is_unsafe: bool,
    /// Location of the closing brace, where block variables die.
    pub end_loc: SrcLoc,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self {
            stmts,
            is_unsafe: false,
            end_loc: SrcLoc::default(),
        }
    }

    pub fn unsafe_block(stmts: Vec<Stmt>) -> Self {
        Self {
            is_unsafe: true,
            ..Self::new(stmts)
        }
    }

    pub fn ends_at(mut self, line: u32, column: u32) -> Self {
        self.end_loc = SrcLoc::at(line, column);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Initializer {
    Expr(Expr),
    /// Storage is declared but not written yet.
    Uninitialized,
    /// Default construction, producing no references.
    Default,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Less,
    LazyAnd,
    LazyOr,
}

impl BinaryOp {
    pub fn is_lazy(self) -> bool {
        matches!(self, BinaryOp::LazyAnd | BinaryOp::LazyOr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyOp {
    Increment,
    Decrement,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: SrcLoc,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Var {
        name: String,
        ty: TypeId,
        mutability: Mutability,
        init: Initializer,
    },
    Ref {
        name: String,
        ty: TypeId,
        mutability: Mutability,
        init: Expr,
    },
    Expr(Expr),
    Assign {
        target: Expr,
        value: Expr,
        /// Operator of a compound assignment like `+=`.
        op: Option<BinaryOp>,
    },
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    Switch {
        value: Expr,
        cases: Vec<Block>,
        default: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    Loop(Block),
    Break,
    Continue,
    Return(Option<Expr>),
    Halt,
    Block(Block),
    With {
        name: String,
        mutability: Mutability,
        /// Binds a reference instead of a copy.
        reference: bool,
        expr: Expr,
        body: Block,
    },
    Yield(Option<Expr>),
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            loc: SrcLoc::default(),
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SrcLoc::at(line, column);
        self
    }

    pub fn var(name: impl Into<String>, ty: TypeId, mutability: Mutability, init: Expr) -> Self {
        Self::new(StmtKind::Var {
            name: name.into(),
            ty,
            mutability,
            init: Initializer::Expr(init),
        })
    }

    pub fn var_default(name: impl Into<String>, ty: TypeId, mutability: Mutability) -> Self {
        Self::new(StmtKind::Var {
            name: name.into(),
            ty,
            mutability,
            init: Initializer::Default,
        })
    }

    pub fn var_uninit(name: impl Into<String>, ty: TypeId, mutability: Mutability) -> Self {
        Self::new(StmtKind::Var {
            name: name.into(),
            ty,
            mutability,
            init: Initializer::Uninitialized,
        })
    }

    pub fn reference(
        name: impl Into<String>,
        ty: TypeId,
        mutability: Mutability,
        init: Expr,
    ) -> Self {
        Self::new(StmtKind::Ref {
            name: name.into(),
            ty,
            mutability,
            init,
        })
    }

    pub fn expr(expr: Expr) -> Self {
        Self::new(StmtKind::Expr(expr))
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Self::new(StmtKind::Assign {
            target,
            value,
            op: None,
        })
    }

    pub fn compound_assign(op: BinaryOp, target: Expr, value: Expr) -> Self {
        Self::new(StmtKind::Assign {
            target,
            value,
            op: Some(op),
        })
    }

    pub fn if_then(cond: Expr, then_block: Block) -> Self {
        Self::new(StmtKind::If {
            cond,
            then_block,
            else_block: None,
        })
    }

    pub fn if_else(cond: Expr, then_block: Block, else_block: Block) -> Self {
        Self::new(StmtKind::If {
            cond,
            then_block,
            else_block: Some(else_block),
        })
    }

    pub fn switch(value: Expr, cases: Vec<Block>, default: Option<Block>) -> Self {
        Self::new(StmtKind::Switch {
            value,
            cases,
            default,
        })
    }

    pub fn while_loop(cond: Expr, body: Block) -> Self {
        Self::new(StmtKind::While { cond, body })
    }

    pub fn infinite_loop(body: Block) -> Self {
        Self::new(StmtKind::Loop(body))
    }

    pub fn break_loop() -> Self {
        Self::new(StmtKind::Break)
    }

    pub fn continue_loop() -> Self {
        Self::new(StmtKind::Continue)
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    pub fn halt() -> Self {
        Self::new(StmtKind::Halt)
    }

    pub fn block(block: Block) -> Self {
        Self::new(StmtKind::Block(block))
    }

    pub fn with_value(
        name: impl Into<String>,
        mutability: Mutability,
        expr: Expr,
        body: Block,
    ) -> Self {
        Self::new(StmtKind::With {
            name: name.into(),
            mutability,
            reference: false,
            expr,
            body,
        })
    }

    pub fn with_reference(
        name: impl Into<String>,
        mutability: Mutability,
        expr: Expr,
        body: Block,
    ) -> Self {
        Self::new(StmtKind::With {
            name: name.into(),
            mutability,
            reference: true,
            expr,
            body,
        })
    }

    pub fn yield_value(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Yield(value))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeId,
    pub loc: SrcLoc,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Literal,
    Name(String),
    /// Field of a struct, by declaration index.
    Field {
        base: Box<Expr>,
        field: usize,
    },
    TupleElement {
        base: Box<Expr>,
        index: usize,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    StructInit(Vec<Expr>),
    TupleInit(Vec<Expr>),
    ArrayInit(Vec<Expr>),
    Move(String),
    Take(Box<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Modify {
        op: ModifyOp,
        target: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Select {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Await(Box<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, ty: TypeId) -> Self {
        Self {
            kind,
            ty,
            loc: SrcLoc::default(),
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.loc = SrcLoc::at(line, column);
        self
    }

    pub fn literal(ty: TypeId) -> Self {
        Self::new(ExprKind::Literal, ty)
    }

    pub fn name(name: impl Into<String>, ty: TypeId) -> Self {
        Self::new(ExprKind::Name(name.into()), ty)
    }

    pub fn field(base: Expr, field: usize, ty: TypeId) -> Self {
        Self::new(
            ExprKind::Field {
                base: Box::new(base),
                field,
            },
            ty,
        )
    }

    pub fn tuple_element(base: Expr, index: usize, ty: TypeId) -> Self {
        Self::new(
            ExprKind::TupleElement {
                base: Box::new(base),
                index,
            },
            ty,
        )
    }

    pub fn index(base: Expr, index: Expr, ty: TypeId) -> Self {
        Self::new(
            ExprKind::Index {
                base: Box::new(base),
                index: Box::new(index),
            },
            ty,
        )
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>, ty: TypeId) -> Self {
        Self::new(
            ExprKind::Call {
                function: function.into(),
                args,
            },
            ty,
        )
    }

    pub fn struct_init(ty: TypeId, fields: Vec<Expr>) -> Self {
        Self::new(ExprKind::StructInit(fields), ty)
    }

    pub fn tuple_init(ty: TypeId, elements: Vec<Expr>) -> Self {
        Self::new(ExprKind::TupleInit(elements), ty)
    }

    pub fn array_init(ty: TypeId, elements: Vec<Expr>) -> Self {
        Self::new(ExprKind::ArrayInit(elements), ty)
    }

    pub fn move_var(name: impl Into<String>, ty: TypeId) -> Self {
        Self::new(ExprKind::Move(name.into()), ty)
    }

    pub fn take(operand: Expr) -> Self {
        let ty = operand.ty;
        Self::new(ExprKind::Take(Box::new(operand)), ty)
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        let ty = operand.ty;
        Self::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn increment(target: Expr) -> Self {
        Self::modify(ModifyOp::Increment, target)
    }

    pub fn decrement(target: Expr) -> Self {
        Self::modify(ModifyOp::Decrement, target)
    }

    fn modify(op: ModifyOp, target: Expr) -> Self {
        let ty = target.ty;
        Self::new(
            ExprKind::Modify {
                op,
                target: Box::new(target),
            },
            ty,
        )
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, ty: TypeId) -> Self {
        Self::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }

    pub fn select(cond: Expr, then_expr: Expr, else_expr: Expr) -> Self {
        let ty = then_expr.ty;
        Self::new(
            ExprKind::Select {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            ty,
        )
    }

    pub fn await_value(operand: Expr, ty: TypeId) -> Self {
        Self::new(ExprKind::Await(Box::new(operand)), ty)
    }
}
