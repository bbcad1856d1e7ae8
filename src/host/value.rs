//! Runtime values of the host VM.
//!
//! A [`Value`] is a reference-counted handle to an [`Object`]. Two handles
//! denote the same runtime object iff they share the allocation, which is
//! what [`ObjectId`] captures. The tracer keys everything on that identity,
//! never on structural equality: two equal integers created separately are
//! still two objects.
//!
//! ```text
//!   Value ──Arc──► Object::Tensor(..)
//!   Value ──Arc──┘            (same ObjectId)
//! ```
//!
//! Builtins, `None` and the NULL call-stack sentinel are interned, so every
//! lookup of e.g. `Builtin::Add` yields the same identity.

use std::fmt;
use std::sync::{Arc, LazyLock};

use super::code::CodeObject;
use super::tensor::Tensor;

/// Identity of a runtime object (address of its allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Raw address value
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// ============================================================================
// Builtins
// ============================================================================

/// Builtin functions known to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Builtin {
    Add = 0,
    Sub = 1,
    Mul = 2,
    TrueDiv = 3,
    Neg = 4,
    GetItem = 5,
    Relu = 6,
    Softmax = 7,
    Matmul = 8,
    Len = 9,
}

impl Builtin {
    pub const ALL: [Builtin; 10] = [
        Builtin::Add,
        Builtin::Sub,
        Builtin::Mul,
        Builtin::TrueDiv,
        Builtin::Neg,
        Builtin::GetItem,
        Builtin::Relu,
        Builtin::Softmax,
        Builtin::Matmul,
        Builtin::Len,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::TrueDiv => "truediv",
            Self::Neg => "neg",
            Self::GetItem => "getitem",
            Self::Relu => "relu",
            Self::Softmax => "softmax",
            Self::Matmul => "matmul",
            Self::Len => "len",
        }
    }

    /// Look a builtin up by its global name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// Builtins reachable as tensor methods (`x.relu()`, `x.matmul(w)`).
    pub fn from_method(name: &str) -> Option<Self> {
        match name {
            "add" => Some(Self::Add),
            "sub" => Some(Self::Sub),
            "mul" => Some(Self::Mul),
            "div" => Some(Self::TrueDiv),
            "neg" => Some(Self::Neg),
            "relu" => Some(Self::Relu),
            "softmax" => Some(Self::Softmax),
            "matmul" => Some(Self::Matmul),
            _ => None,
        }
    }

    /// Whether a call with tensor arguments can be fused into a graph node.
    ///
    /// `len` reads a shape and produces a host integer, so it stays in the
    /// interpreter.
    pub fn is_graph_function(self) -> bool {
        !matches!(self, Self::Len)
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Modules
// ============================================================================

/// What a module computes when called.
#[derive(Debug)]
pub enum ModuleKind {
    /// `y = x @ weight^T + bias`, weight shaped `[out, in]`
    Linear { weight: Tensor, bias: Option<Tensor> },
    Softmax { dim: i64 },
    Relu,
    /// A user module whose `forward` is host bytecode taking `self` first.
    Container { forward: Option<Arc<CodeObject>> },
}

/// A callable module with named children, in the shape of a neural-network
/// layer tree.
#[derive(Debug)]
pub struct Module {
    name: String,
    kind: ModuleKind,
    children: Vec<(String, Value)>,
}

impl Module {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            children: Vec::new(),
        }
    }

    pub fn linear(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self::new("Linear", ModuleKind::Linear { weight, bias })
    }

    pub fn softmax(dim: i64) -> Self {
        Self::new("Softmax", ModuleKind::Softmax { dim })
    }

    pub fn relu() -> Self {
        Self::new("ReLU", ModuleKind::Relu)
    }

    pub fn container(name: impl Into<String>, forward: Arc<CodeObject>) -> Self {
        Self::new(
            name,
            ModuleKind::Container {
                forward: Some(forward),
            },
        )
    }

    /// Attach a named child (submodule, tensor parameter or any value).
    pub fn with_child(mut self, name: impl Into<String>, value: Value) -> Self {
        self.children.push((name.into(), value));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ModuleKind {
        &self.kind
    }

    pub fn children(&self) -> &[(String, Value)] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Value> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Host bytecode implementing `forward`, if any.
    pub fn forward(&self) -> Option<&Arc<CodeObject>> {
        match &self.kind {
            ModuleKind::Container { forward } => forward.as_ref(),
            _ => None,
        }
    }

    /// Leaf modules compute directly and can become `call_module` nodes.
    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, ModuleKind::Container { .. })
    }

    /// Every submodule below `root` with its dotted path (`"encoder.fc"`).
    /// The root itself is not included.
    pub fn named_modules(root: &Value) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        collect_modules(root, "", &mut out);
        out
    }

    /// Walk a dotted path of children starting at `root`.
    pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
        path.split('.')
            .try_fold(root.clone(), |current, segment| {
                current.as_module()?.child(segment).cloned()
            })
    }
}

fn collect_modules(value: &Value, prefix: &str, out: &mut Vec<(String, Value)>) {
    let Some(module) = value.as_module() else {
        return;
    };
    for (name, child) in module.children() {
        if child.as_module().is_none() {
            continue;
        }
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        out.push((path.clone(), child.clone()));
        collect_modules(child, &path, out);
    }
}

// ============================================================================
// Objects and values
// ============================================================================

/// `start:stop:step` with absent bounds left open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SliceValue {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl fmt::Display for SliceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |b: Option<i64>| b.map_or_else(|| "None".to_string(), |v| v.to_string());
        write!(
            f,
            "slice({}, {}, {})",
            part(self.start),
            part(self.stop),
            part(self.step)
        )
    }
}

/// Payload of a runtime value.
#[derive(Debug)]
pub enum Object {
    None,
    /// Call-stack sentinel pushed by `LOAD_METHOD` for non-method attributes.
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Arc<str>),
    Slice(SliceValue),
    Tuple(Vec<Value>),
    Tensor(Tensor),
    Builtin(Builtin),
    Module(Module),
    Function(Arc<CodeObject>),
    /// Anything the tracer has no representation for.
    Opaque(String),
}

/// Handle to a runtime object.
#[derive(Clone)]
pub struct Value(Arc<Object>);

static NONE: LazyLock<Value> = LazyLock::new(|| Value::new(Object::None));
static NULL: LazyLock<Value> = LazyLock::new(|| Value::new(Object::Null));
static BUILTINS: LazyLock<Vec<Value>> = LazyLock::new(|| {
    Builtin::ALL
        .iter()
        .map(|b| Value::new(Object::Builtin(*b)))
        .collect()
});

impl Value {
    /// Allocate a fresh object. Every call yields a new identity.
    pub fn new(object: Object) -> Self {
        Self(Arc::new(object))
    }

    pub fn none() -> Self {
        NONE.clone()
    }

    pub fn null() -> Self {
        NULL.clone()
    }

    pub fn builtin(builtin: Builtin) -> Self {
        BUILTINS[builtin as usize].clone()
    }

    pub fn int(v: i64) -> Self {
        Self::new(Object::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::new(Object::Float(v))
    }

    pub fn bool(v: bool) -> Self {
        Self::new(Object::Bool(v))
    }

    pub fn str(v: impl Into<Arc<str>>) -> Self {
        Self::new(Object::Str(v.into()))
    }

    pub fn slice(v: SliceValue) -> Self {
        Self::new(Object::Slice(v))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Self::new(Object::Tuple(items))
    }

    pub fn tensor(t: Tensor) -> Self {
        Self::new(Object::Tensor(t))
    }

    pub fn module(m: Module) -> Self {
        Self::new(Object::Module(m))
    }

    pub fn function(code: Arc<CodeObject>) -> Self {
        Self::new(Object::Function(code))
    }

    pub fn opaque(description: impl Into<String>) -> Self {
        Self::new(Object::Opaque(description.into()))
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        ObjectId(Arc::as_ptr(&self.0) as usize)
    }

    /// Identity comparison (`a is b`).
    #[inline]
    pub fn is(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub fn object(&self) -> &Object {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        matches!(*self.0, Object::Null)
    }

    pub fn is_none(&self) -> bool {
        matches!(*self.0, Object::None)
    }

    /// Plain numeric or string scalar.
    pub fn is_scalar(&self) -> bool {
        matches!(
            *self.0,
            Object::Int(_) | Object::Float(_) | Object::Bool(_) | Object::Str(_)
        )
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match &*self.0 {
            Object::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match &*self.0 {
            Object::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_builtin(&self) -> Option<Builtin> {
        match &*self.0 {
            Object::Builtin(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &*self.0 {
            Object::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &*self.0 {
            Object::None => "NoneType",
            Object::Null => "NULL",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Bool(_) => "bool",
            Object::Str(_) => "str",
            Object::Slice(_) => "slice",
            Object::Tuple(_) => "tuple",
            Object::Tensor(_) => "tensor",
            Object::Builtin(_) => "builtin_function",
            Object::Module(_) => "module",
            Object::Function(_) => "function",
            Object::Opaque(_) => "object",
        }
    }

    /// Attribute lookup: module children, and tensor methods which resolve to
    /// the interned builtin.
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        match &*self.0 {
            Object::Module(m) => m.child(name).cloned(),
            Object::Tensor(_) => Builtin::from_method(name).map(Value::builtin),
            _ => None,
        }
    }

    /// Truthiness for conditional jumps; `None` for values without one.
    pub fn truthy(&self) -> Option<bool> {
        match &*self.0 {
            Object::None => Some(false),
            Object::Bool(b) => Some(*b),
            Object::Int(i) => Some(*i != 0),
            Object::Float(f) => Some(*f != 0.0),
            Object::Str(s) => Some(!s.is_empty()),
            Object::Tuple(items) => Some(!items.is_empty()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Object::None => write!(f, "None"),
            Object::Null => write!(f, "NULL"),
            Object::Int(i) => write!(f, "{i}"),
            Object::Float(v) => write!(f, "{v:?}"),
            Object::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Object::Str(s) => write!(f, "{s:?}"),
            Object::Slice(s) => write!(f, "{s}"),
            Object::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Object::Tensor(t) => write!(f, "{t}"),
            Object::Builtin(b) => write!(f, "<built-in {b}>"),
            Object::Module(m) => write!(f, "<module {}>", m.name()),
            Object::Function(code) => write!(f, "<function {}>", code.name()),
            Object::Opaque(desc) => write!(f, "<{desc}>"),
        }
    }
}
