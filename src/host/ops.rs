//! Builtin and module kernels.
//!
//! The VM and the graph backend both call into this module, so a fused graph
//! computes exactly what interpretation computes.

use super::tensor::Tensor;
use super::types::{VmError, VmResult};
use super::value::{Builtin, Module, ModuleKind, Object, Value};

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn number(v: &Value) -> Option<Num> {
    match v.object() {
        Object::Int(i) => Some(Num::Int(*i)),
        Object::Bool(b) => Some(Num::Int(*b as i64)),
        Object::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn type_error(expected: &'static str, got: &Value) -> VmError {
    VmError::TypeError {
        expected,
        got: got.type_name(),
    }
}

fn expect_args<const N: usize>(args: &[Value]) -> VmResult<&[Value; N]> {
    <&[Value; N]>::try_from(args).map_err(|_| VmError::ArityMismatch {
        expected: N,
        got: args.len(),
    })
}

fn expect_tensor(v: &Value) -> VmResult<&Tensor> {
    v.as_tensor().ok_or_else(|| type_error("tensor", v))
}

/// Call a builtin with positional arguments.
pub fn call_builtin(builtin: Builtin, args: &[Value]) -> VmResult<Value> {
    call_builtin_kwargs(builtin, args, &[])
}

/// Call a builtin with positional and keyword arguments. Only `softmax`
/// accepts a keyword (`dim`).
pub fn call_builtin_kwargs(
    builtin: Builtin,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> VmResult<Value> {
    if builtin != Builtin::Softmax {
        if let Some((name, _)) = kwargs.first() {
            return Err(VmError::Runtime(format!(
                "{}() got an unexpected keyword argument '{}'",
                builtin, name
            )));
        }
    }

    match builtin {
        Builtin::Add | Builtin::Sub | Builtin::Mul | Builtin::TrueDiv => {
            let [lhs, rhs] = expect_args::<2>(args)?;
            binary(builtin, lhs, rhs)
        }
        Builtin::Neg => {
            let [operand] = expect_args::<1>(args)?;
            match operand.object() {
                Object::Tensor(t) => Ok(Value::tensor(t.map(|x| -x))),
                Object::Float(f) => Ok(Value::float(-f)),
                _ => match number(operand) {
                    Some(Num::Int(i)) => i.checked_neg().map(Value::int).ok_or(VmError::ArithmeticOverflow),
                    _ => Err(type_error("number or tensor", operand)),
                },
            }
        }
        Builtin::GetItem => {
            let [container, index] = expect_args::<2>(args)?;
            getitem(container, index)
        }
        Builtin::Relu => {
            let [x] = expect_args::<1>(args)?;
            Ok(Value::tensor(expect_tensor(x)?.relu()))
        }
        Builtin::Softmax => {
            let (x, dim) = match args {
                [x] => (x, None),
                [x, dim] => (x, Some(dim)),
                _ => {
                    return Err(VmError::ArityMismatch {
                        expected: 1,
                        got: args.len(),
                    })
                }
            };
            let dim = dim.or_else(|| kwargs.iter().find(|(k, _)| k == "dim").map(|(_, v)| v));
            let dim = match dim {
                Some(d) => d.as_int().ok_or_else(|| type_error("int", d))?,
                None => -1,
            };
            Ok(Value::tensor(expect_tensor(x)?.softmax(dim)?))
        }
        Builtin::Matmul => {
            let [a, b] = expect_args::<2>(args)?;
            Ok(Value::tensor(expect_tensor(a)?.matmul(expect_tensor(b)?)?))
        }
        Builtin::Len => {
            let [x] = expect_args::<1>(args)?;
            let len = match x.object() {
                Object::Tensor(t) => t.shape().first().copied().ok_or(VmError::TypeError {
                    expected: "sized tensor",
                    got: "0-d tensor",
                })?,
                Object::Tuple(items) => items.len(),
                Object::Str(s) => s.chars().count(),
                _ => return Err(type_error("sized value", x)),
            };
            Ok(Value::int(len as i64))
        }
    }
}

fn binary(op: Builtin, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    match (lhs.object(), rhs.object()) {
        (Object::Tensor(a), Object::Tensor(b)) => {
            Ok(Value::tensor(a.zip_with(b, |x, y| apply_f64(op, x, y))?))
        }
        (Object::Tensor(a), _) => {
            let s = number(rhs).ok_or_else(|| type_error("number or tensor", rhs))?.as_f64();
            Ok(Value::tensor(a.map(|x| apply_f64(op, x, s))))
        }
        (_, Object::Tensor(b)) => {
            let s = number(lhs).ok_or_else(|| type_error("number or tensor", lhs))?.as_f64();
            Ok(Value::tensor(b.map(|x| apply_f64(op, s, x))))
        }
        (Object::Str(a), Object::Str(b)) if op == Builtin::Add => Ok(Value::str(format!("{a}{b}"))),
        _ => {
            let a = number(lhs).ok_or_else(|| type_error("number", lhs))?;
            let b = number(rhs).ok_or_else(|| type_error("number", rhs))?;
            scalar_binary(op, a, b)
        }
    }
}

fn scalar_binary(op: Builtin, a: Num, b: Num) -> VmResult<Value> {
    match (op, a, b) {
        (Builtin::TrueDiv, a, b) => {
            let d = b.as_f64();
            if d == 0.0 {
                return Err(VmError::DivisionByZero);
            }
            Ok(Value::float(a.as_f64() / d))
        }
        (_, Num::Int(x), Num::Int(y)) => {
            let r = match op {
                Builtin::Add => x.checked_add(y),
                Builtin::Sub => x.checked_sub(y),
                Builtin::Mul => x.checked_mul(y),
                _ => None,
            };
            r.map(Value::int).ok_or(VmError::ArithmeticOverflow)
        }
        (_, a, b) => Ok(Value::float(apply_f64(op, a.as_f64(), b.as_f64()))),
    }
}

#[inline]
fn apply_f64(op: Builtin, x: f64, y: f64) -> f64 {
    match op {
        Builtin::Add => x + y,
        Builtin::Sub => x - y,
        Builtin::Mul => x * y,
        Builtin::TrueDiv => x / y,
        _ => f64::NAN,
    }
}

fn getitem(container: &Value, index: &Value) -> VmResult<Value> {
    match (container.object(), index.object()) {
        (Object::Tensor(t), Object::Int(i)) => Ok(Value::tensor(t.index(*i)?)),
        (Object::Tensor(t), Object::Slice(s)) => Ok(Value::tensor(t.slice(*s)?)),
        (Object::Tuple(items), Object::Int(i)) => {
            let len = items.len();
            let idx = if *i < 0 { *i + len as i64 } else { *i };
            usize::try_from(idx)
                .ok()
                .and_then(|idx| items.get(idx))
                .cloned()
                .ok_or(VmError::IndexOutOfBounds { index: *i, len })
        }
        (Object::Tensor(_) | Object::Tuple(_), _) => Err(type_error("int or slice", index)),
        _ => Err(type_error("subscriptable value", container)),
    }
}

/// Run a leaf module on its arguments.
pub fn call_module(module: &Module, args: &[Value]) -> VmResult<Value> {
    let [x] = expect_args::<1>(args)?;
    let x = expect_tensor(x)?;
    let out = match module.kind() {
        ModuleKind::Linear { weight, bias } => x.linear(weight, bias.as_ref())?,
        ModuleKind::Softmax { dim } => x.softmax(*dim)?,
        ModuleKind::Relu => x.relu(),
        ModuleKind::Container { .. } => return Err(VmError::NotCallable("module without forward")),
    };
    Ok(Value::tensor(out))
}
