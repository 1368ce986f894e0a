//! Binary operator dispatch.
//!
//! A fixed truth table of operand types decides each operator's outcome.
//! When no row matches, the operands are normalized toward compatible
//! types (strings parse to numbers for arithmetic, `x` rotates so the
//! repeated operand comes first) and the table is consulted again, up to a
//! fixed ceiling. `is` is total: when nothing matches or normalization
//! fails, it answers false instead of dying.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};

use crate::{
    error::RunResult,
    machine::Machine,
    value::{CompoundType, VRange, Value, ValueType},
};

/// How many normalize-and-retry rounds before giving up.
const NORMALIZE_CEILING: usize = 4;

/// Applies `op` to `left` and `right`.
pub(super) fn binary(machine: &mut Machine<'_>, op: &str, left: Value, right: Value) -> RunResult<Value> {
    let mut left = left;
    let mut right = right;
    for _ in 0..=NORMALIZE_CEILING {
        if let Some(result) = attempt(machine, op, &left, &right)? {
            return Ok(result);
        }
        let normalized = if op == "is" {
            // A failed coercion under `is` means "does not match".
            match normalize(op, &left, &right) {
                Ok(normalized) => normalized,
                Err(_) => return Ok(Value::Bool(false)),
            }
        } else {
            normalize(op, &left, &right)?
        };
        match normalized {
            Some((l, r)) => {
                left = l;
                right = r;
            }
            None => break,
        }
    }
    if op == "is" {
        return Ok(Value::Bool(false));
    }
    Err(machine.fail(format!(
        "{op} is not supported between a {} and a {}",
        left.type_of(),
        right.type_of()
    )))
}

/// One consultation of the truth table. `Ok(None)` asks for normalization.
fn attempt(machine: &mut Machine<'_>, op: &str, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    match op {
        "+" | "-" | "*" | "/" => arithmetic(machine, op, left, right),
        "~" => Ok(Some(Value::str(format!("{left}{right}")))),
        "&" => {
            let mut joined = left.to_vec()?;
            joined.extend(right.to_vec()?);
            Ok(Some(Value::vec(joined)))
        }
        "x" => repeat(machine, left, right),
        "<" | ">" | "<=" | ">=" => compare(op, left, right),
        "in" => containment(left, right),
        "to" => range(left, right),
        "and" => Ok(Some(if left.truthy() { right.clone() } else { left.clone() })),
        "or" => {
            // Over types, `or` is the alternative: it joins into a compound
            // type rather than picking the first truthy operand.
            if is_type_like(left) || is_type_like(right) {
                let mut contents = flatten_alternatives(left);
                contents.extend(flatten_alternatives(right));
                let lead = match contents.first() {
                    Some(Value::Type(t)) => *t,
                    Some(other) => other.type_of(),
                    None => ValueType::Any,
                };
                return Ok(Some(Value::CompoundType(std::rc::Rc::new(CompoundType { lead, contents }))));
            }
            Ok(Some(if left.truthy() { left.clone() } else { right.clone() }))
        }
        "is" => is(machine, left, right),
        _ => Err(machine.fail(format!("unknown binary operator: {op}"))),
    }
}

fn arithmetic(machine: &Machine<'_>, op: &str, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    match (left, right) {
        (Value::Num(l), Value::Num(r)) => {
            if op == "/" && r.is_zero() {
                return Err(machine.fail("division by zero"));
            }
            let result = match op {
                "+" => l + r,
                "-" => l - r,
                "*" => l * r,
                _ => l / r,
            };
            Ok(Some(Value::Num(result)))
        }
        // Num-Range arithmetic applies to both bounds, inclusive.
        (Value::Range(range), Value::Num(n)) => Ok(Some(shift_range(machine, op, range, n, false)?)),
        (Value::Num(n), Value::Range(range)) => Ok(Some(shift_range(machine, op, range, n, true)?)),
        _ => Ok(None),
    }
}

fn shift_range(machine: &Machine<'_>, op: &str, range: &VRange, n: &BigDecimal, flipped: bool) -> RunResult<Value> {
    let apply = |bound: &BigDecimal| -> RunResult<BigDecimal> {
        if op == "/" && !flipped && n.is_zero() {
            return Err(machine.fail("division by zero"));
        }
        Ok(match (op, flipped) {
            ("+", _) => bound + n,
            ("-", false) => bound - n,
            ("-", true) => n - bound,
            ("*", _) => bound * n,
            (_, false) => bound / n,
            (_, true) => {
                if bound.is_zero() {
                    return Err(machine.fail("division by zero"));
                }
                n / bound
            }
        })
    };
    let start = range.start.as_ref().map(&apply).transpose()?;
    let end = range.end.as_ref().map(&apply).transpose()?;
    Ok(Value::Range(std::rc::Rc::new(VRange { start, end })))
}

/// `x`: repetition, repeated operand first, count second.
fn repeat(machine: &Machine<'_>, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    let Value::Num(count) = right else {
        return Ok(None);
    };
    let count = count
        .to_u64()
        .filter(|_| count.is_integer())
        .and_then(|count| usize::try_from(count).ok())
        .ok_or_else(|| machine.fail(format!("{count} is not a valid repetition count")))?;
    match left {
        Value::Num(_) => Ok(None),
        Value::Str(s) => Ok(Some(Value::str(s.repeat(count)))),
        other => {
            let base = other.to_vec()?;
            let mut repeated = Vec::with_capacity(base.len() * count);
            for _ in 0..count {
                repeated.extend(base.iter().cloned());
            }
            Ok(Some(Value::vec(repeated)))
        }
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    let ordering = match (left, right) {
        (Value::Num(l), Value::Num(r)) => l.partial_cmp(r),
        (Value::Str(l), Value::Str(r)) => l.partial_cmp(r),
        _ => return Ok(None),
    };
    let Some(ordering) = ordering else {
        return Ok(Some(Value::Bool(false)));
    };
    let holds = match op {
        "<" => ordering.is_lt(),
        ">" => ordering.is_gt(),
        "<=" => ordering.is_le(),
        _ => ordering.is_ge(),
    };
    Ok(Some(Value::Bool(holds)))
}

fn containment(left: &Value, right: &Value) -> RunResult<Option<Value>> {
    match right {
        Value::Str(haystack) => Ok(Some(Value::Bool(haystack.contains(&left.to_string())))),
        Value::Map(pairs) => Ok(Some(Value::Bool(pairs.borrow().contains_key(&left.to_string())))),
        Value::Vec(items) => Ok(Some(Value::Bool(items.borrow().iter().any(|item| item.eqv(left))))),
        Value::Range(range) => match left {
            Value::Num(n) => Ok(Some(Value::Bool(range.contains(n)))),
            _ => Ok(None),
        },
        Value::Instance(instance) => Ok(Some(Value::Bool(
            instance.scope.borrow().contains_key(&left.to_string()),
        ))),
        _ => Ok(None),
    }
}

fn range(left: &Value, right: &Value) -> RunResult<Option<Value>> {
    let bound = |value: &Value| match value {
        Value::Num(n) => Some(Some(n.clone())),
        Value::Hole => Some(None),
        _ => None,
    };
    match (bound(left), bound(right)) {
        (Some(start), Some(end)) => Ok(Some(Value::Range(std::rc::Rc::new(VRange { start, end })))),
        _ => Ok(None),
    }
}

/// The `is` table. Asymmetric by design: a Str is a Regex when the pattern
/// matches, a Regex is a Str only when the sources are equal.
fn is(machine: &mut Machine<'_>, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    match (left, right) {
        (_, Value::Any) => Ok(Some(Value::Bool(true))),
        (_, Value::Type(t)) => Ok(Some(Value::Bool(type_matches(left, *t)))),
        (_, Value::CompoundType(compound)) => {
            for alternative in &compound.contents {
                let verdict = binary(machine, "is", left.clone(), alternative.clone())?;
                if verdict.truthy() {
                    return Ok(Some(verdict));
                }
            }
            Ok(Some(Value::Bool(false)))
        }
        // A lambda given is a verification predicate; its map result
        // carries pattern bindings.
        (_, Value::Lambda(lambda)) => {
            let verdict = machine.call_value(Value::Lambda(std::rc::Rc::clone(lambda)), vec![left.clone()])?;
            Ok(Some(verdict))
        }
        // Functions on the right act as predicates over non-function
        // subjects; two functions compare by identity.
        (_, Value::Concrete(_) | Value::Generic(_) | Value::Partial(_) | Value::Builtin(_)) => {
            if matches!(left.type_of(), ValueType::Function | ValueType::Lambda) {
                return Ok(Some(Value::Bool(left.eqv(right))));
            }
            let verdict = machine.call_value(right.clone(), vec![left.clone()])?;
            Ok(Some(verdict))
        }
        (Value::Num(l), Value::Num(r)) => Ok(Some(Value::Bool(l == r))),
        (Value::Str(l), Value::Str(r)) => Ok(Some(Value::Bool(l == r))),
        (Value::Bool(l), Value::Bool(r)) => Ok(Some(Value::Bool(l == r))),
        (_, Value::Bool(r)) => Ok(Some(Value::Bool(left.truthy() == *r))),
        (Value::Str(subject), Value::Regex(regex)) => Ok(Some(match regex.pattern.find(subject) {
            Some(found) => Value::str(found.as_str()),
            None => Value::Bool(false),
        })),
        (Value::Regex(regex), Value::Str(source)) => {
            Ok(Some(Value::Bool(regex.source.as_ref() == source.as_ref())))
        }
        (Value::Regex(l), Value::Regex(r)) => Ok(Some(Value::Bool(l == r))),
        (Value::Num(n), Value::Range(range)) => Ok(Some(Value::Bool(range.contains(n)))),
        (Value::Vec(_), Value::Vec(_))
        | (Value::Map(_), Value::Map(_))
        | (Value::Range(_), Value::Range(_)) => Ok(Some(Value::Bool(left.eqv(right)))),
        (Value::Instance(instance), Value::Box(template)) => {
            Ok(Some(Value::Bool(std::rc::Rc::ptr_eq(&instance.parent, template))))
        }
        (Value::Instance(_), Value::Instance(_)) | (Value::Box(_), Value::Box(_)) => {
            Ok(Some(Value::Bool(left.eqv(right))))
        }
        _ => Ok(None),
    }
}

fn is_type_like(value: &Value) -> bool {
    matches!(value, Value::Type(_) | Value::CompoundType(_) | Value::Any)
}

/// The alternatives a value contributes to a compound type.
fn flatten_alternatives(value: &Value) -> Vec<Value> {
    match value {
        Value::CompoundType(compound) => compound.contents.clone(),
        other => vec![other.clone()],
    }
}

fn type_matches(value: &Value, wanted: ValueType) -> bool {
    let actual = value.type_of();
    if actual == wanted {
        return true;
    }
    match wanted {
        ValueType::Any => true,
        // The function family covers lambdas too.
        ValueType::Function => matches!(actual, ValueType::Lambda),
        _ => false,
    }
}

/// Coerces the operands toward a table row. `Ok(None)` means no rule.
fn normalize(op: &str, left: &Value, right: &Value) -> Result<Option<(Value, Value)>, crate::error::ModelCastError> {
    match op {
        "+" | "-" | "*" | "/" | "<" | ">" | "<=" | ">=" => {
            let l = match left {
                Value::Num(_) | Value::Range(_) => left.clone(),
                other => Value::Num(other.to_num()?),
            };
            let r = match right {
                Value::Num(_) | Value::Range(_) => right.clone(),
                other => Value::Num(other.to_num()?),
            };
            if l.eqv(left) && r.eqv(right) {
                return Ok(None);
            }
            Ok(Some((l, r)))
        }
        "x" => match (left, right) {
            // Rotate so the repeated operand is first, the count second.
            (Value::Num(_), other) if !matches!(other, Value::Num(_)) => {
                Ok(Some((other.clone(), left.clone())))
            }
            (_, other) if !matches!(other, Value::Num(_)) => {
                Ok(Some((left.clone(), Value::Num(other.to_num()?))))
            }
            _ => Ok(None),
        },
        "to" => {
            let l = match left {
                Value::Num(_) | Value::Hole => left.clone(),
                other => Value::Num(other.to_num()?),
            };
            let r = match right {
                Value::Num(_) | Value::Hole => right.clone(),
                other => Value::Num(other.to_num()?),
            };
            if l.eqv(left) && r.eqv(right) {
                return Ok(None);
            }
            Ok(Some((l, r)))
        }
        "is" => match (left, right) {
            (Value::Num(_), Value::Str(_)) => Ok(Some((left.clone(), Value::Num(right.to_num()?)))),
            (Value::Str(_), Value::Num(_)) => Ok(Some((Value::Num(left.to_num()?), right.clone()))),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}
