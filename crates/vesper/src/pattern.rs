//! The pattern compiler: pattern envelopes to verification lambdas.
//!
//! A pattern envelope `'P` becomes a lambda with one synthetic parameter.
//! Called with a candidate value, the lambda evaluates a conjunction of
//! checks compiled compositionally from the pattern; on success it yields
//! the map of variable bindings (or plain truth when the pattern binds
//! nothing), on failure false. Generic dispatch calls these lambdas during
//! typechecking and injects the binding map into the callee's scope.

use crate::{
    error::{ReadError, ReadResult},
    quote::{MapKey, Parameter, Parameters, QTag, Quote, QuoteKind},
};

/// The synthetic parameter every verification lambda declares.
pub const SUBJECT: &str = "__subject";

/// Compiles a pattern into the [`QuoteKind::Lambda`] that verifies it.
pub fn compile(pattern: &Quote, tag: &QTag) -> ReadResult<QuoteKind> {
    let mut compiler = PatternCompiler {
        tag: tag.clone(),
        bindings: Vec::new(),
        checks: Vec::new(),
    };
    let subject = Quote::symbol(tag.clone(), SUBJECT);
    compiler.recur(subject, pattern)?;

    let PatternCompiler { bindings, checks, .. } = compiler;
    let matched = conjoin(tag, checks);
    let body = if bindings.is_empty() {
        matched
    } else {
        let pairs = bindings
            .into_iter()
            .map(|(name, subject)| (MapKey::Str(name), subject))
            .collect();
        let assigns = Quote::new(tag.clone(), QuoteKind::Map { pairs });
        Quote::new(
            tag.clone(),
            QuoteKind::Binary {
                op: "and".to_owned(),
                left: Box::new(matched),
                right: Box::new(assigns),
            },
        )
    };

    let params = Parameters::new(vec![Parameter::named(0, SUBJECT)], tag.file.as_ref(), tag.line)?;
    Ok(QuoteKind::Lambda {
        params,
        body: Box::new(body),
    })
}

/// Joins checks with `and`; an empty conjunction is vacuously true.
fn conjoin(tag: &QTag, checks: Vec<Quote>) -> Quote {
    let mut checks = checks.into_iter();
    let Some(first) = checks.next() else {
        return Quote::new(tag.clone(), QuoteKind::True);
    };
    checks.fold(first, |joined, check| {
        Quote::new(
            tag.clone(),
            QuoteKind::Binary {
                op: "and".to_owned(),
                left: Box::new(joined),
                right: Box::new(check),
            },
        )
    })
}

struct PatternCompiler {
    tag: QTag,
    /// Bound names and their subject expressions, in binding order.
    bindings: Vec<(String, Quote)>,
    /// The accumulated checks, conjoined at the end.
    checks: Vec<Quote>,
}

impl PatternCompiler {
    fn quote(&self, kind: QuoteKind) -> Quote {
        Quote::new(self.tag.clone(), kind)
    }

    fn check_is(&mut self, subject: Quote, against: Quote) {
        let check = self.quote(QuoteKind::Binary {
            op: "is".to_owned(),
            left: Box::new(subject),
            right: Box::new(against),
        });
        self.checks.push(check);
    }

    fn bound(&self, name: &str) -> Option<&Quote> {
        self.bindings
            .iter()
            .rev()
            .find(|(bound, _)| bound == name)
            .map(|(_, subject)| subject)
    }

    /// One compositional step: verify `pattern` against `subject`.
    fn recur(&mut self, subject: Quote, pattern: &Quote) -> ReadResult<()> {
        match &pattern.kind {
            // Literal patterns compare under `is`.
            QuoteKind::Number(_) | QuoteKind::Str(_) | QuoteKind::Regex(_) | QuoteKind::True | QuoteKind::False => {
                self.check_is(subject, pattern.clone());
                Ok(())
            }
            // A bound symbol re-checks parity; a fresh one just binds.
            QuoteKind::Symbol(name) => {
                if let Some(prior) = self.bound(name).cloned() {
                    self.check_is(subject, prior);
                } else {
                    self.bindings.push((name.clone(), subject));
                }
                Ok(())
            }
            // The escape: compare against the inner expression literally.
            QuoteKind::PatternEnvelope(inner) => {
                if matches!(inner.kind, QuoteKind::PatternEnvelope(_)) {
                    return Err(self.unsupported(pattern, "a doubly escaped pattern"));
                }
                self.check_is(subject, (**inner).clone());
                Ok(())
            }
            QuoteKind::Vector { items } => {
                self.check_is(subject.clone(), Quote::symbol(self.tag.clone(), "vec"));
                let length = self.quote(QuoteKind::Unary {
                    op: "#",
                    operand: Box::new(subject.clone()),
                });
                self.check_is(length, self.quote(QuoteKind::Number((items.len() as u64).into())));
                for (index, item) in items.iter().enumerate() {
                    let element = self.quote(QuoteKind::Access {
                        head: Box::new(subject.clone()),
                        args: vec![self.quote(QuoteKind::Number((index as u64).into()))],
                    });
                    self.recur(element, item)?;
                }
                Ok(())
            }
            QuoteKind::Map { pairs } => {
                self.check_is(subject.clone(), Quote::symbol(self.tag.clone(), "map"));
                for (key, value) in pairs {
                    let key_quote = match key {
                        MapKey::Str(name) => self.quote(QuoteKind::Str(name.clone())),
                        MapKey::Expr(expr) => expr.clone(),
                    };
                    let present = self.quote(QuoteKind::Binary {
                        op: "in".to_owned(),
                        left: Box::new(key_quote.clone()),
                        right: Box::new(subject.clone()),
                    });
                    self.checks.push(present);
                    let element = self.quote(QuoteKind::Access {
                        head: Box::new(subject.clone()),
                        args: vec![key_quote],
                    });
                    self.recur(element, value)?;
                }
                Ok(())
            }
            // `x = p` verifies p, then binds x to the subject; the binding
            // shadows an earlier one of the same name.
            QuoteKind::Assign { target, value, .. } => {
                let QuoteKind::Symbol(name) = &target.kind else {
                    return Err(self.unsupported(pattern, "an assignment to a non-symbol"));
                };
                self.recur(subject.clone(), value)?;
                self.bindings.push((name.clone(), subject));
                Ok(())
            }
            QuoteKind::Binary { op, left, right } if (op == "and" || op == "or") && matches!(right.kind, QuoteKind::Binary { .. }) => {
                let joined_left = self.junction_side(subject.clone(), left)?;
                let joined_right = self.junction_side(subject, right)?;
                let junction = self.quote(QuoteKind::Binary {
                    op: op.clone(),
                    left: Box::new(joined_left),
                    right: Box::new(joined_right),
                });
                self.checks.push(junction);
                Ok(())
            }
            // Other binaries compare the subject under the operator.
            QuoteKind::Binary { op, left, right } => {
                self.recur(subject.clone(), left)?;
                let check = self.quote(QuoteKind::Binary {
                    op: op.clone(),
                    left: Box::new(subject),
                    right: Box::new((**right).clone()),
                });
                self.checks.push(check);
                Ok(())
            }
            QuoteKind::SuperlocalTake => Ok(()),
            _ => Err(self.unsupported(pattern, "this form")),
        }
    }

    /// Compiles one side of a junction into a standalone check expression.
    fn junction_side(&mut self, subject: Quote, side: &Quote) -> ReadResult<Quote> {
        if matches!(side.kind, QuoteKind::Symbol(_)) {
            // A bare symbol side stands for the subject itself.
            self.recur(subject.clone(), side)?;
            return Ok(subject);
        }
        let before = self.checks.len();
        self.recur(subject, side)?;
        let side_checks = self.checks.split_off(before);
        Ok(conjoin(&self.tag, side_checks))
    }

    fn unsupported(&self, pattern: &Quote, what: &str) -> ReadError {
        ReadError::new(
            format!("unsupported pattern: {what}"),
            self.tag.file.as_ref(),
            pattern.tag.line,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    fn tag() -> QTag {
        QTag {
            file: Rc::from("test.vsp"),
            line: 1,
        }
    }

    fn symbol(name: &str) -> Quote {
        Quote::symbol(tag(), name)
    }

    #[test]
    fn vector_pattern_checks_kind_length_and_elements() {
        let pattern = Quote::new(
            tag(),
            QuoteKind::Vector {
                items: vec![symbol("a"), symbol("b")],
            },
        );
        let QuoteKind::Lambda { params, body } = compile(&pattern, &tag()).unwrap() else {
            panic!("expected a lambda");
        };
        assert_eq!(params.len(), 1);
        // Bindings present, so the body ands the checks with the map.
        let QuoteKind::Binary { op, right, .. } = &body.kind else {
            panic!("expected the binding conjunction");
        };
        assert_eq!(op, "and");
        assert!(matches!(&right.kind, QuoteKind::Map { pairs } if pairs.len() == 2));
    }

    #[test]
    fn parity_emits_a_check_for_the_second_occurrence() {
        let pattern = Quote::new(
            tag(),
            QuoteKind::Vector {
                items: vec![symbol("a"), symbol("a")],
            },
        );
        let QuoteKind::Lambda { body, .. } = compile(&pattern, &tag()).unwrap() else {
            panic!("expected a lambda");
        };
        // One binding only; the second `a` became an `is` check.
        let QuoteKind::Binary { right, .. } = &body.kind else {
            panic!("expected the binding conjunction");
        };
        assert!(matches!(&right.kind, QuoteKind::Map { pairs } if pairs.len() == 1));
    }

    #[test]
    fn double_escape_is_rejected() {
        let inner = Quote::new(tag(), QuoteKind::PatternEnvelope(Box::new(symbol("x"))));
        let pattern = Quote::new(tag(), QuoteKind::PatternEnvelope(Box::new(inner)));
        assert!(compile(&pattern, &tag()).is_err());
    }

    #[test]
    fn bindingless_pattern_body_is_the_bare_conjunction() {
        let pattern = Quote::new(tag(), QuoteKind::Number(3.into()));
        let QuoteKind::Lambda { body, .. } = compile(&pattern, &tag()).unwrap() else {
            panic!("expected a lambda");
        };
        assert!(matches!(&body.kind, QuoteKind::Binary { op, .. } if op == "is"));
    }
}
