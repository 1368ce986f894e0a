//! The transformer: tree-to-tree lowering between reading and compilation.
//!
//! A type-dispatched recursive visitor that rewrites quotes in place:
//! filter-over-vector and access-assignment lower into internal builtin
//! calls, immediate boxes into a declare-and-instantiate group, pattern
//! envelopes into verification lambdas. Each rewrite preserves tags, and
//! transformation is idempotent: a second pass over a transformed tree
//! changes nothing.

use crate::{
    error::{ReadError, ReadResult},
    pattern,
    quote::{Quote, QuoteKind},
};

/// Transforms every top-level quote of a unit.
pub fn transform_all(quotes: &mut [Quote]) -> ReadResult<()> {
    for quote in quotes {
        transform(quote)?;
    }
    Ok(())
}

/// Transforms one quote tree, in place.
pub fn transform(quote: &mut Quote) -> ReadResult<()> {
    rewrite(quote)?;
    let mut failure: Option<ReadError> = None;
    quote.visit_children_mut(&mut |child| {
        if failure.is_none()
            && let Err(e) = transform(child)
        {
            failure = Some(e);
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Applies the rewrite for this node, if its kind has one.
fn rewrite(quote: &mut Quote) -> ReadResult<()> {
    let tag = quote.tag.clone();
    match &quote.kind {
        QuoteKind::ReadtimeSymbol(name) => {
            return Err(ReadError::new(
                format!("the read-time symbol ${name} was never expanded"),
                tag.file.as_ref(),
                tag.line,
            ));
        }
        QuoteKind::QuoteEnvelope(_) => {
            return Err(ReadError::new(
                "a quote envelope outside of a read-time context",
                tag.file.as_ref(),
                tag.line,
            ));
        }
        _ => {}
    }

    let kind = std::mem::replace(&mut quote.kind, QuoteKind::Hole);
    quote.kind = match kind {
        // `[v… | pred]` -> `__filter(v, pred-as-callable)`.
        QuoteKind::FilterOver { vector, predicate } => QuoteKind::Call {
            callee: Box::new(Quote::symbol(tag.clone(), "__filter")),
            args: vec![*vector, callable_of(&tag, *predicate)],
        },
        // `a[k…] = v` -> `__access_assign(a, v, k…)`.
        QuoteKind::Assign { target, value, global } => match target.kind {
            QuoteKind::Access { head, args } => {
                let mut call_args = vec![*head, *value];
                call_args.extend(args);
                QuoteKind::Call {
                    callee: Box::new(Quote::symbol(tag.clone(), "__access_assign")),
                    args: call_args,
                }
            }
            _ => QuoteKind::Assign { target, value, global },
        },
        // `a[k…] op= v` -> `__access_assign(a, a[k…] op v, k…)`.
        QuoteKind::BinaryAssign { op, target, value } => match target.kind {
            QuoteKind::Access { head, args } => {
                let access = Quote::new(
                    tag.clone(),
                    QuoteKind::Access {
                        head: head.clone(),
                        args: args.clone(),
                    },
                );
                let combined = Quote::new(
                    tag.clone(),
                    QuoteKind::Binary {
                        op,
                        left: Box::new(access),
                        right: value,
                    },
                );
                let mut call_args = vec![*head, combined];
                call_args.extend(args);
                QuoteKind::Call {
                    callee: Box::new(Quote::symbol(tag.clone(), "__access_assign")),
                    args: call_args,
                }
            }
            _ => QuoteKind::BinaryAssign { op, target, value },
        },
        // `immediate box Name { … }` -> `{ box Name { … }; Name := Name(); }`.
        QuoteKind::ImmediateBox(declaration) => {
            let QuoteKind::Box { name, params, .. } = &declaration.kind else {
                return Err(ReadError::new(
                    "immediate expects a box declaration",
                    tag.file.as_ref(),
                    tag.line,
                ));
            };
            if !params.is_empty() {
                return Err(ReadError::new(
                    format!("an immediate box cannot be parametric: {name} takes parameters"),
                    tag.file.as_ref(),
                    tag.line,
                ));
            }
            let name = name.clone();
            let instantiate = Quote::new(
                tag.clone(),
                QuoteKind::Assign {
                    target: Box::new(Quote::symbol(tag.clone(), name.clone())),
                    value: Box::new(Quote::new(
                        tag.clone(),
                        QuoteKind::Call {
                            callee: Box::new(Quote::symbol(tag.clone(), name)),
                            args: Vec::new(),
                        },
                    )),
                    global: true,
                },
            );
            QuoteKind::Group(vec![*declaration, instantiate])
        }
        // `'pattern` -> its verification lambda.
        QuoteKind::PatternEnvelope(inner) => pattern::compile(&inner, &tag)?,
        other => other,
    };
    Ok(())
}

/// Wraps a predicate in a zero-parameter lambda unless it is already
/// callable by name or by construction.
fn callable_of(tag: &crate::quote::QTag, predicate: Quote) -> Quote {
    if matches!(predicate.kind, QuoteKind::Symbol(_) | QuoteKind::Lambda { .. }) {
        return predicate;
    }
    Quote::new(
        tag.clone(),
        QuoteKind::Lambda {
            params: crate::quote::Parameters::default(),
            body: Box::new(predicate),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::Reader;

    fn transformed(src: &str) -> Vec<Quote> {
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        quotes
    }

    #[test]
    fn filter_over_lowers_to_the_filter_builtin() {
        let quotes = transformed("[1, 2 | _ > 1]");
        let QuoteKind::Call { callee, args } = &quotes[0].kind else {
            panic!("expected a call");
        };
        assert_eq!(callee.kind, QuoteKind::Symbol("__filter".to_owned()));
        assert_eq!(args.len(), 2);
        assert!(matches!(args[1].kind, QuoteKind::Lambda { .. }));
    }

    #[test]
    fn access_assign_lowers_to_the_builtin() {
        let quotes = transformed("v[0] = 5");
        let QuoteKind::Call { callee, args } = &quotes[0].kind else {
            panic!("expected a call");
        };
        assert_eq!(callee.kind, QuoteKind::Symbol("__access_assign".to_owned()));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn plain_assign_is_untouched() {
        let quotes = transformed("v = 5");
        assert!(matches!(quotes[0].kind, QuoteKind::Assign { .. }));
    }

    #[test]
    fn pattern_envelope_becomes_a_lambda() {
        let quotes = transformed("'[a, b]");
        assert!(matches!(quotes[0].kind, QuoteKind::Lambda { .. }));
    }

    #[test]
    fn immediate_box_declares_and_instantiates() {
        let quotes = transformed("immediate box Config { port = 8080; }");
        let QuoteKind::Group(parts) = &quotes[0].kind else {
            panic!("expected a group");
        };
        assert!(matches!(parts[0].kind, QuoteKind::Box { .. }));
        assert!(matches!(parts[1].kind, QuoteKind::Assign { global: true, .. }));
    }

    #[test]
    fn parametric_immediate_box_dies() {
        let mut reader = Reader::new("test.vsp", "immediate box Point(x) { }").unwrap();
        let mut quotes = reader.read().unwrap();
        assert!(transform_all(&mut quotes).is_err());
    }

    #[test]
    fn transformation_is_idempotent() {
        let src = "[1, 2 | _ > 1]; v[0] = 5; '[a, b]; immediate box C { x = 1; }";
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let mut quotes = reader.read().unwrap();
        transform_all(&mut quotes).unwrap();
        let once = quotes.clone();
        transform_all(&mut quotes).unwrap();
        assert_eq!(once, quotes);
    }
}
