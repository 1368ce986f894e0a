//! The built-in parselet tables: nud, led and stmt.
//!
//! Each parselet is a function over the [`Reader`]. The nud table covers
//! words at expression start, the led table words after a reducible
//! expression, and the stmt table words at statement start. Read-time macros
//! install additional nud parselets through the reader context; everything
//! else is static dispatch on the word kind.

use std::str::FromStr;

use bigdecimal::BigDecimal;

use crate::{
    error::ReadResult,
    lexer::Trigger,
    quote::{FieldAccessor, MapKey, NextScope, Parameter, Parameters, QTag, Quote, QuoteKind},
    read::{MacroDef, Reader, prec},
    word::{Word, kind},
};

// ----------------------------------------------------------------------
// nud
// ----------------------------------------------------------------------

/// Parses one nud (expression-start) form.
pub fn nud(reader: &mut Reader<'_>) -> ReadResult<Quote> {
    let tag = reader.tag();

    if let Some(definition) = reader.context.macros.get(&reader.word.kind).cloned() {
        let word = reader.advance()?;
        return reader.expand_macro(&definition, &word);
    }

    match reader.word.kind.clone().as_str() {
        kind::SYMBOL => {
            let word = reader.advance()?;
            Ok(Quote::symbol(tag, word.lexeme))
        }
        kind::READTIME_SYMBOL => {
            if !reader.context.readtime {
                return Err(reader.die("a read-time symbol outside of a read-time context"));
            }
            let word = reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::ReadtimeSymbol(word.lexeme)))
        }
        kind::NUMBER => {
            let word = reader.advance()?;
            let number = BigDecimal::from_str(&word.lexeme)
                .map_err(|_| reader.die(format!("malformed number: {}", word.lexeme)))?;
            Ok(Quote::new(tag, QuoteKind::Number(number)))
        }
        kind::STRING => {
            let word = reader.advance()?;
            string_quote(reader, &tag, &word)
        }
        kind::REGEX => {
            let word = reader.advance()?;
            regex::Regex::new(&word.lexeme)
                .map_err(|e| reader.die(format!("malformed regex pattern: {e}")))?;
            Ok(Quote::new(tag, QuoteKind::Regex(word.lexeme)))
        }
        kind::TRUE => {
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::True))
        }
        kind::FALSE => {
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::False))
        }
        "_" => {
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::SuperlocalTake))
        }
        "&_" => {
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::SuperlocalTap))
        }
        "(" => {
            reader.advance()?;
            let inner = reader.led(prec::ZERO)?;
            reader.expect(")")?;
            Ok(inner)
        }
        "[" => vector(reader, tag),
        "%{" => map(reader, tag),
        "{" => {
            reader.advance()?;
            let mut statements = Vec::new();
            while !reader.word.is("}") {
                if reader.word.is_eof() {
                    return Err(reader.die("unterminated block"));
                }
                statements.push(reader.statement()?);
            }
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::Block(statements)))
        }
        "|" => spread(reader, tag),
        "'" => {
            reader.advance()?;
            let pattern = reader.led(prec::ASSIGNMENT)?;
            Ok(Quote::new(tag, QuoteKind::PatternEnvelope(Box::new(pattern))))
        }
        "<" if reader.context.readtime => {
            reader.advance()?;
            let inner = reader.led(prec::ZERO)?;
            reader.expect(">")?;
            Ok(Quote::new(tag, QuoteKind::ReadtimeEnvelope(Box::new(inner))))
        }
        "+" | "-" | "~" | "&" | "#" => {
            let word = reader.advance()?;
            let op = unary_name(&word.kind);
            let operand = reader.led(prec::PREFIX)?;
            Ok(Quote::new(
                tag,
                QuoteKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
            ))
        }
        kind::NOT => {
            reader.advance()?;
            let operand = reader.led(prec::PREFIX)?;
            Ok(Quote::new(
                tag,
                QuoteKind::Unary {
                    op: "not",
                    operand: Box::new(operand),
                },
            ))
        }
        kind::IF => {
            reader.advance()?;
            let cond = reader.led(prec::ZERO)?;
            let suc = reader.led(prec::ZERO)?;
            let alt = if reader.consume(kind::ELSE)?.is_some() {
                Some(Box::new(reader.led(prec::ZERO)?))
            } else {
                None
            };
            Ok(Quote::new(
                tag,
                QuoteKind::If {
                    cond: Box::new(cond),
                    suc: Box::new(suc),
                    alt,
                },
            ))
        }
        kind::LOOP => loop_quote(reader, tag),
        kind::TO => {
            reader.advance()?;
            let end = reader.led(prec::RANGE)?;
            Ok(Quote::new(
                tag,
                QuoteKind::Unary {
                    op: "to",
                    operand: Box::new(end),
                },
            ))
        }
        kind::FROM => {
            reader.advance()?;
            let start = reader.led(prec::RANGE)?;
            Ok(Quote::new(
                tag,
                QuoteKind::Unary {
                    op: "from",
                    operand: Box::new(start),
                },
            ))
        }
        kind::RETURN => {
            reader.advance()?;
            let value = reader.led(prec::ZERO)?;
            Ok(Quote::new(tag, QuoteKind::ReturnExpression(Box::new(value))))
        }
        other => Err(reader.die(format!("{other} cannot start an expression"))),
    }
}

fn unary_name(word_kind: &str) -> &'static str {
    match word_kind {
        "+" => "+",
        "-" => "-",
        "~" => "~",
        "&" => "&",
        "#" => "#",
        _ => "not",
    }
}

/// `[items…]` with an optional `| predicate` filter.
fn vector(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<Quote> {
    reader.advance()?;
    let mut items = Vec::new();
    if !reader.word.is("]") && !reader.word.is("|") {
        items.push(reader.led(prec::ZERO)?);
        while reader.consume(",")?.is_some() {
            items.push(reader.led(prec::ZERO)?);
        }
    }
    let vector = Quote::new(tag.clone(), QuoteKind::Vector { items });
    if reader.consume("|")?.is_some() {
        let predicate = reader.led(prec::ZERO)?;
        reader.expect("]")?;
        return Ok(Quote::new(
            tag,
            QuoteKind::FilterOver {
                vector: Box::new(vector),
                predicate: Box::new(predicate),
            },
        ));
    }
    reader.expect("]")?;
    Ok(vector)
}

/// `%{ key: value, … }`.
fn map(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<Quote> {
    reader.advance()?;
    let mut pairs = Vec::new();
    while !reader.word.is("}") {
        let key = match reader.word.kind.as_str() {
            kind::SYMBOL | kind::STRING => MapKey::Str(reader.advance()?.lexeme),
            "(" => {
                reader.advance()?;
                let expr = reader.led(prec::ZERO)?;
                reader.expect(")")?;
                MapKey::Expr(expr)
            }
            other => return Err(reader.die(format!("{other} cannot be a map key"))),
        };
        reader.expect(":")?;
        let value = reader.led(prec::ZERO)?;
        pairs.push((key, value));
        if reader.consume(",")?.is_none() {
            break;
        }
    }
    reader.expect("}")?;
    Ok(Quote::new(tag, QuoteKind::Map { pairs }))
}

/// `|+| v`, `|f| v` and `|f|: v`.
fn spread(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<Quote> {
    reader.advance()?;
    if let Some(op) = reduce_operator(reader)?
        && reader.peek_is_spread_close(&op)?
    {
        // Checked above: the operator word, then the closing bar.
        let op = reader.advance()?;
        reader.expect("|")?;
        let operand = reader.led(prec::ZERO)?;
        return Ok(Quote::new(
            tag,
            QuoteKind::ReduceSpread {
                op: op.lexeme,
                operand: Box::new(operand),
            },
        ));
    }
    let operator = reader.led(prec::ZERO)?;
    reader.expect("|")?;
    let iterative = reader.consume(":")?.is_some();
    let operand = reader.led(prec::ZERO)?;
    Ok(Quote::new(
        tag,
        QuoteKind::MapSpread {
            operator: Box::new(operator),
            operand: Box::new(operand),
            iterative,
        },
    ))
}

/// The operator word of a reduce spread, if the current word is one.
fn reduce_operator(reader: &Reader<'_>) -> ReadResult<Option<Word>> {
    let word = &reader.word;
    let is_operator = matches!(word.kind.as_str(), "+" | "-" | "*" | "/" | "~" | "&" | "<" | ">" | "<=" | ">=")
        || matches!(word.kind.as_str(), kind::AND | kind::OR | kind::IS | kind::IN)
        || (word.is(kind::SYMBOL) && word.lexeme == "x");
    Ok(if is_operator { Some(word.clone()) } else { None })
}

impl Reader<'_> {
    /// Whether the word after the current one closes a reduce spread.
    fn peek_is_spread_close(&mut self, _op: &Word) -> ReadResult<bool> {
        Ok(self.peek()?.is("|"))
    }
}

/// The four loop forms.
fn loop_quote(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<Quote> {
    reader.advance()?;
    let (mut start, mut base, mut step) = (None, None, None);
    if reader.consume("(")?.is_some() {
        let mut parts = vec![reader.led(prec::ZERO)?];
        while reader.consume(";")?.is_some() {
            parts.push(reader.led(prec::ZERO)?);
        }
        reader.expect(")")?;
        let mut parts = parts.into_iter();
        match parts.len() {
            1 => base = parts.next().map(Box::new),
            2 => {
                base = parts.next().map(Box::new);
                step = parts.next().map(Box::new);
            }
            3 => {
                start = parts.next().map(Box::new);
                base = parts.next().map(Box::new);
                step = parts.next().map(Box::new);
            }
            n => {
                return Err(reader.die(format!("a loop head takes up to three clauses, found {n}")));
            }
        }
    }
    let body = reader.led(prec::ZERO)?;
    Ok(Quote::new(
        tag,
        QuoteKind::Loop {
            start,
            base,
            step,
            body: Box::new(body),
        },
    ))
}

/// Processes escapes and `$` interpolation in a string literal.
///
/// The recognized escapes are `\n \r \t \" \\ \$`. `$name` splices the
/// symbol's value, a bare `$` splices one superlocal take; both stringify
/// through the `~` chain the literal desugars into.
fn string_quote(reader: &Reader<'_>, tag: &QTag, word: &Word) -> ReadResult<Quote> {
    let mut parts: Vec<Quote> = Vec::new();
    let mut buffer = String::new();
    let mut chars = word.lexeme.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => buffer.push('\n'),
                Some('r') => buffer.push('\r'),
                Some('t') => buffer.push('\t'),
                Some('"') => buffer.push('"'),
                Some('\\') => buffer.push('\\'),
                Some('$') => buffer.push('$'),
                other => {
                    let shown = other.map_or(String::new(), String::from);
                    return Err(reader.die(format!("unknown escape: \\{shown}")));
                }
            },
            '$' => {
                if matches!(chars.peek(), Some(c) if c.is_ascii_alphabetic() || *c == '_') {
                    let mut name = String::new();
                    while matches!(chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                        name.push(chars.next().expect("peeked"));
                    }
                    parts.push(Quote::new(tag.clone(), QuoteKind::Str(std::mem::take(&mut buffer))));
                    if name == "_" {
                        parts.push(Quote::new(tag.clone(), QuoteKind::SuperlocalTake));
                    } else {
                        parts.push(Quote::symbol(tag.clone(), name));
                    }
                } else {
                    parts.push(Quote::new(tag.clone(), QuoteKind::Str(std::mem::take(&mut buffer))));
                    parts.push(Quote::new(tag.clone(), QuoteKind::SuperlocalTake));
                }
            }
            _ => buffer.push(c),
        }
    }
    if parts.is_empty() {
        return Ok(Quote::new(tag.clone(), QuoteKind::Str(buffer)));
    }
    if !buffer.is_empty() {
        parts.push(Quote::new(tag.clone(), QuoteKind::Str(buffer)));
    }
    let mut chain = parts.remove(0);
    for part in parts {
        chain = Quote::new(
            tag.clone(),
            QuoteKind::Binary {
                op: "~".to_owned(),
                left: Box::new(chain),
                right: Box::new(part),
            },
        );
    }
    Ok(chain)
}

// ----------------------------------------------------------------------
// led
// ----------------------------------------------------------------------

/// The led binding power of a word kind, if it has a led parselet.
#[must_use]
pub fn led_power(word_kind: &str) -> Option<u8> {
    Some(match word_kind {
        "=" | ":=" | "+=" | "-=" | "*=" | "/=" | "~=" | "&=" => prec::ASSIGNMENT,
        kind::AND | kind::OR => prec::JUNCTION,
        kind::IS | kind::IN | "<" | ">" | "<=" | ">=" => prec::IDENTITY,
        kind::TO => prec::RANGE,
        "+" | "-" | "~" | "&" => prec::ADDITION,
        "*" | "/" | kind::X => prec::PRODUCT,
        "++" | "--" | "?" | kind::DIES => prec::POSTFIX,
        "(" | "[" => prec::CALL,
        "." => prec::FIELD,
        _ => return None,
    })
}

/// Applies the led parselet of the current word to `left`.
pub fn led(reader: &mut Reader<'_>, left: Quote) -> ReadResult<Quote> {
    let tag = reader.tag();
    match reader.word.kind.clone().as_str() {
        "=" | ":=" => {
            let global = reader.word.is(":=");
            reader.advance()?;
            validate_assign_target(reader, &left)?;
            let value = reader.led(prec::ZERO)?;
            Ok(Quote::new(
                tag,
                QuoteKind::Assign {
                    target: Box::new(left),
                    value: Box::new(value),
                    global,
                },
            ))
        }
        compound @ ("+=" | "-=" | "*=" | "/=" | "~=" | "&=") => {
            let op = compound[..1].to_owned();
            reader.advance()?;
            validate_assign_target(reader, &left)?;
            let value = reader.led(prec::ZERO)?;
            Ok(Quote::new(
                tag,
                QuoteKind::BinaryAssign {
                    op,
                    target: Box::new(left),
                    value: Box::new(value),
                },
            ))
        }
        "++" | "--" => {
            let increment = reader.word.is("++");
            reader.advance()?;
            let QuoteKind::Symbol(name) = left.kind else {
                return Err(reader.die("++ and -- expect a symbol"));
            };
            let kind = if increment {
                QuoteKind::ReturnIncrement(name)
            } else {
                QuoteKind::ReturnDecrement(name)
            };
            Ok(Quote::new(tag, kind))
        }
        "?" => {
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::IntoBool(Box::new(left))))
        }
        kind::DIES => {
            reader.advance()?;
            Ok(Quote::new(tag, QuoteKind::Dies(Box::new(left))))
        }
        "(" => {
            reader.advance()?;
            let mut args = Vec::new();
            if !reader.word.is(")") {
                args.push(reader.led(prec::ZERO)?);
                while reader.consume(",")?.is_some() {
                    args.push(reader.led(prec::ZERO)?);
                }
            }
            reader.expect(")")?;
            Ok(Quote::new(
                tag,
                QuoteKind::Call {
                    callee: Box::new(left),
                    args,
                },
            ))
        }
        "[" => {
            reader.advance()?;
            let mut args = vec![reader.led(prec::ZERO)?];
            while reader.consume(",")?.is_some() {
                args.push(reader.led(prec::ZERO)?);
            }
            reader.expect("]")?;
            Ok(Quote::new(
                tag,
                QuoteKind::Access {
                    head: Box::new(left),
                    args,
                },
            ))
        }
        "." => {
            reader.advance()?;
            let accessor = field_accessor(reader)?;
            if let QuoteKind::AccessField { head, mut path } = left.kind {
                path.push(accessor);
                return Ok(Quote::new(tag, QuoteKind::AccessField { head, path }));
            }
            Ok(Quote::new(
                tag,
                QuoteKind::AccessField {
                    head: Box::new(left),
                    path: vec![accessor],
                },
            ))
        }
        operator => {
            let power = led_power(operator).expect("led() is only called with a led word");
            let op = binary_name(operator, &reader.word.lexeme);
            reader.advance()?;
            let right = reader.led(power)?;
            Ok(Quote::new(
                tag,
                QuoteKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            ))
        }
    }
}

fn binary_name(word_kind: &str, lexeme: &str) -> String {
    match word_kind {
        kind::IS => "is".to_owned(),
        kind::IN => "in".to_owned(),
        kind::AND => "and".to_owned(),
        kind::OR => "or".to_owned(),
        kind::TO => "to".to_owned(),
        kind::X => "x".to_owned(),
        _ => lexeme.to_owned(),
    }
}

fn validate_assign_target(reader: &Reader<'_>, target: &Quote) -> ReadResult<()> {
    match target.kind {
        QuoteKind::Symbol(_) | QuoteKind::Access { .. } | QuoteKind::AccessField { .. } => Ok(()),
        _ => Err(reader.die("this cannot be assigned to")),
    }
}

fn field_accessor(reader: &mut Reader<'_>) -> ReadResult<FieldAccessor> {
    match reader.word.kind.clone().as_str() {
        kind::SYMBOL => Ok(FieldAccessor::Immediate(reader.advance()?.lexeme)),
        "(" => {
            reader.advance()?;
            let expr = reader.led(prec::ZERO)?;
            reader.expect(")")?;
            Ok(FieldAccessor::Dynamic(expr))
        }
        "[" => {
            reader.advance()?;
            let mut branches = vec![branch_accessor(reader)?];
            while reader.consume(",")?.is_some() {
                branches.push(branch_accessor(reader)?);
            }
            reader.expect("]")?;
            Ok(FieldAccessor::Branches(branches))
        }
        other => Err(reader.die(format!("{other} cannot be a field accessor"))),
    }
}

fn branch_accessor(reader: &mut Reader<'_>) -> ReadResult<FieldAccessor> {
    match reader.word.kind.clone().as_str() {
        kind::SYMBOL => Ok(FieldAccessor::Immediate(reader.advance()?.lexeme)),
        "(" => {
            reader.advance()?;
            let expr = reader.led(prec::ZERO)?;
            reader.expect(")")?;
            Ok(FieldAccessor::Dynamic(expr))
        }
        other => Err(reader.die(format!("{other} cannot be a field branch"))),
    }
}

// ----------------------------------------------------------------------
// stmt
// ----------------------------------------------------------------------

/// Parses one stmt (statement-start) form, if the current word has one.
///
/// Returns the quote and whether a semicolon is required afterwards.
pub fn stmt(reader: &mut Reader<'_>) -> ReadResult<Option<(Quote, bool)>> {
    let tag = reader.tag();
    match reader.word.kind.as_str() {
        kind::FUN => fun(reader, tag).map(Some),
        kind::BOX => box_quote(reader, tag).map(|(quote, semi)| Some((quote, semi))),
        kind::IMMEDIATE => {
            reader.advance()?;
            if !reader.word.is(kind::BOX) {
                return Err(reader.die("immediate must be followed by a box declaration"));
            }
            let (inner, semi) = box_quote(reader, tag.clone())?;
            Ok(Some((Quote::new(tag, QuoteKind::ImmediateBox(Box::new(inner))), semi)))
        }
        kind::NUD => nud_definition(reader, tag).map(Some),
        kind::ENSURE => ensure(reader, tag).map(Some),
        kind::RETURN => {
            reader.advance()?;
            if reader.consume(kind::QUEUE)?.is_some() {
                return Ok(Some((Quote::new(tag, QuoteKind::ReturnQueue), true)));
            }
            let value = reader.led(prec::ZERO)?;
            Ok(Some((Quote::new(tag, QuoteKind::ReturnStatement(Box::new(value))), true)))
        }
        kind::NEXT => {
            reader.advance()?;
            let scope = if reader.consume(kind::FUN)?.is_some() {
                Some(NextScope::Fun)
            } else if reader.consume(kind::LOOP)?.is_some() {
                Some(NextScope::Loop)
            } else {
                None
            };
            let mut args = Vec::new();
            if !reader.word.is(";") && !reader.word.is("}") && !reader.word.is_eof() {
                args.push(reader.led(prec::ZERO)?);
                while reader.consume(",")?.is_some() {
                    args.push(reader.led(prec::ZERO)?);
                }
            }
            Ok(Some((Quote::new(tag, QuoteKind::Next { scope, args }), true)))
        }
        kind::QUEUE => {
            reader.advance()?;
            let value = reader.led(prec::ZERO)?;
            Ok(Some((Quote::new(tag, QuoteKind::Queue(Box::new(value))), true)))
        }
        _ => Ok(None),
    }
}

/// `fun name(params) given g, … { body }` or `… = expr`.
fn fun(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<(Quote, bool)> {
    reader.advance()?;
    let name = reader.expect(kind::SYMBOL)?.lexeme;
    let params = if reader.word.is("(") {
        parse_params(reader)?
    } else {
        Parameters::default()
    };
    let givens = parse_givens(reader)?;
    let (body, needs_semicolon) = parse_body(reader)?;
    Ok((
        Quote::new(
            tag,
            QuoteKind::Fun {
                name,
                params,
                givens,
                body,
            },
        ),
        needs_semicolon,
    ))
}

/// `box Name(params) given g, … { field = value; … }`.
fn box_quote(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<(Quote, bool)> {
    reader.advance()?;
    let name = reader.expect(kind::SYMBOL)?.lexeme;
    let params = if reader.word.is("(") {
        parse_params(reader)?
    } else {
        Parameters::default()
    };
    let givens = parse_givens(reader)?;
    let mut fields = Vec::new();
    if reader.consume("{")?.is_some() {
        while !reader.word.is("}") {
            let field = reader.expect(kind::SYMBOL)?.lexeme;
            reader.expect("=")?;
            let value = reader.led(prec::ZERO)?;
            fields.push((field, value));
            if reader.consume(";")?.is_none() {
                break;
            }
        }
        reader.expect("}")?;
        Ok((
            Quote::new(
                tag,
                QuoteKind::Box {
                    name,
                    params,
                    givens,
                    fields,
                },
            ),
            false,
        ))
    } else {
        Ok((
            Quote::new(
                tag,
                QuoteKind::Box {
                    name,
                    params,
                    givens,
                    fields,
                },
            ),
            true,
        ))
    }
}

/// `nud trigger(params) = body` or `nud trigger(params) { body }`.
///
/// The trigger is a regex literal or a keyword; the body is read in a
/// read-time context and registered unexpanded.
fn nud_definition(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<(Quote, bool)> {
    reader.advance()?;
    let trigger = reader.advance()?;
    let params = if reader.word.is("(") {
        parse_params(reader)?
    } else {
        Parameters::default()
    };

    let was_readtime = reader.context.readtime;
    reader.context.readtime = true;
    let body_result = parse_body(reader);
    reader.context.readtime = was_readtime;
    let (body, needs_semicolon) = body_result?;

    let word_kind = match trigger.kind.as_str() {
        kind::REGEX => {
            let word_kind = reader.context.fresh_kind();
            let compiled = Trigger::new(word_kind.clone(), &trigger.lexeme, reader.file.as_ref(), trigger.line)?;
            reader.context.triggers.push(compiled);
            word_kind
        }
        kind::STRING | kind::SYMBOL => {
            let lexeme = trigger.lexeme.clone();
            let word_kind = lexeme.to_uppercase();
            if crate::word::keyword_kinds().contains_key(lexeme.as_str()) {
                return Err(reader.die(format!("{lexeme} is already a keyword")));
            }
            reader.context.user_keywords.insert(lexeme, word_kind.clone());
            word_kind
        }
        other => return Err(reader.die(format!("{other} cannot trigger a nud macro"))),
    };

    reader
        .context
        .macros
        .insert(word_kind, std::rc::Rc::new(MacroDef { params, body }));
    Ok((Quote::new(tag, QuoteKind::Group(Vec::new())), needs_semicolon))
}

/// `ensure expr` or `ensure "title" { should "case" expr; … }`.
fn ensure(reader: &mut Reader<'_>, tag: QTag) -> ReadResult<(Quote, bool)> {
    reader.advance()?;
    let subject = reader.led(prec::ZERO)?;
    if !reader.word.is("{") {
        return Ok((Quote::new(tag, QuoteKind::Ensure(Box::new(subject))), true));
    }
    reader.advance()?;
    let mut cases = Vec::new();
    while reader.word.is(kind::SHOULD) {
        let should_tag = reader.tag();
        reader.advance()?;
        let title = reader.expect(kind::STRING)?.lexeme;
        let mut body = Vec::new();
        while !reader.word.is(kind::SHOULD) && !reader.word.is("}") {
            if reader.word.is_eof() {
                return Err(reader.die("unterminated ensure block"));
            }
            body.push(reader.led(prec::ZERO)?);
            if reader.consume(";")?.is_none() {
                break;
            }
        }
        cases.push(Quote::new(should_tag, QuoteKind::EnsureShould { title, cases: body }));
    }
    reader.expect("}")?;
    Ok((
        Quote::new(
            tag,
            QuoteKind::EnsureTest {
                title: Box::new(subject),
                cases,
            },
        ),
        false,
    ))
}

/// `(a, _, *rest, &ctx, '[p])`.
fn parse_params(reader: &mut Reader<'_>) -> ReadResult<Parameters> {
    let line = reader.word.line;
    reader.expect("(")?;
    let mut items = Vec::new();
    while !reader.word.is(")") {
        let index = items.len();
        let param = match reader.word.kind.clone().as_str() {
            "*" => {
                reader.advance()?;
                let name = if reader.word.is(kind::SYMBOL) {
                    Some(reader.advance()?.lexeme)
                } else {
                    None
                };
                Parameter {
                    index,
                    name,
                    given: None,
                    slurpy: true,
                    underscore: false,
                    contextual: false,
                    pattern: None,
                }
            }
            "_" => {
                reader.advance()?;
                Parameter {
                    index,
                    name: None,
                    given: None,
                    slurpy: false,
                    underscore: true,
                    contextual: false,
                    pattern: None,
                }
            }
            "&" => {
                reader.advance()?;
                let name = reader.expect(kind::SYMBOL)?.lexeme;
                Parameter {
                    index,
                    name: Some(name),
                    given: None,
                    slurpy: false,
                    underscore: false,
                    contextual: true,
                    pattern: None,
                }
            }
            "'" => {
                let pattern = nud(reader)?;
                Parameter {
                    index,
                    name: None,
                    given: None,
                    slurpy: false,
                    underscore: false,
                    contextual: false,
                    pattern: Some(Box::new(pattern)),
                }
            }
            kind::SYMBOL => Parameter::named(index, reader.advance()?.lexeme),
            other => return Err(reader.die(format!("{other} cannot be a parameter"))),
        };
        items.push(param);
        if reader.consume(",")?.is_none() {
            break;
        }
    }
    reader.expect(")")?;
    Parameters::new(items, reader.file.as_ref(), line)
}

/// `given g1, g2, …` before a body.
fn parse_givens(reader: &mut Reader<'_>) -> ReadResult<Vec<Quote>> {
    let mut givens = Vec::new();
    if reader.consume(kind::GIVEN)?.is_some() {
        givens.push(reader.led(prec::ASSIGNMENT)?);
        while reader.consume(",")?.is_some() {
            givens.push(reader.led(prec::ASSIGNMENT)?);
        }
    }
    Ok(givens)
}

/// `{ statements }` or `= expr`; the flag is whether a semicolon follows.
fn parse_body(reader: &mut Reader<'_>) -> ReadResult<(Vec<Quote>, bool)> {
    if reader.consume("=")?.is_some() {
        let body = reader.led(prec::ZERO)?;
        return Ok((vec![body], true));
    }
    reader.expect("{")?;
    let mut statements = Vec::new();
    while !reader.word.is("}") {
        if reader.word.is_eof() {
            return Err(reader.die("unterminated body"));
        }
        statements.push(reader.statement()?);
    }
    reader.advance()?;
    Ok((statements, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::Reader;

    fn read_one(src: &str) -> Quote {
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let mut quotes = reader.read().unwrap();
        assert_eq!(quotes.len(), 1, "expected one statement");
        quotes.remove(0)
    }

    #[test]
    fn precedence_binds_product_tighter_than_addition() {
        let quote = read_one("1 + 2 * 3");
        let QuoteKind::Binary { op, right, .. } = &quote.kind else {
            panic!("expected a binary quote");
        };
        assert_eq!(op, "+");
        assert!(matches!(&right.kind, QuoteKind::Binary { op, .. } if op == "*"));
    }

    #[test]
    fn call_and_field_bind_tightest() {
        let quote = read_one("point.x(1)[2]");
        assert!(matches!(quote.kind, QuoteKind::Access { .. }));
    }

    #[test]
    fn fun_reads_params_givens_and_expression_body() {
        let quote = read_one("fun add(a, b) given num, num = a + b;");
        let QuoteKind::Fun {
            name, params, givens, body,
        } = &quote.kind
        else {
            panic!("expected a fun quote");
        };
        assert_eq!(name, "add");
        assert_eq!(params.len(), 2);
        assert_eq!(givens.len(), 2);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn slurpy_must_be_last() {
        let mut reader = Reader::new("test.vsp", "fun f(*rest, a) = 1;").unwrap();
        assert!(reader.read().is_err());
    }

    #[test]
    fn vector_filter_reads_as_filter_over() {
        let quote = read_one("[1, 2, 3 | _ > 2]");
        assert!(matches!(quote.kind, QuoteKind::FilterOver { .. }));
    }

    #[test]
    fn reduce_spread_wants_a_bare_operator() {
        let quote = read_one("|+| [1, 2, 3]");
        let QuoteKind::ReduceSpread { op, .. } = &quote.kind else {
            panic!("expected a reduce spread");
        };
        assert_eq!(op, "+");
    }

    #[test]
    fn map_spread_with_colon_is_iterative() {
        let quote = read_one("|_ + 1|: [1, 2, 3]");
        let QuoteKind::MapSpread { iterative, .. } = &quote.kind else {
            panic!("expected a map spread");
        };
        assert!(*iterative);
    }

    #[test]
    fn string_interpolation_desugars_to_concat() {
        let quote = read_one(r#""sum: $x""#);
        let QuoteKind::Binary { op, left, right } = &quote.kind else {
            panic!("expected a concat chain");
        };
        assert_eq!(op, "~");
        assert_eq!(left.kind, QuoteKind::Str("sum: ".to_owned()));
        assert_eq!(right.kind, QuoteKind::Symbol("x".to_owned()));
    }

    #[test]
    fn escaped_dollar_stays_text() {
        let quote = read_one(r#""cost: \$5""#);
        assert_eq!(quote.kind, QuoteKind::Str("cost: $5".to_owned()));
    }

    #[test]
    fn keyword_macro_expands_at_use() {
        let src = "nud unless(cond, then) = if not $cond $then; unless false, 42;";
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let quotes = reader.read().unwrap();
        assert_eq!(quotes.len(), 2);
        assert!(matches!(quotes[1].kind, QuoteKind::If { .. }));
    }

    #[test]
    fn regex_macro_exports_named_captures() {
        let src = "nud `#(?P<hex>[0-9a-f]{6})`() = $hex; #a1b2c3;";
        let mut reader = Reader::new("test.vsp", src).unwrap();
        let quotes = reader.read().unwrap();
        assert_eq!(quotes[1].kind, QuoteKind::Str("a1b2c3".to_owned()));
    }

    #[test]
    fn readtime_envelope_folds_at_expansion() {
        let mut reader = Reader::new("test.vsp", "nud two() = <1 + 1>; two;").unwrap();
        let quotes = reader.read().unwrap();
        assert_eq!(quotes[1].kind, QuoteKind::Number(2.into()));
    }

    #[test]
    fn mixed_macro_expansion_dies() {
        let src = "nud bad() { fun f() = 1; 2; } bad;";
        let mut reader = Reader::new("test.vsp", src).unwrap();
        assert!(reader.read().is_err());
    }
}
