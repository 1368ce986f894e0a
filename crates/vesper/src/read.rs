//! The reader: source text to top-level quotes.
//!
//! A Pratt parser over the lexer. Parselets live in three tables: `nud`
//! (word at expression start), `led` (word after an expression) and `stmt`
//! (word at statement start). The built-in tables are static dispatch in
//! [`crate::parselets`]; read-time macros extend the nud table through the
//! [`ReadContext`] while the file is still being read.
//!
//! The reader also owns the unit prelude: `distinct?` consumes an optional
//! `distinct a.b.c;` and `exposes` consumes any number of `expose …;`
//! statements. Both must run before statement iteration; a `distinct` or
//! `expose` encountered later dies.

use std::rc::Rc;

use ahash::AHashMap;
use bigdecimal::BigDecimal;

use crate::{
    error::{ReadError, ReadResult},
    lexer::{Lexer, Trigger},
    parselets,
    quote::{Parameters, QTag, Quote, QuoteKind},
    word::{Word, kind},
};

/// Binding powers, loosest to tightest.
pub mod prec {
    pub const ZERO: u8 = 0;
    pub const ASSIGNMENT: u8 = 1;
    pub const CONVERT: u8 = 2;
    pub const JUNCTION: u8 = 3;
    pub const IDENTITY: u8 = 4;
    pub const RANGE: u8 = 5;
    pub const ADDITION: u8 = 6;
    pub const PRODUCT: u8 = 7;
    pub const POSTFIX: u8 = 8;
    pub const PREFIX: u8 = 9;
    pub const CALL: u8 = 10;
    pub const FIELD: u8 = 11;
}

/// A read-time macro: declared parameters and the unexpanded body.
#[derive(Debug, Clone)]
pub struct MacroDef {
    pub params: Parameters,
    pub body: Vec<Quote>,
}

/// Reader state that read-time macros extend.
#[derive(Debug, Default)]
pub struct ReadContext {
    /// Keyword triggers registered by macros: lexeme to word kind.
    pub user_keywords: AHashMap<String, String>,
    /// Regex triggers registered by macros.
    pub triggers: Vec<Trigger>,
    /// Installed macro parselets, by word kind.
    pub macros: AHashMap<String, Rc<MacroDef>>,
    /// Whether `$name` and `<…>` are currently legal.
    pub readtime: bool,
    /// Counter for generated trigger kinds.
    nud_counter: u32,
}

impl ReadContext {
    /// Generates a fresh word kind for a regex trigger.
    pub fn fresh_kind(&mut self) -> String {
        self.nud_counter += 1;
        format!("__NUD{}__", self.nud_counter)
    }
}

/// The reader for one source unit.
pub struct Reader<'src> {
    lexer: Lexer<'src>,
    /// The current word.
    pub word: Word,
    pub file: Rc<str>,
    pub context: ReadContext,
}

impl<'src> Reader<'src> {
    pub fn new(file: impl Into<String>, src: &'src str) -> ReadResult<Self> {
        let file = file.into();
        let mut lexer = Lexer::new(file.clone(), src);
        let context = ReadContext::default();
        let word = lexer.next_word(&context.triggers, &context.user_keywords)?;
        Ok(Self {
            lexer,
            word,
            file: Rc::from(file.as_str()),
            context,
        })
    }

    /// A read error at the current word.
    pub fn die(&self, message: impl Into<String>) -> ReadError {
        ReadError::new(message, self.file.as_ref(), self.word.line).with_lexeme(&self.word.lexeme)
    }

    /// The tag for quotes produced at the current position.
    #[must_use]
    pub fn tag(&self) -> QTag {
        QTag::new(&self.file, self.word.line)
    }

    /// Consumes the current word, returning it, and scans the next.
    pub fn advance(&mut self) -> ReadResult<Word> {
        let next = self.lexer.next_word(&self.context.triggers, &self.context.user_keywords)?;
        Ok(std::mem::replace(&mut self.word, next))
    }

    /// Consumes the current word if it has the wanted kind.
    pub fn consume(&mut self, wanted: &str) -> ReadResult<Option<Word>> {
        if self.word.is(wanted) {
            return self.advance().map(Some);
        }
        Ok(None)
    }

    /// Consumes the current word, dying unless it has the wanted kind.
    pub fn expect(&mut self, wanted: &str) -> ReadResult<Word> {
        if self.word.is(wanted) {
            return self.advance();
        }
        Err(self.die(format!("expected {wanted}, found {}", self.word.kind)))
    }

    /// Scans one word ahead without consuming anything.
    pub fn peek(&mut self) -> ReadResult<Word> {
        self.lexer
            .clone_scan(&self.context.triggers, &self.context.user_keywords)
    }

    /// Reads an expression at the given binding power.
    ///
    /// Reads one nud, then folds in led parselets while their precedence
    /// exceeds `level`. The symbol `x` in operator position is retyped to
    /// the multiplicative operator.
    pub fn led(&mut self, level: u8) -> ReadResult<Quote> {
        let mut left = parselets::nud(self)?;
        loop {
            if self.word.is(kind::SYMBOL) && self.word.lexeme == "x" {
                self.word.kind = kind::X.to_owned();
            }
            let Some(power) = parselets::led_power(&self.word.kind) else {
                return Ok(left);
            };
            if power <= level {
                return Ok(left);
            }
            left = parselets::led(self, left)?;
        }
    }

    /// Reads one statement, enforcing the semicolon rule.
    ///
    /// A semicolon is required afterwards unless the parselet opted out or
    /// the next word is EOF, `}` or `;`.
    pub fn statement(&mut self) -> ReadResult<Quote> {
        if self.word.is(kind::DISTINCT) || self.word.is(kind::EXPOSE) {
            return Err(self.die("distinct and expose belong to the unit prelude"));
        }
        let (quote, needs_semicolon) = match parselets::stmt(self)? {
            Some(result) => result,
            None => (self.led(prec::ZERO)?, true),
        };
        if self.word.is(";") {
            self.advance()?;
        } else if needs_semicolon && !self.word.is_eof() && !self.word.is("}") {
            return Err(self.die(format!("expected ';' after the statement, found {}", self.word.kind)));
        }
        Ok(quote)
    }

    /// Reads every remaining statement.
    pub fn read(&mut self) -> ReadResult<Vec<Quote>> {
        let mut statements = Vec::new();
        while !self.word.is_eof() {
            statements.push(self.statement()?);
        }
        Ok(statements)
    }

    // ------------------------------------------------------------------
    // Unit prelude
    // ------------------------------------------------------------------

    /// Consumes an optional `distinct a.b.c;`, returning the path.
    pub fn distinct(&mut self) -> ReadResult<Option<Vec<String>>> {
        if !self.word.is(kind::DISTINCT) {
            return Ok(None);
        }
        self.advance()?;
        let path = self.dotted_path()?;
        self.expect(";")?;
        Ok(Some(path))
    }

    /// Consumes zero or more `expose a.b.c;` statements, returning the
    /// paths in order.
    pub fn exposes(&mut self) -> ReadResult<Vec<Vec<String>>> {
        let mut paths = Vec::new();
        while self.word.is(kind::EXPOSE) {
            self.advance()?;
            paths.push(self.dotted_path()?);
            self.expect(";")?;
        }
        Ok(paths)
    }

    fn dotted_path(&mut self) -> ReadResult<Vec<String>> {
        let mut path = vec![self.expect(kind::SYMBOL)?.lexeme];
        while self.consume(".")?.is_some() {
            path.push(self.expect(kind::SYMBOL)?.lexeme);
        }
        Ok(path)
    }

    // ------------------------------------------------------------------
    // Macro expansion support
    // ------------------------------------------------------------------

    /// Expands a macro triggered by `word`, yielding the resulting quote.
    ///
    /// Reads the declared arguments, binds them (plus the trigger word's
    /// named captures), clones the body, runs the read-time substitution
    /// visitor and evaluates `<…>` envelopes. An expansion must be either a
    /// single expression or a run of statements; a mixture, or nothing, is
    /// an error.
    pub fn expand_macro(&mut self, definition: &Rc<MacroDef>, word: &Word) -> ReadResult<Quote> {
        let tag = QTag::new(&self.file, word.line);
        let mut bindings: AHashMap<String, Quote> = AHashMap::new();

        if let Some(captures) = &word.captures {
            for (name, text) in captures {
                bindings.insert(name.clone(), Quote::new(tag.clone(), QuoteKind::Str(text.clone())));
            }
        }

        let params = definition.params.items();
        for param in params {
            if param.slurpy {
                let mut rest = Vec::new();
                if !bindings_done(self) {
                    rest.push(self.led(prec::ASSIGNMENT)?);
                    while self.consume(",")?.is_some() {
                        rest.push(self.led(prec::ASSIGNMENT)?);
                    }
                }
                if let Some(name) = &param.name {
                    bindings.insert(name.clone(), Quote::new(tag.clone(), QuoteKind::Vector { items: rest }));
                }
                break;
            }
            if param.index > 0 {
                self.expect(",")?;
            }
            let argument = self.led(prec::ASSIGNMENT)?;
            if let Some(name) = &param.name {
                bindings.insert(name.clone(), argument);
            }
        }

        let mut expansion = definition.body.clone();
        for quote in &mut expansion {
            quote.expand_readtime(&bindings);
            eval_readtime_envelopes(quote, self.file.as_ref())?;
        }

        match classify_expansion(&expansion) {
            Expansion::Expression => Ok(expansion.into_iter().next().expect("classified as one expression")),
            Expansion::Statements => Ok(Quote::new(tag, QuoteKind::Group(expansion))),
            Expansion::Mixed => Err(ReadError::new(
                "a macro must expand to one expression or to statements, not a mixture",
                self.file.as_ref(),
                word.line,
            )),
            Expansion::Empty => Err(ReadError::new(
                "a macro expanded to nothing",
                self.file.as_ref(),
                word.line,
            )),
        }
    }
}

fn bindings_done(reader: &Reader<'_>) -> bool {
    reader.word.is_eof() || reader.word.is(";") || reader.word.is("}") || reader.word.is(")")
}

enum Expansion {
    Expression,
    Statements,
    Mixed,
    Empty,
}

/// A single quote yields itself; a uniform run of quotes splices as a
/// statement group (expressions are valid statements). Mixing statement-only
/// forms with expressions has no single splice position, so it is an error.
fn classify_expansion(quotes: &[Quote]) -> Expansion {
    if quotes.is_empty() {
        return Expansion::Empty;
    }
    if quotes.len() == 1 {
        return Expansion::Expression;
    }
    let statements = quotes.iter().filter(|q| q.is_statement()).count();
    if statements == 0 || statements == quotes.len() {
        return Expansion::Statements;
    }
    Expansion::Mixed
}

/// Replaces every `<…>` envelope in the tree with its read-time value.
fn eval_readtime_envelopes(quote: &mut Quote, file: &str) -> ReadResult<()> {
    let mut failure: Option<ReadError> = None;
    quote.visit_children_mut(&mut |child| {
        if failure.is_some() {
            return;
        }
        if let Err(e) = eval_readtime_envelopes(child, file) {
            failure = Some(e);
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    if let QuoteKind::ReadtimeEnvelope(inner) = &quote.kind {
        let value = eval_readtime(inner, file)?;
        let tag = quote.tag.clone();
        *quote = Quote::new(tag, value);
    }
    Ok(())
}

/// The tiny read-time evaluator behind `<…>`.
///
/// Supports literal numbers, strings and bools, and `+ - * / ~` over them.
/// Anything else is a read error: read-time evaluation is for splicing
/// computed literals, not for running programs.
fn eval_readtime(quote: &Quote, file: &str) -> ReadResult<QuoteKind> {
    let fail = || ReadError::new("unsupported read-time evaluation", file, quote.tag.line);
    match &quote.kind {
        QuoteKind::Number(n) => Ok(QuoteKind::Number(n.clone())),
        QuoteKind::Str(s) => Ok(QuoteKind::Str(s.clone())),
        QuoteKind::True => Ok(QuoteKind::True),
        QuoteKind::False => Ok(QuoteKind::False),
        QuoteKind::Binary { op, left, right } => {
            let left = eval_readtime(left, file)?;
            let right = eval_readtime(right, file)?;
            if op == "~" {
                return Ok(QuoteKind::Str(format!(
                    "{}{}",
                    readtime_text(&left),
                    readtime_text(&right)
                )));
            }
            let (QuoteKind::Number(l), QuoteKind::Number(r)) = (&left, &right) else {
                return Err(fail());
            };
            let result: BigDecimal = match op.as_str() {
                "+" => l + r,
                "-" => l - r,
                "*" => l * r,
                "/" if !bigdecimal::Zero::is_zero(r) => l / r,
                _ => return Err(fail()),
            };
            Ok(QuoteKind::Number(result))
        }
        _ => Err(fail()),
    }
}

fn readtime_text(kind: &QuoteKind) -> String {
    match kind {
        QuoteKind::Number(n) => n.clone().normalized().to_string(),
        QuoteKind::Str(s) => s.clone(),
        QuoteKind::True => "true".to_owned(),
        QuoteKind::False => "false".to_owned(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(src: &str) -> Vec<Quote> {
        let mut reader = Reader::new("test.vsp", src).unwrap();
        reader.read().unwrap()
    }

    #[test]
    fn statements_need_semicolons() {
        let mut reader = Reader::new("test.vsp", "1 + 2 3").unwrap();
        assert!(reader.read().is_err());
    }

    #[test]
    fn trailing_semicolon_is_optional_at_eof() {
        assert_eq!(read_all("1 + 2").len(), 1);
    }

    #[test]
    fn distinct_is_only_legal_in_the_prelude() {
        let mut reader = Reader::new("test.vsp", "distinct a.b;").unwrap();
        assert!(reader.read().is_err());
    }

    #[test]
    fn prelude_reads_distinct_and_exposes() {
        let mut reader = Reader::new("test.vsp", "distinct a.b;\nexpose c;\nexpose d.e;\n1;").unwrap();
        assert_eq!(reader.distinct().unwrap(), Some(vec!["a".to_owned(), "b".to_owned()]));
        let exposes = reader.exposes().unwrap();
        assert_eq!(exposes.len(), 2);
        assert_eq!(exposes[1], vec!["d".to_owned(), "e".to_owned()]);
        assert_eq!(reader.read().unwrap().len(), 1);
    }

    #[test]
    fn x_is_retyped_in_operator_position() {
        let quotes = read_all("3 x 4");
        match &quotes[0].kind {
            QuoteKind::Binary { op, .. } => assert_eq!(op, "x"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn x_stays_a_symbol_at_expression_start() {
        let quotes = read_all("x + 1");
        match &quotes[0].kind {
            QuoteKind::Binary { left, .. } => assert_eq!(left.kind, QuoteKind::Symbol("x".to_owned())),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
