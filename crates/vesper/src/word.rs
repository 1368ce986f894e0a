//! Words are the lexer's output: a kind, a lexeme and a source position.
//!
//! Word kinds are plain strings rather than a closed enum because read-time
//! macros register new kinds while the file is still being read. The built-in
//! kinds live in [`kind`] as constants; user-defined trigger kinds are
//! whatever the macro registration generated.

use ahash::AHashMap;

/// Built-in word kinds.
///
/// Keywords are the uppercased lexeme (`fun` lexes as [`kind::FUN`]);
/// punctuation kinds are the literal punctuation string.
pub mod kind {
    pub const SYMBOL: &str = "SYMBOL";
    /// A `$`-prefixed symbol, legal only in read-time contexts.
    pub const READTIME_SYMBOL: &str = "$SYMBOL";
    pub const NUMBER: &str = "NUMBER";
    pub const STRING: &str = "STRING";
    pub const REGEX: &str = "REGEX";
    pub const EOF: &str = "EOF";
    /// Emitted instead of failing in verbal mode, for highlighters.
    pub const INVALID: &str = "__INVALID__";
    /// The symbol `x` retyped in operator position.
    pub const X: &str = "X";

    pub const FUN: &str = "FUN";
    pub const BOX: &str = "BOX";
    pub const IMMEDIATE: &str = "IMMEDIATE";
    pub const NUD: &str = "NUD";
    pub const IF: &str = "IF";
    pub const ELSE: &str = "ELSE";
    pub const LOOP: &str = "LOOP";
    pub const NEXT: &str = "NEXT";
    pub const RETURN: &str = "RETURN";
    pub const QUEUE: &str = "QUEUE";
    pub const ENSURE: &str = "ENSURE";
    pub const SHOULD: &str = "SHOULD";
    pub const GIVEN: &str = "GIVEN";
    pub const DISTINCT: &str = "DISTINCT";
    pub const EXPOSE: &str = "EXPOSE";
    pub const IS: &str = "IS";
    pub const IN: &str = "IN";
    pub const AND: &str = "AND";
    pub const OR: &str = "OR";
    pub const NOT: &str = "NOT";
    pub const TO: &str = "TO";
    pub const FROM: &str = "FROM";
    pub const DIES: &str = "DIES";
    pub const TRUE: &str = "TRUE";
    pub const FALSE: &str = "FALSE";
}

/// The built-in keyword set, mapped lexeme to kind.
///
/// A symbol whose lexeme appears here is retyped during scanning.
#[must_use]
pub fn keyword_kinds() -> AHashMap<&'static str, &'static str> {
    AHashMap::from_iter([
        ("fun", kind::FUN),
        ("box", kind::BOX),
        ("immediate", kind::IMMEDIATE),
        ("nud", kind::NUD),
        ("if", kind::IF),
        ("else", kind::ELSE),
        ("loop", kind::LOOP),
        ("next", kind::NEXT),
        ("return", kind::RETURN),
        ("queue", kind::QUEUE),
        ("ensure", kind::ENSURE),
        ("should", kind::SHOULD),
        ("given", kind::GIVEN),
        ("distinct", kind::DISTINCT),
        ("expose", kind::EXPOSE),
        ("is", kind::IS),
        ("in", kind::IN),
        ("and", kind::AND),
        ("or", kind::OR),
        ("not", kind::NOT),
        ("to", kind::TO),
        ("from", kind::FROM),
        ("dies", kind::DIES),
        ("true", kind::TRUE),
        ("false", kind::FALSE),
    ])
}

/// Multi-character punctuation, longest-match-first.
///
/// Order matters: `:=` must win over `:`, `++` over `+`, and so on.
pub const PUNCTUATION: &[&str] = &[
    ":=", "+=", "-=", "*=", "/=", "~=", "&=", "++", "--", "<=", ">=", "%{", "&_", "(", ")", "[", "]", "{", "}", "|",
    ";", ",", ":", ".", "=", "+", "-", "*", "/", "~", "&", "#", "<", ">", "?", "'", "_",
];

/// One lexed word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    /// The word kind; a constant from [`kind`], an uppercased keyword, a
    /// punctuation string, or a user-defined trigger kind.
    pub kind: String,
    /// The source text of the word. For strings and regexes this is the raw
    /// content with delimiters stripped; escapes and interpolation are
    /// processed by the reader, which knows the expression context.
    pub lexeme: String,
    /// 1-based source line.
    pub line: u32,
    /// Byte offset of the first character.
    pub begin: usize,
    /// Byte offset one past the last character.
    pub end: usize,
    /// Named captures exported by a regex trigger, if the trigger had any.
    pub captures: Option<AHashMap<String, String>>,
}

impl Word {
    pub fn new(kind: impl Into<String>, lexeme: impl Into<String>, line: u32, begin: usize, end: usize) -> Self {
        Self {
            kind: kind.into(),
            lexeme: lexeme.into(),
            line,
            begin,
            end,
            captures: None,
        }
    }

    /// The end-of-input word.
    #[must_use]
    pub fn eof(line: u32, offset: usize) -> Self {
        Self::new(kind::EOF, "", line, offset, offset)
    }

    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.kind == kind::EOF
    }
}
