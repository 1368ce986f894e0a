//! The scanner turning source text into [`Word`]s.
//!
//! At every step the lexer tries, in priority order: ignorable whitespace and
//! comments, the user-defined regex trigger table, symbols, `$`-symbols,
//! numbers, strings, regex literals, and finally the punctuation table.
//! Symbols whose lexeme is a keyword (built-in or macro-registered) are
//! retyped to the keyword kind.
//!
//! Unknown characters are a "malformed input" [`ReadError`], except in
//! *verbal* mode (used by highlighters) where they become `__INVALID__`
//! words instead.

use ahash::AHashMap;
use regex::Regex;

use crate::{
    error::{ReadError, ReadResult},
    word::{PUNCTUATION, Word, keyword_kinds, kind},
};

/// A user-defined regex trigger registered by a read-time macro.
///
/// The pattern is compiled anchored; named captures are exported onto the
/// emitted word so the macro body can splice them.
#[derive(Debug, Clone)]
pub struct Trigger {
    /// The word kind this trigger emits.
    pub kind: String,
    /// Anchored compiled pattern.
    pub pattern: Regex,
}

impl Trigger {
    /// Compiles a trigger from the user's pattern source.
    ///
    /// The pattern is anchored at the scan position by wrapping it in
    /// `^(?:…)`, keeping any named capture groups intact.
    pub fn new(kind: impl Into<String>, source: &str, file: &str, line: u32) -> ReadResult<Self> {
        let pattern = Regex::new(&format!("^(?:{source})"))
            .map_err(|e| ReadError::new(format!("malformed trigger pattern: {e}"), file, line))?;
        Ok(Self {
            kind: kind.into(),
            pattern,
        })
    }
}

/// The scanner. One per source unit.
#[derive(Clone)]
pub struct Lexer<'src> {
    src: &'src str,
    file: String,
    offset: usize,
    line: u32,
    /// Verbal mode emits `__INVALID__` words instead of dying, so a
    /// highlighter can keep scanning past garbage.
    verbal: bool,
    keywords: AHashMap<&'static str, &'static str>,
}

impl<'src> Lexer<'src> {
    pub fn new(file: impl Into<String>, src: &'src str) -> Self {
        Self {
            src,
            file: file.into(),
            offset: 0,
            line: 1,
            verbal: false,
            keywords: keyword_kinds(),
        }
    }

    /// Switches the lexer into verbal mode.
    #[must_use]
    pub fn verbal(mut self) -> Self {
        self.verbal = true;
        self
    }

    /// The line the lexer is currently on.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    fn error(&self, message: impl Into<String>) -> ReadError {
        ReadError::new(message, &self.file, self.line)
    }

    fn rest(&self) -> &'src str {
        &self.src[self.offset..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Advances past one char, maintaining the line counter.
    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Skips whitespace and comments. Line comments run `//` to end of line,
    /// block comments `/*` to `*/` without nesting.
    fn skip_ignorable(&mut self) -> ReadResult<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.rest().starts_with("//") => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.rest().starts_with("/*") => {
                    self.bump();
                    self.bump();
                    loop {
                        if self.rest().starts_with("*/") {
                            self.bump();
                            self.bump();
                            break;
                        }
                        if self.bump().is_none() {
                            return Err(self.error("unterminated block comment"));
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scans the next word.
    ///
    /// `triggers` and `user_keywords` come from the reader context and may
    /// grow between calls as macros register new syntax.
    pub fn next_word(
        &mut self,
        triggers: &[Trigger],
        user_keywords: &AHashMap<String, String>,
    ) -> ReadResult<Word> {
        self.skip_ignorable()?;
        let begin = self.offset;
        let line = self.line;

        let Some(first) = self.peek() else {
            return Ok(Word::eof(line, begin));
        };

        // User triggers outrank everything except ignorables.
        for trigger in triggers {
            if let Some(caps) = trigger.pattern.captures(self.rest()) {
                let whole = caps.get(0).map_or("", |m| m.as_str());
                if whole.is_empty() {
                    continue;
                }
                let mut captures = AHashMap::new();
                for name in trigger.pattern.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        captures.insert(name.to_owned(), m.as_str().to_owned());
                    }
                }
                for _ in whole.chars() {
                    self.bump();
                }
                let mut word = Word::new(trigger.kind.clone(), whole, line, begin, self.offset);
                if !captures.is_empty() {
                    word.captures = Some(captures);
                }
                return Ok(word);
            }
        }

        if is_symbol_start(first) {
            return Ok(self.scan_symbol(begin, line, user_keywords));
        }
        if first == '$' && self.rest()[1..].starts_with(is_symbol_start) {
            self.bump();
            let word = self.scan_symbol(begin + 1, line, user_keywords);
            return Ok(Word::new(kind::READTIME_SYMBOL, word.lexeme, line, begin, self.offset));
        }
        if first.is_ascii_digit() {
            return self.scan_number(begin, line);
        }
        if first == '"' {
            return self.scan_string(begin, line);
        }
        if first == '`' {
            return self.scan_regex(begin, line);
        }
        for punct in PUNCTUATION {
            if self.rest().starts_with(punct) {
                for _ in punct.chars() {
                    self.bump();
                }
                return Ok(Word::new(*punct, *punct, line, begin, self.offset));
            }
        }

        if self.verbal {
            self.bump();
            return Ok(Word::new(kind::INVALID, &self.src[begin..self.offset], line, begin, self.offset));
        }
        Err(self.error(format!("malformed input: {first:?}")).with_lexeme(first))
    }

    /// Scans the next word from a copy of the lexer, leaving this one
    /// untouched. Backs the reader's one-word lookahead.
    pub fn clone_scan(
        &self,
        triggers: &[Trigger],
        user_keywords: &AHashMap<String, String>,
    ) -> ReadResult<Word> {
        self.clone().next_word(triggers, user_keywords)
    }

    fn scan_symbol(&mut self, begin: usize, line: u32, user_keywords: &AHashMap<String, String>) -> Word {
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        // A trailing ? or ! belongs to the symbol (`empty?`, `save!`).
        if matches!(self.peek(), Some('?' | '!')) {
            self.bump();
        }
        let lexeme = &self.src[begin..self.offset];
        if lexeme == "_" {
            return Word::new("_", "_", line, begin, self.offset);
        }
        if let Some(keyword) = self.keywords.get(lexeme) {
            return Word::new(*keyword, lexeme, line, begin, self.offset);
        }
        if let Some(keyword) = user_keywords.get(lexeme) {
            return Word::new(keyword.clone(), lexeme, line, begin, self.offset);
        }
        Word::new(kind::SYMBOL, lexeme, line, begin, self.offset)
    }

    /// Scans a decimal number with optional underscores and fraction.
    fn scan_number(&mut self, begin: usize, line: u32) -> ReadResult<Word> {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '_') {
            self.bump();
        }
        // A fraction only if the dot is followed by a digit, so `1.to_str`
        // stays a field access.
        if self.peek() == Some('.') && self.rest()[1..].starts_with(|c: char| c.is_ascii_digit()) {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '_') {
                self.bump();
            }
        }
        let lexeme: String = self.src[begin..self.offset].chars().filter(|c| *c != '_').collect();
        Ok(Word::new(kind::NUMBER, lexeme, line, begin, self.offset))
    }

    /// Scans a double-quoted string, leaving escapes raw for the reader.
    fn scan_string(&mut self, begin: usize, line: u32) -> ReadResult<Word> {
        self.bump();
        let content_begin = self.offset;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('"') => break,
                Some('\\') => {
                    self.bump();
                    if self.bump().is_none() {
                        return Err(self.error("unterminated string"));
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        let content = &self.src[content_begin..self.offset];
        self.bump();
        Ok(Word::new(kind::STRING, content, line, begin, self.offset))
    }

    /// Scans a backtick regex literal. The pattern is validated later, when
    /// the reader builds the quote.
    fn scan_regex(&mut self, begin: usize, line: u32) -> ReadResult<Word> {
        self.bump();
        let content_begin = self.offset;
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated regex")),
                Some('`') => break,
                Some(_) => {
                    self.bump();
                }
            }
        }
        let content = &self.src[content_begin..self.offset];
        self.bump();
        Ok(Word::new(kind::REGEX, content, line, begin, self.offset))
    }
}

fn is_symbol_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(src: &str) -> Vec<Word> {
        let mut lexer = Lexer::new("test.vsp", src);
        let no_keywords = AHashMap::new();
        let mut words = Vec::new();
        loop {
            let word = lexer.next_word(&[], &no_keywords).unwrap();
            let done = word.is_eof();
            words.push(word);
            if done {
                break;
            }
        }
        words
    }

    fn kinds(src: &str) -> Vec<String> {
        scan_all(src).into_iter().map(|w| w.kind).collect()
    }

    #[test]
    fn keywords_are_retyped() {
        assert_eq!(kinds("fun f"), vec!["FUN", "SYMBOL", "EOF"]);
    }

    #[test]
    fn numbers_allow_underscores() {
        let words = scan_all("1_000_000 1.25");
        assert_eq!(words[0].lexeme, "1000000");
        assert_eq!(words[1].lexeme, "1.25");
    }

    #[test]
    fn readtime_symbols_require_readtime_context_downstream() {
        let words = scan_all("$name");
        assert_eq!(words[0].kind, kind::READTIME_SYMBOL);
        assert_eq!(words[0].lexeme, "name");
    }

    #[test]
    fn longest_punctuation_wins() {
        assert_eq!(kinds("a := 1"), vec!["SYMBOL", ":=", "NUMBER", "EOF"]);
        assert_eq!(kinds("i++"), vec!["SYMBOL", "++", "EOF"]);
        assert_eq!(kinds("&_ & _"), vec!["&_", "&", "_", "EOF"]);
    }

    #[test]
    fn strings_keep_escapes_raw() {
        let words = scan_all(r#""a\nb$x""#);
        assert_eq!(words[0].kind, kind::STRING);
        assert_eq!(words[0].lexeme, r"a\nb$x");
    }

    #[test]
    fn comments_are_ignorable() {
        assert_eq!(kinds("1 // trailing\n2"), vec!["NUMBER", "NUMBER", "EOF"]);
        assert_eq!(kinds("1 /* x\ny */ 2"), vec!["NUMBER", "NUMBER", "EOF"]);
    }

    #[test]
    fn line_counter_tracks_newlines() {
        let words = scan_all("1\n\n2");
        assert_eq!(words[0].line, 1);
        assert_eq!(words[1].line, 3);
    }

    #[test]
    fn malformed_input_dies() {
        let mut lexer = Lexer::new("test.vsp", "@");
        let err = lexer.next_word(&[], &AHashMap::new()).unwrap_err();
        assert!(err.message.contains("malformed input"));
    }

    #[test]
    fn verbal_mode_emits_invalid_words() {
        let mut lexer = Lexer::new("test.vsp", "@a").verbal();
        let no_keywords = AHashMap::new();
        let word = lexer.next_word(&[], &no_keywords).unwrap();
        assert_eq!(word.kind, kind::INVALID);
        let word = lexer.next_word(&[], &no_keywords).unwrap();
        assert_eq!(word.kind, kind::SYMBOL);
    }

    #[test]
    fn triggers_outrank_symbols() {
        let trigger = Trigger::new("GREETING", r"hello-(?P<who>\w+)", "test.vsp", 1).unwrap();
        let mut lexer = Lexer::new("test.vsp", "hello-world rest");
        let word = lexer.next_word(&[trigger], &AHashMap::new()).unwrap();
        assert_eq!(word.kind, "GREETING");
        assert_eq!(word.captures.unwrap()["who"], "world");
    }
}
