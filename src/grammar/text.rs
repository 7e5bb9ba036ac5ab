//! Grammar text: the production format commands are compiled into
//!
//! ```text
//! ?start : message_group
//! message_group : message+
//! ?message : rule_0__monitor | rule_1__say_space_chord
//! rule_1__say_space_chord : "say" chord
//! chord : key ( "plus" key )*
//! %import common.NUMBER
//! %declare VOID
//! %ignore WS
//! ```
//!
//! A `?` prefix marks a production that is inlined into its parent when it
//! has exactly one child. Continuation lines start with `|`. `//` starts a
//! comment.
//!
//! The same expression syntax (with a looser lexical layer) is used for the
//! pattern mini-language, so [`Expr`] is shared by both.

use std::collections::BTreeSet;
use std::fmt;

use super::GrammarError;

/// Lexical/syntactic error inside one expression
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyntaxError {
    #[error("unterminated {what} at offset {offset}")]
    Unterminated { what: &'static str, offset: usize },

    #[error("unexpected {found:?} at offset {offset}")]
    Unexpected { found: String, offset: usize },

    #[error("unclosed '{open}' at offset {offset}")]
    Unclosed { open: char, offset: usize },

    #[error("empty expression at offset {offset}")]
    Empty { offset: usize },
}

/// Right-hand side of a production
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `"text"`
    Literal(String),
    /// `/regex/flags`
    Regex { source: String, flags: String },
    /// `name` or `TERMINAL`
    Ref(String),
    Seq(Vec<Expr>),
    Alt(Vec<Expr>),
    /// `( ... )`
    Group(Box<Expr>),
    /// `[ ... ]` or `x?`
    Optional(Box<Expr>),
    /// `x*` (min 0) or `x+` (min 1)
    Repeat { inner: Box<Expr>, min: usize },
}

impl Expr {
    /// Every symbol referenced anywhere in the expression
    pub fn references(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Ref(name) => {
                out.insert(name.as_str());
            }
            Expr::Seq(items) | Expr::Alt(items) => {
                items.iter().for_each(|e| e.collect_references(out));
            }
            Expr::Group(inner) | Expr::Optional(inner) | Expr::Repeat { inner, .. } => {
                inner.collect_references(out)
            }
            Expr::Literal(_) | Expr::Regex { .. } => {}
        }
    }

    /// Every regex literal, as `(source, flags)`
    pub fn regexes(&self) -> Vec<(&str, &str)> {
        match self {
            Expr::Regex { source, flags } => vec![(source.as_str(), flags.as_str())],
            Expr::Seq(items) | Expr::Alt(items) => items.iter().flat_map(Expr::regexes).collect(),
            Expr::Group(inner) | Expr::Optional(inner) | Expr::Repeat { inner, .. } => {
                inner.regexes()
            }
            Expr::Literal(_) | Expr::Ref(_) => Vec::new(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(text) => {
                write!(f, "\"")?;
                for c in text.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Expr::Regex { source, flags } => write!(f, "/{source}/{flags}"),
            Expr::Ref(name) => write!(f, "{name}"),
            Expr::Seq(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match item {
                        Expr::Alt(_) => write!(f, "( {item} )")?,
                        _ => write!(f, "{item}")?,
                    }
                }
                Ok(())
            }
            Expr::Alt(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Expr::Group(inner) => write!(f, "( {inner} )"),
            Expr::Optional(inner) => write!(f, "[ {inner} ]"),
            Expr::Repeat { inner, min } => {
                let op = if *min == 0 { '*' } else { '+' };
                match inner.as_ref() {
                    Expr::Seq(_) | Expr::Alt(_) => write!(f, "( {inner} ){op}"),
                    _ => write!(f, "{inner}{op}"),
                }
            }
        }
    }
}

// ============================================================================
// Lexing
// ============================================================================

/// Which lexical layer to read an expression with
#[derive(Clone, Copy)]
pub(crate) enum Dialect<'a> {
    /// Grammar text: bare identifiers are references
    Grammar,
    /// Pattern mini-language: bare words are literals unless `known` says
    /// they name a fragment; `<name>` is always a reference
    Pattern { known: &'a dyn Fn(&str) -> bool },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Regex { source: String, flags: String },
    Name(String),
    /// A bare word in the pattern dialect that is not a known fragment
    Word(String),
    Punct(char),
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_punct(c: char) -> bool {
    matches!(c, '(' | ')' | '[' | ']' | '|' | '*' | '+' | '?')
}

fn tokenize(src: &str, dialect: Dialect<'_>) -> Result<Vec<(usize, Token)>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if is_punct(c) {
            chars.next();
            tokens.push((offset, Token::Punct(c)));
            continue;
        }

        match c {
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => text.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(SyntaxError::Unterminated { what: "string", offset });
                }
                tokens.push((offset, Token::Str(text)));
            }
            '/' => {
                chars.next();
                let mut source = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => {
                            source.push('\\');
                            match chars.next() {
                                Some((_, escaped)) => source.push(escaped),
                                None => break,
                            }
                        }
                        '/' => {
                            closed = true;
                            break;
                        }
                        c => source.push(c),
                    }
                }
                if !closed {
                    return Err(SyntaxError::Unterminated { what: "regex", offset });
                }
                let mut flags = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !matches!(c, 'i' | 'm' | 's' | 'x') {
                        break;
                    }
                    flags.push(c);
                    chars.next();
                }
                tokens.push((offset, Token::Regex { source, flags }));
            }
            '<' if matches!(dialect, Dialect::Pattern { .. }) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '>' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(SyntaxError::Unterminated { what: "reference", offset });
                }
                let name = name.trim().to_string();
                if name.is_empty() || !name.chars().all(is_name_char) {
                    return Err(SyntaxError::Unexpected {
                        found: format!("<{name}>"),
                        offset,
                    });
                }
                tokens.push((offset, Token::Name(name)));
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    let stop = match dialect {
                        Dialect::Grammar => !is_name_char(c),
                        Dialect::Pattern { .. } => {
                            c.is_whitespace() || is_punct(c) || c == '"' || c == '<'
                        }
                    };
                    if stop {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                if word.is_empty() {
                    return Err(SyntaxError::Unexpected {
                        found: c.to_string(),
                        offset,
                    });
                }
                let token = match dialect {
                    Dialect::Grammar => Token::Name(word),
                    Dialect::Pattern { known } if known(&word) => Token::Name(word),
                    Dialect::Pattern { .. } => Token::Word(word),
                };
                tokens.push((offset, token));
            }
        }
    }
    Ok(tokens)
}

// ============================================================================
// Expression parsing
// ============================================================================

struct ExprParser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn alternation(&mut self) -> Result<Expr, SyntaxError> {
        let mut branches = vec![self.sequence()?];
        while self.peek() == Some(&Token::Punct('|')) {
            self.pos += 1;
            branches.push(self.sequence()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Expr::Alt(branches)
        })
    }

    fn sequence(&mut self) -> Result<Expr, SyntaxError> {
        let start = self.offset();
        let mut items: Vec<Expr> = Vec::new();
        // Adjacent bare words form one literal phrase
        let mut phrase: Vec<String> = Vec::new();

        loop {
            match self.peek() {
                None | Some(Token::Punct('|' | ')' | ']')) => break,
                Some(Token::Word(word)) => {
                    let word = word.clone();
                    self.pos += 1;
                    if self.postfix_follows() {
                        flush_phrase(&mut phrase, &mut items);
                        let item = self.postfix(Expr::Literal(word))?;
                        items.push(item);
                    } else {
                        phrase.push(word);
                    }
                }
                Some(_) => {
                    flush_phrase(&mut phrase, &mut items);
                    let atom = self.atom()?;
                    let item = self.postfix(atom)?;
                    items.push(item);
                }
            }
        }
        flush_phrase(&mut phrase, &mut items);

        match items.len() {
            0 => Err(SyntaxError::Empty { offset: start }),
            1 => Ok(items.remove(0)),
            _ => Ok(Expr::Seq(items)),
        }
    }

    fn postfix_follows(&self) -> bool {
        matches!(self.peek(), Some(Token::Punct('*' | '+' | '?')))
    }

    fn postfix(&mut self, mut atom: Expr) -> Result<Expr, SyntaxError> {
        while let Some(&Token::Punct(op @ ('*' | '+' | '?'))) = self.peek() {
            atom = match op {
                '?' => Expr::Optional(Box::new(atom)),
                '*' => Expr::Repeat { inner: Box::new(atom), min: 0 },
                _ => Expr::Repeat { inner: Box::new(atom), min: 1 },
            };
            self.pos += 1;
        }
        Ok(atom)
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        let token = match self.tokens.get(self.pos) {
            Some((_, token)) => token.clone(),
            None => return Err(SyntaxError::Empty { offset }),
        };
        self.pos += 1;

        match token {
            Token::Str(text) => Ok(Expr::Literal(text)),
            Token::Regex { source, flags } => Ok(Expr::Regex { source, flags }),
            Token::Name(name) => Ok(Expr::Ref(name)),
            Token::Word(word) => Ok(Expr::Literal(word)),
            Token::Punct(open @ ('(' | '[')) => {
                let close = if open == '(' { ')' } else { ']' };
                let inner = self.alternation()?;
                if self.peek() != Some(&Token::Punct(close)) {
                    return Err(SyntaxError::Unclosed { open, offset });
                }
                self.pos += 1;
                Ok(if open == '(' {
                    Expr::Group(Box::new(inner))
                } else {
                    Expr::Optional(Box::new(inner))
                })
            }
            Token::Punct(c) => Err(SyntaxError::Unexpected {
                found: c.to_string(),
                offset,
            }),
        }
    }
}

fn flush_phrase(phrase: &mut Vec<String>, items: &mut Vec<Expr>) {
    if !phrase.is_empty() {
        items.push(Expr::Literal(phrase.join(" ")));
        phrase.clear();
    }
}

/// Parse one complete expression.
pub(crate) fn parse_expr(src: &str, dialect: Dialect<'_>) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(src, dialect)?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        end: src.len(),
    };
    let expr = parser.alternation()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(expr),
        Some((offset, token)) => Err(SyntaxError::Unexpected {
            found: match token {
                Token::Punct(c) => c.to_string(),
                other => format!("{other:?}"),
            },
            offset: *offset,
        }),
    }
}

// ============================================================================
// Productions and directives
// ============================================================================

/// `name : expr`
#[derive(Debug, Clone, PartialEq)]
pub struct Production {
    pub name: String,
    /// `?name`: inline into the parent when there is a single child
    pub inline: bool,
    pub expr: Expr,
}

/// `%import common.SOURCE -> ALIAS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub source: String,
    pub alias: String,
}

/// A parsed grammar text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrammarText {
    pub productions: Vec<Production>,
    pub imports: Vec<Import>,
    /// Terminals that exist but are never produced by the lexer
    pub declared: Vec<String>,
    pub ignored: Vec<String>,
}

impl GrammarText {
    pub fn parse(src: &str) -> Result<Self, GrammarError> {
        let mut grammar = GrammarText::default();
        // (first line number, inline, name, accumulated body)
        let mut pending: Option<(usize, bool, String, String)> = None;

        for (index, raw) in src.lines().enumerate() {
            let line_no = index + 1;
            let line = strip_comment(raw);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if trimmed.starts_with('|') {
                match pending.as_mut() {
                    Some((_, _, _, body)) => {
                        body.push(' ');
                        body.push_str(trimmed);
                        continue;
                    }
                    None => {
                        return Err(GrammarError::Text {
                            line: line_no,
                            message: "continuation line without a production".to_string(),
                        });
                    }
                }
            }

            if let Some(production) = pending.take() {
                grammar.productions.push(finish_production(production)?);
            }

            if let Some(directive) = trimmed.strip_prefix('%') {
                grammar.directive(directive, line_no)?;
                continue;
            }

            let Some((head, body)) = trimmed.split_once(':') else {
                return Err(GrammarError::Text {
                    line: line_no,
                    message: format!("expected `name : expression`, got {trimmed:?}"),
                });
            };
            let head = head.trim();
            let (inline, name) = match head.strip_prefix('?') {
                Some(name) => (true, name.trim()),
                None => (false, head),
            };
            if name.is_empty() || !name.chars().all(is_name_char) {
                return Err(GrammarError::Text {
                    line: line_no,
                    message: format!("invalid production name {name:?}"),
                });
            }
            pending = Some((line_no, inline, name.to_string(), body.to_string()));
        }

        if let Some(production) = pending.take() {
            grammar.productions.push(finish_production(production)?);
        }
        Ok(grammar)
    }

    fn directive(&mut self, directive: &str, line: usize) -> Result<(), GrammarError> {
        let mut words = directive.split_whitespace();
        let keyword = words.next().unwrap_or("");
        let rest: Vec<&str> = words.collect();
        let bad = |message: String| GrammarError::Text { line, message };

        match (keyword, rest.as_slice()) {
            ("import", [path]) | ("import", [path, "->", _]) => {
                let source = path
                    .strip_prefix("common.")
                    .ok_or_else(|| bad(format!("only `common.*` imports are available, got {path}")))?;
                let alias = match rest.as_slice() {
                    [_, "->", alias] => alias.to_string(),
                    _ => source.to_string(),
                };
                self.imports.push(Import {
                    source: source.to_string(),
                    alias,
                });
            }
            ("ignore", [name]) => self.ignored.push(name.to_string()),
            ("declare", names) if !names.is_empty() => {
                self.declared.extend(names.iter().map(|n| n.to_string()));
            }
            _ => return Err(bad(format!("unsupported directive %{directive}"))),
        }
        Ok(())
    }
}

fn finish_production(
    (line, inline, name, body): (usize, bool, String, String),
) -> Result<Production, GrammarError> {
    let expr = parse_expr(&body, Dialect::Grammar).map_err(|e| GrammarError::Text {
        line,
        message: format!("in `{name}`: {e}"),
    })?;
    Ok(Production { name, inline, expr })
}

/// `line` without a trailing `//` comment
pub(crate) fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(at) if !inside_literal(line, at) => &line[..at],
        _ => line,
    }
}

/// Whether byte offset `at` falls inside a string or regex literal
fn inside_literal(line: &str, at: usize) -> bool {
    let mut open: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if i >= at {
            break;
        }
        if escaped {
            escaped = false;
            continue;
        }
        match (open, c) {
            (_, '\\') => escaped = true,
            (None, '"' | '/') => open = Some(c),
            (Some(q), c) if q == c => open = None,
            _ => {}
        }
    }
    open.is_some()
}
