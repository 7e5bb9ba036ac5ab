//! Runtime recognizer for compiled grammar text
//!
//! Productions are linked into an arena of nodes. Recognition computes, for
//! every `(node, position)` pair, the set of positions where a match of that
//! node can end (memoized, so each pair is evaluated once). Terminals are
//! matched against the raw text at every possible length, which gives the
//! complete dynamic tokenization commands need: the vocabulary comes from many
//! plugins and no fixed lexer could split it correctly.
//!
//! A tree is then derived from the end-position sets, preferring the longest
//! span for earlier pieces and the first alternative among equals.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

use regex::Regex;

use super::GrammarError;
use super::text::{Expr, GrammarText};

type NodeId = usize;

/// Terminals available through `%import common.NAME`
fn builtin_terminal(name: &str) -> Option<&'static str> {
    const UNSIGNED: &str = r"(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?";
    Some(match name {
        "INT" => r"[0-9]+",
        "NUMBER" => UNSIGNED,
        "SIGNED_NUMBER" => r"[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][+-]?[0-9]+)?",
        "DIGIT" => r"[0-9]",
        "LETTER" => r"\p{L}",
        "WORD" => r"\p{L}+",
        "CNAME" => r"[\p{L}_][\p{L}0-9_]*",
        "ESCAPED_STRING" => r#""(?:[^"\\]|\\.)*""#,
        "WS" => r"\s+",
        "WS_INLINE" => r"[ \t]+",
        "NEWLINE" => r"(?:\r?\n)+",
        _ => return None,
    })
}

fn anchored(source: &str, flags: &str) -> Result<Regex, regex::Error> {
    if flags.is_empty() {
        Regex::new(&format!(r"\A(?:{source})\z"))
    } else {
        Regex::new(&format!(r"(?{flags})\A(?:{source})\z"))
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[derive(Debug)]
enum Node {
    Literal(String),
    Terminal { name: String, regex: Regex },
    Rule(usize),
    Seq(Vec<NodeId>),
    Alt(Vec<NodeId>),
    Optional(NodeId),
    Repeat { inner: NodeId, min: usize },
    Never,
}

#[derive(Debug)]
struct Rule {
    name: String,
    inline: bool,
    /// Upper-case productions match as a single token
    terminal: bool,
    body: NodeId,
}

/// A linked grammar, ready to parse
#[derive(Debug)]
pub struct Grammar {
    nodes: Vec<Node>,
    rules: Vec<Rule>,
    start: NodeId,
    skip_whitespace: bool,
}

/// A derived parse tree
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Node {
        rule: String,
        /// Byte range of the match in the parsed text
        span: Range<usize>,
        children: Vec<Tree>,
    },
    Token {
        terminal: String,
        text: String,
    },
}

impl Tree {
    pub fn label(&self) -> &str {
        match self {
            Tree::Node { rule, .. } => rule,
            Tree::Token { terminal, .. } => terminal,
        }
    }

    pub fn children(&self) -> &[Tree] {
        match self {
            Tree::Node { children, .. } => children,
            Tree::Token { .. } => &[],
        }
    }

    /// All tokens under this tree, in order
    pub fn tokens(&self) -> Vec<&Tree> {
        match self {
            Tree::Token { .. } => vec![self],
            Tree::Node { children, .. } => children.iter().flat_map(Tree::tokens).collect(),
        }
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn indented(tree: &Tree, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
            let pad = "  ".repeat(depth);
            match tree {
                Tree::Token { terminal, text } => writeln!(f, "{pad}[{terminal}] {text:?}"),
                Tree::Node { rule, children, .. } => {
                    writeln!(f, "{pad}({rule})")?;
                    for child in children {
                        indented(child, f, depth + 1)?;
                    }
                    Ok(())
                }
            }
        }
        indented(self, f, 0)
    }
}

// ============================================================================
// Linking
// ============================================================================

struct Linker<'a> {
    grammar: Grammar,
    rule_index: HashMap<&'a str, usize>,
    imports: HashMap<&'a str, (&'a str, Regex)>,
    declared: BTreeSet<&'a str>,
}

impl<'a> Linker<'a> {
    fn push(&mut self, node: Node) -> NodeId {
        self.grammar.nodes.push(node);
        self.grammar.nodes.len() - 1
    }

    fn link(&mut self, rule: &str, expr: &'a Expr) -> Result<NodeId, GrammarError> {
        let node = match expr {
            Expr::Literal(text) => Node::Literal(text.clone()),
            Expr::Regex { source, flags } => Node::Terminal {
                name: "__ANON".to_string(),
                regex: anchored(source, flags).map_err(|source| GrammarError::InvalidRegex {
                    rule: rule.to_string(),
                    source,
                })?,
            },
            Expr::Ref(name) => {
                if let Some(&index) = self.rule_index.get(name.as_str()) {
                    Node::Rule(index)
                } else if let Some((alias, regex)) = self.imports.get(name.as_str()) {
                    Node::Terminal {
                        name: alias.to_string(),
                        regex: regex.clone(),
                    }
                } else if self.declared.contains(name.as_str()) {
                    Node::Never
                } else {
                    return Err(GrammarError::UndefinedReference {
                        rule: rule.to_string(),
                        name: name.clone(),
                    });
                }
            }
            Expr::Seq(items) => {
                let ids = items
                    .iter()
                    .map(|item| self.link(rule, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Node::Seq(ids)
            }
            Expr::Alt(items) => {
                let ids = items
                    .iter()
                    .map(|item| self.link(rule, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Node::Alt(ids)
            }
            Expr::Group(inner) => return self.link(rule, inner),
            Expr::Optional(inner) => Node::Optional(self.link(rule, inner)?),
            Expr::Repeat { inner, min } => Node::Repeat {
                inner: self.link(rule, inner)?,
                min: *min,
            },
        };
        Ok(self.push(node))
    }
}

impl Grammar {
    /// Parse and link grammar text.
    pub fn from_text(src: &str) -> Result<Self, GrammarError> {
        Self::link(&GrammarText::parse(src)?)
    }

    pub fn link(text: &GrammarText) -> Result<Self, GrammarError> {
        let mut rule_index = HashMap::new();
        for (index, production) in text.productions.iter().enumerate() {
            if rule_index.insert(production.name.as_str(), index).is_some() {
                return Err(GrammarError::NameCollision(production.name.clone()));
            }
        }

        let mut imports = HashMap::new();
        for import in &text.imports {
            let source = builtin_terminal(&import.source).ok_or_else(|| {
                GrammarError::UndefinedReference {
                    rule: "%import".to_string(),
                    name: format!("common.{}", import.source),
                }
            })?;
            let regex = anchored(source, "").map_err(|source| GrammarError::InvalidRegex {
                rule: import.alias.clone(),
                source,
            })?;
            imports.insert(import.alias.as_str(), (import.alias.as_str(), regex));
        }

        let start = *rule_index.get("start").ok_or(GrammarError::MissingStart)?;
        let skip_whitespace = text
            .ignored
            .iter()
            .any(|name| name == "WS" || name == "WS_INLINE");

        let mut linker = Linker {
            grammar: Grammar {
                nodes: Vec::new(),
                rules: Vec::with_capacity(text.productions.len()),
                start: 0,
                skip_whitespace,
            },
            rule_index,
            imports,
            declared: text.declared.iter().map(String::as_str).collect(),
        };

        for production in &text.productions {
            let body = linker.link(&production.name, &production.expr)?;
            let terminal = production
                .name
                .chars()
                .next()
                .is_some_and(|c| c.is_uppercase());
            linker.grammar.rules.push(Rule {
                name: production.name.clone(),
                inline: production.inline,
                terminal,
                body,
            });
        }

        linker.grammar.start = linker.push(Node::Rule(start));
        Ok(linker.grammar)
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.iter().any(|rule| rule.name == name)
    }

    /// Parse `text` from the `start` production.
    pub fn parse(&self, text: &str) -> Result<Tree, GrammarError> {
        let end = if self.skip_whitespace {
            text.trim_end().len()
        } else {
            text.len()
        };

        let mut session = Session {
            grammar: self,
            text,
            memo: HashMap::new(),
            furthest: 0,
        };

        let mut trees = Vec::new();
        if !session.derive(self.start, 0, end, &mut trees) {
            return Err(GrammarError::ParseFailure {
                text: text.to_string(),
                offset: session.furthest,
            });
        }

        Ok(if trees.len() == 1 {
            trees.remove(0)
        } else {
            Tree::Node {
                rule: "start".to_string(),
                span: 0..end,
                children: trees,
            }
        })
    }
}

// ============================================================================
// Recognition
// ============================================================================

struct Session<'g> {
    grammar: &'g Grammar,
    text: &'g str,
    memo: HashMap<(NodeId, usize), Rc<BTreeSet<usize>>>,
    /// Furthest position any token reached, for error reporting
    furthest: usize,
}

impl<'g> Session<'g> {
    fn token_start(&self, pos: usize) -> usize {
        if !self.grammar.skip_whitespace {
            return pos;
        }
        let rest = &self.text[pos..];
        pos + (rest.len() - rest.trim_start().len())
    }

    /// Whether `start..end` neither begins nor ends inside a word
    fn on_boundaries(&self, start: usize, end: usize) -> bool {
        let joined = |a: Option<char>, b: Option<char>| match (a, b) {
            (Some(a), Some(b)) => is_word_char(a) && is_word_char(b),
            _ => false,
        };
        let token = &self.text[start..end];
        !joined(self.text[..start].chars().next_back(), token.chars().next())
            && !joined(token.chars().next_back(), self.text[end..].chars().next())
    }

    fn match_literal(&mut self, literal: &str, pos: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        if literal.is_empty() {
            out.insert(pos);
            return out;
        }
        let start = self.token_start(pos);
        let end = start + literal.len();
        if self.text[start..].starts_with(literal) && self.on_boundaries(start, end) {
            self.furthest = self.furthest.max(end);
            out.insert(end);
        }
        out
    }

    fn match_regex(&mut self, regex: &Regex, pos: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let start = self.token_start(pos);
        let rest = &self.text[start..];
        if rest.chars().next().is_none_or(char::is_whitespace) {
            return out;
        }
        for (offset, c) in rest.char_indices() {
            if c.is_whitespace() {
                continue;
            }
            let end = start + offset + c.len_utf8();
            if self.on_boundaries(start, end) && regex.is_match(&self.text[start..end]) {
                out.insert(end);
            }
        }
        if let Some(&last) = out.last() {
            self.furthest = self.furthest.max(last);
        }
        out
    }

    /// Positions where a match of `id` starting at `pos` can end
    fn ends(&mut self, id: NodeId, pos: usize) -> Rc<BTreeSet<usize>> {
        if let Some(hit) = self.memo.get(&(id, pos)) {
            return hit.clone();
        }
        // A node reached again at the same position is left recursion; that
        // branch matches nothing.
        self.memo.insert((id, pos), Rc::new(BTreeSet::new()));

        let grammar = self.grammar;
        let result = match &grammar.nodes[id] {
            Node::Literal(literal) => self.match_literal(literal, pos),
            Node::Terminal { regex, .. } => self.match_regex(regex, pos),
            Node::Rule(index) => (*self.ends(grammar.rules[*index].body, pos)).clone(),
            Node::Seq(items) => self.seq_ends(items, pos),
            Node::Alt(alts) => {
                let mut out = BTreeSet::new();
                for &alt in alts {
                    out.extend(self.ends(alt, pos).iter().copied());
                }
                out
            }
            Node::Optional(inner) => {
                let mut out = (*self.ends(*inner, pos)).clone();
                out.insert(pos);
                out
            }
            Node::Repeat { inner, min } => self.repeat_ends(*inner, *min, pos),
            Node::Never => BTreeSet::new(),
        };

        let result = Rc::new(result);
        self.memo.insert((id, pos), result.clone());
        result
    }

    fn seq_ends(&mut self, items: &[NodeId], pos: usize) -> BTreeSet<usize> {
        let mut frontier = BTreeSet::from([pos]);
        for &item in items {
            let mut next = BTreeSet::new();
            for &p in &frontier {
                next.extend(self.ends(item, p).iter().copied());
            }
            if next.is_empty() {
                return next;
            }
            frontier = next;
        }
        frontier
    }

    /// `min` is 0 (`*`) or 1 (`+`)
    fn repeat_ends(&mut self, inner: NodeId, min: usize, pos: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        if min == 0 {
            out.insert(pos);
        }
        let mut visited = BTreeSet::from([pos]);
        let mut frontier = BTreeSet::from([pos]);
        let mut count = 0;
        while !frontier.is_empty() {
            count += 1;
            let mut next = BTreeSet::new();
            for &p in &frontier {
                next.extend(self.ends(inner, p).iter().copied());
            }
            if count >= min {
                out.extend(next.iter().copied());
            }
            frontier = next.difference(&visited).copied().collect();
            visited.extend(frontier.iter().copied());
        }
        out
    }

    // ------------------------------------------------------------------------
    // Derivation
    // ------------------------------------------------------------------------

    fn derive(&mut self, id: NodeId, start: usize, end: usize, out: &mut Vec<Tree>) -> bool {
        if !self.ends(id, start).contains(&end) {
            return false;
        }

        let grammar = self.grammar;
        match &grammar.nodes[id] {
            Node::Literal(_) => true,
            Node::Terminal { name, .. } => {
                let from = self.token_start(start);
                out.push(Tree::Token {
                    terminal: name.clone(),
                    text: self.text[from..end].to_string(),
                });
                true
            }
            Node::Rule(index) => {
                let rule = &grammar.rules[*index];
                let from = self.token_start(start).min(end);
                if rule.terminal {
                    out.push(Tree::Token {
                        terminal: rule.name.clone(),
                        text: self.text[from..end].to_string(),
                    });
                    return true;
                }
                let mut children = Vec::new();
                if !self.derive(rule.body, start, end, &mut children) {
                    return false;
                }
                if rule.inline && children.len() == 1 {
                    out.append(&mut children);
                } else {
                    out.push(Tree::Node {
                        rule: rule.name.clone(),
                        span: from..end,
                        children,
                    });
                }
                true
            }
            Node::Seq(items) => self.derive_seq(items, start, end, out),
            Node::Alt(alts) => {
                for &alt in alts {
                    let mark = out.len();
                    if self.derive(alt, start, end, out) {
                        return true;
                    }
                    out.truncate(mark);
                }
                false
            }
            Node::Optional(inner) => {
                let mark = out.len();
                if self.derive(*inner, start, end, out) {
                    return true;
                }
                out.truncate(mark);
                start == end
            }
            Node::Repeat { inner, min } => self.derive_repeat(*inner, *min, start, end, out),
            Node::Never => false,
        }
    }

    fn derive_seq(&mut self, items: &[NodeId], start: usize, end: usize, out: &mut Vec<Tree>) -> bool {
        let Some((&first, rest)) = items.split_first() else {
            return start == end;
        };
        let mids: Vec<usize> = self
            .ends(first, start)
            .iter()
            .rev()
            .copied()
            .filter(|&mid| mid <= end)
            .collect();

        for mid in mids {
            if !self.seq_ends(rest, mid).contains(&end) {
                continue;
            }
            let mark = out.len();
            if self.derive(first, start, mid, out) && self.derive_seq(rest, mid, end, out) {
                return true;
            }
            out.truncate(mark);
        }
        false
    }

    fn derive_repeat(
        &mut self,
        inner: NodeId,
        min: usize,
        start: usize,
        end: usize,
        out: &mut Vec<Tree>,
    ) -> bool {
        if start == end && min == 0 {
            return true;
        }
        let remaining = min.saturating_sub(1);
        let mids: Vec<usize> = self
            .ends(inner, start)
            .iter()
            .rev()
            .copied()
            .filter(|&mid| mid > start && mid <= end)
            .collect();

        for mid in mids {
            if !self.repeat_ends(inner, remaining, mid).contains(&end) {
                continue;
            }
            let mark = out.len();
            if self.derive(inner, start, mid, out)
                && self.derive_repeat(inner, remaining, mid, end, out)
            {
                return true;
            }
            out.truncate(mark);
        }

        // An empty match of the inner node satisfies the minimum.
        start == end && self.derive(inner, start, start, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const IMPORTS: &str = "\n%import common.NUMBER\n%import common.WORD\n%declare VOID\n%ignore WS\n";

    fn grammar(body: &str) -> Grammar {
        Grammar::from_text(&format!(
            "?start : message_group\nmessage_group : message+\n{body}{IMPORTS}"
        ))
        .unwrap()
    }

    fn commands(tree: &Tree) -> Vec<&str> {
        tree.children().iter().map(Tree::label).collect()
    }

    #[test]
    fn test_single_command() {
        let g = grammar(
            "?message : rule_0 | rule_1\nrule_0 : \"say\" key\nrule_1 : \"monitor\"\nkey : \"alpha\" | \"bravo\"",
        );
        let tree = g.parse("say bravo").unwrap();
        assert_eq!(tree.label(), "message_group");
        assert_eq!(commands(&tree), vec!["rule_0"]);

        let rule = &tree.children()[0];
        match &rule.children()[0] {
            Tree::Node { rule, span, children } => {
                assert_eq!(rule, "key");
                assert_eq!(&"say bravo"[span.clone()], "bravo");
                assert!(children.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_compound_utterance_in_order() {
        let g = grammar(
            "?message : rule_0 | rule_1\nrule_0 : \"say\" key\nrule_1 : \"monitor\"\nkey : \"alpha\" | \"bravo\"",
        );
        let tree = g.parse("monitor say alpha monitor").unwrap();
        assert_eq!(commands(&tree), vec!["rule_1", "rule_0", "rule_1"]);
    }

    #[test]
    fn test_repetition_and_tokens() {
        let g = grammar(
            "?message : rule_0\nrule_0 : \"press\" chord\nchord : key ( \"plus\" key )*\nkey : \"control\" | \"shift\" | WORD",
        );
        let tree = g.parse("press control plus shift plus sierra").unwrap();
        let chord = &tree.children()[0].children()[0];
        assert_eq!(chord.label(), "chord");
        let keys: Vec<&str> = chord.children().iter().map(Tree::label).collect();
        assert_eq!(keys, vec!["key", "key", "key"]);
        assert_eq!(
            chord.tokens(),
            vec![&Tree::Token {
                terminal: "WORD".into(),
                text: "sierra".into()
            }]
        );
    }

    #[test]
    fn test_earlier_command_takes_longest_span() {
        let g = grammar("?message : rule_0 | rule_1\nrule_0 : \"go\" [ \"left\" ]\nrule_1 : \"left\"");
        let tree = g.parse("go left").unwrap();
        assert_eq!(commands(&tree), vec!["rule_0"]);
    }

    #[test]
    fn test_first_rule_wins_on_equal_spans() {
        let g = grammar("?message : rule_0 | rule_1\nrule_0 : \"stop\"\nrule_1 : \"stop\"");
        let tree = g.parse("stop").unwrap();
        assert_eq!(commands(&tree), vec!["rule_0"]);
    }

    #[test]
    fn test_literals_respect_word_boundaries() {
        let g = grammar("?message : rule_0\nrule_0 : \"hit\"");
        assert!(g.parse("hit").is_ok());
        assert!(matches!(
            g.parse("hitch"),
            Err(GrammarError::ParseFailure { offset: 0, .. })
        ));
    }

    #[test]
    fn test_regex_is_tokenized_dynamically() {
        let g = grammar("?message : rule_0 | rule_1\nrule_0 : \"alert\" /\\w.+/\nrule_1 : \"go\" NUMBER");
        let tree = g.parse("go 12 alert hello there").unwrap();
        assert_eq!(commands(&tree), vec!["rule_1", "rule_0"]);
        assert_eq!(
            tree.children()[0].children(),
            &[Tree::Token {
                terminal: "NUMBER".into(),
                text: "12".into()
            }]
        );
        assert_eq!(
            tree.children()[1].children(),
            &[Tree::Token {
                terminal: "__ANON".into(),
                text: "hello there".into()
            }]
        );
    }

    #[test]
    fn test_parse_failure_reports_furthest_offset() {
        let g = grammar("?message : rule_0\nrule_0 : \"say\" \"alpha\"");
        match g.parse("say bravo") {
            Err(GrammarError::ParseFailure { text, offset }) => {
                assert_eq!(text, "say bravo");
                assert_eq!(offset, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(g.parse("").is_err());
    }

    #[test]
    fn test_declared_terminal_never_matches() {
        let g = grammar("?message : rule_0 | rule_1\nrule_0 : VOID\nrule_1 : \"ok\"");
        assert_eq!(commands(&g.parse("ok").unwrap()), vec!["rule_1"]);
    }

    #[test]
    fn test_left_recursion_terminates() {
        let g = grammar("?message : rule_0\nrule_0 : items\nitems : items \"x\" | \"x\"");
        assert!(g.parse("x").is_ok());
    }

    #[test]
    fn test_link_errors() {
        assert!(matches!(
            Grammar::from_text("?start : missing"),
            Err(GrammarError::UndefinedReference { .. })
        ));
        assert!(matches!(
            Grammar::from_text("other : \"x\""),
            Err(GrammarError::MissingStart)
        ));
        assert!(matches!(
            Grammar::from_text("start : \"x\"\nstart : \"y\""),
            Err(GrammarError::NameCollision(_))
        ));
        assert!(matches!(
            Grammar::from_text("start : /(/"),
            Err(GrammarError::InvalidRegex { .. })
        ));
        assert!(matches!(
            Grammar::from_text("start : \"x\"\n%import common.NOPE"),
            Err(GrammarError::UndefinedReference { .. })
        ));
    }
}
