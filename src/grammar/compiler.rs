//! Combine registries into one grammar and a command dispatcher
//!
//! Each registered pattern becomes a rule named `rule_{index}__{slug}`. The
//! grammar accepts one or more commands per utterance:
//!
//! ```text
//! ?start : message_group
//! message_group : message+
//! ?message : rule_0__... | rule_1__... | ...
//! ```
//!
//! A pattern or fragment that fails to translate, references an undefined
//! fragment, or carries a broken regex is compiled as the unmatchable `VOID`
//! terminal and reported as a diagnostic. Every other rule still compiles.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;

use regex::Regex;

use super::GrammarError;
use super::engine::{Grammar, Tree};
use super::pattern;
use super::registry::{Arg, Handler, Registry};
use super::text::{self, Dialect, Expr};

/// Terminals every compiled grammar imports, as `(source, alias)`
const IMPORTS: &[(&str, &str)] = &[
    ("ESCAPED_STRING", "ESCAPED_STRING"),
    ("SIGNED_NUMBER", "SIGNED_NUMBER"),
    ("NUMBER", "NUMBER"),
    ("INT", "INT"),
    ("WORD", "WORD"),
    ("CNAME", "NAME"),
    ("WS", "WS"),
];

/// The unmatchable placeholder terminal
const VOID: &str = "VOID";

const RESERVED: &[&str] = &["start", "message_group", "message", VOID];

const NUMERIC_TERMINALS: &[&str] = &["NUMBER", "SIGNED_NUMBER", "INT"];

/// One grammar production derived from a registry entry
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub pattern: String,
    pub handler: Handler,
}

/// One recognized command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub rule: String,
    pub pattern: String,
    pub args: Vec<Arg>,
}

/// Grammar text plus the problems isolated while producing it
#[derive(Debug)]
pub struct BuiltGrammar {
    pub text: String,
    pub diagnostics: Vec<GrammarError>,
}

fn char_name(c: char) -> Option<&'static str> {
    Some(match c {
        ' ' => "space",
        '\t' => "character_tabulation",
        '!' => "exclamation_mark",
        '"' => "quotation_mark",
        '#' => "number_sign",
        '$' => "dollar_sign",
        '%' => "percent_sign",
        '&' => "ampersand",
        '\'' => "apostrophe",
        '(' => "left_parenthesis",
        ')' => "right_parenthesis",
        '*' => "asterisk",
        '+' => "plus_sign",
        ',' => "comma",
        '-' => "hyphen_minus",
        '.' => "full_stop",
        '/' => "solidus",
        ':' => "colon",
        ';' => "semicolon",
        '<' => "less_than_sign",
        '=' => "equals_sign",
        '>' => "greater_than_sign",
        '?' => "question_mark",
        '@' => "commercial_at",
        '[' => "left_square_bracket",
        '\\' => "reverse_solidus",
        ']' => "right_square_bracket",
        '^' => "circumflex_accent",
        '`' => "grave_accent",
        '{' => "left_curly_bracket",
        '|' => "vertical_line",
        '}' => "right_curly_bracket",
        '~' => "tilde",
        _ => return None,
    })
}

/// Human-readable identifier form of a pattern.
pub fn normalize_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c.is_alphanumeric() || c == '_' {
            out.extend(c.to_lowercase());
        } else if let Some(name) = char_name(c) {
            let _ = write!(out, "_{name}_");
        } else {
            let _ = write!(out, "_u{:x}_", c as u32);
        }
    }
    out
}

/// Name every registry entry, in the registry's pattern order.
pub fn build_rules(registry: &Registry) -> Vec<Rule> {
    registry
        .pattern_to_handler
        .iter()
        .enumerate()
        .map(|(index, (pattern, handler))| Rule {
            name: format!("rule_{index}__{}", normalize_pattern(pattern)),
            pattern: pattern.clone(),
            handler: handler.clone(),
        })
        .collect()
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn is_builtin(name: &str) -> bool {
    IMPORTS.iter().any(|(_, alias)| *alias == name)
}

/// Check that an expression only uses names and regexes that will link.
fn validate(name: &str, expr: &Expr, defined: &BTreeSet<&str>) -> Result<(), GrammarError> {
    for reference in expr.references() {
        if !defined.contains(reference) && !is_builtin(reference) {
            return Err(GrammarError::UndefinedReference {
                rule: name.to_string(),
                name: reference.to_string(),
            });
        }
    }
    for (source, flags) in expr.regexes() {
        let grouped = if flags.is_empty() {
            format!("(?:{source})")
        } else {
            format!("(?{flags})(?:{source})")
        };
        Regex::new(&grouped).map_err(|source| GrammarError::InvalidRegex {
            rule: name.to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Check that `body` survives being written as one production line.
fn check_line(name: &str, body: &str) -> Result<(), GrammarError> {
    let unrepresentable = |reason: String| GrammarError::Unrepresentable {
        rule: name.to_string(),
        reason,
    };
    if body.contains(['\n', '\r']) {
        return Err(unrepresentable("contains a line break".to_string()));
    }
    if text::strip_comment(body).len() != body.len() {
        return Err(unrepresentable("reads as a `//` comment".to_string()));
    }
    text::parse_expr(body, Dialect::Grammar)
        .map(|_| ())
        .map_err(|e| unrepresentable(e.to_string()))
}

/// Produce grammar text for `rules` and the named fragments.
pub fn build_grammar(rules: &[Rule], definitions: &BTreeMap<String, String>) -> BuiltGrammar {
    let mut diagnostics = Vec::new();

    let rule_names: BTreeSet<&str> = rules.iter().map(|r| r.name.as_str()).collect();
    if rule_names.len() != rules.len() {
        let mut seen = BTreeSet::new();
        for rule in rules {
            if !seen.insert(rule.name.as_str()) {
                diagnostics.push(GrammarError::NameCollision(rule.name.clone()));
            }
        }
    }

    let mut defined: BTreeSet<&str> = BTreeSet::new();
    for name in definitions.keys() {
        let clashes = RESERVED.contains(&name.as_str())
            || is_builtin(name)
            || rule_names.contains(name.as_str());
        if clashes || !is_identifier(name) {
            diagnostics.push(GrammarError::NameCollision(name.clone()));
        } else {
            defined.insert(name);
        }
    }

    let known = |word: &str| defined.contains(word) || is_builtin(word);
    let translate = |name: &str, source: &str, diagnostics: &mut Vec<GrammarError>| {
        let result = pattern::parse(source, &known)
            .map_err(GrammarError::from)
            .and_then(|expr| validate(name, &expr, &defined).map(|()| expr.to_string()))
            .and_then(|body| check_line(name, &body).map(|()| body));
        match result {
            Ok(body) => body,
            Err(e) => {
                diagnostics.push(e);
                VOID.to_string()
            }
        }
    };

    let mut text = String::new();
    let _ = writeln!(text, "?start : message_group");
    let _ = writeln!(text, "message_group : message+");

    let mut emitted = BTreeSet::new();
    let message_rules: Vec<&Rule> = rules
        .iter()
        .filter(|rule| emitted.insert(rule.name.as_str()))
        .collect();

    match message_rules.split_first() {
        None => {
            let _ = writeln!(text, "?message : {VOID}");
        }
        Some((first, rest)) => {
            let _ = writeln!(text, "?message : {}", first.name);
            for rule in rest {
                let _ = writeln!(text, "    | {}", rule.name);
            }
        }
    }

    for rule in &message_rules {
        let body = translate(&rule.name, &rule.pattern, &mut diagnostics);
        let _ = writeln!(text, "{} : {body}", rule.name);
    }

    for (name, source) in definitions {
        if defined.contains(name.as_str()) {
            let body = translate(name, source, &mut diagnostics);
            let _ = writeln!(text, "{name} : {body}");
        }
    }

    text.push('\n');
    for (source, alias) in IMPORTS {
        if source == alias {
            let _ = writeln!(text, "%import common.{source}");
        } else {
            let _ = writeln!(text, "%import common.{source} -> {alias}");
        }
    }
    let _ = writeln!(text, "%declare {VOID}");
    let _ = writeln!(text, "%ignore WS");

    BuiltGrammar { text, diagnostics }
}

/// A compiled grammar plus the rule-to-handler table
#[derive(Debug)]
pub struct Dispatcher {
    grammar: Grammar,
    text: String,
    rules: HashMap<String, Rule>,
    diagnostics: Vec<GrammarError>,
}

/// Link grammar text and attach handlers for the rules it defines.
pub fn compile(text: &str, rules: Vec<Rule>) -> Result<Dispatcher, GrammarError> {
    let grammar = Grammar::from_text(text)?;
    let rules = rules
        .into_iter()
        .filter(|rule| grammar.has_rule(&rule.name))
        .map(|rule| (rule.name.clone(), rule))
        .collect();
    Ok(Dispatcher {
        grammar,
        text: text.to_string(),
        rules,
        diagnostics: Vec::new(),
    })
}

impl Dispatcher {
    /// Build and compile a dispatcher for everything in `registry`.
    pub fn from_registry(registry: &Registry) -> Result<Self, GrammarError> {
        let rules = build_rules(registry);
        let built = build_grammar(&rules, &registry.definitions);
        let mut dispatcher = compile(&built.text, rules)?;
        dispatcher.diagnostics = built.diagnostics;
        Ok(dispatcher)
    }

    pub fn grammar_text(&self) -> &str {
        &self.text
    }

    /// Problems isolated while building the grammar
    pub fn diagnostics(&self) -> &[GrammarError] {
        &self.diagnostics
    }

    pub fn handler(&self, rule: &str) -> Option<&Handler> {
        self.rules.get(rule).map(|r| &r.handler)
    }

    /// Parse a transcript into the commands it contains, in spoken order.
    pub fn parse(&self, transcript: &str) -> Result<Vec<Command>, GrammarError> {
        let text = transcript.split_whitespace().collect::<Vec<_>>().join(" ");
        let tree = self.grammar.parse(&text).map_err(|e| match e {
            GrammarError::ParseFailure { offset, .. } => GrammarError::ParseFailure {
                text: transcript.to_string(),
                offset,
            },
            other => other,
        })?;

        let mut commands = Vec::new();
        self.collect(&text, &tree, &mut commands);
        Ok(commands)
    }

    fn collect(&self, text: &str, tree: &Tree, out: &mut Vec<Command>) {
        if let Some(rule) = self.rules.get(tree.label()) {
            out.push(Command {
                rule: rule.name.clone(),
                pattern: rule.pattern.clone(),
                args: tree.children().iter().map(|c| capture(text, c)).collect(),
            });
            return;
        }
        for child in tree.children() {
            self.collect(text, child, out);
        }
    }
}

fn numeric(terminal: &str, text: &str) -> Option<f64> {
    if NUMERIC_TERMINALS.contains(&terminal) {
        text.parse().ok()
    } else {
        None
    }
}

/// Argument value of one child of a command node
fn capture(text: &str, tree: &Tree) -> Arg {
    match tree {
        Tree::Token { terminal, text } => match numeric(terminal, text) {
            Some(n) => Arg::Number(n),
            None => Arg::Text(text.clone()),
        },
        Tree::Node { span, .. } => {
            let matched = &text[span.clone()];
            if let [Tree::Token { terminal, text }] = tree.tokens().as_slice()
                && text == matched
                && let Some(n) = numeric(terminal, text)
            {
                return Arg::Number(n);
            }
            Arg::Text(matched.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn noop(name: &str) -> Handler {
        Handler::new(name, |_args| async { Ok(()) })
    }

    fn registry(patterns: &[&str], definitions: &[(&str, &str)]) -> Registry {
        let mut registry = Registry::new();
        for pattern in patterns {
            registry.register(pattern, noop(pattern));
        }
        registry.define(definitions.iter().copied());
        registry
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(
            normalize_pattern("say <chord>"),
            "say_space__less_than_sign_chord_greater_than_sign_"
        );
        assert_eq!(normalize_pattern("\"Hi\""), "_quotation_mark_hi_quotation_mark_");
        assert_eq!(normalize_pattern("a\u{2192}b"), "a_u2192_b");
    }

    #[test]
    fn test_rule_names_are_stable() {
        let registry = registry(&["say <key>", "monitor"], &[("key", "(alpha | bravo)")]);
        let names: Vec<String> = build_rules(&registry).into_iter().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                "rule_0__monitor".to_string(),
                "rule_1__say_space__less_than_sign_key_greater_than_sign_".to_string(),
            ]
        );
        let again: Vec<String> = build_rules(&registry).into_iter().map(|r| r.name).collect();
        assert_eq!(names, again);
    }

    #[test]
    fn test_grammar_text_layout() {
        let registry = registry(&["say <key>", "monitor"], &[("key", "(alpha | bravo)")]);
        let rules = build_rules(&registry);
        let built = build_grammar(&rules, &registry.definitions);
        assert!(built.diagnostics.is_empty());
        assert_eq!(
            built.text,
            r#"?start : message_group
message_group : message+
?message : rule_0__monitor
    | rule_1__say_space__less_than_sign_key_greater_than_sign_
rule_0__monitor : "monitor"
rule_1__say_space__less_than_sign_key_greater_than_sign_ : "say" key
key : ( "alpha" | "bravo" )

%import common.ESCAPED_STRING
%import common.SIGNED_NUMBER
%import common.NUMBER
%import common.INT
%import common.WORD
%import common.CNAME -> NAME
%import common.WS
%declare VOID
%ignore WS
"#
        );
    }

    #[test]
    fn test_parse_commands_with_args() {
        let registry = registry(
            &["say <key>", "go NUMBER lines", "alert /\\w.+/"],
            &[("key", "(alpha | bravo)")],
        );
        let dispatcher = Dispatcher::from_registry(&registry).unwrap();

        let commands = dispatcher.parse("say   alpha go 3 lines").unwrap();
        let summary: Vec<(&str, &[Arg])> = commands
            .iter()
            .map(|c| (c.pattern.as_str(), c.args.as_slice()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("say <key>", &[Arg::Text("alpha".into())][..]),
                ("go NUMBER lines", &[Arg::Number(3.0)][..]),
            ]
        );

        let commands = dispatcher.parse("alert the build is done").unwrap();
        assert_eq!(commands[0].args, vec![Arg::Text("the build is done".into())]);
        assert!(dispatcher.handler(&commands[0].rule).is_some());
    }

    #[test]
    fn test_numeric_fragment_is_a_number() {
        let registry = registry(&["line <n>", "spell <w>"], &[("n", "NUMBER"), ("w", "WORD")]);
        let dispatcher = Dispatcher::from_registry(&registry).unwrap();
        assert_eq!(dispatcher.parse("line 42").unwrap()[0].args, vec![Arg::Number(42.0)]);
        assert_eq!(
            dispatcher.parse("spell cat").unwrap()[0].args,
            vec![Arg::Text("cat".into())]
        );
    }

    #[test]
    fn test_optional_absent_yields_no_argument() {
        let registry = registry(&["copy [<n>]"], &[("n", "NUMBER")]);
        let dispatcher = Dispatcher::from_registry(&registry).unwrap();
        assert!(dispatcher.parse("copy").unwrap()[0].args.is_empty());
        assert_eq!(dispatcher.parse("copy 2").unwrap()[0].args, vec![Arg::Number(2.0)]);
    }

    #[test]
    fn test_unparseable_transcript() {
        let dispatcher = Dispatcher::from_registry(&registry(&["monitor"], &[])).unwrap();
        match dispatcher.parse("launch  rockets") {
            Err(GrammarError::ParseFailure { text, offset }) => {
                assert_eq!(text, "launch  rockets");
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_pattern_is_isolated() {
        let registry = registry(&["[broken", "monitor", "say <missing>"], &[]);
        let dispatcher = Dispatcher::from_registry(&registry).unwrap();

        assert_eq!(dispatcher.diagnostics().len(), 2);
        assert!(matches!(
            &dispatcher.diagnostics()[0],
            GrammarError::Pattern(e) if e.pattern == "[broken"
        ));
        assert!(matches!(
            &dispatcher.diagnostics()[1],
            GrammarError::UndefinedReference { name, .. } if name == "missing"
        ));
        assert!(dispatcher.grammar_text().contains("rule_0___left_square_bracket_broken : VOID"));

        let commands = dispatcher.parse("monitor").unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].pattern, "monitor");
    }

    #[test]
    fn test_bad_definition_is_isolated() {
        let registry = registry(
            &["press <key>", "monitor", "note <text>"],
            &[("key", "(alpha | "), ("text", "/[/"), ("message", "x")],
        );
        let dispatcher = Dispatcher::from_registry(&registry).unwrap();
        assert_eq!(dispatcher.diagnostics().len(), 3);
        assert!(dispatcher.parse("press alpha").is_err());
        assert_eq!(dispatcher.parse("monitor").unwrap().len(), 1);
    }

    #[test]
    fn test_patterns_that_break_the_grammar_text_are_isolated() {
        for broken in ["//", "\"a\nb\"", "/a\nb/", "say //"] {
            let dispatcher = Dispatcher::from_registry(&registry(&[broken, "go"], &[]))
                .unwrap_or_else(|e| panic!("{broken:?} broke the grammar: {e}"));
            assert_eq!(dispatcher.diagnostics().len(), 1, "{broken:?}");
            assert!(matches!(
                &dispatcher.diagnostics()[0],
                GrammarError::Unrepresentable { .. }
            ));
            assert_eq!(dispatcher.parse("go").unwrap()[0].pattern, "go");
        }
    }

    #[test]
    fn test_empty_regex_fragment_is_isolated() {
        let dispatcher =
            Dispatcher::from_registry(&registry(&["note <frag>", "go"], &[("frag", "//")])).unwrap();
        assert_eq!(dispatcher.diagnostics().len(), 1);
        assert!(dispatcher.grammar_text().contains("frag : VOID"));
        assert_eq!(dispatcher.parse("go").unwrap()[0].pattern, "go");
    }

    #[test]
    fn test_slashes_inside_a_literal_survive() {
        let dispatcher =
            Dispatcher::from_registry(&registry(&["open \"http://x\"", "go"], &[])).unwrap();
        assert!(dispatcher.diagnostics().is_empty());
        assert_eq!(dispatcher.parse("open http://x").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_registry_compiles() {
        let dispatcher = Dispatcher::from_registry(&Registry::new()).unwrap();
        assert!(dispatcher.parse("anything").is_err());
    }
}
