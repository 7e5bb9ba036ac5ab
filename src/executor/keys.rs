//! Keys, chords and their spoken names
//!
//! A chord is spoken as key names joined by "plus" ("control plus sierra")
//! and written as names joined by `+` (`control+s`). The spoken table covers
//! the NATO alphabet, digit words, named keys, punctuation and modifiers.

use std::fmt;
use std::str::FromStr;

/// Errors raised while reading a chord
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unknown key {0:?}")]
    UnknownKey(String),

    #[error("empty chord")]
    Empty,

    #[error("chord {0:?} has no key after its modifiers")]
    MissingKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Control,
    Shift,
    Alt,
    Super,
}

impl Modifier {
    pub fn name(self) -> &'static str {
        match self {
            Modifier::Control => "control",
            Modifier::Shift => "shift",
            Modifier::Alt => "alt",
            Modifier::Super => "super",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "control" | "ctrl" => Some(Modifier::Control),
            "shift" => Some(Modifier::Shift),
            "alt" | "option" => Some(Modifier::Alt),
            "super" | "meta" | "command" | "cmd" => Some(Modifier::Super),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Enter,
    Tab,
    Space,
    Backspace,
    Delete,
    Escape,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Function(u8),
    /// A modifier pressed on its own
    Modifier(Modifier),
}

const NAMED_KEYS: &[(&str, Key)] = &[
    ("enter", Key::Enter),
    ("tab", Key::Tab),
    ("space", Key::Space),
    ("backspace", Key::Backspace),
    ("delete", Key::Delete),
    ("escape", Key::Escape),
    ("up", Key::Up),
    ("down", Key::Down),
    ("left", Key::Left),
    ("right", Key::Right),
    ("home", Key::Home),
    ("end", Key::End),
    ("pageup", Key::PageUp),
    ("pagedown", Key::PageDown),
];

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Char(c) => write!(f, "{c}"),
            Key::Function(n) => write!(f, "f{n}"),
            Key::Modifier(m) => write!(f, "{}", m.name()),
            named => {
                let name = NAMED_KEYS
                    .iter()
                    .find(|(_, key)| key == named)
                    .map(|(name, _)| *name)
                    .unwrap_or("?");
                write!(f, "{name}")
            }
        }
    }
}

impl FromStr for Key {
    type Err = KeyError;

    /// Written key name: `s`, `enter`, `f5`, `pageup`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let mut chars = lower.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Ok(Key::Char(c));
        }
        if let Some((_, key)) = NAMED_KEYS.iter().find(|(name, _)| *name == lower) {
            return Ok(*key);
        }
        if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<u8>().ok())
            && (1..=24).contains(&n)
        {
            return Ok(Key::Function(n));
        }
        if let Some(m) = Modifier::from_name(&lower) {
            return Ok(Key::Modifier(m));
        }
        Err(KeyError::UnknownKey(s.to_string()))
    }
}

/// A key pressed while holding zero or more modifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyChord {
    pub modifiers: Vec<Modifier>,
    pub key: Key,
}

impl KeyChord {
    pub fn key(key: Key) -> Self {
        Self {
            modifiers: Vec::new(),
            key,
        }
    }

    /// Add a modifier in front of the chord's own modifiers.
    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        if !self.modifiers.contains(&modifier) {
            self.modifiers.insert(0, modifier);
        }
        self
    }

    /// Read a spoken chord such as "control plus shift plus sierra".
    pub fn from_spoken(text: &str) -> Result<Self, KeyError> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Err(KeyError::Empty);
        }

        let mut parts = Vec::new();
        let mut i = 0;
        while i < words.len() {
            let (consumed, spoken) = longest_spoken(&words[i..])
                .ok_or_else(|| KeyError::UnknownKey(words[i].to_string()))?;
            parts.push(spoken);
            i += consumed;
            if i < words.len() {
                if words[i] != "plus" {
                    return Err(KeyError::UnknownKey(words[i..].join(" ")));
                }
                i += 1;
                if i == words.len() {
                    return Err(KeyError::MissingKey(text.to_string()));
                }
            }
        }
        Self::from_parts(parts, text)
    }

    fn from_parts(mut parts: Vec<Spoken>, text: &str) -> Result<Self, KeyError> {
        let key = match parts.pop() {
            Some(Spoken::Key(key)) => key,
            Some(Spoken::Modifier(m)) => Key::Modifier(m),
            None => return Err(KeyError::Empty),
        };
        let mut modifiers = Vec::new();
        for part in parts {
            match part {
                Spoken::Modifier(m) => modifiers.push(m),
                Spoken::Key(_) => return Err(KeyError::MissingKey(text.to_string())),
            }
        }
        Ok(Self { modifiers, key })
    }
}

impl fmt::Display for KeyChord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            write!(f, "{}+", m.name())?;
        }
        write!(f, "{}", self.key)
    }
}

impl FromStr for KeyChord {
    type Err = KeyError;

    /// Written chord such as `control+shift+s` or `super+m`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        // A trailing "+" is the plus key itself: `control++`
        let (head, last) = match s.strip_suffix("++") {
            Some(head) => (head, "+"),
            None => match s.rsplit_once('+') {
                Some((head, last)) => (head, last),
                None => ("", s),
            },
        };
        let key: Key = last.parse()?;
        let mut modifiers = Vec::new();
        for name in head.split('+').filter(|n| !n.is_empty()) {
            let m = Modifier::from_name(&name.trim().to_lowercase())
                .ok_or_else(|| KeyError::UnknownKey(name.to_string()))?;
            modifiers.push(m);
        }
        Ok(Self { modifiers, key })
    }
}

// ============================================================================
// Pronunciation table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Spoken {
    Key(Key),
    Modifier(Modifier),
}

const fn ch(c: char) -> Spoken {
    Spoken::Key(Key::Char(c))
}

/// Spoken name -> key. "plus" is reserved as the chord separator.
const PRONUNCIATION: &[(&str, Spoken)] = &[
    // NATO alphabet
    ("alpha", ch('a')),
    ("bravo", ch('b')),
    ("charlie", ch('c')),
    ("delta", ch('d')),
    ("echo", ch('e')),
    ("foxtrot", ch('f')),
    ("golf", ch('g')),
    ("hotel", ch('h')),
    ("india", ch('i')),
    ("juliet", ch('j')),
    ("kilo", ch('k')),
    ("lima", ch('l')),
    ("mike", ch('m')),
    ("november", ch('n')),
    ("oscar", ch('o')),
    ("papa", ch('p')),
    ("quebec", ch('q')),
    ("romeo", ch('r')),
    ("sierra", ch('s')),
    ("tango", ch('t')),
    ("uniform", ch('u')),
    ("victor", ch('v')),
    ("whiskey", ch('w')),
    ("x-ray", ch('x')),
    ("xray", ch('x')),
    ("yankee", ch('y')),
    ("zulu", ch('z')),
    // Digits
    ("zero", ch('0')),
    ("one", ch('1')),
    ("two", ch('2')),
    ("three", ch('3')),
    ("four", ch('4')),
    ("five", ch('5')),
    ("six", ch('6')),
    ("seven", ch('7')),
    ("eight", ch('8')),
    ("nine", ch('9')),
    // Named keys
    ("enter", Spoken::Key(Key::Enter)),
    ("return", Spoken::Key(Key::Enter)),
    ("tab", Spoken::Key(Key::Tab)),
    ("space", Spoken::Key(Key::Space)),
    ("backspace", Spoken::Key(Key::Backspace)),
    ("delete", Spoken::Key(Key::Delete)),
    ("escape", Spoken::Key(Key::Escape)),
    ("up", Spoken::Key(Key::Up)),
    ("down", Spoken::Key(Key::Down)),
    ("left", Spoken::Key(Key::Left)),
    ("right", Spoken::Key(Key::Right)),
    ("home", Spoken::Key(Key::Home)),
    ("end", Spoken::Key(Key::End)),
    ("page up", Spoken::Key(Key::PageUp)),
    ("page down", Spoken::Key(Key::PageDown)),
    // Punctuation
    ("period", ch('.')),
    ("dot", ch('.')),
    ("comma", ch(',')),
    ("question mark", ch('?')),
    ("exclamation mark", ch('!')),
    ("colon", ch(':')),
    ("semicolon", ch(';')),
    ("dash", ch('-')),
    ("hyphen", ch('-')),
    ("underscore", ch('_')),
    ("plus sign", ch('+')),
    ("equals", ch('=')),
    ("slash", ch('/')),
    ("backslash", ch('\\')),
    ("pipe", ch('|')),
    ("tilde", ch('~')),
    ("caret", ch('^')),
    ("asterisk", ch('*')),
    ("ampersand", ch('&')),
    ("percent", ch('%')),
    ("dollar", ch('$')),
    ("hash", ch('#')),
    ("at sign", ch('@')),
    ("quote", ch('"')),
    ("apostrophe", ch('\'')),
    ("open paren", ch('(')),
    ("close paren", ch(')')),
    ("open bracket", ch('[')),
    ("close bracket", ch(']')),
    ("open brace", ch('{')),
    ("close brace", ch('}')),
    ("less than", ch('<')),
    ("greater than", ch('>')),
    // Modifiers
    ("control", Spoken::Modifier(Modifier::Control)),
    ("shift", Spoken::Modifier(Modifier::Shift)),
    ("alt", Spoken::Modifier(Modifier::Alt)),
    ("super", Spoken::Modifier(Modifier::Super)),
];

/// Longest table entry at the start of `words`, with the word count it used
fn longest_spoken(words: &[&str]) -> Option<(usize, Spoken)> {
    (1..=words.len().min(2)).rev().find_map(|n| {
        let phrase = words[..n].join(" ");
        PRONUNCIATION
            .iter()
            .find(|(name, _)| *name == phrase)
            .map(|(_, spoken)| (n, *spoken))
    })
}

/// Every spoken key name, for building grammar fragments
pub fn spoken_names() -> impl Iterator<Item = &'static str> {
    PRONUNCIATION.iter().map(|(name, _)| *name)
}
