//! Spoken arithmetic
//!
//! "solve two plus three times four" types `14`. Numbers may be spoken
//! ("twenty one", "three hundred") or written ("21"); operators are `plus`,
//! `minus`, `times`, `divided by` and `over`, with the usual precedence.

use std::sync::Arc;

use super::{Wrapper, joined};
use crate::executor::{Action, ActionExecutor};
use crate::grammar::{Handler, Registry};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MathError {
    #[error("nothing to evaluate")]
    Empty,
    #[error("unexpected `{0}`")]
    Unexpected(String),
    #[error("expected a number after `{0}`")]
    MissingOperand(String),
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Add => "plus",
            Op::Sub => "minus",
            Op::Mul => "times",
            Op::Div => "divided by",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(Op),
}

fn small_number(word: &str) -> Option<f64> {
    const UNITS: &[&str] = &[
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
        "nineteen",
    ];
    const TENS: &[&str] = &[
        "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
    ];
    if let Some(i) = UNITS.iter().position(|w| *w == word) {
        return Some(i as f64);
    }
    TENS.iter()
        .position(|w| *w == word)
        .map(|i| (i as f64 + 2.0) * 10.0)
}

/// Split symbols off words: "2+3" reads like "2 plus 3".
fn words(text: &str) -> Vec<String> {
    let spaced = text
        .to_lowercase()
        .replace('+', " plus ")
        .replace('-', " minus ");
    spaced.split_whitespace().map(str::to_string).collect()
}

fn tokenize(text: &str) -> Result<Vec<Token>, MathError> {
    let words = words(text);
    let mut tokens = Vec::new();
    // Spoken number being built: finished thousands plus the current group
    let mut number: Option<(f64, f64)> = None;

    let flush = |number: &mut Option<(f64, f64)>, tokens: &mut Vec<Token>| {
        if let Some((total, group)) = number.take() {
            tokens.push(Token::Number(total + group));
        }
    };

    let mut i = 0;
    while i < words.len() {
        let word = words[i].as_str();
        i += 1;

        if let Some(n) = small_number(word) {
            let (total, group) = number.unwrap_or((0.0, 0.0));
            number = Some((total, group + n));
            continue;
        }
        match word {
            "hundred" => {
                let (total, group) = number.unwrap_or((0.0, 1.0));
                number = Some((total, group.max(1.0) * 100.0));
                continue;
            }
            "thousand" => {
                let (total, group) = number.unwrap_or((0.0, 1.0));
                number = Some((total + group.max(1.0) * 1000.0, 0.0));
                continue;
            }
            "and" if number.is_some() => continue,
            _ => {}
        }

        flush(&mut number, &mut tokens);
        let op = match word {
            "plus" | "add" => Op::Add,
            "minus" => Op::Sub,
            "times" | "multiplied" => Op::Mul,
            "over" | "divided" => Op::Div,
            "by" => continue,
            _ => {
                let n = word
                    .parse::<f64>()
                    .map_err(|_| MathError::Unexpected(word.to_string()))?;
                tokens.push(Token::Number(n));
                continue;
            }
        };
        tokens.push(Token::Op(op));
    }
    flush(&mut number, &mut tokens);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self, ops: &[Op]) -> Option<Op> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) if ops.contains(op) => Some(*op),
            _ => None,
        }
    }

    fn sum(&mut self) -> Result<f64, MathError> {
        let mut value = self.product()?;
        while let Some(op) = self.peek_op(&[Op::Add, Op::Sub]) {
            self.pos += 1;
            let rhs = self.operand(op)?;
            let rhs = self.product_from(rhs)?;
            value = if op == Op::Add { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn product(&mut self) -> Result<f64, MathError> {
        let first = self.factor()?;
        self.product_from(first)
    }

    fn product_from(&mut self, mut value: f64) -> Result<f64, MathError> {
        while let Some(op) = self.peek_op(&[Op::Mul, Op::Div]) {
            self.pos += 1;
            let rhs = self.operand(op)?;
            if op == Op::Mul {
                value *= rhs;
            } else if rhs == 0.0 {
                return Err(MathError::DivisionByZero);
            } else {
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn operand(&mut self, after: Op) -> Result<f64, MathError> {
        if self.pos >= self.tokens.len() {
            return Err(MathError::MissingOperand(after.name().to_string()));
        }
        self.factor()
    }

    /// A number, with any leading minus signs
    fn factor(&mut self) -> Result<f64, MathError> {
        match self.tokens.get(self.pos).copied() {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Token::Op(Op::Sub)) => {
                self.pos += 1;
                Ok(-self.operand(Op::Sub)?)
            }
            Some(Token::Op(op)) => Err(MathError::Unexpected(op.name().to_string())),
            None => Err(MathError::Empty),
        }
    }
}

/// Evaluate a spoken arithmetic expression.
pub fn evaluate(text: &str) -> Result<f64, MathError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(MathError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.sum()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(value),
        Some(Token::Number(n)) => Err(MathError::Unexpected(n.to_string())),
        Some(Token::Op(op)) => Err(MathError::Unexpected(op.name().to_string())),
    }
}

/// Render a result the way it should be typed: `14`, `2.5`
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

pub(super) fn math(executor: &Arc<dyn ActionExecutor>) -> Wrapper {
    let mut registry = Registry::new();
    registry.define([("math", r"/[A-Za-z0-9\-\+ ]+/")]);

    let executor = executor.clone();
    let solve = registry.register(
        "solve <math>",
        Handler::new("solve", move |args| {
            let executor = executor.clone();
            async move {
                let result = format_number(evaluate(&joined(&args))?);
                executor.execute(Action::TypeText(result.clone())).await?;
                executor.execute(Action::Speak(result)).await?;
                Ok(())
            }
        }),
    );
    registry.register("arch <math>", solve);

    Wrapper::always("math", registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::grammar::Dispatcher;

    #[test]
    fn test_spoken_numbers() {
        assert_eq!(evaluate("seven").unwrap(), 7.0);
        assert_eq!(evaluate("twenty one").unwrap(), 21.0);
        assert_eq!(evaluate("three hundred and five").unwrap(), 305.0);
        assert_eq!(evaluate("two thousand twenty").unwrap(), 2020.0);
        assert_eq!(evaluate("42").unwrap(), 42.0);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(evaluate("two plus three times four").unwrap(), 14.0);
        assert_eq!(evaluate("ten minus four minus three").unwrap(), 3.0);
        assert_eq!(evaluate("nine divided by two").unwrap(), 4.5);
        assert_eq!(evaluate("2+3").unwrap(), 5.0);
        assert_eq!(evaluate("minus two times three").unwrap(), -6.0);
        assert_eq!(evaluate("eight over two over two").unwrap(), 2.0);
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate(""), Err(MathError::Empty));
        assert_eq!(evaluate("one over zero"), Err(MathError::DivisionByZero));
        assert_eq!(
            evaluate("two plus"),
            Err(MathError::MissingOperand("plus".into()))
        );
        assert_eq!(evaluate("banana"), Err(MathError::Unexpected("banana".into())));
        assert_eq!(evaluate("times two"), Err(MathError::Unexpected("times".into())));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(14.0), "14");
        assert_eq!(format_number(-6.0), "-6");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn test_solve_types_and_speaks() {
        let recorder = RecordingExecutor::new();
        let executor: Arc<dyn ActionExecutor> = recorder.clone();
        let wrapper = math(&executor);
        let dispatcher = Dispatcher::from_registry(&wrapper.registry).unwrap();

        let commands = dispatcher.parse("solve two plus three times four").unwrap();
        assert_eq!(commands.len(), 1);
        let command = commands.into_iter().next().unwrap();
        dispatcher
            .handler(&command.rule)
            .unwrap()
            .call(command.args)
            .await
            .unwrap();

        assert_eq!(
            recorder.actions(),
            vec![Action::TypeText("14".into()), Action::Speak("14".into())]
        );
    }
}
