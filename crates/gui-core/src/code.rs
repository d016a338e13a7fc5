//! Parser for agent action code
//!
//! Agents answer with short Python-flavoured snippets such as
//! `pyautogui.click(512, 300, clicks=2)` or `agent.type("hello", enter=True)`.
//! Only call statements with literal arguments are accepted; anything else is
//! rejected rather than guessed at.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unexpected character {found:?} at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("expected {expected} at offset {offset}")]
    Expected { expected: &'static str, offset: usize },
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("positional argument follows keyword argument at offset {0}")]
    PositionalAfterKeyword(usize),
    #[error("unknown name {0:?}")]
    UnknownName(String),
}

/// Literal argument value
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    List(Vec<Literal>),
}

impl Literal {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Integer value, truncating floats
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Int(i) => Some(*i),
            Literal::Float(f) => Some(f.trunc() as i64),
            Literal::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(b) => Some(*b),
            Literal::Int(i) => Some(*i != 0),
            Literal::None => Some(false),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Literal::None)
    }
}

/// One call statement
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Dotted callee, e.g. `pyautogui.click`
    pub target: String,
    pub args: Vec<Literal>,
    pub kwargs: Vec<(String, Literal)>,
}

impl Call {
    /// Argument by keyword, falling back to position
    pub fn arg(&self, position: usize, name: &str) -> Option<&Literal> {
        self.kwarg(name).or_else(|| self.args.get(position))
    }

    pub fn kwarg(&self, name: &str) -> Option<&Literal> {
        self.kwargs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Argument that is present and not `None`
    pub fn value(&self, position: usize, name: &str) -> Option<&Literal> {
        self.arg(position, name).filter(|v| !v.is_none())
    }
}

/// Parse a snippet into its call statements
///
/// Statements are separated by newlines or `;`. Blank lines, `#` comments and
/// `import`/`from` lines are skipped.
pub fn parse_program(source: &str) -> Result<Vec<Call>, ParseError> {
    let mut parser = Parser::new(source);
    let mut calls = Vec::new();

    loop {
        parser.skip_separators();
        if parser.at_end() {
            break;
        }

        if parser.at_keyword("import") || parser.at_keyword("from") {
            parser.skip_line();
            continue;
        }

        calls.push(parser.call()?);
        parser.end_statement()?;
    }

    Ok(calls)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Skip spaces and tabs within a statement
    fn skip_inline_space(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t') | Some('\r')) {
            self.pos += 1;
        }
    }

    /// Skip all whitespace, including newlines (inside brackets)
    fn skip_space(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    fn skip_separators(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == ';' => self.pos += 1,
                Some('#') => self.skip_line(),
                _ => break,
            }
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        let end = self.pos + keyword.chars().count();
        if end > self.chars.len() {
            return false;
        }
        let word: String = self.chars[self.pos..end].iter().collect();
        word == keyword && self.chars.get(end).map_or(true, |c| c.is_whitespace())
    }

    fn end_statement(&mut self) -> Result<(), ParseError> {
        self.skip_inline_space();
        match self.peek() {
            None | Some('\n') | Some(';') | Some('#') => Ok(()),
            Some(found) => Err(ParseError::UnexpectedChar {
                found,
                offset: self.pos,
            }),
        }
    }

    fn expect(&mut self, want: char, expected: &'static str) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c == want => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(ParseError::Expected {
                expected,
                offset: self.pos,
            }),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn identifier(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => self.pos += 1,
            _ => return None,
        }
        while self.peek().map_or(false, |c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        Some(self.chars[start..self.pos].iter().collect())
    }

    fn call(&mut self) -> Result<Call, ParseError> {
        let mut target = self.identifier().ok_or(match self.peek() {
            Some(found) => ParseError::UnexpectedChar {
                found,
                offset: self.pos,
            },
            None => ParseError::UnexpectedEnd,
        })?;

        while self.peek() == Some('.') {
            self.pos += 1;
            let part = self.identifier().ok_or(ParseError::Expected {
                expected: "attribute name",
                offset: self.pos,
            })?;
            target.push('.');
            target.push_str(&part);
        }

        self.skip_inline_space();
        self.expect('(', "'('")?;

        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        loop {
            self.skip_space();
            if self.peek() == Some(')') {
                self.pos += 1;
                break;
            }

            let arg_start = self.pos;
            if let Some(name) = self.keyword_name() {
                self.skip_space();
                let value = self.literal()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(ParseError::PositionalAfterKeyword(arg_start));
                }
                args.push(self.literal()?);
            }

            self.skip_space();
            match self.bump() {
                Some(',') => continue,
                Some(')') => break,
                Some(found) => {
                    return Err(ParseError::UnexpectedChar {
                        found,
                        offset: self.pos - 1,
                    })
                }
                None => return Err(ParseError::UnexpectedEnd),
            }
        }

        Ok(Call {
            target,
            args,
            kwargs,
        })
    }

    /// Consume `name=` if present, leaving the position untouched otherwise
    fn keyword_name(&mut self) -> Option<String> {
        let start = self.pos;
        if let Some(name) = self.identifier() {
            self.skip_inline_space();
            if self.peek() == Some('=') && self.peek_at(1) != Some('=') {
                self.pos += 1;
                return Some(name);
            }
        }
        self.pos = start;
        None
    }

    fn literal(&mut self) -> Result<Literal, ParseError> {
        match self.peek() {
            None => Err(ParseError::UnexpectedEnd),
            Some('"') | Some('\'') => self.string().map(Literal::Str),
            Some('[') => self.sequence(']').map(Literal::List),
            Some('(') => self.sequence(')').map(Literal::List),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.number(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let start = self.pos;
                let word = self.identifier().unwrap_or_default();
                match word.as_str() {
                    "True" => Ok(Literal::Bool(true)),
                    "False" => Ok(Literal::Bool(false)),
                    "None" => Ok(Literal::None),
                    _ => {
                        self.pos = start;
                        Err(ParseError::UnknownName(word))
                    }
                }
            }
            Some(found) => Err(ParseError::UnexpectedChar {
                found,
                offset: self.pos,
            }),
        }
    }

    fn sequence(&mut self, close: char) -> Result<Vec<Literal>, ParseError> {
        self.pos += 1;
        let mut items = Vec::new();

        loop {
            self.skip_space();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }

            items.push(self.literal()?);

            self.skip_space();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(items),
                Some(found) => {
                    return Err(ParseError::UnexpectedChar {
                        found,
                        offset: self.pos - 1,
                    })
                }
                None => return Err(ParseError::UnexpectedEnd),
            }
        }
    }

    fn number(&mut self) -> Result<Literal, ParseError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            let exponent_sign = matches!(c, '-' | '+')
                && matches!(self.chars.get(self.pos - 1), Some('e') | Some('E'));
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '_' || exponent_sign {
                self.pos += 1;
            } else {
                break;
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        if let Ok(i) = text.parse::<i64>() {
            return Ok(Literal::Int(i));
        }
        text.parse::<f64>()
            .map(Literal::Float)
            .map_err(|_| ParseError::InvalidNumber(text))
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let quote = self.bump().ok_or(ParseError::UnexpectedEnd)?;
        let mut out = String::new();

        loop {
            match self.bump() {
                None | Some('\n') => return Err(ParseError::UnterminatedString(start)),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    None => return Err(ParseError::UnterminatedString(start)),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }
}
