//! Tokenizer for guard and invariant expressions.

use super::error::ExprError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Nil,

    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,

    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string {:?}", s),
            Token::Eof => "end of input".to_string(),
            other => format!("{:?}", other),
        }
    }
}

/// A token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Split an expression into tokens. The result always ends with [`Token::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ExprError> {
    Lexer::new(input).run()
}

struct Lexer<'a> {
    input: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map(|(i, _)| *i).unwrap_or(self.input.len())
    }

    fn run(mut self) -> Result<Vec<Spanned>, ExprError> {
        let mut tokens = Vec::new();

        loop {
            while matches!(self.peek(), Some(c) if c.is_whitespace()) {
                self.pos += 1;
            }

            let position = self.offset();
            let Some(c) = self.peek() else {
                tokens.push(Spanned { token: Token::Eof, position });
                return Ok(tokens);
            };

            let token = match c {
                '0'..='9' => self.number()?,
                '.' if matches!(self.peek_next(), Some('0'..='9')) => self.number()?,
                '"' | '\'' => self.string(c)?,
                c if c.is_alphabetic() || c == '_' => self.ident(),
                _ => self.operator(c, position)?,
            };
            tokens.push(Spanned { token, position });
        }
    }

    fn number(&mut self) -> Result<Token, ExprError> {
        let start = self.offset();
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => self.pos += 1,
                '.' if !seen_dot && matches!(self.peek_next(), Some('0'..='9')) => {
                    seen_dot = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let text = &self.input[start..self.offset()];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| ExprError::parse(format!("invalid number '{}'", text), start))
    }

    fn string(&mut self, quote: char) -> Result<Token, ExprError> {
        let start = self.offset();
        self.pos += 1;
        let mut out = String::new();

        loop {
            match self.peek() {
                None => return Err(ExprError::parse("unterminated string literal", start)),
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Token::Str(out));
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = match self.peek() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        Some(other) => {
                            return Err(ExprError::parse(
                                format!("unknown escape sequence '\\{}'", other),
                                self.offset(),
                            ))
                        }
                        None => return Err(ExprError::parse("unterminated string literal", start)),
                    };
                    out.push(escaped);
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn ident(&mut self) -> Token {
        let start = self.offset();
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        match &self.input[start..self.offset()] {
            "true" => Token::True,
            "false" => Token::False,
            "nil" | "null" => Token::Nil,
            name => Token::Ident(name.to_string()),
        }
    }

    fn operator(&mut self, c: char, position: usize) -> Result<Token, ExprError> {
        let next = self.peek_next();
        let (token, width) = match (c, next) {
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('!', _) => (Token::Not, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            _ => {
                return Err(ExprError::parse(format!("unexpected character '{}'", c), position));
            }
        };
        self.pos += width;
        Ok(token)
    }
}
