//! Recursive-descent parser.
//!
//! Precedence, lowest to highest: `||`, `&&`, comparison, additive,
//! multiplicative, unary, postfix (`a[b]`, `a.b`, `f(a, b)`), primary.

use super::ast::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::error::ExprError;
use super::lexer::{tokenize, Spanned, Token};
use super::value::Value;

/// Maximum nesting depth accepted by the parser.
pub const MAX_DEPTH: usize = 100;

/// Parse an expression into its syntax tree.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(ExprError::parse(
            format!("unexpected {} after expression", other.describe()),
            parser.position(),
        )),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::parse(
                format!("expected {}, found {}", expected.describe(), self.peek().describe()),
                self.position(),
            ))
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Undo the levels taken by `links` left-nested chain nodes.
    fn unwind(&mut self, links: usize) {
        self.depth -= links;
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let expr = self.or();
        self.leave();
        expr
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        let mut links = 0;
        while *self.peek() == Token::Or {
            self.advance();
            self.enter()?;
            links += 1;
            let rhs = self.and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.unwind(links);
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        let mut links = 0;
        while *self.peek() == Token::And {
            self.advance();
            self.enter()?;
            links += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.unwind(links);
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.additive()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            self.enter()?;
            links += 1;
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
        self.unwind(links);
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            links += 1;
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        self.unwind(links);
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            self.enter()?;
            links += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
        self.unwind(links);
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        let mut links = 0;
        loop {
            if matches!(self.peek(), Token::LBracket | Token::Dot | Token::LParen) {
                self.enter()?;
                links += 1;
            }
            match self.peek() {
                Token::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::Dot => {
                    self.advance();
                    let position = self.position();
                    match self.advance() {
                        Token::Ident(name) => {
                            expr = Expr::Field {
                                target: Box::new(expr),
                                name,
                            };
                        }
                        other => {
                            return Err(ExprError::parse(
                                format!("expected field name after '.', found {}", other.describe()),
                                position,
                            ));
                        }
                    }
                }
                Token::LParen => {
                    let position = self.position();
                    let Expr::Ident(function) = expr else {
                        return Err(ExprError::parse("only named functions can be called", position));
                    };
                    self.advance();
                    let args = self.arguments()?;
                    expr = Expr::Call { function, args };
                }
                _ => break,
            }
        }
        self.unwind(links);
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expression()?);
            match self.advance() {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => {
                    return Err(ExprError::parse(
                        format!("expected ',' or ')' in argument list, found {}", other.describe()),
                        self.position(),
                    ));
                }
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let position = self.position();
        match self.advance() {
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Nil => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let expr = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            other => Err(ExprError::parse(
                format!("unexpected {}", other.describe()),
                position,
            )),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str) -> Box<Expr> {
        Box::new(Expr::Ident(name.to_string()))
    }

    #[test]
    fn test_precedence() {
        let expr = parse("a + b * c > 1 && !d").unwrap();
        let Expr::Logical { op: LogicalOp::And, lhs, rhs } = expr else {
            panic!("expected &&");
        };
        assert!(matches!(*rhs, Expr::Unary { op: UnaryOp::Not, .. }));
        let Expr::Binary { op: BinaryOp::Gt, lhs: sum, .. } = *lhs else {
            panic!("expected >");
        };
        assert_eq!(
            *sum,
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: ident("a"),
                rhs: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: ident("b"),
                    rhs: ident("c"),
                }),
            }
        );
    }

    #[test]
    fn test_or_binds_looser_than_and() {
        let expr = parse("a || b && c").unwrap();
        let Expr::Logical { op: LogicalOp::Or, rhs, .. } = expr else {
            panic!("expected ||");
        };
        assert!(matches!(*rhs, Expr::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse("allowances[owner].limit").unwrap();
        assert_eq!(
            expr,
            Expr::Field {
                target: Box::new(Expr::Index {
                    target: ident("allowances"),
                    index: ident("owner"),
                }),
                name: "limit".to_string(),
            }
        );
    }

    #[test]
    fn test_call() {
        let expr = parse("max(a, 2, len(s))").unwrap();
        let Expr::Call { function, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(function, "max");
        assert_eq!(args.len(), 3);
        assert!(matches!(parse("f()").unwrap(), Expr::Call { args, .. } if args.is_empty()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("a +"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("(a"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("a b"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("a[1](2)"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("f(a b)"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse(""), Err(ExprError::Parse { .. })));
    }

    #[test]
    fn test_max_depth() {
        let ok = format!("{}1{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
        assert!(parse(&ok).is_ok());

        let deep = format!("{}1{}", "(".repeat(MAX_DEPTH + 5), ")".repeat(MAX_DEPTH + 5));
        assert_eq!(parse(&deep), Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH }));

        let negations = format!("{}x", "!".repeat(MAX_DEPTH + 1));
        assert_eq!(parse(&negations), Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH }));
    }

    #[test]
    fn test_flat_chains_count_toward_depth() {
        let short = vec!["1"; 50].join(" + ");
        assert!(parse(&short).is_ok());

        let sum = vec!["1"; MAX_DEPTH + 1].join(" + ");
        assert_eq!(parse(&sum), Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH }));

        let conj = vec!["a"; MAX_DEPTH + 1].join(" && ");
        assert_eq!(parse(&conj), Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH }));

        let fields = vec!["a"; MAX_DEPTH + 1].join(".");
        assert_eq!(parse(&fields), Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH }));

        let indexes = format!("m{}", "[0]".repeat(MAX_DEPTH + 1));
        assert_eq!(parse(&indexes), Err(ExprError::MaxDepthExceeded { max: MAX_DEPTH }));
    }
}
