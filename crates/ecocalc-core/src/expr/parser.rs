//! Recursive-descent parser. One function per precedence level, lowest first.
use super::lexer::{tokenize, Spanned, Tok};
use super::{BinOp, Expr, ExprError, Func};

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0, end: src.len() };
    let expr = p.comparison()?;
    match p.peek() {
        None => Ok(expr),
        Some(_) => Err(p.error("unexpected trailing input")),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Offset reported for errors at end of input.
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, o)| *o)
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::new(self.offset(), message)
    }

    fn bump(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ExprError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    // ── Precedence levels ────────────────────────────────────────────────────

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Ge) => BinOp::Ge,
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::Ne) => BinOp::Ne,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    /// Sign applies to the whole power: `-a ** b` is `-(a ** b)`.
    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&Tok::Plus) {
            return self.unary();
        }
        self.power()
    }

    /// Right associative: `a ** b ** c` is `a ** (b ** c)`. The exponent may
    /// carry its own sign, as in `2 ** -1`.
    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.primary()?;
        if self.eat(&Tok::StarStar) {
            let exp = self.unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.bump() {
            Some(Tok::Number(n)) => Ok(Expr::Number(n)),
            Some(Tok::LParen) => {
                let inner = self.comparison()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Tok::Ident(name)) => match name.as_str() {
                "True" => Ok(Expr::Number(1.0)),
                "False" => Ok(Expr::Number(0.0)),
                _ if self.peek() == Some(&Tok::LParen) => {
                    self.pos += 1;
                    self.call(name, offset)
                }
                _ => Ok(Expr::Symbol(name)),
            },
            Some(_) => Err(ExprError::new(offset, "expected a number, symbol or '('")),
            None => Err(ExprError::new(offset, "unexpected end of expression")),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────────

    fn call(&mut self, name: String, offset: usize) -> Result<Expr, ExprError> {
        match name.as_str() {
            "percentile" => self.percentile_call(),
            "mask" => self.mask_call(),
            _ => {
                let func = Func::from_name(&name)
                    .ok_or_else(|| ExprError::new(offset, format!("unknown function '{name}'")))?;
                let mut args = Vec::new();
                if !self.eat(&Tok::RParen) {
                    loop {
                        args.push(self.comparison()?);
                        if self.eat(&Tok::RParen) {
                            break;
                        }
                        self.expect(&Tok::Comma, "',' or ')'")?;
                    }
                }
                if !func.accepts(args.len()) {
                    return Err(ExprError::new(
                        offset,
                        format!("{name}() does not take {} argument(s)", args.len()),
                    ));
                }
                Ok(Expr::Call(func, args))
            }
        }
    }

    fn symbol_arg(&mut self) -> Result<String, ExprError> {
        match self.bump() {
            Some(Tok::Ident(s)) => Ok(s),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a symbol name"))
            }
        }
    }

    /// A numeric literal, optionally negated.
    fn literal(&mut self) -> Result<f64, ExprError> {
        let negative = self.eat(&Tok::Minus);
        match self.bump() {
            Some(Tok::Number(n)) => Ok(if negative { -n } else { n }),
            _ => {
                self.pos -= 1;
                Err(self.error("expected a numeric literal"))
            }
        }
    }

    fn percentile_call(&mut self) -> Result<Expr, ExprError> {
        let symbol = self.symbol_arg()?;
        self.expect(&Tok::Comma, "','")?;
        let percentile = self.literal()?;
        self.expect(&Tok::RParen, "')'")?;
        Ok(Expr::Percentile { symbol, percentile })
    }

    fn mask_call(&mut self) -> Result<Expr, ExprError> {
        let symbol = self.symbol_arg()?;
        let mut codes = Vec::new();
        let mut invert = false;
        while self.eat(&Tok::Comma) {
            let is_keyword = matches!(self.peek(), Some(Tok::Ident(k)) if k == "invert")
                && matches!(self.tokens.get(self.pos + 1), Some((Tok::Assign, _)));
            if is_keyword {
                self.pos += 2;
                invert = match self.bump() {
                    Some(Tok::Ident(b)) if b == "True" => true,
                    Some(Tok::Ident(b)) if b == "False" => false,
                    Some(Tok::Number(n)) => n != 0.0,
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("invert must be True or False"));
                    }
                };
            } else {
                codes.push(self.literal()?);
            }
        }
        self.expect(&Tok::RParen, "')'")?;
        Ok(Expr::Mask { symbol, codes, invert })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Box<Expr> {
        Box::new(Expr::Symbol(s.into()))
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let e = parse("a + b * c").unwrap();
        assert_eq!(
            e,
            Expr::Binary(BinOp::Add, sym("a"), Box::new(Expr::Binary(BinOp::Mul, sym("b"), sym("c"))))
        );
    }

    #[test]
    fn power_is_right_associative() {
        let e = parse("a ** b ** c").unwrap();
        assert_eq!(
            e,
            Expr::Binary(BinOp::Pow, sym("a"), Box::new(Expr::Binary(BinOp::Pow, sym("b"), sym("c"))))
        );
    }

    #[test]
    fn negation_applies_after_power() {
        let e = parse("-x ** 2").unwrap();
        assert_eq!(e, Expr::Neg(Box::new(Expr::Binary(BinOp::Pow, sym("x"), Box::new(Expr::Number(2.0))))));
    }

    #[test]
    fn negative_exponent() {
        let e = parse("2 ** -1").unwrap();
        assert_eq!(
            e,
            Expr::Binary(BinOp::Pow, Box::new(Expr::Number(2.0)), Box::new(Expr::Neg(Box::new(Expr::Number(1.0)))))
        );
    }

    #[test]
    fn comparison_is_loosest() {
        let e = parse("val >= 0 + 1").unwrap();
        assert!(matches!(e, Expr::Binary(BinOp::Ge, _, _)));
    }

    #[test]
    fn mask_with_codes_and_keyword() {
        let e = parse("mask(raster, 20, 30, -1, invert=True)").unwrap();
        assert_eq!(
            e,
            Expr::Mask { symbol: "raster".into(), codes: vec![20.0, 30.0, -1.0], invert: true }
        );
    }

    #[test]
    fn percentile_call() {
        let e = parse("service / percentile(service, 99)").unwrap();
        let Expr::Binary(BinOp::Div, _, rhs) = e else { panic!("expected division") };
        assert_eq!(*rhs, Expr::Percentile { symbol: "service".into(), percentile: 99.0 });
    }

    #[test]
    fn unknown_function_reports_offset() {
        let err = parse("1 + frob(2)").unwrap_err();
        assert_eq!(err.offset, 4);
        assert!(err.message.contains("frob"));
    }

    #[test]
    fn arity_is_checked() {
        assert!(parse("abs(1, 2)").is_err());
        assert!(parse("min()").is_err());
        assert!(parse("max(1, 2, 3)").is_ok());
    }

    #[test]
    fn unbalanced_parenthesis() {
        let err = parse("(a + b").unwrap_err();
        assert_eq!(err.offset, 6);
        assert!(parse("a + b)").is_err());
    }

    #[test]
    fn booleans_are_literals() {
        assert_eq!(parse("True").unwrap(), Expr::Number(1.0));
        assert_eq!(parse("False").unwrap(), Expr::Number(0.0));
    }
}
