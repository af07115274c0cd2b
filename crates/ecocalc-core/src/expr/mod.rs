//! Arithmetic expressions over named raster layers.
//!
//! An expression is parsed once into an [`Expr`] tree and evaluated per pixel
//! against an [`Env`] that supplies the symbol values for that pixel and the
//! precomputed percentiles.
mod lexer;
mod parser;

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

pub use parser::parse;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at offset {offset}")]
pub struct ExprError {
    /// Byte offset into the source expression.
    pub offset: usize,
    pub message: String,
}

impl ExprError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self { offset, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Min,
    Max,
    Abs,
    Sqrt,
    Log,
    Exp,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        Some(match name {
            "min" => Func::Min,
            "max" => Func::Max,
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "log" => Func::Log,
            "exp" => Func::Exp,
            _ => return None,
        })
    }

    fn accepts(self, n: usize) -> bool {
        match self {
            Func::Min | Func::Max => n >= 1,
            _ => n == 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
    Percentile { symbol: String, percentile: f64 },
    Mask { symbol: String, codes: Vec<f64>, invert: bool },
}

/// Values visible to an expression while evaluating one pixel.
pub trait Env {
    fn symbol(&self, name: &str) -> Option<f64>;
    fn percentile(&self, name: &str, percentile: f64) -> Option<f64>;
}

impl Env for HashMap<String, f64> {
    fn symbol(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }

    fn percentile(&self, _name: &str, _percentile: f64) -> Option<f64> {
        None
    }
}

#[inline]
fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl Expr {
    /// Every symbol the expression reads, including those inside
    /// `percentile(...)` and `mask(...)`.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |e| match e {
            Expr::Symbol(s) | Expr::Percentile { symbol: s, .. } | Expr::Mask { symbol: s, .. } => {
                out.insert(s.clone());
            }
            _ => {}
        });
        out
    }

    /// `(symbol, percentile)` pairs that must be computed before evaluation.
    pub fn percentile_requests(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Percentile { symbol, percentile } = e {
                if !out.iter().any(|(s, p)| s == symbol && p == percentile) {
                    out.push((symbol.clone(), *percentile));
                }
            }
        });
        out
    }

    fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Neg(inner) => inner.walk(f),
            Expr::Binary(_, a, b) => {
                a.walk(f);
                b.walk(f);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.walk(f)),
            _ => {}
        }
    }

    /// Evaluate for one pixel. A symbol or percentile the environment does not
    /// provide evaluates to NaN; callers validate symbols up front.
    pub fn eval<E: Env + ?Sized>(&self, env: &E) -> f64 {
        match self {
            Expr::Number(n) => *n,
            Expr::Symbol(s) => env.symbol(s).unwrap_or(f64::NAN),
            Expr::Neg(inner) => -inner.eval(env),
            Expr::Binary(op, a, b) => {
                let (x, y) = (a.eval(env), b.eval(env));
                match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    BinOp::Pow => x.powf(y),
                    BinOp::Lt => truth(x < y),
                    BinOp::Le => truth(x <= y),
                    BinOp::Gt => truth(x > y),
                    BinOp::Ge => truth(x >= y),
                    BinOp::Eq => truth(x == y),
                    BinOp::Ne => truth(x != y),
                }
            }
            Expr::Call(func, args) => match func {
                Func::Min => args.iter().map(|a| a.eval(env)).fold(f64::INFINITY, f64::min),
                Func::Max => args.iter().map(|a| a.eval(env)).fold(f64::NEG_INFINITY, f64::max),
                Func::Abs => args[0].eval(env).abs(),
                Func::Sqrt => args[0].eval(env).sqrt(),
                Func::Log => args[0].eval(env).ln(),
                Func::Exp => args[0].eval(env).exp(),
            },
            Expr::Percentile { symbol, percentile } => {
                env.percentile(symbol, *percentile).unwrap_or(f64::NAN)
            }
            Expr::Mask { symbol, codes, invert } => {
                let Some(v) = env.symbol(symbol) else {
                    return f64::NAN;
                };
                truth(codes.contains(&v) != *invert)
            }
        }
    }
}
