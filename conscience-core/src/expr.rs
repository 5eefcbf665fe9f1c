//! Score expression parser and evaluator.
//!
//! Score policies configure expressions such as `100`, `(num stat.cpu)` or
//! `((num stat.cpu) + (num stat.space)) / 2`, evaluated against the stats a
//! service reports at registration time. The grammar is deliberately small:
//!
//! ```text
//! expr   := term (("+" | "-") term)*
//! term   := factor (("*" | "/") factor)*
//! factor := NUMBER | "(" expr ")" | "num" PATH | "-" factor
//! PATH   := ident ("." ident)*
//! ```
//!
//! Parsing happens once per policy at config load; evaluation per rescore.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
	Num(f64),
	/// `num <path>`: accessor into the reported stats map (e.g. `stat.cpu`).
	Var(String),
	Neg(Box<Expr>),
	Add(Box<Expr>, Box<Expr>),
	Sub(Box<Expr>, Box<Expr>),
	Mul(Box<Expr>, Box<Expr>),
	Div(Box<Expr>, Box<Expr>),
}

impl Expr {
	pub fn parse(input: &str) -> Result<Self> {
		let tokens = lex(input)?;
		let mut p = Parser { tokens, pos: 0 };
		let e = p.expr()?;
		if p.pos != p.tokens.len() {
			return Err(Error::expr(format!("trailing input at token {}", p.pos)));
		}
		Ok(e)
	}

	pub fn eval(&self, stats: &BTreeMap<String, f64>) -> Result<f64> {
		match self {
			Expr::Num(n) => Ok(*n),
			Expr::Var(path) => stats
				.get(path)
				.copied()
				.ok_or_else(|| Error::expr(format!("unknown variable: {path}"))),
			Expr::Neg(e) => Ok(-e.eval(stats)?),
			Expr::Add(a, b) => Ok(a.eval(stats)? + b.eval(stats)?),
			Expr::Sub(a, b) => Ok(a.eval(stats)? - b.eval(stats)?),
			Expr::Mul(a, b) => Ok(a.eval(stats)? * b.eval(stats)?),
			Expr::Div(a, b) => {
				let d = b.eval(stats)?;
				if d == 0.0 {
					return Err(Error::expr("division by zero"));
				}
				Ok(a.eval(stats)? / d)
			}
		}
	}

	/// Variables referenced by this expression, for config-time diagnostics.
	pub fn variables(&self) -> Vec<&str> {
		let mut out = Vec::new();
		self.collect_vars(&mut out);
		out
	}

	fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
		match self {
			Expr::Num(_) => {}
			Expr::Var(p) => out.push(p),
			Expr::Neg(e) => e.collect_vars(out),
			Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
				a.collect_vars(out);
				b.collect_vars(out);
			}
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
	Num(f64),
	Ident(String),
	LParen,
	RParen,
	Plus,
	Minus,
	Star,
	Slash,
}

fn lex(input: &str) -> Result<Vec<Token>> {
	let mut tokens = Vec::new();
	let mut chars = input.char_indices().peekable();
	while let Some(&(i, c)) = chars.peek() {
		match c {
			' ' | '\t' | '\r' | '\n' => {
				chars.next();
			}
			'(' => { chars.next(); tokens.push(Token::LParen); }
			')' => { chars.next(); tokens.push(Token::RParen); }
			'+' => { chars.next(); tokens.push(Token::Plus); }
			'-' => { chars.next(); tokens.push(Token::Minus); }
			'*' => { chars.next(); tokens.push(Token::Star); }
			'/' => { chars.next(); tokens.push(Token::Slash); }
			'0'..='9' | '.' => {
				let start = i;
				let mut end = i;
				while let Some(&(j, d)) = chars.peek() {
					if d.is_ascii_digit() || d == '.' {
						end = j + d.len_utf8();
						chars.next();
					} else {
						break;
					}
				}
				let text = &input[start..end];
				let n: f64 = text
					.parse()
					.map_err(|_| Error::expr(format!("invalid number: {text:?}")))?;
				tokens.push(Token::Num(n));
			}
			c if c.is_ascii_alphabetic() || c == '_' => {
				let start = i;
				let mut end = i;
				while let Some(&(j, d)) = chars.peek() {
					if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
						end = j + d.len_utf8();
						chars.next();
					} else {
						break;
					}
				}
				tokens.push(Token::Ident(input[start..end].to_string()));
			}
			other => return Err(Error::expr(format!("unexpected character: {other:?}"))),
		}
	}
	Ok(tokens)
}

struct Parser {
	tokens: Vec<Token>,
	pos: usize,
}

impl Parser {
	fn peek(&self) -> Option<&Token> {
		self.tokens.get(self.pos)
	}

	fn next(&mut self) -> Option<Token> {
		let t = self.tokens.get(self.pos).cloned();
		if t.is_some() {
			self.pos += 1;
		}
		t
	}

	fn expr(&mut self) -> Result<Expr> {
		let mut lhs = self.term()?;
		loop {
			match self.peek() {
				Some(Token::Plus) => {
					self.next();
					lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
				}
				Some(Token::Minus) => {
					self.next();
					lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
				}
				_ => return Ok(lhs),
			}
		}
	}

	fn term(&mut self) -> Result<Expr> {
		let mut lhs = self.factor()?;
		loop {
			match self.peek() {
				Some(Token::Star) => {
					self.next();
					lhs = Expr::Mul(Box::new(lhs), Box::new(self.factor()?));
				}
				Some(Token::Slash) => {
					self.next();
					lhs = Expr::Div(Box::new(lhs), Box::new(self.factor()?));
				}
				_ => return Ok(lhs),
			}
		}
	}

	fn factor(&mut self) -> Result<Expr> {
		match self.next() {
			Some(Token::Num(n)) => Ok(Expr::Num(n)),
			Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.factor()?))),
			Some(Token::LParen) => {
				let e = self.expr()?;
				match self.next() {
					Some(Token::RParen) => Ok(e),
					_ => Err(Error::expr("expected closing parenthesis")),
				}
			}
			Some(Token::Ident(kw)) if kw == "num" => match self.next() {
				Some(Token::Ident(path)) => Ok(Expr::Var(path)),
				_ => Err(Error::expr("expected variable path after `num`")),
			},
			Some(Token::Ident(other)) => {
				Err(Error::expr(format!("unexpected identifier: {other:?}")))
			}
			Some(t) => Err(Error::expr(format!("unexpected token: {t:?}"))),
			None => Err(Error::expr("unexpected end of expression")),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stats(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
		pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
	}

	#[test]
	fn constant_expression() {
		let e = Expr::parse("100").unwrap();
		assert_eq!(e.eval(&BTreeMap::new()).unwrap(), 100.0);
	}

	#[test]
	fn stat_accessor() {
		let e = Expr::parse("(num stat.cpu)").unwrap();
		assert_eq!(e.eval(&stats(&[("stat.cpu", 73.0)])).unwrap(), 73.0);
	}

	#[test]
	fn arithmetic_with_precedence() {
		let e = Expr::parse("10 + 2 * 5").unwrap();
		assert_eq!(e.eval(&BTreeMap::new()).unwrap(), 20.0);
		let e = Expr::parse("(10 + 2) * 5").unwrap();
		assert_eq!(e.eval(&BTreeMap::new()).unwrap(), 60.0);
	}

	#[test]
	fn averaged_stats() {
		let e = Expr::parse("((num stat.cpu) + (num stat.space)) / 2").unwrap();
		let v = e.eval(&stats(&[("stat.cpu", 80.0), ("stat.space", 40.0)])).unwrap();
		assert_eq!(v, 60.0);
	}

	#[test]
	fn unary_minus() {
		let e = Expr::parse("-3 + 5").unwrap();
		assert_eq!(e.eval(&BTreeMap::new()).unwrap(), 2.0);
	}

	#[test]
	fn unknown_variable_fails_at_eval() {
		let e = Expr::parse("(num stat.cpu)").unwrap();
		assert!(e.eval(&BTreeMap::new()).is_err());
	}

	#[test]
	fn division_by_zero_fails() {
		let e = Expr::parse("1 / 0").unwrap();
		assert!(e.eval(&BTreeMap::new()).is_err());
	}

	#[test]
	fn malformed_expressions_fail_at_parse() {
		for bad in ["", "(", "1 +", "num", "foo", "1 ) 2", "1 $ 2"] {
			assert!(Expr::parse(bad).is_err(), "{bad:?}");
		}
	}

	#[test]
	fn variables_are_reported() {
		let e = Expr::parse("((num stat.cpu) + (num stat.io)) / 2").unwrap();
		assert_eq!(e.variables(), vec!["stat.cpu", "stat.io"]);
	}
}
