use crate::expr::lexer::Token;
use crate::expr::{ExprError, ExprValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    LooseEq,
    StrictEq,
    LooseNe,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone)]
pub enum Ast {
    Lit(ExprValue),
    Var(String),
    Not(Box<Ast>),
    Neg(Box<Ast>),
    Bin(BinOp, Box<Ast>, Box<Ast>),
}

/// Recursive descent over the token stream, one level per precedence tier.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse(mut self) -> Result<Ast, ExprError> {
        let ast = self.or_expr()?;
        if let Some(tok) = self.tokens.get(self.pos) {
            return Err(ExprError::Parse {
                pos: self.pos,
                message: format!("unexpected trailing token {tok:?}"),
            });
        }
        Ok(ast)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn or_expr(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let right = self.and_expr()?;
            left = Ast::Bin(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let right = self.equality()?;
            left = Ast::Bin(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::LooseEq,
                Some(Token::EqEqEq) => BinOp::StrictEq,
                Some(Token::BangEq) => BinOp::LooseNe,
                Some(Token::BangEqEq) => BinOp::StrictNe,
                _ => break,
            };
            self.bump();
            let right = self.relational()?;
            left = Ast::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn relational(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let right = self.additive()?;
            left = Ast::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let right = self.multiplicative()?;
            left = Ast::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.bump();
            let right = self.unary()?;
            left = Ast::Bin(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Ast, ExprError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.bump();
                Ok(Ast::Not(Box::new(self.unary()?)))
            }
            Some(Token::Minus) => {
                self.bump();
                Ok(Ast::Neg(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Ast, ExprError> {
        let pos = self.pos;
        match self.bump() {
            Some(Token::Num(n)) => Ok(Ast::Lit(ExprValue::Num(n))),
            Some(Token::Str(s)) => Ok(Ast::Lit(ExprValue::Str(s))),
            Some(Token::True) => Ok(Ast::Lit(ExprValue::Bool(true))),
            Some(Token::False) => Ok(Ast::Lit(ExprValue::Bool(false))),
            Some(Token::Null) => Ok(Ast::Lit(ExprValue::Null)),
            Some(Token::Ident(name)) => {
                // An identifier followed by '(' would be a call; the grammar
                // has no call production, so reject it outright.
                if self.peek() == Some(&Token::LParen) {
                    return Err(ExprError::Parse {
                        pos,
                        message: format!("function calls are not supported ('{name}')"),
                    });
                }
                Ok(Ast::Var(name))
            }
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Parse {
                        pos,
                        message: "unbalanced parenthesis".to_string(),
                    }),
                }
            }
            other => Err(ExprError::Parse {
                pos,
                message: format!("expected a value, found {other:?}"),
            }),
        }
    }
}

/// Walks the AST against a variable resolver. The resolver is the only door
/// out of the sandbox and it only hands back plain values.
pub fn eval(
    ast: &Ast,
    resolve: &dyn Fn(&str) -> Result<ExprValue, ExprError>,
) -> Result<ExprValue, ExprError> {
    match ast {
        Ast::Lit(v) => Ok(v.clone()),
        Ast::Var(name) => resolve(name),
        Ast::Not(inner) => Ok(ExprValue::Bool(!eval(inner, resolve)?.truthy())),
        Ast::Neg(inner) => {
            let v = eval(inner, resolve)?;
            let n = v
                .to_number()
                .ok_or_else(|| ExprError::Type(format!("cannot negate {v:?}")))?;
            Ok(ExprValue::Num(-n))
        }
        Ast::Bin(op, l, r) => {
            // Short-circuit before evaluating the right operand.
            match op {
                BinOp::And => {
                    let left = eval(l, resolve)?;
                    return if left.truthy() { eval(r, resolve) } else { Ok(left) };
                }
                BinOp::Or => {
                    let left = eval(l, resolve)?;
                    return if left.truthy() { Ok(left) } else { eval(r, resolve) };
                }
                _ => {}
            }

            let left = eval(l, resolve)?;
            let right = eval(r, resolve)?;
            match op {
                BinOp::And | BinOp::Or => unreachable!("handled above"),
                BinOp::LooseEq => Ok(ExprValue::Bool(left.loose_eq(&right))),
                BinOp::LooseNe => Ok(ExprValue::Bool(!left.loose_eq(&right))),
                BinOp::StrictEq => Ok(ExprValue::Bool(left.strict_eq(&right))),
                BinOp::StrictNe => Ok(ExprValue::Bool(!left.strict_eq(&right))),
                BinOp::Lt => compare(&left, &right, |o| o == std::cmp::Ordering::Less),
                BinOp::Le => compare(&left, &right, |o| o != std::cmp::Ordering::Greater),
                BinOp::Gt => compare(&left, &right, |o| o == std::cmp::Ordering::Greater),
                BinOp::Ge => compare(&left, &right, |o| o != std::cmp::Ordering::Less),
                BinOp::Add => add(&left, &right),
                BinOp::Sub => arith(&left, &right, |a, b| Some(a - b)),
                BinOp::Mul => arith(&left, &right, |a, b| Some(a * b)),
                BinOp::Div => arith(&left, &right, |a, b| Some(a / b)),
                BinOp::Mod => arith(&left, &right, |a, b| Some(a % b)),
            }
        }
    }
}

fn compare(
    left: &ExprValue,
    right: &ExprValue,
    pick: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<ExprValue, ExprError> {
    if let (ExprValue::Str(a), ExprValue::Str(b)) = (left, right) {
        return Ok(ExprValue::Bool(pick(a.cmp(b))));
    }
    let (a, b) = numeric_pair(left, right)?;
    let ord = a
        .partial_cmp(&b)
        .ok_or_else(|| ExprError::Type("cannot order NaN".to_string()))?;
    Ok(ExprValue::Bool(pick(ord)))
}

fn add(left: &ExprValue, right: &ExprValue) -> Result<ExprValue, ExprError> {
    if matches!(left, ExprValue::Str(_)) || matches!(right, ExprValue::Str(_)) {
        return Ok(ExprValue::Str(format!(
            "{}{}",
            left.display(),
            right.display()
        )));
    }
    arith(left, right, |a, b| Some(a + b))
}

fn arith(
    left: &ExprValue,
    right: &ExprValue,
    f: impl Fn(f64, f64) -> Option<f64>,
) -> Result<ExprValue, ExprError> {
    let (a, b) = numeric_pair(left, right)?;
    f(a, b)
        .map(ExprValue::Num)
        .ok_or_else(|| ExprError::Type("arithmetic failure".to_string()))
}

fn numeric_pair(left: &ExprValue, right: &ExprValue) -> Result<(f64, f64), ExprError> {
    match (left.to_number(), right.to_number()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ExprError::Type(format!(
            "expected numbers, found {left:?} and {right:?}"
        ))),
    }
}
