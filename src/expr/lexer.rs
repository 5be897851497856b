use crate::expr::ExprError;

/// Closed token set of the guard-expression grammar. There is deliberately no
/// token for `.`, `,`, `[`, `{`, `;` or `=`: member access, calls, indexing,
/// statements and assignment are unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Num(f64),
    Str(String),
    True,
    False,
    Null,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    EqEqEq,
    BangEq,
    BangEqEq,
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
}

pub fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(parse_err(i, "expected '&&'"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(parse_err(i, "expected '||'"));
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    if bytes.get(i + 2) == Some(&b'=') {
                        tokens.push(Token::EqEqEq);
                        i += 3;
                    } else {
                        tokens.push(Token::EqEq);
                        i += 2;
                    }
                } else {
                    return Err(parse_err(i, "assignment is not supported"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    if bytes.get(i + 2) == Some(&b'=') {
                        tokens.push(Token::BangEqEq);
                        i += 3;
                    } else {
                        tokens.push(Token::BangEq);
                        i += 2;
                    }
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut text = String::new();
                // Literal bodies may hold arbitrary UTF-8, so decode real
                // chars here instead of single bytes.
                loop {
                    match src[i..].chars().next() {
                        None => return Err(parse_err(start, "unterminated string literal")),
                        Some('\\') => {
                            let escaped = src[i + 1..]
                                .chars()
                                .next()
                                .ok_or_else(|| parse_err(i, "dangling escape"))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            i += 1 + escaped.len_utf8();
                        }
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
                if bytes.get(i) == Some(&b'.') {
                    i += 1;
                    while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &src[start..i];
                let num = text
                    .parse::<f64>()
                    .map_err(|_| parse_err(start, "malformed number"))?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(match &src[start..i] {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    ident => Token::Ident(ident.to_string()),
                });
            }
            _ => return Err(parse_err(i, &format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

fn parse_err(pos: usize, message: &str) -> ExprError {
    ExprError::Parse {
        pos,
        message: message.to_string(),
    }
}
