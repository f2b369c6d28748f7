//! Tokenizer for gene scripts.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords
    Use,
    Fn,
    Let,
    If,
    Else,
    For,
    In,
    Return,
    Break,
    Continue,
    Try,
    Catch,
    Throw,
    True,
    False,
    Null,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    ColonColon,
    Dot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Bang,
}

fn keyword(ident: &str) -> Option<Token> {
    Some(match ident {
        "use" => Token::Use,
        "fn" => Token::Fn,
        "let" => Token::Let,
        "if" => Token::If,
        "else" => Token::Else,
        "for" => Token::For,
        "in" => Token::In,
        "return" => Token::Return,
        "break" => Token::Break,
        "continue" => Token::Continue,
        "try" => Token::Try,
        "catch" => Token::Catch,
        "throw" => Token::Throw,
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => return None,
    })
}

/// Tokenize a gene source. `#` starts a comment running to end of line.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut pos = 0;
    let mut line = 1;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '\n' => {
                line += 1;
                pos += 1;
            }
            ' ' | '\t' | '\r' => pos += 1,
            '#' => {
                while pos < chars.len() && chars[pos] != '\n' {
                    pos += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                pos += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            ';' => {
                tokens.push(Token::Semi);
                pos += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            ':' => {
                if chars.get(pos + 1) == Some(&':') {
                    tokens.push(Token::ColonColon);
                    pos += 2;
                } else {
                    tokens.push(Token::Colon);
                    pos += 1;
                }
            }
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    pos += 2;
                } else {
                    tokens.push(Token::Assign);
                    pos += 1;
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Bang);
                    pos += 1;
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::LtEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::GtEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            '&' => {
                if chars.get(pos + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    pos += 2;
                } else {
                    return Err(ScriptError::Parse(format!("line {line}: stray '&'")));
                }
            }
            '|' => {
                if chars.get(pos + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    pos += 2;
                } else {
                    return Err(ScriptError::Parse(format!("line {line}: stray '|'")));
                }
            }
            '"' => {
                pos += 1;
                let mut text = String::new();
                loop {
                    match chars.get(pos) {
                        None | Some('\n') => {
                            return Err(ScriptError::Parse(format!(
                                "line {line}: unterminated string"
                            )))
                        }
                        Some('"') => {
                            pos += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(pos + 1).copied();
                            match escaped {
                                Some('"') => text.push('"'),
                                Some('\\') => text.push('\\'),
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                other => {
                                    return Err(ScriptError::Parse(format!(
                                        "line {line}: bad escape '\\{}'",
                                        other.unwrap_or(' ')
                                    )))
                                }
                            }
                            pos += 2;
                        }
                        Some(other) => {
                            text.push(*other);
                            pos += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let start = pos;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
                let mut is_float = false;
                if chars.get(pos) == Some(&'.')
                    && chars.get(pos + 1).is_some_and(char::is_ascii_digit)
                {
                    is_float = true;
                    pos += 1;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
                let text: String = chars[start..pos].iter().collect();
                if is_float {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| ScriptError::Parse(format!("line {line}: bad number '{text}'")))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| ScriptError::Parse(format!("line {line}: bad number '{text}'")))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let ident: String = chars[start..pos].iter().collect();
                tokens.push(keyword(&ident).unwrap_or(Token::Ident(ident)));
            }
            other => {
                return Err(ScriptError::Parse(format!(
                    "line {line}: unexpected character '{other}'"
                )))
            }
        }
    }

    Ok(tokens)
}
