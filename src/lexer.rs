//! Tokenizer for the Agentflow configuration language
//!
//! Produces a flat token stream with line/column positions. The parser
//! consumes this stream; all location info in parse errors originates here.

use thiserror::Error;

/// Lexical error with source position
#[derive(Debug, Error)]
#[error("{message} at line {line}, column {column}")]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// A single token kind
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare identifier (block keywords, attribute names, reference parts)
    Ident(String),
    /// Quoted string literal
    Str(String),
    /// Integer literal
    Int(i64),
    /// Floating-point literal
    Float(f64),

    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,

    /// `=`
    Assign,
    /// `==`
    EqEq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `&&`
    AndAnd,
    /// `||`
    OrOr,
    /// `!`
    Bang,
    /// `?`
    Question,
    /// `:`
    Colon,
    /// `,`
    Comma,
    /// `.`
    Dot,
    /// `$` (starts a state reference)
    Dollar,
}

impl Token {
    /// Human-readable description for error messages
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{}'", s),
            Token::Str(s) => format!("string \"{}\"", s),
            Token::Int(n) => format!("number {}", n),
            Token::Float(n) => format!("number {}", n),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Assign => "'='".to_string(),
            Token::EqEq => "'=='".to_string(),
            Token::NotEq => "'!='".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::LtEq => "'<='".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::GtEq => "'>='".to_string(),
            Token::AndAnd => "'&&'".to_string(),
            Token::OrOr => "'||'".to_string(),
            Token::Bang => "'!'".to_string(),
            Token::Question => "'?'".to_string(),
            Token::Colon => "':'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Dollar => "'$'".to_string(),
        }
    }
}

/// Token with its source position (1-based line/column)
#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

/// Tokenize a full source text
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, LexError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            line: self.line,
            column: self.column,
        }
    }

    fn run(mut self) -> Result<Vec<SpannedToken>, LexError> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            // Skip whitespace
            if c.is_whitespace() {
                self.bump();
                continue;
            }

            // Comments
            if c == '/' {
                let (line, column) = (self.line, self.column);
                self.bump();
                match self.peek() {
                    Some('/') => {
                        while let Some(c) = self.peek() {
                            if c == '\n' {
                                break;
                            }
                            self.bump();
                        }
                        continue;
                    }
                    Some('*') => {
                        self.bump();
                        self.skip_block_comment(line, column)?;
                        continue;
                    }
                    _ => {
                        return Err(LexError {
                            message: "Unexpected character '/'".to_string(),
                            line,
                            column,
                        })
                    }
                }
            }

            let (line, column) = (self.line, self.column);
            let token = self.next_token()?;
            tokens.push(SpannedToken {
                token,
                line,
                column,
            });
        }

        Ok(tokens)
    }

    fn skip_block_comment(&mut self, line: usize, column: usize) -> Result<(), LexError> {
        // Non-nesting: ends at the first */
        loop {
            match self.bump() {
                Some('*') if self.peek() == Some('/') => {
                    self.bump();
                    return Ok(());
                }
                Some(_) => {}
                None => {
                    return Err(LexError {
                        message: "Unterminated block comment".to_string(),
                        line,
                        column,
                    })
                }
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        let c = self.peek().expect("caller checked non-empty");

        match c {
            '{' => {
                self.bump();
                Ok(Token::LBrace)
            }
            '}' => {
                self.bump();
                Ok(Token::RBrace)
            }
            '[' => {
                self.bump();
                Ok(Token::LBracket)
            }
            ']' => {
                self.bump();
                Ok(Token::RBracket)
            }
            '(' => {
                self.bump();
                Ok(Token::LParen)
            }
            ')' => {
                self.bump();
                Ok(Token::RParen)
            }
            '?' => {
                self.bump();
                Ok(Token::Question)
            }
            ':' => {
                self.bump();
                Ok(Token::Colon)
            }
            ',' => {
                self.bump();
                Ok(Token::Comma)
            }
            '.' => {
                self.bump();
                Ok(Token::Dot)
            }
            '$' => {
                self.bump();
                Ok(Token::Dollar)
            }
            '=' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(Token::EqEq)
                } else {
                    Ok(Token::Assign)
                }
            }
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(Token::NotEq)
                } else {
                    Ok(Token::Bang)
                }
            }
            '<' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(Token::LtEq)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(Token::GtEq)
                } else {
                    Ok(Token::Gt)
                }
            }
            '&' => {
                self.bump();
                if self.peek() == Some('&') {
                    self.bump();
                    Ok(Token::AndAnd)
                } else {
                    Err(self.error("Unexpected character '&' (did you mean '&&'?)"))
                }
            }
            '|' => {
                self.bump();
                if self.peek() == Some('|') {
                    self.bump();
                    Ok(Token::OrOr)
                } else {
                    Err(self.error("Unexpected character '|' (did you mean '||'?)"))
                }
            }
            '"' => self.lex_string(),
            '-' => self.lex_number(),
            c if c.is_ascii_digit() => self.lex_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.lex_ident()),
            other => Err(self.error(format!("Unexpected character '{}'", other))),
        }
    }

    fn lex_string(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        self.bump(); // opening quote

        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(Token::Str(value)),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => {
                        return Err(LexError {
                            message: "Unterminated string literal".to_string(),
                            line,
                            column,
                        })
                    }
                },
                Some('\n') | None => {
                    return Err(LexError {
                        message: "Unterminated string literal".to_string(),
                        line,
                        column,
                    })
                }
                Some(other) => value.push(other),
            }
        }
    }

    fn lex_number(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();

        if self.peek() == Some('-') {
            text.push('-');
            self.bump();
            if !self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                return Err(LexError {
                    message: "Expected digit after '-'".to_string(),
                    line,
                    column,
                });
            }
        }

        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float {
                // Only a fraction if a digit follows; otherwise it's a Dot token
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if lookahead.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
                    is_float = true;
                    text.push('.');
                    self.bump();
                } else {
                    break;
                }
            } else {
                break;
            }
        }

        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| LexError {
                    message: format!("Invalid number '{}'", text),
                    line,
                    column,
                })
        } else {
            text.parse::<i64>().map(Token::Int).map_err(|_| LexError {
                message: format!("Invalid number '{}'", text),
                line,
                column,
            })
        }
    }

    fn lex_ident(&mut self) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token::Ident(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_basic_tokens() {
        let tokens = kinds(r#"agentflow { version = "0.1" }"#);
        assert_eq!(
            tokens,
            vec![
                Token::Ident("agentflow".into()),
                Token::LBrace,
                Token::Ident("version".into()),
                Token::Assign,
                Token::Str("0.1".into()),
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("0.7"), vec![Token::Float(0.7)]);
        assert_eq!(kinds("2000"), vec![Token::Int(2000)]);
        assert_eq!(kinds("-1"), vec![Token::Int(-1)]);
    }

    #[test]
    fn test_dotted_reference_is_ident_dot_ident() {
        let tokens = kinds("model.gpt4");
        assert_eq!(
            tokens,
            vec![
                Token::Ident("model".into()),
                Token::Dot,
                Token::Ident("gpt4".into()),
            ]
        );
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            kinds("a == b != c < d <= e > f >= g"),
            vec![
                Token::Ident("a".into()),
                Token::EqEq,
                Token::Ident("b".into()),
                Token::NotEq,
                Token::Ident("c".into()),
                Token::Lt,
                Token::Ident("d".into()),
                Token::LtEq,
                Token::Ident("e".into()),
                Token::Gt,
                Token::Ident("f".into()),
                Token::GtEq,
                Token::Ident("g".into()),
            ]
        );
    }

    #[test]
    fn test_logical_operators() {
        assert_eq!(
            kinds("a && b || !c"),
            vec![
                Token::Ident("a".into()),
                Token::AndAnd,
                Token::Ident("b".into()),
                Token::OrOr,
                Token::Bang,
                Token::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn test_state_ref_tokens() {
        assert_eq!(
            kinds("$input.count"),
            vec![
                Token::Dollar,
                Token::Ident("input".into()),
                Token::Dot,
                Token::Ident("count".into()),
            ]
        );
    }

    #[test]
    fn test_line_comments_skipped() {
        let tokens = kinds("// a comment\nfoo // trailing\nbar");
        assert_eq!(
            tokens,
            vec![Token::Ident("foo".into()), Token::Ident("bar".into())]
        );
    }

    #[test]
    fn test_block_comments_skipped() {
        let tokens = kinds("/* multi\nline */ foo");
        assert_eq!(tokens, vec![Token::Ident("foo".into())]);
    }

    #[test]
    fn test_unterminated_block_comment() {
        assert!(tokenize("/* never ends").is_err());
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("\"open").is_err());
    }

    #[test]
    fn test_invalid_character() {
        let err = tokenize("version = @bad").unwrap_err();
        assert!(err.message.contains('@'));
    }

    #[test]
    fn test_positions_track_lines() {
        let tokens = tokenize("foo\n  bar").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[0].column, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[1].column, 3);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\"c""#),
            vec![Token::Str("a\nb\"c".into())]
        );
    }
}
