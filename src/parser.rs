//! Recursive-descent parser for the Agentflow language
//!
//! Grammar: a sequence of top-level blocks
//! `keyword "label"? ("label2")? { attributes-and-nested-blocks }` where
//! attributes are `name = expr`. Expression parsing uses conventional
//! precedence: ternary lowest, then `||`, then `&&`, then unary `!`, then
//! comparisons, then primary terms.
//!
//! The parser never recovers: the first malformed construct aborts with a
//! `ParseError` carrying line/column and the file label.

use crate::ast::{
    AgentBlock, AgentflowFile, Attribute, BlockBody, CapabilityBlock, CompareOp, Expr,
    MetadataBlock, ModelBlock, ModuleBlock, NestedBlock, PolicyBlock, ProviderBlock, Reference,
    SchemaBlock, ServerBlock, StateRef, StateRoot, StepBlock, VarRef, VariableBlock, WorkflowBlock,
};
use crate::lexer::{tokenize, LexError, SpannedToken, Token};
use thiserror::Error;

/// Syntax error with source position
#[derive(Debug, Error)]
#[error("{}: {message} at line {line}, column {column}", .file.as_deref().unwrap_or("<input>"))]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl ParseError {
    fn from_lex(err: LexError, file: Option<&str>) -> Self {
        Self {
            message: err.message,
            line: err.line,
            column: err.column,
            file: file.map(str::to_string),
        }
    }
}

/// Parse Agentflow source text into an AST
pub fn parse(source: &str, file_label: Option<&str>) -> Result<AgentflowFile, ParseError> {
    let tokens = tokenize(source).map_err(|e| ParseError::from_lex(e, file_label))?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        file: file_label.map(str::to_string),
    };
    parser.parse_file()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    file: Option<String>,
}

impl Parser {
    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|t| &t.token)
    }

    fn bump(&mut self) -> Option<SpannedToken> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn current_position(&self) -> (usize, usize) {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| (t.line, t.column))
            .unwrap_or((1, 1))
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let (line, column) = self.current_position();
        ParseError {
            message: message.into(),
            line,
            column,
            file: self.file.clone(),
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(tok) => self.error(format!("Expected {}, found {}", expected, tok.describe())),
            None => self.error(format!("Expected {}, found end of input", expected)),
        }
    }

    fn expect_ident(&mut self) -> Result<(String, usize), ParseError> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let tok = self.bump().expect("peeked");
                match tok.token {
                    Token::Ident(name) => Ok((name, tok.line)),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Str(_)) => {
                let tok = self.bump().expect("peeked");
                match tok.token {
                    Token::Str(s) => Ok(s),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn expect_token(&mut self, token: Token, what: &str) -> Result<(), ParseError> {
        if self.peek() == Some(&token) {
            self.bump();
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    fn parse_file(&mut self) -> Result<AgentflowFile, ParseError> {
        let mut file = AgentflowFile {
            file_label: self.file.clone(),
            ..Default::default()
        };

        while self.peek().is_some() {
            let (keyword, line) = self.expect_ident()?;
            match keyword.as_str() {
                "agentflow" => {
                    let body = self.parse_braced_body()?;
                    file.metadata = Some(MetadataBlock {
                        version: body
                            .get_attribute("version")
                            .and_then(|e| e.as_str())
                            .map(str::to_string),
                        project: body
                            .get_attribute("project")
                            .and_then(|e| e.as_str())
                            .map(str::to_string),
                        line,
                    });
                }
                "variable" => {
                    let name = self.expect_string("variable name")?;
                    let body = self.parse_braced_body()?;
                    file.variables.push(VariableBlock {
                        name,
                        var_type: body
                            .get_attribute("type")
                            .and_then(|e| e.as_str())
                            .map(str::to_string),
                        default: body.get_attribute("default").cloned(),
                        sensitive: body
                            .get_attribute("sensitive")
                            .and_then(|e| e.as_bool())
                            .unwrap_or(false),
                        description: body
                            .get_attribute("description")
                            .and_then(|e| e.as_str())
                            .map(str::to_string),
                        line,
                    });
                }
                "provider" => {
                    let provider_type = self.expect_string("provider type")?;
                    let name = self.expect_string("provider instance name")?;
                    let body = self.parse_braced_body()?;
                    file.providers.push(ProviderBlock {
                        provider_type,
                        name,
                        body,
                        line,
                    });
                }
                "model" => {
                    let name = self.expect_string("model name")?;
                    let body = self.parse_braced_body()?;
                    file.models.push(ModelBlock { name, body, line });
                }
                "agent" => {
                    let name = self.expect_string("agent name")?;
                    let body = self.parse_braced_body()?;
                    file.agents.push(AgentBlock { name, body, line });
                }
                "policy" => {
                    let name = self.expect_string("policy name")?;
                    let body = self.parse_braced_body()?;
                    file.policies.push(PolicyBlock { name, body, line });
                }
                "server" => {
                    let name = self.expect_string("server name")?;
                    let body = self.parse_braced_body()?;
                    file.servers.push(ServerBlock { name, body, line });
                }
                "capability" => {
                    let name = self.expect_string("capability name")?;
                    let body = self.parse_braced_body()?;
                    file.capabilities.push(CapabilityBlock { name, body, line });
                }
                "schema" => {
                    let name = self.expect_string("schema name")?;
                    let body = self.parse_braced_body()?;
                    file.schemas.push(SchemaBlock { name, body, line });
                }
                "module" => {
                    let name = self.expect_string("module name")?;
                    let body = self.parse_braced_body()?;
                    file.modules.push(ModuleBlock { name, body, line });
                }
                "workflow" => {
                    let name = self.expect_string("workflow name")?;
                    let body = self.parse_braced_body()?;
                    file.workflows.push(self.build_workflow(name, body, line)?);
                }
                other => {
                    return Err(ParseError {
                        message: format!("Unknown block type '{}'", other),
                        line,
                        column: 1,
                        file: self.file.clone(),
                    })
                }
            }
        }

        Ok(file)
    }

    /// Split `step` sub-blocks out of a parsed workflow body
    fn build_workflow(
        &self,
        name: String,
        body: BlockBody,
        line: usize,
    ) -> Result<WorkflowBlock, ParseError> {
        let mut steps = Vec::new();
        let mut rest = Vec::new();

        for block in body.blocks {
            if block.keyword == "step" {
                let step_id = block.label.clone().ok_or_else(|| ParseError {
                    message: "step block requires a quoted id".to_string(),
                    line: block.line,
                    column: 1,
                    file: self.file.clone(),
                })?;
                steps.push(StepBlock {
                    step_id,
                    body: block.body,
                    line: block.line,
                });
            } else {
                rest.push(block);
            }
        }

        Ok(WorkflowBlock {
            name,
            body: BlockBody {
                attributes: body.attributes,
                blocks: rest,
            },
            steps,
            line,
        })
    }

    fn parse_braced_body(&mut self) -> Result<BlockBody, ParseError> {
        self.expect_token(Token::LBrace, "'{'")?;
        let body = self.parse_body_items()?;
        self.expect_token(Token::RBrace, "'}'")?;
        Ok(body)
    }

    fn parse_body_items(&mut self) -> Result<BlockBody, ParseError> {
        let mut body = BlockBody::default();

        loop {
            match self.peek() {
                Some(Token::RBrace) => return Ok(body),
                Some(Token::Ident(_)) => {
                    let (name, line) = self.expect_ident()?;
                    match self.peek() {
                        Some(Token::Assign) => {
                            self.bump();
                            let value = self.parse_expr()?;
                            body.attributes.push(Attribute { name, value, line });
                        }
                        Some(Token::LBrace) => {
                            let inner = self.parse_braced_body()?;
                            body.blocks.push(NestedBlock {
                                keyword: name,
                                label: None,
                                body: inner,
                                line,
                            });
                        }
                        Some(Token::Str(_)) if self.peek_at(1) == Some(&Token::LBrace) => {
                            let label = self.expect_string("block label")?;
                            let inner = self.parse_braced_body()?;
                            body.blocks.push(NestedBlock {
                                keyword: name,
                                label: Some(label),
                                body: inner,
                                line,
                            });
                        }
                        _ => {
                            return Err(self.unexpected(&format!(
                                "'=' or '{{' after '{}'",
                                name
                            )))
                        }
                    }
                }
                Some(_) => return Err(self.unexpected("attribute name or '}'")),
                None => return Err(self.unexpected("'}'")),
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let condition = self.parse_or()?;
        if self.peek() == Some(&Token::Question) {
            self.bump();
            let true_value = self.parse_expr()?;
            self.expect_token(Token::Colon, "':' in conditional expression")?;
            let false_value = self.parse_expr()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                true_value: Box::new(true_value),
                false_value: Box::new(false_value),
            });
        }
        Ok(condition)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            operands.push(self.parse_and()?);
        }
        if operands.len() == 1 {
            Ok(operands.pop().expect("one operand"))
        } else {
            Ok(Expr::Or(operands))
        }
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut operands = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            operands.push(self.parse_unary()?);
        }
        if operands.len() == 1 {
            Ok(operands.pop().expect("one operand"))
        } else {
            Ok(Expr::And(operands))
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Bang) {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(CompareOp::Eq),
            Some(Token::NotEq) => Some(CompareOp::Ne),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::LtEq) => Some(CompareOp::Le),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::GtEq) => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let right = self.parse_primary()?;
            return Ok(Expr::Comparison {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Str(_)) => {
                let tok = self.bump().expect("peeked");
                match tok.token {
                    Token::Str(s) => Ok(Expr::Str(s)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Int(_)) => {
                let tok = self.bump().expect("peeked");
                match tok.token {
                    Token::Int(n) => Ok(Expr::Int(n)),
                    _ => unreachable!(),
                }
            }
            Some(Token::Float(_)) => {
                let tok = self.bump().expect("peeked");
                match tok.token {
                    Token::Float(n) => Ok(Expr::Float(n)),
                    _ => unreachable!(),
                }
            }
            Some(Token::LBracket) => self.parse_array(),
            Some(Token::LParen) => {
                self.bump();
                let inner = self.parse_expr()?;
                self.expect_token(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Dollar) => self.parse_state_ref(),
            Some(Token::Ident(_)) => self.parse_word_or_reference(),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_array(&mut self) -> Result<Expr, ParseError> {
        self.expect_token(Token::LBracket, "'['")?;
        let mut items = Vec::new();

        if self.peek() == Some(&Token::RBracket) {
            self.bump();
            return Ok(Expr::Array(items));
        }

        loop {
            items.push(self.parse_expr()?);
            match self.peek() {
                Some(Token::Comma) => {
                    self.bump();
                    // Allow a trailing comma before the closing bracket
                    if self.peek() == Some(&Token::RBracket) {
                        self.bump();
                        return Ok(Expr::Array(items));
                    }
                }
                Some(Token::RBracket) => {
                    self.bump();
                    return Ok(Expr::Array(items));
                }
                _ => return Err(self.unexpected("',' or ']' in array")),
            }
        }
    }

    fn parse_state_ref(&mut self) -> Result<Expr, ParseError> {
        self.expect_token(Token::Dollar, "'$'")?;
        let (root_name, _) = self.expect_ident()?;
        let root = match root_name.as_str() {
            "input" => StateRoot::Input,
            "state" => StateRoot::State,
            other => {
                return Err(self.error(format!(
                    "Unknown state reference root '${}' (expected $input or $state)",
                    other
                )))
            }
        };

        let mut path = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.bump();
            let (part, _) = self.expect_ident()?;
            path.push(part);
        }

        Ok(Expr::StateRef(StateRef { root, path }))
    }

    /// A bare identifier is either a dotted reference (`model.gpt4`,
    /// `var.api_key`), a boolean literal, a type word (`string`,
    /// `list(number)`), or a plain word treated as a string.
    fn parse_word_or_reference(&mut self) -> Result<Expr, ParseError> {
        let (first, _) = self.expect_ident()?;

        // Dotted path → reference
        if self.peek() == Some(&Token::Dot) {
            let mut parts = vec![first];
            while self.peek() == Some(&Token::Dot) {
                self.bump();
                let (part, _) = self.expect_ident()?;
                parts.push(part);
            }
            if parts[0] == "var" {
                return Ok(Expr::VarRef(VarRef {
                    name: parts[1..].join("."),
                }));
            }
            return Ok(Expr::Reference(Reference::new(parts)));
        }

        // `list(string)` style type words
        if self.peek() == Some(&Token::LParen) {
            self.bump();
            let (inner, _) = self.expect_ident()?;
            self.expect_token(Token::RParen, "')' in type expression")?;
            return Ok(Expr::Str(format!("{}({})", first, inner)));
        }

        match first.as_str() {
            "true" => Ok(Expr::Bool(true)),
            "false" => Ok(Expr::Bool(false)),
            // Bare words (`string`, `stdio`, ...) behave as string literals
            _ => Ok(Expr::Str(first)),
        }
    }
}
