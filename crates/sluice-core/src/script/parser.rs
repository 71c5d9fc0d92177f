//! Recursive-descent parser for the sandboxed scripting subset.
//!
//! Precedence, loosest first: ternary, `||`, `&&`, equality, comparison,
//! additive, multiplicative, unary, postfix (member/index/call), primary.

use super::ast::{BinaryOp, Expr, FuncDef, Program, Stmt, UnaryOp};
use super::lexer::{tokenize, Spanned, Token};
use sluice_error::ScriptError;

/// Parse a script source into a [`Program`].
pub fn parse(source: &str) -> Result<Program, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos:    usize,
}

impl Parser {
    fn parse_program(&mut self) -> Result<Program, ScriptError> {
        let mut program = Program::default();

        while !self.at_end() {
            if self.check(&Token::Function) {
                let (name, def) = self.parse_function()?;
                program.functions.insert(name, def);
            } else {
                program.statements.push(self.parse_statement()?);
            }
        }

        if program.functions.is_empty() && program.statements.is_empty() {
            return Err(ScriptError::Syntax {
                line:    1,
                message: "empty script".to_string(),
            });
        }

        Ok(program)
    }

    fn parse_function(&mut self) -> Result<(String, FuncDef), ScriptError> {
        self.expect(&Token::Function)?;
        let name = self.expect_ident()?;
        self.expect(&Token::LParen)?;

        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        let body = self.parse_block()?;
        Ok((name, FuncDef { params, body }))
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&Token::LBrace)?;
        let mut statements = Vec::new();
        while !self.check(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error("expected '}'"));
            }
            statements.push(self.parse_statement()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt, ScriptError> {
        if self.consume(&Token::Let) {
            let name = self.expect_ident()?;
            self.expect(&Token::Assign)?;
            let expr = self.parse_expression()?;
            self.consume(&Token::Semicolon);
            return Ok(Stmt::Let { name, expr });
        }

        if self.consume(&Token::Return) {
            if self.consume(&Token::Semicolon) || self.check(&Token::RBrace) || self.at_end() {
                return Ok(Stmt::Return(None));
            }
            let expr = self.parse_expression()?;
            self.consume(&Token::Semicolon);
            return Ok(Stmt::Return(Some(expr)));
        }

        if self.consume(&Token::If) {
            self.expect(&Token::LParen)?;
            let cond = self.parse_expression()?;
            self.expect(&Token::RParen)?;
            let then_block = self.parse_block_or_single()?;
            let else_block = if self.consume(&Token::Else) {
                if self.check(&Token::If) {
                    vec![self.parse_statement()?]
                } else {
                    self.parse_block_or_single()?
                }
            } else {
                Vec::new()
            };
            return Ok(Stmt::If {
                cond,
                then_block,
                else_block,
            });
        }

        // `name = expr;` assignment, distinguished by lookahead
        if let Some(Token::Ident(name)) = self.peek_token().cloned() {
            if self.peek_nth(1) == Some(&Token::Assign) {
                self.pos += 2;
                let expr = self.parse_expression()?;
                self.consume(&Token::Semicolon);
                return Ok(Stmt::Assign { name, expr });
            }
        }

        let expr = self.parse_expression()?;
        self.consume(&Token::Semicolon);
        Ok(Stmt::Expr(expr))
    }

    fn parse_block_or_single(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        if self.check(&Token::LBrace) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_statement()?])
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ScriptError> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ScriptError> {
        let cond = self.parse_or()?;
        if self.consume(&Token::Question) {
            let then = self.parse_expression()?;
            self.expect(&Token::Colon)?;
            let alt = self.parse_expression()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(then),
                alt:  Box::new(alt),
            });
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        while self.consume(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or {
                left:  Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_equality()?;
        while self.consume(&Token::And) {
            let right = self.parse_equality()?;
            left = Expr::And {
                left:  Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.consume(&Token::Eq) {
                BinaryOp::Eq
            } else if self.consume(&Token::NotEq) {
                BinaryOp::NotEq
            } else {
                break;
            };
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.consume(&Token::Lt) {
                BinaryOp::Lt
            } else if self.consume(&Token::Le) {
                BinaryOp::Le
            } else if self.consume(&Token::Gt) {
                BinaryOp::Gt
            } else if self.consume(&Token::Ge) {
                BinaryOp::Ge
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.consume(&Token::Plus) {
                BinaryOp::Add
            } else if self.consume(&Token::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.consume(&Token::Star) {
                BinaryOp::Mul
            } else if self.consume(&Token::Slash) {
                BinaryOp::Div
            } else if self.consume(&Token::Percent) {
                BinaryOp::Rem
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.consume(&Token::Bang) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op:   UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.consume(&Token::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op:   UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.consume(&Token::Dot) {
                let property = self.expect_ident()?;
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr::MethodCall {
                        target: Box::new(expr),
                        method: property,
                        args,
                    };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
            } else if self.consume(&Token::LBracket) {
                let index = self.parse_expression()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index:  Box::new(index),
                };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ScriptError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.consume(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        let Some(spanned) = self.tokens.get(self.pos).cloned() else {
            return Err(ScriptError::Syntax {
                line:    self.last_line(),
                message: "unexpected end of script".to_string(),
            });
        };

        match spanned.token {
            Token::Number(n) => {
                self.pos += 1;
                Ok(Expr::Literal(number_value(n)))
            },
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(serde_json::Value::String(s)))
            },
            Token::True => {
                self.pos += 1;
                Ok(Expr::Literal(serde_json::Value::Bool(true)))
            },
            Token::False => {
                self.pos += 1;
                Ok(Expr::Literal(serde_json::Value::Bool(false)))
            },
            Token::Null => {
                self.pos += 1;
                Ok(Expr::Literal(serde_json::Value::Null))
            },
            Token::Ident(name) => {
                self.pos += 1;
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call { callee: name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            },
            Token::LParen => {
                self.pos += 1;
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            },
            Token::LBrace => self.parse_object_literal(),
            Token::LBracket => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.check(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expression()?);
                        if !self.consume(&Token::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::Array(items))
            },
            other => Err(ScriptError::Syntax {
                line:    spanned.line,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }

    fn parse_object_literal(&mut self) -> Result<Expr, ScriptError> {
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        if !self.check(&Token::RBrace) {
            loop {
                let key = match self.peek_token().cloned() {
                    Some(Token::Ident(name)) => {
                        self.pos += 1;
                        name
                    },
                    Some(Token::Str(s)) => {
                        self.pos += 1;
                        s
                    },
                    _ => return Err(self.error("expected object key")),
                };
                self.expect(&Token::Colon)?;
                let value = self.parse_expression()?;
                fields.push((key, value));
                if !self.consume(&Token::Comma) {
                    break;
                }
                // Allow trailing comma
                if self.check(&Token::RBrace) {
                    break;
                }
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Object(fields))
    }

    // Cursor helpers

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_token(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|s| &s.token)
    }

    fn check(&self, token: &Token) -> bool {
        self.peek_token() == Some(token)
    }

    fn consume(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ScriptError> {
        if self.consume(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {token:?}")))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ScriptError> {
        if let Some(Token::Ident(name)) = self.peek_token().cloned() {
            self.pos += 1;
            Ok(name)
        } else {
            Err(self.error("expected identifier"))
        }
    }

    fn error(&self, message: &str) -> ScriptError {
        ScriptError::Syntax {
            line:    self
                .tokens
                .get(self.pos)
                .map_or_else(|| self.last_line(), |s| s.line),
            message: message.to_string(),
        }
    }

    fn last_line(&self) -> usize {
        self.tokens.last().map_or(1, |s| s.line)
    }
}

fn number_value(n: f64) -> serde_json::Value {
    serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_expression_program() {
        let program = parse("payload.total > 100").unwrap();
        assert!(program.as_single_expression().is_some());
    }

    #[test]
    fn test_function_definition() {
        let program = parse(
            "function transform(payload, context) {\n  return { oid: payload.orderId };\n}",
        )
        .unwrap();
        let def = program.functions.get("transform").unwrap();
        assert_eq!(def.params, vec!["payload", "context"]);
        assert_eq!(def.body.len(), 1);
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let program = parse("1 + 2 * 3").unwrap();
        let Some(Expr::Binary { op, right, .. }) = program.as_single_expression() else {
            panic!("expected binary expr");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.as_ref(),
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_ternary_and_logical() {
        let program = parse("a > 1 ? 'big' : b || 'default'").unwrap();
        assert!(matches!(
            program.as_single_expression(),
            Some(Expr::Conditional { .. })
        ));
    }

    #[test]
    fn test_member_index_and_calls() {
        let program = parse("items[0].name.toUpperCase()").unwrap();
        assert!(matches!(
            program.as_single_expression(),
            Some(Expr::MethodCall { .. })
        ));
    }

    #[test]
    fn test_object_literal_with_string_keys_and_trailing_comma() {
        let program = parse("{ a: 1, 'b-c': 2, }").unwrap();
        let Some(Expr::Object(fields)) = program.as_single_expression() else {
            panic!("expected object literal");
        };
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].0, "b-c");
    }

    #[test]
    fn test_if_else_chain() {
        let program = parse(
            "function f(x) { if (x > 2) { return 'big'; } else if (x > 1) { return 'mid'; } else { return 'small'; } }",
        )
        .unwrap();
        assert!(program.functions.contains_key("f"));
    }

    #[test]
    fn test_let_and_assignment() {
        let program = parse("let x = 1; x = x + 1; x").unwrap();
        assert_eq!(program.statements.len(), 3);
        assert!(matches!(program.statements[1], Stmt::Assign { .. }));
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let err = parse("let x = 1;\nlet y = ;").unwrap_err();
        match err {
            ScriptError::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_script_is_syntax_error() {
        assert!(parse("  \n ").is_err());
    }
}
