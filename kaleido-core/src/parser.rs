use std::collections::HashMap;
use std::str::Chars;

use crate::ast::{Expr, Function, Item, Prototype};
use crate::error::{ParseError, ParseErrorKind};
use crate::lexer::{Lexer, Token, TokenKind};

/// Binding strength of the binary operators. Higher binds tighter.
#[derive(Debug, Clone)]
pub struct PrecedenceTable {
    entries: HashMap<&'static str, i32>,
}

impl Default for PrecedenceTable {
    fn default() -> Self {
        let entries = [("<", 10), ("+", 20), ("-", 20), ("*", 40)];
        PrecedenceTable {
            entries: entries.into_iter().collect(),
        }
    }
}

impl PrecedenceTable {
    pub fn get(&self, op: &str) -> Option<i32> {
        self.entries.get(op).copied()
    }
}

/// Operator-precedence parser producing one `Item` per top-level form.
///
/// Uses the lexer's single token of lookahead. There is no recovery
/// inside a form: on error the caller discards the rest of the line
/// (see [`Lexer::discard_line`]) and starts over.
pub struct Parser<I: Iterator<Item = char>> {
    lexer: Lexer<I>,
    precedence: PrecedenceTable,
}

impl<'a> Parser<Chars<'a>> {
    pub fn for_str(source: &'a str) -> Self {
        Parser::new(Lexer::new(source.chars()))
    }
}

impl<I: Iterator<Item = char>> Parser<I> {
    pub fn new(lexer: Lexer<I>) -> Self {
        Parser {
            lexer,
            precedence: PrecedenceTable::default(),
        }
    }

    pub fn lexer_mut(&mut self) -> &mut Lexer<I> {
        &mut self.lexer
    }

    /// topLevel := (';')* ( definition | externDecl | expression )
    ///
    /// Returns `None` on a clean end of input.
    pub fn parse_top_level(&mut self) -> Result<Option<Item>, ParseError> {
        while self.lexer.peek().is(TokenKind::Semicolon) {
            self.lexer.next_token();
        }
        self.lexer.begin_form();

        let item = match self.lexer.peek().kind {
            TokenKind::Eof => return Ok(None),
            TokenKind::Def => Item::Function(self.parse_definition()?),
            TokenKind::Extern => Item::Extern(self.parse_extern()?),
            _ => Item::Function(Function::anonymous(self.parse_expression()?)),
        };
        Ok(Some(item))
    }

    /// definition := 'def' prototype expression
    fn parse_definition(&mut self) -> Result<Function, ParseError> {
        self.lexer.next_token();
        let proto = self.parse_prototype()?;
        let body = self.parse_expression()?;
        Ok(Function { proto, body })
    }

    /// externDecl := 'extern' prototype
    fn parse_extern(&mut self) -> Result<Prototype, ParseError> {
        self.lexer.next_token();
        self.parse_prototype()
    }

    /// prototype := identifier '(' identifier* ')'
    fn parse_prototype(&mut self) -> Result<Prototype, ParseError> {
        let name = self.expect(TokenKind::Identifier, "function name")?.literal;
        self.expect(TokenKind::LParen, "`(` after function name")?;

        let mut params = Vec::new();
        while self.lexer.peek().is(TokenKind::Identifier) {
            params.push(self.lexer.next_token().literal);
        }

        self.expect(TokenKind::RParen, "`)` to close the parameter list")?;
        Ok(Prototype::new(name, params))
    }

    /// expression := primary binaryRhs(0)
    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_primary()?;
        self.parse_binary_rhs(0, lhs)
    }

    /// Precedence climbing. Equal precedence chains to the left; the right
    /// operand only absorbs the following operator if it binds strictly
    /// tighter than the one just consumed.
    fn parse_binary_rhs(&mut self, min_prec: i32, mut lhs: Expr) -> Result<Expr, ParseError> {
        loop {
            let op_prec = self.current_precedence()?;
            if op_prec < min_prec {
                return Ok(lhs);
            }

            let op = self.lexer.next_token().literal;
            let mut rhs = self.parse_primary()?;

            let next_prec = self.current_precedence()?;
            if op_prec < next_prec {
                rhs = self.parse_binary_rhs(op_prec + 1, rhs)?;
            }

            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    /// Precedence of the lookahead, or -1 when it is not an operator.
    fn current_precedence(&mut self) -> Result<i32, ParseError> {
        let token = self.lexer.peek();
        if !token.is(TokenKind::Operator) {
            return Ok(-1);
        }
        match self.precedence.get(&token.literal) {
            Some(prec) => Ok(prec),
            None => Err(self.error(ParseErrorKind::UnknownOperator)),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        if let Some(value) = self.lexer.peek().number {
            self.lexer.next_token();
            return Ok(Expr::Number(value));
        }

        match self.lexer.peek().kind {
            TokenKind::Identifier => self.parse_identifier(),
            TokenKind::LParen => self.parse_parenthesized(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::Error => Err(self.error(ParseErrorKind::InvalidNumericLiteral)),
            _ => Err(self.error(ParseErrorKind::ExpectedExpression)),
        }
    }

    fn parse_parenthesized(&mut self) -> Result<Expr, ParseError> {
        self.lexer.next_token();
        let expr = self.parse_expression()?;
        self.expect(TokenKind::RParen, "`)`")?;
        Ok(expr)
    }

    /// identifierOrCall := identifier ['(' (expression (',' expression)*)? ')']
    fn parse_identifier(&mut self) -> Result<Expr, ParseError> {
        let name = self.lexer.next_token().literal;
        if !self.lexer.peek().is(TokenKind::LParen) {
            return Ok(Expr::Variable(name));
        }
        self.lexer.next_token();

        let mut args = Vec::new();
        if !self.lexer.peek().is(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if self.lexer.peek().is(TokenKind::RParen) {
                    break;
                }
                self.expect(TokenKind::Comma, "`,` or `)` in argument list")?;
            }
        }
        self.lexer.next_token();

        Ok(Expr::call(name, args))
    }

    /// ifExpr := 'if' expression 'then' expression 'else' expression
    fn parse_if(&mut self) -> Result<Expr, ParseError> {
        self.lexer.next_token();
        let cond = self.parse_expression()?;
        self.expect(TokenKind::Then, "`then`")?;
        let then_branch = self.parse_expression()?;
        self.expect(TokenKind::Else, "`else`")?;
        let else_branch = self.parse_expression()?;

        Ok(Expr::If {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    /// forExpr := 'for' identifier '=' expression ',' expression
    ///            (',' expression)? 'in' expression
    fn parse_for(&mut self) -> Result<Expr, ParseError> {
        self.lexer.next_token();
        let var = self.expect(TokenKind::Identifier, "loop variable name")?.literal;

        if !self.lexer.peek().is_operator("=") {
            return Err(self.error(ParseErrorKind::Expected("`=` after loop variable")));
        }
        self.lexer.next_token();

        let start = self.parse_expression()?;
        self.expect(TokenKind::Comma, "`,` after loop start")?;
        let end = self.parse_expression()?;

        let step = if self.lexer.peek().is(TokenKind::Comma) {
            self.lexer.next_token();
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };

        self.expect(TokenKind::In, "`in`")?;
        let body = self.parse_expression()?;

        Ok(Expr::For {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body: Box::new(body),
        })
    }

    fn expect(&mut self, kind: TokenKind, what: &'static str) -> Result<Token, ParseError> {
        if self.lexer.peek().is(kind) {
            Ok(self.lexer.next_token())
        } else {
            Err(self.error(ParseErrorKind::Expected(what)))
        }
    }

    fn error(&mut self, kind: ParseErrorKind) -> ParseError {
        let token = self.lexer.peek().clone();
        ParseError {
            kind,
            token,
            context: self.lexer.form_text().to_string(),
        }
    }
}

/// Parse every top-level form in `source`.
pub fn parse_program(source: &str) -> Result<Vec<Item>, ParseError> {
    let mut parser = Parser::for_str(source);
    let mut items = Vec::new();
    while let Some(item) = parser.parse_top_level()? {
        items.push(item);
    }
    Ok(items)
}
