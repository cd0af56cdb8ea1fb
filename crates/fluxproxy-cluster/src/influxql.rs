//! InfluxQL WHERE 子句等值条件提取
//!
//! 只用于读路由: 在最外层 WHERE 中收集经由 AND 与括号可达的
//! `标签 = 值` 条件。OR 子树与非等值比较不参与路由。
//! 值可以是单引号字符串、双引号标识符或数字;
//! 与结束关键字同名的标签 (如 `order`) 在后跟比较运算符时按标签名处理。

use fluxproxy_common::Tag;
use logos::Logos;
use serde_json::Value;
use std::collections::HashMap;

use crate::{ClusterError, ClusterResult};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token {
    #[token("WHERE", ignore(ascii_case))]
    Where,
    #[token("AND", ignore(ascii_case))]
    And,
    #[token("OR", ignore(ascii_case))]
    Or,

    // 条件表达式的结束关键字
    #[token("GROUP", ignore(ascii_case))]
    Group,
    #[token("ORDER", ignore(ascii_case))]
    Order,
    #[token("LIMIT", ignore(ascii_case))]
    Limit,
    #[token("OFFSET", ignore(ascii_case))]
    Offset,
    #[token("SLIMIT", ignore(ascii_case))]
    SLimit,
    #[token("SOFFSET", ignore(ascii_case))]
    SOffset,
    #[token("FILL", ignore(ascii_case))]
    Fill,
    #[token("TZ", ignore(ascii_case))]
    Tz,

    #[token("=")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<>")]
    Ne2,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("=~")]
    EqRegex,
    #[token("!~")]
    NeRegex,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token("::")]
    DoubleColon,

    #[regex(r"'([^'\\]|\\.)*'", |lex| unquote(lex.slice()))]
    String(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    QuotedIdentifier(String),

    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().to_string())]
    Number(String),

    #[regex(r"[0-9]+(ns|us|u|ms|s|m|h|d|w)", |lex| lex.slice().to_string())]
    Duration(String),

    #[regex(r"/([^/\\\n]|\\.)*/", |lex| lex.slice().to_string())]
    Regex(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string())]
    Identifier(String),
}

fn unquote(s: &str) -> String {
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

impl Token {
    fn ends_condition(&self) -> bool {
        matches!(
            self,
            Token::Group
                | Token::Order
                | Token::Limit
                | Token::Offset
                | Token::SLimit
                | Token::SOffset
                | Token::Fill
                | Token::Tz
                | Token::Semicolon
        )
    }

    fn comparison(&self) -> bool {
        matches!(
            self,
            Token::Eq | Token::Ne | Token::Ne2 | Token::Lt | Token::Le | Token::Gt | Token::Ge | Token::EqRegex | Token::NeRegex
        )
    }

    fn arithmetic(&self) -> bool {
        matches!(self, Token::Plus | Token::Minus | Token::Star | Token::Slash | Token::Percent)
    }
}

/// 条件表达式
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Token, Box<Expr>, Box<Expr>),
    Identifier(String),
    /// 双引号标识符,既可作标签名也可作值
    Quoted(String),
    Literal(String),
    /// 路由不关心的表达式: 算术、函数调用、正则等
    Opaque,
}

/// 分词,遇到无法识别的字符时报错
pub fn tokenize(sql: &str) -> ClusterResult<Vec<Token>> {
    Ok(lex(sql)?.into_iter().map(|(token, _)| token).collect())
}

/// 分词并保留每个 token 的原文
fn lex(sql: &str) -> ClusterResult<Vec<(Token, String)>> {
    let mut lexer = Token::lexer(sql);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.slice().to_string())),
            Err(()) => {
                return Err(ClusterError::Sql(format!(
                    "unexpected character {:?} at {}",
                    lexer.slice(),
                    lexer.span().start
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, String)>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, String)>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(token, _)| token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek()?.clone();
        self.pos += 1;
        Some(token)
    }

    /// 结束关键字后紧跟比较运算符时,视为同名标签
    fn keyword_identifier(&mut self) -> Option<String> {
        let (token, text) = self.tokens.get(self.pos)?;
        if !token.ends_condition() || *token == Token::Semicolon {
            return None;
        }
        if !self.peek_nth(1).is_some_and(|next| next.comparison()) {
            return None;
        }
        let name = text.clone();
        self.pos += 1;
        Some(name)
    }

    fn skip_if(&mut self, token: Token) -> bool {
        if self.peek() == Some(&token) {
            self.next();
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        match self.peek() {
            None => true,
            Some(t) => t.ends_condition(),
        }
    }

    fn parse_or(&mut self) -> ClusterResult<Expr> {
        let mut left = self.parse_and()?;
        while self.skip_if(Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ClusterResult<Expr> {
        let mut left = self.parse_comparison()?;
        while self.skip_if(Token::And) {
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> ClusterResult<Expr> {
        let left = self.parse_arithmetic()?;
        let op = match self.peek() {
            Some(t) if t.comparison() => t.clone(),
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_arithmetic()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_arithmetic(&mut self) -> ClusterResult<Expr> {
        let mut left = self.parse_primary()?;
        while matches!(self.peek(), Some(t) if t.arithmetic()) {
            self.next();
            self.parse_primary()?;
            left = Expr::Opaque;
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> ClusterResult<Expr> {
        if let Some(name) = self.keyword_identifier() {
            return Ok(Expr::Identifier(name));
        }
        if self.at_end() {
            return Err(ClusterError::Sql("missing operand".to_string()));
        }
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                if !self.skip_if(Token::RParen) {
                    return Err(ClusterError::Sql("unbalanced parentheses".to_string()));
                }
                Ok(expr)
            }
            Some(Token::Identifier(name)) => self.reference(Expr::Identifier(name)),
            Some(Token::QuotedIdentifier(name)) => self.reference(Expr::Quoted(name)),
            Some(Token::String(s)) => Ok(Expr::Literal(s)),
            Some(Token::Number(n)) => Ok(Expr::Literal(n)),
            Some(Token::Minus) => match self.parse_primary()? {
                Expr::Literal(n) => Ok(Expr::Literal(format!("-{}", n))),
                _ => Ok(Expr::Opaque),
            },
            Some(Token::Duration(_)) | Some(Token::Regex(_)) => Ok(Expr::Opaque),
            Some(t) => Err(ClusterError::Sql(format!("unexpected token {:?}", t))),
            None => Err(ClusterError::Sql("missing operand".to_string())),
        }
    }

    /// 标识符之后可能是函数调用或 `::type` 类型转换
    fn reference(&mut self, expr: Expr) -> ClusterResult<Expr> {
        if self.skip_if(Token::LParen) {
            self.skip_arguments()?;
            return Ok(Expr::Opaque);
        }
        if self.skip_if(Token::DoubleColon) {
            match self.next() {
                Some(Token::Identifier(_)) => {}
                _ => return Err(ClusterError::Sql("missing type after ::".to_string())),
            }
        }
        Ok(expr)
    }

    /// 跳过函数参数,直到匹配的右括号
    fn skip_arguments(&mut self) -> ClusterResult<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next() {
                Some(Token::LParen) => depth += 1,
                Some(Token::RParen) => depth -= 1,
                Some(_) => {}
                None => return Err(ClusterError::Sql("unbalanced parentheses".to_string())),
            }
        }
        Ok(())
    }
}

fn collect(expr: &Expr, out: &mut Vec<(String, String)>) {
    match expr {
        Expr::And(left, right) => {
            collect(left, out);
            collect(right, out);
        }
        Expr::Compare(Token::Eq, left, right) => {
            if let Some(pair) = equality(left, right) {
                out.push(pair);
            }
        }
        _ => {}
    }
}

/// 等值比较两侧: 左侧为标签名时右侧取值,右侧为标签名时左侧必须是字面量
fn equality(left: &Expr, right: &Expr) -> Option<(String, String)> {
    match (left, right) {
        (Expr::Identifier(name) | Expr::Quoted(name), Expr::Literal(value) | Expr::Quoted(value))
        | (Expr::Literal(value), Expr::Identifier(name) | Expr::Quoted(name)) => Some((name.clone(), value.clone())),
        _ => None,
    }
}

/// 定位最外层 WHERE 之后的 token
fn where_clause(tokens: Vec<(Token, String)>) -> Option<Vec<(Token, String)>> {
    let mut depth = 0usize;
    let mut iter = tokens.into_iter();
    while let Some((token, _)) = iter.next() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            Token::Where if depth == 0 => return Some(iter.by_ref().collect()),
            _ => {}
        }
    }
    None
}

/// # Brief
/// 从查询语句中提取指定标签的等值条件
///
/// # Arguments
/// * `tag_names` - 参与路由的标签名
/// * `sql` - InfluxQL 查询语句
///
/// # Returns
/// 按条件出现顺序排列的标签;语句没有 WHERE 时返回空列表
pub fn select_tags(tag_names: &[String], sql: &str) -> ClusterResult<Vec<Tag>> {
    let tokens = lex(sql)?;
    let Some(clause) = where_clause(tokens) else {
        return Ok(Vec::new());
    };

    let mut parser = Parser::new(clause);
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        if !token.ends_condition() {
            return Err(ClusterError::Sql(format!("unexpected token {:?}", token)));
        }
    }

    let mut pairs = Vec::new();
    collect(&expr, &mut pairs);
    Ok(pairs
        .into_iter()
        .filter(|(name, _)| tag_names.iter().any(|t| t == name))
        .map(|(name, value)| Tag::new(name, value))
        .collect())
}

/// # Brief
/// 从透传查询的维度头中读取标签
///
/// 维度头是标签名到值的 JSON 对象,只保留 `tag_names` 中出现的标签。
pub fn dimension_tags(tag_names: &[String], dimensions: &str) -> ClusterResult<Vec<Tag>> {
    let map: HashMap<String, Value> = serde_json::from_str(dimensions)
        .map_err(|e| ClusterError::GetTagValueFailed(format!("invalid dimensions {}: {}", dimensions, e)))?;
    Ok(tag_names
        .iter()
        .filter_map(|name| {
            map.get(name).map(|value| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Tag::new(name.clone(), value)
            })
        })
        .collect())
}
