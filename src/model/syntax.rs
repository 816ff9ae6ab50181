//! WF-008: Body IR — statements, expressions, and symbolic aspect references.
//!
//! Member bodies are small statement lists. Expressions may embed an
//! [`AspectReference`] (`{{base}}(x)`), a call whose target is decided by the
//! linker rather than by the author. The text syntax parsed here is what
//! project files and advice templates use; `Display` prints it back on one line.

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Reference vocabulary
// ============================================================================

/// Which element of a chain an aspect reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The element that owns the reference (`{{self}}`).
    Current,
    /// The immediately preceding element.
    Base,
    /// The pristine pre-aspect implementation.
    Original,
    /// The last element, i.e. the fully composed member.
    Final,
}

impl Direction {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Current => "self",
            Self::Base => "base",
            Self::Original => "original",
            Self::Final => "final",
        }
    }

    fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "self" => Some(Self::Current),
            "base" => Some(Self::Base),
            "original" => Some(Self::Original),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// One independent entry point of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Body,
    Get,
    Set,
    Add,
    Remove,
}

impl Facet {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Body => "body",
            Self::Get => "get",
            Self::Set => "set",
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }

    /// Prefix of the callable name for this facet (`get_total`).
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Body => "",
            Self::Get => "get_",
            Self::Set => "set_",
            Self::Add => "add_",
            Self::Remove => "remove_",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "body" => Some(Self::Body),
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

bitflags! {
    /// Call-site flags of an aspect reference.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RefFlags: u8 {
        /// The linker may substitute the reference with a copy of the target body.
        const INLINEABLE = 0b0001;
    }
}

/// A symbolic call to a logically adjacent chain element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AspectReference {
    pub direction: Direction,
    /// Target facet; `None` means the owner's facet for the owner's member, else `Body`.
    pub facet: Option<Facet>,
    /// Target member by name; `None` means the member owning the body.
    pub member: Option<String>,
    pub flags: RefFlags,
    pub args: Vec<Expr>,
}

impl AspectReference {
    pub fn new(direction: Direction, args: Vec<Expr>) -> Self {
        Self {
            direction,
            facet: None,
            member: None,
            flags: RefFlags::empty(),
            args,
        }
    }

    pub fn inlineable(mut self) -> Self {
        self.flags |= RefFlags::INLINEABLE;
        self
    }

    pub fn is_inlineable(&self) -> bool {
        self.flags.contains(RefFlags::INLINEABLE)
    }

    fn head(&self) -> String {
        let mut head = self.direction.keyword().to_string();
        if let Some(facet) = self.facet {
            head.push('.');
            head.push_str(facet.keyword());
        }
        if let Some(ref member) = self.member {
            head.push('@');
            head.push_str(member);
        }
        if self.is_inlineable() {
            head.push_str("|inline");
        }
        head
    }
}

// ============================================================================
// Expressions and statements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Lt,
    Gt,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Eq => "==",
            Self::Lt => "<",
            Self::Gt => ">",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Eq | Self::Lt | Self::Gt => 1,
            Self::Add | Self::Sub => 2,
            Self::Mul => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i64),
    Str(String),
    Name(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Ordinary call: another member's public form, a synthetic form, or an
    /// external function.
    Call { callee: String, args: Vec<Expr> },
    Ref(AspectReference),
}

impl Expr {
    pub fn name(s: &str) -> Self {
        Self::Name(s.to_string())
    }

    pub fn call(callee: &str, args: Vec<Expr>) -> Self {
        Self::Call {
            callee: callee.to_string(),
            args,
        }
    }

    /// Literals and names: substituting them can neither reorder nor
    /// duplicate a side effect.
    pub fn is_trivial(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Str(_) | Self::Name(_))
    }

    /// True if evaluating this expression can call anything.
    pub fn has_effects(&self) -> bool {
        match self {
            Self::Int(_) | Self::Str(_) | Self::Name(_) => false,
            Self::Binary { lhs, rhs, .. } => lhs.has_effects() || rhs.has_effects(),
            Self::Call { .. } | Self::Ref(_) => true,
        }
    }

    pub fn visit_refs<'a>(&'a self, f: &mut dyn FnMut(&'a AspectReference)) {
        match self {
            Self::Int(_) | Self::Str(_) | Self::Name(_) => {}
            Self::Binary { lhs, rhs, .. } => {
                lhs.visit_refs(f);
                rhs.visit_refs(f);
            }
            Self::Call { args, .. } => args.iter().for_each(|a| a.visit_refs(f)),
            Self::Ref(r) => {
                f(r);
                r.args.iter().for_each(|a| a.visit_refs(f));
            }
        }
    }

    fn collect_names(&self, out: &mut FxHashSet<String>) {
        match self {
            Self::Int(_) | Self::Str(_) => {}
            Self::Name(n) => {
                out.insert(n.clone());
            }
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_names(out);
                rhs.collect_names(out);
            }
            Self::Call { args, .. } => args.iter().for_each(|a| a.collect_names(out)),
            Self::Ref(r) => r.args.iter().for_each(|a| a.collect_names(out)),
        }
    }

    /// Replace free names according to `map`.
    pub fn substitute(&self, map: &FxHashMap<String, Expr>) -> Expr {
        match self {
            Self::Name(n) => map.get(n).cloned().unwrap_or_else(|| self.clone()),
            Self::Int(_) | Self::Str(_) => self.clone(),
            Self::Binary { op, lhs, rhs } => Self::Binary {
                op: *op,
                lhs: Box::new(lhs.substitute(map)),
                rhs: Box::new(rhs.substitute(map)),
            },
            Self::Call { callee, args } => Self::Call {
                callee: callee.clone(),
                args: args.iter().map(|a| a.substitute(map)).collect(),
            },
            Self::Ref(r) => Self::Ref(AspectReference {
                args: r.args.iter().map(|a| a.substitute(map)).collect(),
                ..r.clone()
            }),
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, parent: u8, right: bool) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "\"{}\"", escape(s)),
            Self::Name(n) => f.write_str(n),
            Self::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                let paren = prec < parent || (right && prec == parent);
                if paren {
                    f.write_str("(")?;
                }
                lhs.fmt_prec(f, prec, false)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_prec(f, prec, true)?;
                if paren {
                    f.write_str(")")?;
                }
                Ok(())
            }
            Self::Call { callee, args } => {
                f.write_str(callee)?;
                fmt_args(f, args)
            }
            Self::Ref(r) => {
                write!(f, "{{{{{}}}}}", r.head())?;
                fmt_args(f, &r.args)
            }
        }
    }
}

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[Expr]) -> fmt::Result {
    f.write_str("(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        arg.fmt_prec(f, 0, false)?;
    }
    f.write_str(")")
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_prec(f, 0, false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Expr(Expr),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
}

impl Stmt {
    fn visit_refs<'a>(&'a self, f: &mut dyn FnMut(&'a AspectReference)) {
        match self {
            Self::Let { value, .. } | Self::Expr(value) => value.visit_refs(f),
            Self::Return(value) => {
                if let Some(v) = value {
                    v.visit_refs(f);
                }
            }
            Self::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.visit_refs(f);
                then_branch.iter().for_each(|s| s.visit_refs(f));
                else_branch.iter().for_each(|s| s.visit_refs(f));
            }
        }
    }

    fn count_returns(&self) -> usize {
        match self {
            Self::Return(_) => 1,
            Self::If {
                then_branch,
                else_branch,
                ..
            } => then_branch
                .iter()
                .chain(else_branch.iter())
                .map(Stmt::count_returns)
                .sum(),
            _ => 0,
        }
    }

    fn collect_names(&self, out: &mut FxHashSet<String>) {
        match self {
            Self::Let { name, value } => {
                out.insert(name.clone());
                value.collect_names(out);
            }
            Self::Expr(value) => value.collect_names(out),
            Self::Return(value) => {
                if let Some(v) = value {
                    v.collect_names(out);
                }
            }
            Self::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.collect_names(out);
                then_branch.iter().for_each(|s| s.collect_names(out));
                else_branch.iter().for_each(|s| s.collect_names(out));
            }
        }
    }

    fn collect_locals(&self, out: &mut Vec<String>) {
        match self {
            Self::Let { name, .. } => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Self::If {
                then_branch,
                else_branch,
                ..
            } => {
                then_branch.iter().for_each(|s| s.collect_locals(out));
                else_branch.iter().for_each(|s| s.collect_locals(out));
            }
            _ => {}
        }
    }

    fn render(&self, indent: usize, out: &mut String) {
        let pad = "    ".repeat(indent);
        match self {
            Self::If {
                cond,
                then_branch,
                else_branch,
            } => {
                out.push_str(&format!("{}if {} {{\n", pad, cond));
                then_branch.iter().for_each(|s| s.render(indent + 1, out));
                if else_branch.is_empty() {
                    out.push_str(&format!("{}}}\n", pad));
                } else {
                    out.push_str(&format!("{}}} else {{\n", pad));
                    else_branch.iter().for_each(|s| s.render(indent + 1, out));
                    out.push_str(&format!("{}}}\n", pad));
                }
            }
            other => out.push_str(&format!("{}{}\n", pad, other)),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Let { name, value } => write!(f, "let {} = {};", name, value),
            Self::Expr(value) => write!(f, "{};", value),
            Self::Return(Some(value)) => write!(f, "return {};", value),
            Self::Return(None) => f.write_str("return;"),
            Self::If {
                cond,
                then_branch,
                else_branch,
            } => {
                write!(f, "if {} {{", cond)?;
                for s in then_branch {
                    write!(f, " {}", s)?;
                }
                f.write_str(" }")?;
                if !else_branch.is_empty() {
                    f.write_str(" else {")?;
                    for s in else_branch {
                        write!(f, " {}", s)?;
                    }
                    f.write_str(" }")?;
                }
                Ok(())
            }
        }
    }
}

/// Substitute names through a statement list, honouring `let` shadowing.
/// `renames` maps a local declared by these statements to its new name.
pub fn substitute_stmts(
    stmts: &[Stmt],
    map: &FxHashMap<String, Expr>,
    renames: &FxHashMap<String, String>,
) -> Vec<Stmt> {
    let mut scope = map.clone();
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        out.push(match stmt {
            Stmt::Let { name, value } => {
                let value = value.substitute(&scope);
                let name = match renames.get(name) {
                    Some(renamed) => {
                        scope.insert(name.clone(), Expr::Name(renamed.clone()));
                        renamed.clone()
                    }
                    None => {
                        scope.remove(name);
                        name.clone()
                    }
                };
                Stmt::Let { name, value }
            }
            Stmt::Expr(value) => Stmt::Expr(value.substitute(&scope)),
            Stmt::Return(value) => Stmt::Return(value.as_ref().map(|v| v.substitute(&scope))),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => Stmt::If {
                cond: cond.substitute(&scope),
                then_branch: substitute_stmts(then_branch, &scope, renames),
                else_branch: substitute_stmts(else_branch, &scope, renames),
            },
        });
    }
    out
}

// ============================================================================
// Body
// ============================================================================

/// The structural body of one chain element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body {
    pub stmts: Vec<Stmt>,
}

impl Body {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    /// Parse the text syntax.
    pub fn parse(src: &str) -> Result<Body, String> {
        let tokens = lex(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let stmts = parser.block_until(None)?;
        Ok(Body { stmts })
    }

    pub fn references(&self) -> Vec<&AspectReference> {
        let mut refs = Vec::new();
        self.stmts.iter().for_each(|s| s.visit_refs(&mut |r| refs.push(r)));
        refs
    }

    pub fn has_references(&self) -> bool {
        !self.references().is_empty()
    }

    pub fn return_count(&self) -> usize {
        self.stmts.iter().map(Stmt::count_returns).sum()
    }

    /// Single exit point: no return at all, or exactly one as the last
    /// top-level statement.
    pub fn is_single_exit(&self) -> bool {
        match self.return_count() {
            0 => true,
            1 => matches!(self.stmts.last(), Some(Stmt::Return(_))),
            _ => false,
        }
    }

    /// Names introduced by `let`, in first-declaration order.
    pub fn locals(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.stmts.iter().for_each(|s| s.collect_locals(&mut out));
        out
    }

    /// Every name read or declared anywhere in the body.
    pub fn names(&self) -> FxHashSet<String> {
        let mut out = FxHashSet::default();
        self.stmts.iter().for_each(|s| s.collect_names(&mut out));
        out
    }

    /// Multi-line rendering at the given indentation level.
    pub fn render(&self, indent: usize) -> String {
        let mut out = String::new();
        self.stmts.iter().for_each(|s| s.render(indent, &mut out));
        out
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stmt) in self.stmts.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", stmt)?;
        }
        Ok(())
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Ref(AspectReference),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Assign,
    EqEq,
    Lt,
    Gt,
    Plus,
    Minus,
    Star,
}

/// Whether the text after a `{{` at `start` reads as a reference head. A
/// block brace directly followed by a reference (`{{{base}}(x); }`) or a
/// nested block does not.
fn opens_reference(chars: &[char], start: usize) -> bool {
    let mut i = start;
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    let word_start = i;
    while chars.get(i).is_some_and(|c| c.is_alphanumeric() || *c == '_') {
        i += 1;
    }
    if i == word_start {
        return false;
    }
    let word: String = chars[word_start..i].iter().collect();
    if Direction::from_keyword(&word).is_some() {
        return true;
    }
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    matches!(chars.get(i), Some('.' | '@' | '|' | '}'))
}

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '{' && chars.get(i + 1) == Some(&'{') && opens_reference(&chars, i + 2) {
            let start = i + 2;
            let mut end = start;
            while end + 1 < chars.len() && !(chars[end] == '}' && chars[end + 1] == '}') {
                end += 1;
            }
            if end + 1 >= chars.len() {
                return Err(format!("unclosed reference at position {}", i));
            }
            let head: String = chars[start..end].iter().collect();
            tokens.push(Token::Ref(parse_ref_head(head.trim())?));
            i = end + 2;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<i64>()
                .map_err(|e| format!("bad integer {}: {}", text, e))?;
            tokens.push(Token::Int(n));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c == '"' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string literal".to_string()),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => s.push('\n'),
                            Some(&other) => s.push(other),
                            None => return Err("unterminated string literal".to_string()),
                        }
                        i += 2;
                    }
                    Some(&other) => {
                        s.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }
        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semi,
            '<' => Token::Lt,
            '>' => Token::Gt,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '=' if chars.get(i + 1) == Some(&'=') => {
                i += 1;
                Token::EqEq
            }
            '=' => Token::Assign,
            other => return Err(format!("unexpected character '{}' at position {}", other, i)),
        };
        tokens.push(token);
        i += 1;
    }

    Ok(tokens)
}

/// Parse `direction[.facet][@member][|flag...]`.
fn parse_ref_head(head: &str) -> Result<AspectReference, String> {
    let mut parts = head.split('|');
    let target = parts.next().unwrap_or_default().trim();
    let mut flags = RefFlags::empty();
    for flag in parts {
        match flag.trim() {
            "inline" => flags |= RefFlags::INLINEABLE,
            other => return Err(format!("unknown reference flag '{}'", other)),
        }
    }

    let (path, member) = match target.split_once('@') {
        Some((path, member)) if !member.trim().is_empty() => {
            (path.trim(), Some(member.trim().to_string()))
        }
        Some(_) => return Err(format!("empty member in reference '{}'", head)),
        None => (target, None),
    };
    let (dir, facet) = match path.split_once('.') {
        Some((dir, facet)) => {
            let facet = Facet::from_keyword(facet.trim())
                .ok_or_else(|| format!("unknown facet '{}' in reference '{}'", facet, head))?;
            (dir.trim(), Some(facet))
        }
        None => (path, None),
    };
    let direction = Direction::from_keyword(dir)
        .ok_or_else(|| format!("unknown reference direction '{}'", dir))?;

    Ok(AspectReference {
        direction,
        facet,
        member,
        flags,
        args: Vec::new(),
    })
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), String> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(format!("expected {}, found {:?}", what, t)),
            None => Err(format!("expected {}, found end of body", what)),
        }
    }

    /// Statements until `end` (or end of input when `end` is None).
    fn block_until(&mut self, end: Option<Token>) -> Result<Vec<Stmt>, String> {
        let mut stmts = Vec::new();
        loop {
            match (self.peek(), &end) {
                (None, None) => return Ok(stmts),
                (None, Some(_)) => return Err("unclosed block".to_string()),
                (Some(t), Some(e)) if t == e => {
                    self.pos += 1;
                    return Ok(stmts);
                }
                _ => stmts.push(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        match self.peek() {
            Some(Token::Ident(kw)) if kw == "let" => {
                self.pos += 1;
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    other => return Err(format!("expected name after let, found {:?}", other)),
                };
                self.expect(Token::Assign, "'='")?;
                let value = self.expr()?;
                self.terminator()?;
                Ok(Stmt::Let { name, value })
            }
            Some(Token::Ident(kw)) if kw == "return" => {
                self.pos += 1;
                let value = match self.peek() {
                    None | Some(Token::Semi) | Some(Token::RBrace) => None,
                    _ => Some(self.expr()?),
                };
                self.terminator()?;
                Ok(Stmt::Return(value))
            }
            Some(Token::Ident(kw)) if kw == "if" => {
                self.pos += 1;
                self.if_tail()
            }
            _ => {
                let value = self.expr()?;
                self.terminator()?;
                Ok(Stmt::Expr(value))
            }
        }
    }

    fn if_tail(&mut self) -> Result<Stmt, String> {
        let cond = self.expr()?;
        self.expect(Token::LBrace, "'{'")?;
        let then_branch = self.block_until(Some(Token::RBrace))?;
        let else_branch = match self.peek() {
            Some(Token::Ident(kw)) if kw == "else" => {
                self.pos += 1;
                match self.peek() {
                    Some(Token::Ident(kw)) if kw == "if" => {
                        self.pos += 1;
                        vec![self.if_tail()?]
                    }
                    _ => {
                        self.expect(Token::LBrace, "'{'")?;
                        self.block_until(Some(Token::RBrace))?
                    }
                }
            }
            _ => Vec::new(),
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    /// `;`, optional before `}` and at end of input.
    fn terminator(&mut self) -> Result<(), String> {
        match self.peek() {
            Some(Token::Semi) => {
                self.pos += 1;
                Ok(())
            }
            None | Some(Token::RBrace) => Ok(()),
            Some(t) => Err(format!("expected ';', found {:?}", t)),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Gt) => BinOp::Gt,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.primary()?;
        while let Some(Token::Star) = self.peek() {
            self.pos += 1;
            let rhs = self.primary()?;
            lhs = Expr::Binary {
                op: BinOp::Mul,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    let args = self.args()?;
                    Ok(Expr::Call { callee: name, args })
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Some(Token::Ref(mut reference)) => {
                reference.args = self.args()?;
                Ok(Expr::Ref(reference))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(t) => Err(format!("unexpected token {:?}", t)),
            None => Err("unexpected end of body".to_string()),
        }
    }

    fn args(&mut self) -> Result<Vec<Expr>, String> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => return Err(format!("expected ',' or ')', found {:?}", other)),
            }
        }
    }
}
