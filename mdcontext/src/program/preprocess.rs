// SPDX-License-Identifier: AGPL-3.0-only

//! Text preprocessor for kernel sources.
//!
//! WGSL has no macro layer, but kernel sources are written against one:
//! precision aliases, vendor switches and periodic-box helpers all arrive
//! as `#define`s. This module implements the subset the kernels use:
//!
//! - `#define NAME body` and `#define NAME(a, b) body`, `#undef NAME`
//! - `#ifdef`, `#ifndef`, `#if`, `#elif`, `#else`, `#endif`, where `#if`
//!   understands `defined(X)`, `!`, `&&`, `||`, comparisons, integer
//!   literals and macro names
//! - `#error message`; `#pragma` lines are dropped
//! - backslash line continuation
//!
//! Substitution works on whole identifiers, rescans the result and never
//! re-expands a macro inside its own expansion. Directive lines become
//! blank lines so diagnostics keep their line numbers.

use std::collections::BTreeMap;
use std::fmt;

const MAX_EXPANSION_DEPTH: usize = 64;

/// A defined macro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    /// Parameter names for function-like macros.
    pub params: Option<Vec<String>>,
    pub body: String,
}

/// Failure while preprocessing, with the 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for PreprocessError {}

struct Frame {
    opened_at: usize,
    parent_active: bool,
    active: bool,
    taken: bool,
    seen_else: bool,
}

/// Macro table plus the directive interpreter.
#[derive(Debug, Default, Clone)]
pub struct Preprocessor {
    macros: BTreeMap<String, Macro>,
}

impl Preprocessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a macro from a key (`NAME` or `NAME(a, b)`) and a body.
    ///
    /// # Errors
    ///
    /// A key that does not start with an identifier.
    pub fn define(&mut self, key: &str, body: &str) -> Result<(), PreprocessError> {
        self.define_directive(&format!("{key} {body}"), 0)
    }

    pub fn undefine(&mut self, name: &str) {
        self.macros.remove(name);
    }

    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    #[must_use]
    pub const fn macros(&self) -> &BTreeMap<String, Macro> {
        &self.macros
    }

    /// Run directives and substitution over `source`. Definitions made by
    /// the source remain in the table afterwards.
    ///
    /// # Errors
    ///
    /// Unbalanced conditionals, malformed directives, `#error`, or a macro
    /// invoked with the wrong number of arguments.
    pub fn process(&mut self, source: &str) -> Result<String, PreprocessError> {
        let mut out = String::with_capacity(source.len());
        let mut stack: Vec<Frame> = Vec::new();
        let mut lines = source.lines().enumerate().peekable();

        while let Some((idx, first)) = lines.next() {
            let line_no = idx + 1;
            let mut logical = first.to_string();
            let mut extra = 0usize;
            while logical.ends_with('\\') {
                logical.pop();
                match lines.next() {
                    Some((_, next)) => {
                        logical.push(' ');
                        logical.push_str(next);
                        extra += 1;
                    }
                    None => break,
                }
            }

            let active = stack.last().map_or(true, |f| f.active);
            let trimmed = logical.trim_start();
            if let Some(directive) = trimmed.strip_prefix('#') {
                self.directive(directive.trim(), line_no, active, &mut stack)?;
            } else if active {
                let expanded = self
                    .expand(&logical, &mut Vec::new(), 0)
                    .map_err(|message| PreprocessError {
                        line: line_no,
                        message,
                    })?;
                out.push_str(&expanded);
            }
            out.push('\n');
            for _ in 0..extra {
                out.push('\n');
            }
        }

        if let Some(open) = stack.last() {
            return Err(PreprocessError {
                line: open.opened_at,
                message: "unterminated conditional directive".into(),
            });
        }
        Ok(out)
    }

    fn directive(
        &mut self,
        text: &str,
        line: usize,
        active: bool,
        stack: &mut Vec<Frame>,
    ) -> Result<(), PreprocessError> {
        let name_len = text
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        let (name, rest) = text.split_at(name_len);
        let rest = rest.trim();
        let err = |message: String| PreprocessError { line, message };

        match name {
            "define" if active => self.define_directive(rest, line)?,
            "undef" if active => self.undefine(rest),
            "ifdef" | "ifndef" => {
                let mut cond = self.is_defined(rest);
                if name == "ifndef" {
                    cond = !cond;
                }
                let cond = active && cond;
                stack.push(Frame {
                    opened_at: line,
                    parent_active: active,
                    active: cond,
                    taken: cond,
                    seen_else: false,
                });
            }
            "if" => {
                let cond = active && self.evaluate(rest).map_err(err)? != 0;
                stack.push(Frame {
                    opened_at: line,
                    parent_active: active,
                    active: cond,
                    taken: cond,
                    seen_else: false,
                });
            }
            "elif" => {
                let Some(frame) = stack.last_mut() else {
                    return Err(err("#elif without #if".into()));
                };
                if frame.seen_else {
                    return Err(err("#elif after #else".into()));
                }
                if frame.taken || !frame.parent_active {
                    frame.active = false;
                } else {
                    let cond = self.evaluate(rest).map_err(err)? != 0;
                    frame.active = cond;
                    frame.taken = cond;
                }
            }
            "else" => {
                let Some(frame) = stack.last_mut() else {
                    return Err(err("#else without #if".into()));
                };
                if frame.seen_else {
                    return Err(err("duplicate #else".into()));
                }
                frame.seen_else = true;
                frame.active = frame.parent_active && !frame.taken;
                frame.taken = true;
            }
            "endif" => {
                if stack.pop().is_none() {
                    return Err(err("#endif without #if".into()));
                }
            }
            "error" if active => return Err(err(format!("#error {rest}"))),
            "define" | "undef" | "error" | "pragma" => {}
            other if active => return Err(err(format!("unknown directive #{other}"))),
            _ => {}
        }
        Ok(())
    }

    fn define_directive(&mut self, text: &str, line: usize) -> Result<(), PreprocessError> {
        let text = text.trim_start();
        let name_len = text
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if name_len == 0 || text.as_bytes()[0].is_ascii_digit() {
            return Err(PreprocessError {
                line,
                message: format!("#define needs a macro name, got '{text}'"),
            });
        }
        let name = text[..name_len].to_string();
        let rest = &text[name_len..];

        let (params, body) = if let Some(after_paren) = rest.strip_prefix('(') {
            let Some(close) = after_paren.find(')') else {
                return Err(PreprocessError {
                    line,
                    message: format!("unterminated parameter list for macro {name}"),
                });
            };
            let params: Vec<String> = after_paren[..close]
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            (Some(params), after_paren[close + 1..].trim())
        } else {
            (None, rest.trim())
        };
        self.macros.insert(
            name,
            Macro {
                params,
                body: body.to_string(),
            },
        );
        Ok(())
    }

    /// Substitute macros in one line of text.
    ///
    /// # Errors
    ///
    /// Wrong argument count or runaway expansion.
    pub fn expand_text(&self, text: &str) -> Result<String, String> {
        self.expand(text, &mut Vec::new(), 0)
    }

    fn expand(&self, text: &str, disabled: &mut Vec<String>, depth: usize) -> Result<String, String> {
        if depth > MAX_EXPANSION_DEPTH {
            return Err("macro expansion too deep".into());
        }
        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut plain_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let b = bytes[i];
            if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
                break;
            }
            if b.is_ascii_digit() {
                i += scan_number(&bytes[i..]);
                continue;
            }
            if !is_ident_start(b) {
                i += 1;
                continue;
            }
            let start = i;
            i += scan_ident(&bytes[i..]);
            let name = &text[start..i];
            let Some(mac) = self.macros.get(name) else {
                continue;
            };
            if disabled.iter().any(|d| d == name) {
                continue;
            }

            let replacement = match &mac.params {
                None => {
                    disabled.push(name.to_string());
                    let r = self.expand(&mac.body, disabled, depth + 1);
                    disabled.pop();
                    r?
                }
                Some(params) => {
                    let mut j = i;
                    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if bytes.get(j) != Some(&b'(') {
                        continue;
                    }
                    let Some((raw_args, end)) = split_args(text, j) else {
                        continue;
                    };
                    let raw_args = if params.is_empty() && raw_args.len() == 1 && raw_args[0].is_empty() {
                        Vec::new()
                    } else {
                        raw_args
                    };
                    if raw_args.len() != params.len() {
                        return Err(format!(
                            "macro {name} expects {} argument(s), got {}",
                            params.len(),
                            raw_args.len()
                        ));
                    }
                    let mut args = Vec::with_capacity(raw_args.len());
                    for a in &raw_args {
                        args.push(self.expand(a, disabled, depth + 1)?);
                    }
                    let substituted = substitute_params(&mac.body, params, &args);
                    disabled.push(name.to_string());
                    let r = self.expand(&substituted, disabled, depth + 1);
                    disabled.pop();
                    i = end;
                    r?
                }
            };
            out.push_str(&text[plain_start..start]);
            out.push_str(&replacement);
            plain_start = i;
        }
        out.push_str(&text[plain_start..]);
        Ok(out)
    }

    /// Evaluate an `#if` / `#elif` expression.
    fn evaluate(&self, expr: &str) -> Result<i64, String> {
        let tokens = tokenize_expr(expr)?;
        let mut parser = ExprParser {
            pp: self,
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };
        let value = parser.or()?;
        if parser.pos != tokens.len() {
            return Err(format!("unexpected tokens in #if expression '{expr}'"));
        }
        Ok(value)
    }
}

const fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn scan_ident(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count()
}

fn scan_number(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_' || **b == b'.')
        .count()
}

/// Split `text[open..]`, which starts at `(`, into top-level arguments.
/// Returns the arguments and the index just past the closing paren.
fn split_args(text: &str, open: usize) -> Option<(Vec<String>, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut args = Vec::new();
    let mut arg_start = open + 1;
    for (k, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    args.push(text[arg_start..k].trim().to_string());
                    return Some((args, k + 1));
                }
            }
            b',' if depth == 1 => {
                args.push(text[arg_start..k].trim().to_string());
                arg_start = k + 1;
            }
            _ => {}
        }
    }
    None
}

fn substitute_params(body: &str, params: &[String], args: &[String]) -> String {
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(body.len());
    let mut plain_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            i += scan_number(&bytes[i..]);
        } else if is_ident_start(bytes[i]) {
            let start = i;
            i += scan_ident(&bytes[i..]);
            if let Some(k) = params.iter().position(|p| p == &body[start..i]) {
                out.push_str(&body[plain_start..start]);
                out.push_str(&args[k]);
                plain_start = i;
            }
        } else {
            i += 1;
        }
    }
    out.push_str(&body[plain_start..]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Num(i64),
    Ident(String),
    Op(&'static str),
}

fn tokenize_expr(expr: &str) -> Result<Vec<Tok>, String> {
    const OPS: [&str; 14] = [
        "&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "(", ")", "-", "+", "*",
    ];
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    'outer: while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b.is_ascii_digit() {
            let len = scan_number(&bytes[i..]);
            tokens.push(Tok::Num(parse_int(&expr[i..i + len])?));
            i += len;
            continue;
        }
        if is_ident_start(b) {
            let len = scan_ident(&bytes[i..]);
            tokens.push(Tok::Ident(expr[i..i + len].to_string()));
            i += len;
            continue;
        }
        for op in OPS {
            if expr[i..].starts_with(op) {
                tokens.push(Tok::Op(op));
                i += op.len();
                continue 'outer;
            }
        }
        return Err(format!("unexpected character '{}' in #if expression", b as char));
    }
    Ok(tokens)
}

fn parse_int(raw: &str) -> Result<i64, String> {
    let digits = raw.trim_end_matches(['u', 'U', 'l', 'L']);
    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    };
    parsed.map_err(|_| format!("invalid integer '{raw}' in #if expression"))
}

struct ExprParser<'a> {
    pp: &'a Preprocessor,
    tokens: &'a [Tok],
    pos: usize,
    depth: usize,
}

impl ExprParser<'_> {
    fn peek_op(&self, op: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Tok::Op(o)) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.peek_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<i64, String> {
        let mut v = self.and()?;
        while self.eat_op("||") {
            let rhs = self.and()?;
            v = i64::from(v != 0 || rhs != 0);
        }
        Ok(v)
    }

    fn and(&mut self) -> Result<i64, String> {
        let mut v = self.equality()?;
        while self.eat_op("&&") {
            let rhs = self.equality()?;
            v = i64::from(v != 0 && rhs != 0);
        }
        Ok(v)
    }

    fn equality(&mut self) -> Result<i64, String> {
        let mut v = self.relational()?;
        loop {
            if self.eat_op("==") {
                v = i64::from(v == self.relational()?);
            } else if self.eat_op("!=") {
                v = i64::from(v != self.relational()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn relational(&mut self) -> Result<i64, String> {
        let mut v = self.additive()?;
        loop {
            if self.eat_op("<=") {
                v = i64::from(v <= self.additive()?);
            } else if self.eat_op(">=") {
                v = i64::from(v >= self.additive()?);
            } else if self.eat_op("<") {
                v = i64::from(v < self.additive()?);
            } else if self.eat_op(">") {
                v = i64::from(v > self.additive()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn additive(&mut self) -> Result<i64, String> {
        let mut v = self.multiplicative()?;
        loop {
            if self.eat_op("+") {
                v = v.wrapping_add(self.multiplicative()?);
            } else if self.eat_op("-") {
                v = v.wrapping_sub(self.multiplicative()?);
            } else {
                return Ok(v);
            }
        }
    }

    fn multiplicative(&mut self) -> Result<i64, String> {
        let mut v = self.unary()?;
        while self.eat_op("*") {
            v = v.wrapping_mul(self.unary()?);
        }
        Ok(v)
    }

    fn unary(&mut self) -> Result<i64, String> {
        if self.eat_op("!") {
            return Ok(i64::from(self.unary()? == 0));
        }
        if self.eat_op("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, String> {
        let Some(tok) = self.tokens.get(self.pos).cloned() else {
            return Err("incomplete #if expression".into());
        };
        self.pos += 1;
        match tok {
            Tok::Num(n) => Ok(n),
            Tok::Op("(") => {
                let v = self.or()?;
                if !self.eat_op(")") {
                    return Err("missing ')' in #if expression".into());
                }
                Ok(v)
            }
            Tok::Ident(name) if name == "defined" => {
                let paren = self.eat_op("(");
                let Some(Tok::Ident(target)) = self.tokens.get(self.pos).cloned() else {
                    return Err("defined() needs a macro name".into());
                };
                self.pos += 1;
                if paren && !self.eat_op(")") {
                    return Err("missing ')' after defined(".into());
                }
                Ok(i64::from(self.pp.is_defined(&target)))
            }
            Tok::Ident(name) => self.macro_value(&name),
            Tok::Op(op) => Err(format!("unexpected '{op}' in #if expression")),
        }
    }

    /// An identifier in `#if` evaluates to its object-like body, or 0.
    fn macro_value(&mut self, name: &str) -> Result<i64, String> {
        let Some(mac) = self.pp.get(name) else {
            return Ok(0);
        };
        if mac.params.is_some() || mac.body.trim().is_empty() {
            return Ok(0);
        }
        if self.depth > MAX_EXPANSION_DEPTH {
            return Err("macro expansion too deep".into());
        }
        let tokens = tokenize_expr(&mac.body)?;
        let mut nested = ExprParser {
            pp: self.pp,
            tokens: &tokens,
            pos: 0,
            depth: self.depth + 1,
        };
        nested.or()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn run(src: &str) -> String {
        Preprocessor::new().process(src).unwrap()
    }

    #[test]
    fn object_macro_substitutes_whole_identifiers() {
        let out = run("#define N 128\nlet a = N; let b = NN; let c = N_1;\n");
        assert!(out.contains("let a = 128;"));
        assert!(out.contains("let b = NN;"));
        assert!(out.contains("let c = N_1;"));
    }

    #[test]
    fn function_macro_substitutes_arguments() {
        let mut pp = Preprocessor::new();
        pp.define("SQUARE(x)", "((x)*(x))").unwrap();
        let out = pp.process("let y = SQUARE(a + f(b, c));").unwrap();
        assert_eq!(out.trim(), "let y = ((a + f(b, c))*(a + f(b, c)));");
    }

    #[test]
    fn rescans_and_guards_recursion() {
        let out = run("#define A B\n#define B A + 1\nlet v = A;\n");
        assert!(out.contains("let v = A + 1;"));
    }

    #[test]
    fn conditionals_select_branches() {
        let src = "#define USE_X 1\n#ifdef USE_X\nx\n#else\ny\n#endif\n#ifndef USE_X\nz\n#endif\n";
        let out = run(src);
        assert!(out.contains('x'));
        assert!(!out.contains('y'));
        assert!(!out.contains('z'));
    }

    #[test]
    fn if_expressions() {
        let src = "#define V 3\n#if defined(V) && V > 2\nyes\n#elif V == 3\nno\n#else\nnever\n#endif\n";
        let out = run(src);
        assert!(out.contains("yes"));
        assert!(!out.contains("no"));
        assert!(!out.contains("never"));
        assert!(run("#if !defined(MISSING)\nok\n#endif\n").contains("ok"));
    }

    #[test]
    fn nested_inactive_blocks_stay_inactive() {
        let src = "#if 0\n#if 1\ninner\n#endif\n#else\nouter\n#endif\n";
        let out = run(src);
        assert!(!out.contains("inner"));
        assert!(out.contains("outer"));
    }

    #[test]
    fn directive_lines_keep_line_numbers() {
        let out = run("#define A 1\nA\n");
        assert_eq!(out, "\n1\n");
    }

    #[test]
    fn line_continuation_joins_define() {
        let out = run("#define LONG a + \\\n b\nLONG\n");
        let third: Vec<&str> = out.lines().nth(2).unwrap().split_whitespace().collect();
        assert_eq!(third, ["a", "+", "b"]);
    }

    #[test]
    fn unbalanced_conditionals_fail() {
        let err = Preprocessor::new().process("#ifdef X\nfoo\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(Preprocessor::new().process("#endif\n").is_err());
        assert!(Preprocessor::new().process("#else\n").is_err());
    }

    #[test]
    fn error_directive_only_when_active() {
        assert!(Preprocessor::new().process("#error boom\n").is_err());
        assert!(Preprocessor::new()
            .process("#if 0\n#error boom\n#endif\n")
            .is_ok());
    }

    #[test]
    fn wrong_argument_count_fails() {
        let err = Preprocessor::new()
            .process("#define F(a, b) a\nF(1)\n")
            .unwrap_err();
        assert!(err.message.contains("expects 2"));
    }

    #[test]
    fn undef_removes() {
        let out = run("#define A 1\n#undef A\nA\n");
        assert!(out.contains('A'));
    }

    #[test]
    fn line_comments_are_not_expanded() {
        let out = run("#define real f32\nlet x: real = 1.0; // real\n");
        assert!(out.contains("let x: f32 = 1.0; // real"));
    }

    #[test]
    fn numbers_with_letters_are_not_identifiers() {
        let out = run("#define e5 X\nlet a = 1e5;\n");
        assert!(out.contains("1e5"));
    }
}
