use crate::ExtractionError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifiers and keywords alike.
    Ident(String),
    Number(f64),
    BigInt(i128),
    Str(String),
    /// A template literal. Substitutions are not evaluated.
    Template { raw: String, substitutions: bool },
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
    pub line: usize,
    /// A line terminator separates this token from the previous one.
    pub newline_before: bool,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(q) if q == p)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(id) if id == name)
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident(id) => format!("'{id}'"),
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::BigInt(n) => format!("bigint {n}"),
            TokenKind::Str(_) => "string".into(),
            TokenKind::Template { .. } => "template".into(),
            TokenKind::Punct(p) => format!("'{p}'"),
            TokenKind::Eof => "end of input".into(),
        }
    }
}

#[rustfmt::skip]
const PUNCTUATORS: &[&str] = &[
    ">>>=",
    "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=",
    "=>", "==", "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", "**", "<<", ">>",
    "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-", "*", "/", "%",
    "&", "|", "^", "!", "~", "?", ":", "=", ".", "@", "#",
];

/// Produces tokens on demand, so text after the point of interest is never
/// looked at.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ExtractionError {
        ExtractionError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    /// Skips whitespace and comments. Returns whether a line break was crossed.
    fn skip_trivia(&mut self) -> Result<bool, ExtractionError> {
        let mut newline = false;
        loop {
            match (self.peek_char(), self.peek_nth(1)) {
                (Some('\n'), _) | (Some('\u{2028}'), _) | (Some('\u{2029}'), _) => {
                    newline = true;
                    self.bump();
                }
                (Some(c), _) if c.is_whitespace() || c == '\u{feff}' => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while !matches!(self.peek_char(), None | Some('\n')) {
                        self.bump();
                    }
                }
                (Some('/'), Some('*')) => {
                    let line = self.line;
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek_char() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(ExtractionError::Syntax {
                                    line,
                                    message: "unterminated comment".into(),
                                })
                            }
                        }
                    }
                    newline |= self.line != line;
                }
                _ => return Ok(newline),
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, ExtractionError> {
        let newline_before = self.skip_trivia()?;
        let offset = self.pos;
        let line = self.line;
        let token = |kind| Token {
            kind,
            offset,
            line,
            newline_before,
        };

        let c = match self.peek_char() {
            Some(c) => c,
            None => return Ok(token(TokenKind::Eof)),
        };

        if is_ident_start(c) {
            while self.peek_char().map_or(false, is_ident_part) {
                self.bump();
            }
            return Ok(token(TokenKind::Ident(self.src[offset..self.pos].to_string())));
        }
        if c.is_ascii_digit() || (c == '.' && self.peek_nth(1).map_or(false, |d| d.is_ascii_digit()))
        {
            return self.number().map(token);
        }
        match c {
            '\'' | '"' => return self.string(c).map(token),
            '`' => return self.template().map(token),
            _ => {}
        }

        let rest = &self.src[self.pos..];
        match PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                self.pos += p.len();
                Ok(token(TokenKind::Punct(*p)))
            }
            None => Err(self.error(format!("unexpected character '{c}'"))),
        }
    }

    fn number(&mut self) -> Result<TokenKind, ExtractionError> {
        let start = self.pos;
        let radix = match (self.peek_char(), self.peek_nth(1)) {
            (Some('0'), Some('x' | 'X')) => 16,
            (Some('0'), Some('o' | 'O')) => 8,
            (Some('0'), Some('b' | 'B')) => 2,
            _ => 10,
        };

        if radix != 10 {
            self.bump();
            self.bump();
            let digits = self.digits(|c| c.is_digit(radix));
            if digits.is_empty() {
                return Err(self.error("missing digits after radix prefix"));
            }
            let value = i128::from_str_radix(&digits, radix)
                .map_err(|_| self.error("integer literal too large"))?;
            if self.peek_char() == Some('n') {
                self.bump();
                return Ok(TokenKind::BigInt(value));
            }
            return self.end_of_number(TokenKind::Number(value as f64));
        }

        let mut text = self.digits(|c| c.is_ascii_digit());
        if self.peek_char() == Some('n') {
            self.bump();
            let value = text
                .parse::<i128>()
                .map_err(|_| self.error("bigint literal too large"))?;
            return Ok(TokenKind::BigInt(value));
        }
        if self.peek_char() == Some('.') {
            self.bump();
            text.push('.');
            text.push_str(&self.digits(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            let sign = self.peek_nth(1);
            let digit_at = if matches!(sign, Some('+' | '-')) { 2 } else { 1 };
            if self.peek_nth(digit_at).map_or(false, |d| d.is_ascii_digit()) {
                self.bump();
                text.push('e');
                if digit_at == 2 {
                    text.extend(self.bump());
                }
                text.push_str(&self.digits(|c| c.is_ascii_digit()));
            }
        }
        let value = text
            .parse::<f64>()
            .map_err(|_| self.error(format!("invalid number '{}'", &self.src[start..self.pos])))?;
        self.end_of_number(TokenKind::Number(value))
    }

    fn end_of_number(&self, kind: TokenKind) -> Result<TokenKind, ExtractionError> {
        match self.peek_char() {
            Some(c) if is_ident_start(c) || c.is_ascii_digit() => {
                Err(self.error("identifier starts immediately after numeric literal"))
            }
            _ => Ok(kind),
        }
    }

    /// Reads digits accepted by `accept`, dropping `_` separators.
    fn digits(&mut self, accept: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            if accept(c) {
                out.push(c);
            } else if c != '_' {
                break;
            }
            self.bump();
        }
        out
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, ExtractionError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(TokenKind::Str(out)),
                Some('\\') => self.escape(&mut out)?,
                Some('\n') | None => return Err(self.error("unterminated string literal")),
                Some(c) => out.push(c),
            }
        }
    }

    fn template(&mut self) -> Result<TokenKind, ExtractionError> {
        self.bump();
        let mut raw = String::new();
        let mut substitutions = false;
        loop {
            match self.bump() {
                Some('`') => return Ok(TokenKind::Template { raw, substitutions }),
                Some('\\') => self.escape(&mut raw)?,
                Some('$') if self.peek_char() == Some('{') => {
                    substitutions = true;
                    self.skip_substitution()?;
                }
                Some(c) => raw.push(c),
                None => return Err(self.error("unterminated template literal")),
            }
        }
    }

    fn skip_substitution(&mut self) -> Result<(), ExtractionError> {
        self.bump();
        let mut depth = 1;
        while depth > 0 {
            match self.bump() {
                Some('{') => depth += 1,
                Some('}') => depth -= 1,
                Some(q @ ('\'' | '"')) => {
                    self.pos -= 1;
                    self.string(q)?;
                }
                Some('`') => {
                    self.pos -= 1;
                    self.template()?;
                }
                Some(_) => {}
                None => return Err(self.error("unterminated template substitution")),
            }
        }
        Ok(())
    }

    fn escape(&mut self, out: &mut String) -> Result<(), ExtractionError> {
        let c = self
            .bump()
            .ok_or_else(|| self.error("unterminated escape sequence"))?;
        match c {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            '\n' => {}
            'x' => {
                let code = self.hex_digits(2)?;
                out.extend(char::from_u32(code));
            }
            'u' => {
                let code = if self.peek_char() == Some('{') {
                    self.bump();
                    let digits = self.digits(|c| c.is_ascii_hexdigit());
                    if self.bump() != Some('}') {
                        return Err(self.error("invalid unicode escape"));
                    }
                    u32::from_str_radix(&digits, 16)
                        .map_err(|_| self.error("invalid unicode escape"))?
                } else {
                    self.hex_digits(4)?
                };
                out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            c => out.push(c),
        }
        Ok(())
    }

    fn hex_digits(&mut self, n: usize) -> Result<u32, ExtractionError> {
        let mut code = 0;
        for _ in 0..n {
            let d = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid hexadecimal escape"))?;
            code = code * 16 + d;
        }
        Ok(code)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Returns whether `name` occurs as a whole word in `text`.
pub fn mentions(text: &str, name: &str) -> bool {
    text.match_indices(name).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + name.len()..].chars().next();
        !before.map_or(false, is_ident_part) && !after.map_or(false, is_ident_part)
    })
}

#[cfg(test)]
fn lex_all(src: &str) -> Vec<TokenKind> {
    let mut lexer = Lexer::new(src);
    let mut out = vec![];
    loop {
        let token = lexer.next_token().unwrap();
        if token.is_eof() {
            return out;
        }
        out.push(token.kind);
    }
}

#[test]
fn lex_literals() {
    use TokenKind::*;

    assert_eq!(
        lex_all("0x1F 1_000 .5 2.5e-3 1E3 10n 0b101 'a\\'b' \"\\u0041\" `t`"),
        vec![
            Number(31.0),
            Number(1000.0),
            Number(0.5),
            Number(0.0025),
            Number(1000.0),
            BigInt(10),
            Number(5.0),
            Str("a'b".into()),
            Str("A".into()),
            Template {
                raw: "t".into(),
                substitutions: false
            },
        ]
    );
}

#[test]
fn lex_punctuation_and_comments() {
    use TokenKind::*;

    let src = "// META: title=x\nconst a = [...b]; /* multi\nline */ x => x ** 2;";
    assert_eq!(
        lex_all(src),
        vec![
            Ident("const".into()),
            Ident("a".into()),
            Punct("="),
            Punct("["),
            Punct("..."),
            Ident("b".into()),
            Punct("]"),
            Punct(";"),
            Ident("x".into()),
            Punct("=>"),
            Ident("x".into()),
            Punct("**"),
            Number(2.0),
            Punct(";"),
        ]
    );

    let mut lexer = Lexer::new("a\n  b /* \n */ c d");
    let flags = std::iter::from_fn(|| {
        let t = lexer.next_token().unwrap();
        (!t.is_eof()).then_some((t.line, t.newline_before))
    })
    .collect::<Vec<_>>();
    assert_eq!(flags, vec![(1, false), (2, true), (3, true), (3, false)]);
}

#[test]
fn lex_templates_with_substitutions() {
    assert_eq!(
        lex_all("`a${ {b: '}'} }c`"),
        vec![TokenKind::Template {
            raw: "ac".into(),
            substitutions: true
        }]
    );
}

#[test]
fn lex_errors() {
    assert!(matches!(
        Lexer::new("\n'abc").next_token(),
        Err(ExtractionError::Syntax { line: 2, .. })
    ));
    assert!(Lexer::new("/* never closed").next_token().is_err());
    assert!(Lexer::new("3in").next_token().is_err());
}

#[test]
fn test_mentions() {
    assert!(mentions("addTests.filter(x)", "addTests"));
    assert!(!mentions("subaddTests + addTests2", "addTests"));
    assert!(mentions("[addTests]", "addTests"));
}
