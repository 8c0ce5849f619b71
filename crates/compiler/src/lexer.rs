//! Lexical analysis for MF source.
//!
//! The scanner produces a flat token stream terminated by exactly one EOF
//! token. Comments are kept as tokens so downstream consumers can decide to
//! skip them; whitespace is discarded. Keywords match case-insensitively.

use crate::diagnostics::{Code, Diagnostics};

/// Token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Ident,
    Int,
    Float,
    Str,
    Op,
    Punct,
    Type,
    Comment,
    Eof,
}

/// A token with its lexeme and 1-based source position.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: u32, column: u32) -> Self {
        Token {
            kind,
            text: text.into(),
            line,
            column,
        }
    }

    pub fn is(&self, kind: TokenKind, text: &str) -> bool {
        self.kind == kind && self.text == text
    }
}

const KEYWORDS: &[&str] = &[
    "func",
    "fn",
    "if",
    "else",
    "while",
    "for",
    "in",
    "return",
    "break",
    "continue",
    "class",
    "extends",
    "implements",
    "interface",
    "public",
    "private",
    "protected",
    "static",
    "final",
    "abstract",
    "async",
    "await",
    "spawn",
    "auto",
    "const",
    "let",
    "var",
    "range",
    "import",
    "ret",
    "new",
    "raise",
    "hybrid",
];

const TYPE_NAMES: &[&str] = &[
    "i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "f32", "f64", "bool", "string", "void",
];

/// Multi-character operators, matched greedily. `<` and `>` stay single
/// tokens so `>>` can close nested generics.
const MULTI_OPS: &[&str] = &[
    "->", "==", "!=", "<=", ">=", "&&", "||", "+=", "-=", "*=", "/=", "%=",
];

const OP_CHARS: &str = "+-*/%=<>!&|^~";
const PUNCT_CHARS: &str = "()[]{},.:;@";

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source: source.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Scan the entire source into a token vector ending with one EOF token.
    ///
    /// Unrecognized characters are reported and skipped; scanning always
    /// reaches the end of the input.
    pub fn tokenize(mut self, diags: &mut Diagnostics) -> Vec<Token> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.bump();
                continue;
            }

            if c == b'/' && matches!(self.peek_at(1), Some(b'/') | Some(b'*')) {
                tokens.push(self.scan_comment(diags));
                continue;
            }

            if c.is_ascii_digit() {
                tokens.push(self.scan_number());
                continue;
            }

            if c == b'"' || c == b'\'' {
                tokens.push(self.scan_string(diags));
                continue;
            }

            if c.is_ascii_alphabetic() || c == b'_' {
                tokens.push(self.scan_word());
                continue;
            }

            if OP_CHARS.contains(c as char) {
                tokens.push(self.scan_operator());
                continue;
            }

            if PUNCT_CHARS.contains(c as char) {
                let (line, column) = (self.line, self.column);
                self.bump();
                tokens.push(Token::new(
                    TokenKind::Punct,
                    (c as char).to_string(),
                    line,
                    column,
                ));
                continue;
            }

            diags.error(
                Code::InvalidCharacter,
                format!("unexpected character `{}`", c as char),
                self.line,
                self.column,
            );
            self.bump();
        }

        tokens.push(Token::new(TokenKind::Eof, "", self.line, self.column));
        tokens
    }

    fn scan_comment(&mut self, diags: &mut Diagnostics) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        if self.peek_at(1) == Some(b'/') {
            while let Some(c) = self.peek() {
                if c == b'\n' {
                    break;
                }
                self.bump();
            }
        } else {
            // Block comments do not nest.
            self.bump();
            self.bump();
            loop {
                match self.peek() {
                    Some(b'*') if self.peek_at(1) == Some(b'/') => {
                        self.bump();
                        self.bump();
                        break;
                    }
                    Some(_) => {
                        self.bump();
                    }
                    None => {
                        diags.error(
                            Code::UnterminatedString,
                            "unterminated block comment",
                            line,
                            column,
                        );
                        break;
                    }
                }
            }
        }
        Token::new(TokenKind::Comment, self.slice(start), line, column)
    }

    fn scan_number(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == b'.' && !is_float && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())
            {
                is_float = true;
                self.bump();
            } else {
                break;
            }
        }
        let kind = if is_float {
            TokenKind::Float
        } else {
            TokenKind::Int
        };
        Token::new(kind, self.slice(start), line, column)
    }

    fn scan_string(&mut self, diags: &mut Diagnostics) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        let quote = self.source[self.pos];
        self.bump();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    // An escape consumes two characters atomically.
                    self.bump();
                    if self.peek().is_some() {
                        self.bump();
                    }
                }
                Some(c) if c == quote => {
                    self.bump();
                    break;
                }
                Some(_) => {
                    self.bump();
                }
                None => {
                    diags.error(
                        Code::UnterminatedString,
                        "unterminated string literal",
                        line,
                        column,
                    );
                    break;
                }
            }
        }
        // The lexeme keeps the surrounding quotes.
        Token::new(TokenKind::Str, self.slice(start), line, column)
    }

    fn scan_word(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let text = self.slice(start);
        let lower = text.to_ascii_lowercase();
        let kind = if KEYWORDS.contains(&lower.as_str()) {
            TokenKind::Keyword
        } else if TYPE_NAMES.contains(&lower.as_str()) {
            TokenKind::Type
        } else {
            TokenKind::Ident
        };
        Token::new(kind, text, line, column)
    }

    fn scan_operator(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        for op in MULTI_OPS {
            if self.source[self.pos..].starts_with(op.as_bytes()) {
                for _ in 0..op.len() {
                    self.bump();
                }
                return Token::new(TokenKind::Op, *op, line, column);
            }
        }
        let c = self.source[self.pos] as char;
        self.bump();
        Token::new(TokenKind::Op, c.to_string(), line, column)
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.source.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) {
        if let Some(&c) = self.source.get(self.pos) {
            self.pos += 1;
            if c == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn slice(&self, start: usize) -> String {
        String::from_utf8_lossy(&self.source[start..self.pos]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> (Vec<Token>, Diagnostics) {
        let mut diags = Diagnostics::new("test.mf");
        let tokens = Lexer::new(source).tokenize(&mut diags);
        (tokens, diags)
    }

    #[test]
    fn test_single_eof_on_empty_input() {
        let (tokens, diags) = lex("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let (tokens, _) = lex("FN Return CLASS");
        assert_eq!(tokens[0].kind, TokenKind::Keyword);
        assert_eq!(tokens[0].text, "FN");
        assert_eq!(tokens[1].kind, TokenKind::Keyword);
        assert_eq!(tokens[2].kind, TokenKind::Keyword);
    }

    #[test]
    fn test_type_names() {
        let (tokens, _) = lex("i32 f64 bool string void");
        for t in &tokens[..5] {
            assert_eq!(t.kind, TokenKind::Type, "token {:?}", t.text);
        }
    }

    #[test]
    fn test_int_and_float_literals() {
        let (tokens, _) = lex("42 3.25 7");
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[0].text, "42");
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[1].text, "3.25");
        assert_eq!(tokens[2].kind, TokenKind::Int);
    }

    #[test]
    fn test_member_access_on_int_stays_punct() {
        // `1.x` is an int, a dot and an identifier, not a float.
        let (tokens, _) = lex("1.x");
        assert_eq!(tokens[0].kind, TokenKind::Int);
        assert_eq!(tokens[1].kind, TokenKind::Punct);
        assert_eq!(tokens[2].kind, TokenKind::Ident);
    }

    #[test]
    fn test_string_lexeme_keeps_quotes() {
        let (tokens, _) = lex(r#""hello\n" 'x'"#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, r#""hello\n""#);
        assert_eq!(tokens[1].text, "'x'");
    }

    #[test]
    fn test_unterminated_string_is_reported() {
        let (tokens, diags) = lex("\"oops");
        assert!(diags.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_arrow_and_greedy_operators() {
        let (tokens, _) = lex("-> == <= += a=b");
        assert_eq!(tokens[0].text, "->");
        assert_eq!(tokens[1].text, "==");
        assert_eq!(tokens[2].text, "<=");
        assert_eq!(tokens[3].text, "+=");
        assert_eq!(tokens[5].text, "=");
    }

    #[test]
    fn test_angle_brackets_stay_single() {
        let (tokens, _) = lex("Map<string, Vec<i32>>");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Map", "<", "string", ",", "Vec", "<", "i32", ">", ">", ""]
        );
    }

    #[test]
    fn test_comments_become_tokens() {
        let (tokens, _) = lex("a // trailing\n/* block\ncomment */ b");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Comment,
                TokenKind::Comment,
                TokenKind::Ident,
                TokenKind::Eof
            ]
        );
        assert_eq!(tokens[1].text, "// trailing");
    }

    #[test]
    fn test_invalid_character_recovers() {
        let (tokens, diags) = lex("a ` b");
        assert_eq!(diags.error_count(), 1);
        let idents: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(idents, vec!["a", "b"]);
    }

    #[test]
    fn test_positions_are_one_based() {
        let (tokens, _) = lex("a\n  b");
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn test_lexemes_reconstruct_source() {
        // Concatenating lexemes with the interleaving whitespace reproduces
        // the input byte for byte.
        let source = "fn main() -> i32 { return 2 + 3; }";
        let (tokens, _) = lex(source);
        let mut rebuilt = String::new();
        let mut cursor = 0usize;
        for t in &tokens {
            if t.kind == TokenKind::Eof {
                break;
            }
            let at = source[cursor..].find(&t.text).map(|i| i + cursor).unwrap();
            rebuilt.push_str(&source[cursor..at]);
            rebuilt.push_str(&t.text);
            cursor = at + t.text.len();
        }
        rebuilt.push_str(&source[cursor..]);
        assert_eq!(rebuilt, source);
    }
}
