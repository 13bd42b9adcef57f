use radix_trie::Trie;

use super::token::{Token, TokenKind};
use super::util::StrCursor;

const KEYWORDS: [(&str, TokenKind); 16] = [
    ("and", TokenKind::And),
    ("class", TokenKind::Class),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("super", TokenKind::Super),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

/// Turns source text into a stream of tokens ending in an `EOF` token.
/// Lexical errors are reported in-band: the scanner emits a token of kind
/// `Error` whose data is a human readable message, and the parser turns it
/// into a diagnostic.
pub struct Scanner<'src> {
    source: &'src str,
    cursor: StrCursor<'src>,
    start: usize,
    keywords: Trie<&'static str, TokenKind>,
    line: u64,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut keywords = Trie::new();
        for (keyword, kind) in KEYWORDS {
            keywords.insert(keyword, kind);
        }

        Self {
            source,
            cursor: StrCursor::new(source),
            start: 0,
            keywords,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace();
        self.start = self.cursor.index;

        let ch = match self.cursor.advance() {
            Some(ch) => ch,
            None => return self.make_token(TokenKind::EOF),
        };

        match ch {
            '(' => self.make_token(TokenKind::ParenLeft),
            ')' => self.make_token(TokenKind::ParenRight),
            '{' => self.make_token(TokenKind::BraceLeft),
            '}' => self.make_token(TokenKind::BraceRight),
            ';' => self.make_token(TokenKind::Semicolon),
            ',' => self.make_token(TokenKind::Comma),
            '.' => self.make_token(TokenKind::Dot),
            '-' => self.make_token(TokenKind::Minus),
            '+' => self.make_token(TokenKind::Plus),
            '/' => self.make_token(TokenKind::Slash),
            '*' => self.make_token(TokenKind::Star),
            '!' => self.make_token_matching('=', TokenKind::BangEqual, TokenKind::Bang),
            '=' => self.make_token_matching('=', TokenKind::EqualEqual, TokenKind::Equal),
            '<' => self.make_token_matching('=', TokenKind::LessEqual, TokenKind::Less),
            '>' => self.make_token_matching('=', TokenKind::GreaterEqual, TokenKind::Greater),
            '"' => self.scan_string(),
            ch if ch.is_ascii_digit() => self.scan_number(),
            ch if ch.is_alphabetic() || ch == '_' => self.scan_identifier(),
            _ => self.make_error_token("Unexpected character."),
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        let data = self.source[self.start..self.cursor.index].to_owned();
        Token::new(kind, data, self.line)
    }

    fn make_error_token(&self, message: &str) -> Token {
        Token::new(TokenKind::Error, message.to_owned(), self.line)
    }

    fn make_token_matching(
        &mut self,
        expected: char,
        if_matches: TokenKind,
        otherwise: TokenKind,
    ) -> Token {
        if self.cursor.peek() == Some(expected) {
            self.cursor.advance();
            self.make_token(if_matches)
        } else {
            self.make_token(otherwise)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.cursor.peek() {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.cursor.advance();
                }
                '/' => {
                    if self.cursor.peek_next() != Some('/') {
                        return;
                    }
                    while let Some(ch) = self.cursor.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.cursor.advance();
                    }
                }
                ch if ch.is_whitespace() => {
                    self.cursor.advance();
                }
                _ => return,
            }
        }
    }

    fn scan_string(&mut self) -> Token {
        while let Some(ch) = self.cursor.peek() {
            if ch == '"' {
                self.cursor.advance();
                return self.make_token(TokenKind::String);
            }
            if ch == '\n' {
                self.line += 1;
            }
            self.cursor.advance();
        }
        self.make_error_token("Unterminated string.")
    }

    fn scan_number(&mut self) -> Token {
        self.cursor.advance_while(|ch| ch.is_ascii_digit());

        // A fractional part needs a digit after the dot.
        if self.cursor.peek() == Some('.')
            && self.cursor.peek_next().map_or(false, |ch| ch.is_ascii_digit())
        {
            self.cursor.advance();
            self.cursor.advance_while(|ch| ch.is_ascii_digit());
        }

        self.make_token(TokenKind::Number)
    }

    fn scan_identifier(&mut self) -> Token {
        self.cursor.advance_while(|ch| ch.is_alphanumeric() || ch == '_');

        let identifier = &self.source[self.start..self.cursor.index];
        match self.keywords.get(identifier) {
            Some(kind) => self.make_token(*kind),
            None => self.make_token(TokenKind::Identifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token();
            let kind = token.kind;
            kinds.push(kind);
            if kind == TokenKind::EOF {
                return kinds;
            }
        }
    }

    #[test]
    fn scans_punctuation_and_operators() {
        assert_eq!(
            kinds("(){};,.-+/*"),
            vec![
                TokenKind::ParenLeft,
                TokenKind::ParenRight,
                TokenKind::BraceLeft,
                TokenKind::BraceRight,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scans_two_character_operators() {
        assert_eq!(
            kinds("! != = == < <= > >="),
            vec![
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        assert_eq!(
            kinds("class classy var _x this"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::This,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scans_number_literals() {
        let mut scanner = Scanner::new("12 3.75 4.");
        assert_eq!(scanner.scan_token().data, "12");
        assert_eq!(scanner.scan_token().data, "3.75");
        // The trailing dot is not part of the number.
        assert_eq!(scanner.scan_token().data, "4");
        assert_eq!(scanner.scan_token().kind, TokenKind::Dot);
    }

    #[test]
    fn scans_string_literals_with_quotes() {
        let mut scanner = Scanner::new(r#""hello world""#);
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.data, "\"hello world\"");
    }

    #[test]
    fn tracks_line_numbers() {
        let mut scanner = Scanner::new("one\ntwo\n\nthree");
        assert_eq!(scanner.scan_token().line, 1);
        assert_eq!(scanner.scan_token().line, 2);
        assert_eq!(scanner.scan_token().line, 4);
    }

    #[test]
    fn strings_can_span_lines() {
        let mut scanner = Scanner::new("\"a\nb\" x");
        assert_eq!(scanner.scan_token().kind, TokenKind::String);
        assert_eq!(scanner.scan_token().line, 2);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("var a; // the rest is ignored\nvar b;"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"oops");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.data, "Unterminated string.");
    }

    #[test]
    fn unexpected_character_is_an_error_token() {
        let mut scanner = Scanner::new("@");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.data, "Unexpected character.");
    }
}
