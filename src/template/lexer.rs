//! Token stream over a message template file: braces are standalone tokens
//!  even when glued to a word, everything else splits on whitespace, and
//!  `//` comments run to the end of the line.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Open,
    Close,
    Word(&'a str),
}

pub struct Lexer<'a> {
    rest: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer { rest: input }
    }

    fn skip_blanks(&mut self) {
        loop {
            self.rest = self.rest.trim_start();
            if let Some(stripped) = self.rest.strip_prefix("//") {
                self.rest = match stripped.find('\n') {
                    Some(eol) => &stripped[eol + 1..],
                    None => "",
                };
            }
            else {
                return;
            }
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        self.skip_blanks();

        let mut chars = self.rest.char_indices();
        match chars.next() {
            None => None,
            Some((_, '{')) => {
                self.rest = &self.rest[1..];
                Some(Token::Open)
            }
            Some((_, '}')) => {
                self.rest = &self.rest[1..];
                Some(Token::Close)
            }
            Some(_) => {
                let end = self.rest
                    .find(|c: char| c.is_whitespace() || c == '{' || c == '}')
                    .unwrap_or(self.rest.len());
                let word = &self.rest[..end];
                self.rest = &self.rest[end..];
                Some(Token::Word(word))
            }
        }
    }
}
