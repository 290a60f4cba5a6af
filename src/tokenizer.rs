//! Two-stage tokenizer.
//!
//! The char stage classifies each source character (quote begin/end, block
//! begin/end, selector modifiers, spaces) using one character of look-behind
//! and look-ahead. The token stage folds those codes into `(text, kind)`
//! tokens. Tokens are produced lazily so the reducer can evaluate completed
//! messages before later characters are even classified.

use crate::{MAX_PARSE_DEPTH, ParseError, ParseErrorKind};
use bitflags::bitflags;
use std::collections::VecDeque;

bitflags! {
    /// Classification bits of a token
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TokenKind: u32 {
        const TERM = 0x01;
        const BLOCK_BEGIN = 0x02;
        const BLOCK_END = 0x04;
        const ALL_BLOCK_END = 0x08;
        const STRING = 0x10;
        const SYNTACTIC = 0x20;
        const FIRSTTERM = 0x40;
        const BLOCK_SELECTOR_MOD = 0x100;
    }
}

/// Ends trailing-argument collection
pub const SIGIL_END_TRAILING_ARGS: &str = ";";
/// Discards the previous result and starts a new receiver
pub const SIGIL_DISCARD_MESSAGE: &str = ".";
/// Opens an implicit block that closes with its enclosing block
pub const SIGIL_RIGHT_FIRST: &str = "$";

const SIGIL_USER_QUOTER: (char, char) = ('-', '-');
const SIGIL_LINE_QUOTER: (char, char) = ('-', '>');
const SELECTOR_PREFIXES: [char; 3] = ['!', '~', '`'];
const QUOTE_ENDPARENS: [(char, char); 7] = [
    ('[', ']'),
    ('{', '}'),
    ('<', '>'),
    ('(', ')'),
    ('（', '）'),
    ('【', '】'),
    ('《', '》'),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub kind: TokenKind,
    /// Number of source characters consumed when this token was produced
    pub read: usize,
}

impl Token {
    pub fn is_string(&self) -> bool {
        self.kind.contains(TokenKind::STRING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CharCode {
    Char(char),
    Space,
    BeginQuote,
    EndQuote,
    BeginBlock,
    EndBlock,
    SelectorMod(&'static str),
}

fn is_void(ch: Option<char>, brk: char) -> bool {
    match ch {
        None => true,
        Some(c) => c.is_whitespace() || c == brk,
    }
}

fn is_trimming_control(ch: char) -> bool {
    ch.is_control() && !ch.is_whitespace()
}

fn quote_partner(ch: char) -> char {
    QUOTE_ENDPARENS
        .iter()
        .find(|(open, _)| *open == ch)
        .map_or(ch, |(_, close)| *close)
}

fn modifier_str(ch: char) -> &'static str {
    match ch {
        '!' => "!",
        '~' => "~",
        _ => "`",
    }
}

/// Quote state: `Some(Some(c))` ends at `c`, `Some(None)` runs to end of input
type QuoteEnd = Option<Option<char>>;

struct CharReader {
    chars: Vec<char>,
    pos: usize,
    consume: usize,
    userquote_wait: bool,
    quote: QuoteEnd,
    pending: VecDeque<CharCode>,
}

impl CharReader {
    fn new(source: &str) -> Self {
        CharReader {
            chars: source.chars().collect(),
            pos: 0,
            consume: 0,
            userquote_wait: false,
            quote: None,
            pending: VecDeque::new(),
        }
    }

    fn char_at(&self, i: isize) -> Option<char> {
        if i < 0 {
            return None;
        }
        self.chars.get(i as usize).copied()
    }

    fn quoting(&self) -> bool {
        self.quote.is_some()
    }

    fn next_code(&mut self) -> Option<CharCode> {
        loop {
            if let Some(code) = self.pending.pop_front() {
                return Some(code);
            }
            let i = self.pos;
            let ch = *self.chars.get(i)?;
            self.pos += 1;

            if self.consume > 0 {
                self.consume -= 1;
                continue;
            }
            if is_trimming_control(ch) {
                continue;
            }

            if self.userquote_wait {
                self.userquote_wait = false;
                let end = if ch.is_whitespace() {
                    ' '
                } else {
                    quote_partner(ch)
                };
                self.quote = Some(Some(end));
                return Some(CharCode::BeginQuote);
            }

            let pch = self.char_at(i as isize - 1);
            let nch = self.char_at(i as isize + 1);
            let p_void = is_void(pch, '(');
            let n_void = is_void(nch, ')');

            if let Some(end) = self.quote {
                if n_void && end == Some(ch) {
                    self.quote = None;
                    return Some(CharCode::EndQuote);
                }
                return Some(CharCode::Char(ch));
            }

            if p_void && (ch == '\'' || ch == '"') {
                self.quote = Some(Some(ch));
                return Some(CharCode::BeginQuote);
            }
            if p_void && ch == '(' {
                return Some(CharCode::BeginBlock);
            }
            if p_void && nch == Some('(') && SELECTOR_PREFIXES.contains(&ch) {
                self.consume = 1;
                self.pending
                    .push_back(CharCode::SelectorMod(modifier_str(ch)));
                return Some(CharCode::BeginBlock);
            }
            if ch == ')' {
                if n_void {
                    return Some(CharCode::EndBlock);
                }
                if nch == Some(':') {
                    let consume_args =
                        self.char_at(i as isize + 2) == Some('>') && is_void(self.char_at(i as isize + 3), ')');
                    self.consume = if consume_args { 2 } else { 1 };
                    self.pending.push_back(CharCode::EndBlock);
                    return Some(CharCode::SelectorMod(if consume_args { ":>" } else { ":" }));
                }
                return Some(CharCode::Char(ch));
            }
            if pch == Some(SIGIL_USER_QUOTER.0) && ch == SIGIL_USER_QUOTER.1 {
                self.userquote_wait = true;
                continue;
            }
            if pch == Some(SIGIL_LINE_QUOTER.0) && ch == SIGIL_LINE_QUOTER.1 {
                self.quote = Some(None);
                return Some(CharCode::BeginQuote);
            }
            if ch.is_whitespace() {
                return Some(CharCode::Space);
            }
            return Some(CharCode::Char(ch));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockKind {
    Explicit,
    Implicit,
}

/// Lazy token stream over a source string
pub struct TokenStream<'s> {
    source: &'s str,
    reader: CharReader,
    buffer: String,
    blocks: Vec<BlockKind>,
    wait_firstterm: bool,
    pending: VecDeque<Token>,
    finished: bool,
}

impl<'s> TokenStream<'s> {
    pub fn new(source: &'s str) -> Self {
        TokenStream {
            source,
            reader: CharReader::new(source),
            buffer: String::new(),
            blocks: Vec::new(),
            wait_firstterm: true,
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Tag the next produced token as the first term of a new message chain
    pub fn set_next_token_firstterm(&mut self) {
        self.wait_firstterm = true;
    }

    fn new_token(&mut self, text: String, mut kind: TokenKind) -> Token {
        if text == SIGIL_END_TRAILING_ARGS || text == SIGIL_DISCARD_MESSAGE {
            kind = TokenKind::SYNTACTIC;
        } else if !text.is_empty() {
            kind |= TokenKind::TERM;
        }
        if self.wait_firstterm {
            kind |= TokenKind::FIRSTTERM;
            if kind.contains(TokenKind::TERM) {
                self.wait_firstterm = false;
            }
        }
        Token {
            text,
            kind,
            read: self.reader.pos,
        }
    }

    fn emit(&mut self, text: String, kind: TokenKind) {
        let token = self.new_token(text, kind);
        self.pending.push_back(token);
    }

    fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn push_block(&mut self, kind: BlockKind) -> Result<(), ParseError> {
        if self.blocks.len() >= MAX_PARSE_DEPTH {
            return Err(ParseError::with_context(
                ParseErrorKind::TooDeeplyNested,
                format!("blocks nested deeper than {MAX_PARSE_DEPTH}"),
                self.source,
                self.reader.pos,
            ));
        }
        self.blocks.push(kind);
        self.emit(String::new(), TokenKind::BLOCK_BEGIN);
        Ok(())
    }

    fn flush_term(&mut self) -> Result<(), ParseError> {
        let text = self.take_buffer();
        if text == SIGIL_RIGHT_FIRST {
            return self.push_block(BlockKind::Implicit);
        }
        if !text.is_empty() {
            self.emit(text, TokenKind::empty());
        }
        Ok(())
    }

    fn end_block(&mut self) -> Result<(), ParseError> {
        if !self.blocks.contains(&BlockKind::Explicit) {
            if !self.buffer.is_empty() {
                self.buffer.push(')');
                return Ok(());
            }
            return Err(ParseError::with_context_and_found(
                ParseErrorKind::InvalidSyntax,
                "unmatched closing bracket",
                self.source,
                self.reader.pos,
                Some(")".into()),
            ));
        }
        let mut text = self.take_buffer();
        while let Some(kind) = self.blocks.pop() {
            self.emit(std::mem::take(&mut text), TokenKind::BLOCK_END);
            if kind == BlockKind::Explicit {
                break;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ParseError> {
        self.finished = true;
        let open = self
            .blocks
            .iter()
            .filter(|k| **k == BlockKind::Explicit)
            .count();
        if open > 0 {
            return Err(ParseError::with_context(
                ParseErrorKind::Incomplete,
                format!("{open} block(s) are not closed"),
                self.source,
                self.reader.pos,
            ));
        }
        let text = self.take_buffer();
        let mut kind = TokenKind::ALL_BLOCK_END;
        if self.reader.quoting() {
            kind |= TokenKind::STRING;
        }
        self.emit(text, kind);
        Ok(())
    }

    fn step(&mut self) -> Result<(), ParseError> {
        let Some(code) = self.reader.next_code() else {
            return self.finish();
        };
        match code {
            CharCode::Char(c) => self.buffer.push(c),
            CharCode::Space => self.flush_term()?,
            CharCode::BeginQuote => self.buffer.clear(),
            CharCode::EndQuote => {
                let text = self.take_buffer();
                if !text.is_empty() {
                    self.emit(text, TokenKind::STRING);
                }
            }
            CharCode::BeginBlock => {
                self.flush_term()?;
                self.push_block(BlockKind::Explicit)?;
            }
            CharCode::EndBlock => self.end_block()?,
            CharCode::SelectorMod(m) => self.pending.push_back(Token {
                text: m.to_string(),
                kind: TokenKind::BLOCK_SELECTOR_MOD,
                read: self.reader.pos,
            }),
        }
        Ok(())
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<Token, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(token));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.step() {
                self.finished = true;
                self.pending.clear();
                return Some(Err(e));
            }
        }
    }
}

/// Tokenize a whole source string
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    TokenStream::new(source).collect()
}
