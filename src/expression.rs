// SPDX-License-Identifier: (Apache-2.0 OR MIT)

//! This module parses tcpdump-style filter expression source text.
//!
//! Lexing is a small `combine` grammar producing words and parentheses; the token walk then
//! assembles primitives one at a time, folding the multi-word directions (`src or dst`,
//! `src and dst`), the negator, `gateway` and `proto`, and groups primitives under AND/OR
//! into a [`Filter`] tree. Defaulting and adjacent-primitive merging are applied per group.

use combine::parser::char::{char, spaces};
use combine::{choice, eof, many, many1, satisfy, EasyParser, Parser};

use crate::error::CompileError;
use crate::filter::{
    combine_adjacent, Composite, Direction, Filter, Kind, Primitive, Protocol, SubProtocol,
};

/// One lexical unit of an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// A whitespace-delimited word.
    Word(String),
    /// `(`
    Open,
    /// `)`
    Close,
}

/// Split the raw expression into words and parentheses.
fn tokenize(input: &str) -> Result<Vec<Token>, CompileError> {
    let word = many1::<String, _, _>(satisfy(|c: char| {
        !c.is_whitespace() && c != '(' && c != ')'
    }))
    .map(Token::Word);
    let token = choice((
        char('(').map(|_| Token::Open),
        char(')').map(|_| Token::Close),
        word,
    ));
    let mut lexer = spaces()
        .with(many::<Vec<Token>, _, _>(token.skip(spaces())))
        .skip(eof());
    match lexer.easy_parse(input) {
        Ok((tokens, _)) => Ok(tokens),
        Err(err) => {
            log::debug!("failed to tokenize {input:?}: {err}");
            Err(CompileError::Parse)
        }
    }
}

/// True for words that cannot continue a primitive once its identifier has been consumed.
fn starts_new_primitive(word: &str) -> bool {
    matches!(word, "not" | "gateway" | "proto")
        || Kind::from_word(word).is_some()
        || Direction::from_word(word).is_some()
        || Protocol::from_word(word).is_some()
        || SubProtocol::from_word(word).is_some()
}

/// A tokenized filter expression, ready to be grouped into a [`Filter`].
#[derive(Debug, Clone)]
pub struct Expression {
    tokens: Vec<Token>,
    pos: usize,
}

impl Expression {
    /// Tokenize an expression. The input must be non-empty; the empty filter is the caller's
    /// accept-all special case.
    pub fn new(input: &str) -> Result<Expression, CompileError> {
        Ok(Expression {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    /// Group the token stream into a filter tree, applying merging and defaulting.
    pub fn compile(mut self) -> Result<Filter, CompileError> {
        self.group(false)
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    /// Parse one parenthesis level: a sequence of primitives and nested groups under a single
    /// operator. As in the reference grammar the operator is flat per level; the last joiner
    /// seen wins.
    fn group(&mut self, nested: bool) -> Result<Filter, CompileError> {
        let mut and = false;
        let mut filters: Vec<Filter> = Vec::new();
        loop {
            match self.peek() {
                None => {
                    if nested {
                        // unclosed parenthesis
                        return Err(CompileError::Parse);
                    }
                    break;
                }
                Some(Token::Close) => {
                    if !nested {
                        return Err(CompileError::Parse);
                    }
                    self.pos += 1;
                    break;
                }
                Some(Token::Open) => {
                    self.pos += 1;
                    filters.push(self.group(true)?);
                }
                Some(Token::Word(word)) if word == "and" || word == "or" => {
                    if filters.is_empty() {
                        return Err(CompileError::Parse);
                    }
                    and = word == "and";
                    self.pos += 1;
                }
                Some(Token::Word(_)) => {
                    filters.push(Filter::Primitive(self.next_primitive()));
                }
            }
        }

        // Merging only makes sense under AND: `udp and port 53` is one predicate,
        // `udp or port 53` is two.
        if and {
            filters = combine_adjacent(filters);
        }

        let mut grouped: Vec<Filter> = Vec::with_capacity(filters.len());
        let mut previous: Option<Primitive> = None;
        for filter in filters {
            match filter {
                Filter::Primitive(mut p) => {
                    p.set_defaults(previous.as_ref());
                    previous = Some(p.clone());
                    if p.gateway {
                        grouped.push(p.expand_gateway());
                    } else {
                        grouped.push(Filter::Primitive(p));
                    }
                }
                composite => grouped.push(composite),
            }
        }

        match grouped.len() {
            0 => Err(CompileError::Parse),
            1 => Ok(grouped.pop().unwrap()),
            _ => Ok(Filter::Composite(Composite {
                and,
                filters: grouped,
            })),
        }
    }

    /// Consume tokens into one primitive. Stops at a joiner, a parenthesis, end of input, or
    /// a qualifier that opens a new primitive after an identifier has been taken.
    fn next_primitive(&mut self) -> Primitive {
        let mut p = Primitive::new();
        loop {
            let word = match self.tokens.get(self.pos) {
                Some(Token::Word(w)) => w.clone(),
                _ => break,
            };
            match word.as_str() {
                "and" | "or" => break,
                "not" => {
                    p.negator = true;
                    self.pos += 1;
                }
                "gateway" => {
                    p.gateway = true;
                    p.protocol = Protocol::Ether;
                    p.kind = Kind::Host;
                    self.pos += 1;
                }
                "proto" => {
                    self.pos += 1;
                    // The name may come escaped, as in `ip proto \icmp`.
                    if let Some(Token::Word(raw)) = self.tokens.get(self.pos) {
                        let name = raw.trim_start_matches('\\').to_string();
                        match SubProtocol::from_word(&name) {
                            Some(sub) => p.sub_protocol = sub,
                            None => {
                                p.sub_protocol = SubProtocol::Unknown;
                                p.id = name;
                            }
                        }
                        self.pos += 1;
                    }
                }
                _ => {
                    if !p.id.is_empty() && starts_new_primitive(&word) {
                        break;
                    }
                    if word == "src" || word == "dst" {
                        if let Some(direction) = self.compound_direction(&word) {
                            p.direction = direction;
                            continue;
                        }
                    }
                    if let Some(kind) = Kind::from_word(&word) {
                        p.kind = kind;
                    } else if let Some(direction) = Direction::from_word(&word) {
                        p.direction = direction;
                    } else if let Some(protocol) = Protocol::from_word(&word) {
                        p.protocol = protocol;
                    } else if let Some(sub) = SubProtocol::from_word(&word) {
                        p.sub_protocol = sub;
                    } else {
                        p.id = word;
                    }
                    self.pos += 1;
                }
            }
        }
        p
    }

    /// Fold `src or dst` / `dst and src` and friends into one direction, consuming all three
    /// tokens. Leaves the stream alone when the next two tokens do not complete the phrase.
    fn compound_direction(&mut self, first: &str) -> Option<Direction> {
        let middle = match self.tokens.get(self.pos + 1) {
            Some(Token::Word(w)) if w == "or" || w == "and" => w.clone(),
            _ => return None,
        };
        match self.tokens.get(self.pos + 2) {
            Some(Token::Word(w)) if (w == "src" || w == "dst") && w != first => {}
            _ => return None,
        }
        self.pos += 3;
        if middle == "or" {
            Some(Direction::SrcOrDst)
        } else {
            Some(Direction::SrcAndDst)
        }
    }
}
