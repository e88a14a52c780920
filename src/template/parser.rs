//! Recursive-descent parser for the message template grammar:
//!
//! ```ascii
//! template := [version] packet*
//! packet   := '{' name priority id trusted encoded [deprecated] block* '}'
//! block    := '{' name repetition [multiplicity] variable* '}'
//! variable := '{' name type [length] '}'
//! ```
//!
//! Keyword matching is case-sensitive. Unrecognized priority, repetition and
//!  type keywords map to their `Error` sentinels and parsing continues - the
//!  entry is flagged, not the file. Structural mismatches (unbalanced
//!  braces, missing tokens, trailing input) are hard errors.

use std::iter::Peekable;

use anyhow::{bail, Context};

use crate::message_id::Priority;
use crate::template::lexer::{Lexer, Token};
use crate::template::{BlockInfo, PacketInfo, Repetition, VariableInfo, VariableKind};

pub fn parse(input: &str) -> anyhow::Result<Vec<PacketInfo>> {
    let mut parser = Parser {
        tokens: Lexer::new(input).peekable(),
    };
    parser.parse_template()
}

struct Parser<'a> {
    tokens: Peekable<Lexer<'a>>,
}

impl<'a> Parser<'a> {
    fn parse_template(&mut self) -> anyhow::Result<Vec<PacketInfo>> {
        self.skip_version_header();

        let mut packets = Vec::new();
        while let Some(&token) = self.tokens.peek() {
            match token {
                Token::Open => packets.push(self.parse_packet()?),
                other => bail!("expected a packet, found {:?}", other),
            }
        }
        Ok(packets)
    }

    /// `version 2.0` style leader: everything up to the first brace
    fn skip_version_header(&mut self) {
        if self.tokens.peek() == Some(&Token::Word("version")) {
            while matches!(self.tokens.peek(), Some(Token::Word(_))) {
                self.tokens.next();
            }
        }
    }

    fn parse_packet(&mut self) -> anyhow::Result<PacketInfo> {
        self.expect_open()?;

        let name = self.expect_word("packet name")?.to_owned();
        let priority = match self.expect_word("packet priority")? {
            "Low" => Priority::Low,
            "Medium" => Priority::Medium,
            "High" => Priority::High,
            "Fixed" => Priority::Fixed,
            _ => Priority::Error,
        };
        let raw_id = self.parse_number("packet id")?;
        let id = priority.combine(raw_id);
        let trusted = self.expect_word("trust marker")? == "Trusted";
        let encoded = self.expect_word("encoding marker")? == "Encoded";

        // the deprecation marker is optional; anything that is not a brace
        //  must be it
        let deprecated = match self.tokens.peek() {
            Some(Token::Word(_)) => self.expect_word("deprecation marker")? == "Deprecated",
            _ => false,
        };

        let mut blocks = Vec::new();
        while self.tokens.peek() == Some(&Token::Open) {
            blocks.push(self.parse_block()?);
        }
        self.expect_close()?;

        Ok(PacketInfo {
            name,
            id,
            priority,
            trusted,
            encoded,
            deprecated,
            blocks,
        })
    }

    fn parse_block(&mut self) -> anyhow::Result<BlockInfo> {
        self.expect_open()?;

        let name = self.expect_word("block name")?.to_owned();
        let (repetition, mut multiplicity) = match self.expect_word("block repetition")? {
            "Single" => (Repetition::Single, 1),
            "Multiple" => (Repetition::Multiple, 0),
            "Variable" => (Repetition::Variable, 0),
            _ => (Repetition::Error, 0),
        };

        // the multiplicity is only written for Multiple blocks
        if matches!(self.tokens.peek(), Some(Token::Word(_))) {
            multiplicity = self.parse_number("block multiplicity")?;
        }

        let mut variables = Vec::new();
        while self.tokens.peek() == Some(&Token::Open) {
            variables.push(self.parse_variable()?);
        }
        self.expect_close()?;

        Ok(BlockInfo {
            name,
            repetition,
            multiplicity,
            variables,
        })
    }

    fn parse_variable(&mut self) -> anyhow::Result<VariableInfo> {
        self.expect_open()?;

        let name = self.expect_word("variable name")?.to_owned();
        let (mut kind, mut size) = match self.expect_word("variable type")? {
            "BOOL" => (VariableKind::Bool, 1),
            "S8" => (VariableKind::S8, 1),
            "S16" => (VariableKind::S16, 2),
            "S32" => (VariableKind::S32, 4),
            "S64" => (VariableKind::S64, 8),
            "U8" => (VariableKind::U8, 1),
            "U16" => (VariableKind::U16, 2),
            "U32" => (VariableKind::U32, 4),
            "U64" => (VariableKind::U64, 8),
            "F32" => (VariableKind::F32, 4),
            "F64" => (VariableKind::F64, 8),
            "LLUUID" => (VariableKind::Uuid, 16),
            "LLVector3" => (VariableKind::Vector3, 12),
            "LLVector3d" => (VariableKind::Vector3d, 24),
            "LLVector4" => (VariableKind::Vector4, 16),
            "LLQuaternion" => (VariableKind::Quaternion, 12),
            "IPADDR" => (VariableKind::IpAddr, 4),
            "IPPORT" => (VariableKind::IpPort, 2),
            "Fixed" => (VariableKind::Fixed, 0),
            "Variable" => (VariableKind::Variable1, 0),
            _ => (VariableKind::Error, 0),
        };

        // a trailing number resolves Fixed payload sizes and Variable
        //  prefix widths
        if matches!(self.tokens.peek(), Some(Token::Word(_))) {
            size = self.parse_number::<usize>("variable length")?;
            if kind == VariableKind::Variable1 && size == 2 {
                kind = VariableKind::Variable2;
            }
        }

        self.expect_close()?;

        Ok(VariableInfo { name, kind, size })
    }

    fn parse_number<T: TryFrom<u64>>(&mut self, what: &str) -> anyhow::Result<T> {
        let word = self.expect_word(what)?;
        let value = match word.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => word.parse(),
        }.with_context(|| format!("{} is not a number: {:?}", what, word))?;

        T::try_from(value).ok().with_context(|| format!("{} out of range: {}", what, value))
    }

    fn expect_word(&mut self, what: &str) -> anyhow::Result<&'a str> {
        match self.tokens.next() {
            Some(Token::Word(word)) => Ok(word),
            other => bail!("expected {}, found {:?}", what, other),
        }
    }

    fn expect_open(&mut self) -> anyhow::Result<()> {
        match self.tokens.next() {
            Some(Token::Open) => Ok(()),
            other => bail!("expected '{{', found {:?}", other),
        }
    }

    fn expect_close(&mut self) -> anyhow::Result<()> {
        match self.tokens.next() {
            Some(Token::Close) => Ok(()),
            other => bail!("expected '}}', found {:?}", other),
        }
    }
}
