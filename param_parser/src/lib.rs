// Copyright © 2026 The numa-spread Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Flat `key=value` run parameters.
//!
//! Parameters come either as a comma separated string
//! (`main_vm=vm1,limit_mb=300`) or as a parameter file holding one
//! `key = value` pair per line. Values may be double-quoted to carry commas
//! or leading/trailing blanks.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

mod private_trait {
    // Dispatches to `FromStr::from_str` on externally-defined types and to
    // custom parsing code for the list/toggle types of this module.
    pub trait Parseable
    where
        Self: Sized,
    {
        type Err;
        fn from_str(input: &str) -> Result<Self, <Self as Parseable>::Err>;
    }
}
use private_trait::Parseable;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter: {0}")]
    UnknownParam(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("invalid syntax on line {0}: {1}")]
    InvalidLine(usize, String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* param */, String /* value */),
    #[error("missing required parameter: {0}")]
    Missing(String),
}
pub type ParamResult<T> = std::result::Result<T, ParamError>;

#[derive(Default)]
pub struct ParamParser {
    params: HashMap<String, Option<String>>,
    ignore_unknown: bool,
}

fn split_commas(s: &str) -> ParamResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut opened_brackets = 0u64;
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            // In quotes, only '"' is special
            '"' => in_quotes = !in_quotes,
            _ if in_quotes => {}
            '[' => opened_brackets += 1,
            ']' => {
                if opened_brackets < 1 {
                    return Err(ParamError::InvalidSyntax(s.to_owned()));
                }
                opened_brackets -= 1;
            }
            ',' if opened_brackets == 0 => {
                list.push(current);
                current = String::new();
                continue;
            }
            _ => {}
        };
        current.push(c);
    }
    list.push(current);

    if in_quotes || opened_brackets != 0 {
        return Err(ParamError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

fn dequote(s: &str) -> String {
    let trimmed = s.trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut prev = '\0';
    let mut in_quotes = false;
    for c in trimmed.chars() {
        if c == '"' {
            // A doubled quote outside of a quoted run is a literal quote
            if prev == '"' && !in_quotes {
                out.push('"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(c);
        }
        prev = c;
    }
    out
}

impl ParamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently skip parameters that were never registered with `add()`.
    ///
    /// Parameter files are often shared between several test cases, so a
    /// file may legitimately carry keys meant for someone else.
    pub fn ignore_unknown(&mut self, ignore: bool) -> &mut Self {
        self.ignore_unknown = ignore;
        self
    }

    pub fn add(&mut self, param: &str) -> &mut Self {
        assert!(
            !param.contains(['"', '[', ']', '=', ',', '#']),
            "forbidden character in parameter name"
        );
        self.params.insert(param.to_owned(), None);
        self
    }

    fn set(&mut self, key: &str, value: &str) -> ParamResult<()> {
        match self.params.get_mut(key) {
            Some(slot) => {
                *slot = Some(value.trim().to_owned());
                Ok(())
            }
            None if self.ignore_unknown => Ok(()),
            None => Err(ParamError::UnknownParam(key.to_owned())),
        }
    }

    /// Parse a comma separated `key=value` string. Later values override
    /// earlier ones, including values coming from a previous `parse_file()`.
    pub fn parse(&mut self, input: &str) -> ParamResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for param in split_commas(input)?.iter() {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| ParamError::InvalidSyntax(param.to_owned()))?;
            self.set(key.trim(), value)?;
        }

        Ok(())
    }

    /// Parse the content of a parameter file: one `key = value` per line,
    /// blank lines and `#` comments are skipped.
    pub fn parse_file(&mut self, content: &str) -> ParamResult<()> {
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ParamError::InvalidLine(index + 1, line.to_owned()))?;
            if value.matches('"').count() % 2 != 0 {
                return Err(ParamError::InvalidLine(index + 1, line.to_owned()));
            }
            self.set(key.trim(), value)?;
        }

        Ok(())
    }

    pub fn get(&self, param: &str) -> Option<String> {
        self.params
            .get(param)
            .and_then(|v| v.as_deref())
            .map(dequote)
            .filter(|s| !s.is_empty())
    }

    pub fn require(&self, param: &str) -> ParamResult<String> {
        self.get(param)
            .ok_or_else(|| ParamError::Missing(param.to_owned()))
    }

    pub fn convert<T: Parseable>(&self, param: &str) -> ParamResult<Option<T>> {
        match self.get(param) {
            None => Ok(None),
            Some(v) => Ok(Some(Parseable::from_str(&v).map_err(|_| {
                ParamError::Conversion(param.to_owned(), v.to_owned())
            })?)),
        }
    }
}

pub struct Toggle(pub bool);

#[derive(Error, Debug)]
pub enum ToggleParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Parseable for Toggle {
    type Err = ToggleParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yes" | "on" | "true" => Ok(Toggle(true)),
            "no" | "off" | "false" => Ok(Toggle(false)),
            _ => Err(ToggleParseError::InvalidValue(s.to_owned())),
        }
    }
}

/// A list of integers written as `0,2,4-6` (ranges are inclusive), the
/// way the kernel prints node and cpu lists.
#[derive(Debug, PartialEq, Eq)]
pub struct IntegerList(pub Vec<u64>);

#[derive(Error, Debug)]
pub enum IntegerListParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Parseable for IntegerList {
    type Err = IntegerListParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().trim_matches(|c| c == '[' || c == ']');
        if s.is_empty() {
            return Ok(IntegerList(Vec::new()));
        }

        let mut integer_list = Vec::new();
        for range in s.split(',') {
            let range = range.trim();
            let parse = |item: &str| {
                item.parse::<u64>()
                    .map_err(|_| IntegerListParseError::InvalidValue(item.to_owned()))
            };

            match range.split_once('-') {
                None => integer_list.push(parse(range)?),
                Some((start, end)) => {
                    let (start, end) = (parse(start)?, parse(end)?);
                    if start > end {
                        return Err(IntegerListParseError::InvalidValue(range.to_owned()));
                    }
                    integer_list.extend(start..=end);
                }
            }
        }

        Ok(IntegerList(integer_list))
    }
}

impl<T> Parseable for T
where
    T: FromStr + Sized,
{
    type Err = <T as FromStr>::Err;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse()
    }
}

/// Parse a kernel style list (`0-1,3`) outside of a `ParamParser`.
pub fn parse_integer_list(s: &str) -> Result<Vec<u64>, IntegerListParseError> {
    <IntegerList as Parseable>::from_str(s).map(|l| l.0)
}
