//! Positional decoding of delimited input lines into named records, and back.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// ASCII 31, the "unit separator" control character.
pub const UNIT_SEPARATOR: char = '\u{1f}';

/// Enumeration of errors related to mapping input lines to records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("the input line has {found} fields but the mapping has {expected}")]
    MalformedRecord { expected: usize, found: usize },
    #[error("a field mapping must name at least one field")]
    EmptyMapping,
    #[error("the field mapping has an empty name at position {0}")]
    EmptyFieldName(usize),
    #[error("the field mapping names {0:?} more than once")]
    DuplicateFieldName(String),
    #[error("{0:?} is not a valid field delimiter")]
    InvalidDelimiter(String),
}

/// The character separating positional fields in an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiter(char);

impl Delimiter {
    pub fn new(c: char) -> Result<Self, MappingError> {
        if c.is_whitespace() {
            return Err(MappingError::InvalidDelimiter(c.to_string()));
        }
        Ok(Delimiter(c))
    }

    pub fn as_char(&self) -> char {
        self.0
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter(UNIT_SEPARATOR)
    }
}

/// Accepts a single literal character, a decimal character code ("31") or a hex character
/// code ("0x1f"). Single digits are read as character codes. Whitespace never separates fields.
impl FromStr for Delimiter {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MappingError::InvalidDelimiter(s.to_owned());

        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if !c.is_ascii_digit() {
                return Delimiter::new(c);
            }
        }

        let code = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| invalid())?,
            None => s.parse::<u32>().map_err(|_| invalid())?,
        };
        let c = char::from_u32(code).ok_or_else(invalid)?;

        Delimiter::new(c)
    }
}

/// Ordered field names, assigning a name to each positional field of an input line.
///
/// The first name is the natural key of every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping(Vec<String>);

impl FieldMapping {
    pub fn new<I, S>(names: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();

        if names.is_empty() {
            return Err(MappingError::EmptyMapping);
        }
        if let Some(position) = names.iter().position(|name| name.is_empty()) {
            return Err(MappingError::EmptyFieldName(position));
        }
        for (position, name) in names.iter().enumerate() {
            if names[..position].contains(name) {
                return Err(MappingError::DuplicateFieldName(name.clone()));
            }
        }

        Ok(FieldMapping(names))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn natural_key(&self) -> &str {
        &self.0[0]
    }
}

/// Parses a comma-separated list of names, as supplied through configuration.
impl FromStr for FieldMapping {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(MappingError::EmptyMapping);
        }
        FieldMapping::new(s.split(','))
    }
}

/// One input line decoded into named fields. Empty fields are omitted rather than stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Record(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Maps input lines to `Record`s and back, using a fixed `FieldMapping` and `Delimiter`.
#[derive(Debug, Clone)]
pub struct RecordMapper {
    mapping: FieldMapping,
    delimiter: Delimiter,
}

impl RecordMapper {
    pub fn new(mapping: FieldMapping, delimiter: Delimiter) -> Self {
        Self { mapping, delimiter }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    /// Decode a line into a `Record`. The field count is the only thing validated.
    pub fn parse(&self, line: &str) -> Result<Record, MappingError> {
        let found = line.split(self.delimiter.0).count();
        if found != self.mapping.len() {
            return Err(MappingError::MalformedRecord {
                expected: self.mapping.len(),
                found,
            });
        }

        Ok(self
            .mapping
            .names()
            .zip(line.split(self.delimiter.0))
            .filter(|(_, value)| !value.is_empty())
            .collect())
    }

    /// Encode a `Record` back into line form. Absent fields become empty placeholders, so
    /// `serialize(parse(line)) == line` for every well-formed line.
    pub fn serialize(&self, record: &Record) -> String {
        let mut buf = [0u8; 4];
        let separator = self.delimiter.0.encode_utf8(&mut buf);

        self.mapping
            .names()
            .map(|name| record.get(name).unwrap_or(""))
            .collect::<Vec<&str>>()
            .join(separator)
    }

    /// Human readable key/value listing over the whole mapping.
    pub fn render(&self, record: &Record) -> String {
        let fields = self
            .mapping
            .names()
            .map(|name| format!("\"{}\": \"{}\"", name, record.get(name).unwrap_or("")))
            .collect::<Vec<String>>();

        format!("{{ {} }}", fields.join(", "))
    }

    pub fn natural_key<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record.get(self.mapping.natural_key())
    }
}

impl fmt::Display for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}
