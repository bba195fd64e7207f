//! Comparison key extraction.
//!
//! A record is split on the configured separator, the key field is rotated to the front and the
//! leading fragments are typed according to the field type specifier. The record itself is never
//! modified: the key is only used to decide the position of the record in the output.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sort::SortError;

/// Sort direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

impl Order {
    /// Creates an order from a "reverse" flag.
    pub fn from_reverse(reverse: bool) -> Order {
        if reverse {
            Order::Desc
        } else {
            Order::Asc
        }
    }

    /// Applies the direction to an ascending comparison result.
    pub fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        }
    }
}

impl Default for Order {
    fn default() -> Self {
        Order::Asc
    }
}

/// Field type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Raw text, compared byte-wise. Type symbol `s`.
    String,
    /// Signed decimal integer of any length. Type symbol `n`.
    Integer,
}

impl FieldType {
    fn from_symbol(symbol: char) -> Option<FieldType> {
        match symbol {
            's' => Some(FieldType::String),
            'n' => Some(FieldType::Integer),
            _ => None,
        }
    }
}

/// Integer of arbitrary size: a sign and the decimal digits without leading zeros.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Integer {
    negative: bool,
    digits: String,
}

impl Integer {
    /// Parses an optionally signed decimal integer. Surrounding whitespace and single underscores
    /// between digits are accepted.
    pub fn parse(value: &str) -> Option<Integer> {
        let value = value.trim();
        let (negative, body) = match value.as_bytes().first() {
            Some(b'-') => (true, &value[1..]),
            Some(b'+') => (false, &value[1..]),
            _ => (false, value),
        };
        if body
            .split('_')
            .any(|group| group.is_empty() || !group.bytes().all(|b| b.is_ascii_digit()))
        {
            return None;
        }

        let digits = body.replace('_', "");
        let digits = match digits.trim_start_matches('0') {
            "" => "0",
            significant => significant,
        };
        Some(Integer {
            negative: negative && digits != "0",
            digits: digits.to_string(),
        })
    }
}

impl From<i64> for Integer {
    fn from(value: i64) -> Self {
        Integer {
            negative: value < 0,
            digits: value.unsigned_abs().to_string(),
        }
    }
}

impl PartialOrd for Integer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Integer {
    fn cmp(&self, other: &Self) -> Ordering {
        let magnitude = self
            .digits
            .len()
            .cmp(&other.digits.len())
            .then_with(|| self.digits.cmp(&other.digits));

        match (self.negative, other.negative) {
            (false, false) => magnitude,
            (true, true) => magnitude.reverse(),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
        }
    }
}

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            write!(f, "-")?;
        }
        write!(f, "{}", self.digits)
    }
}

/// A single typed key component.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyField {
    Text(String),
    Integer(Integer),
}

/// Comparison key: the key field followed by the remaining fields in their original order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    fields: Vec<KeyField>,
}

impl Key {
    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }
}

/// A line together with its comparison key.
///
/// Records compare by key only, two records with different text but equal keys are equal.
#[derive(Clone, Debug)]
pub struct Record {
    key: Key,
    line: String,
}

impl Record {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn into_line(self) -> String {
        self.line
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Key extraction parameters.
///
/// The extractor is a plain value: it is cloned into every worker instead of being captured by a
/// closure, and it can be serialized when a worker lives outside the current process.
///
/// # Examples
/// ```
/// use line_ext_sort::key::{Integer, KeyExtractor, KeyField};
///
/// let extractor = KeyExtractor::new(" ", 2, "ns").unwrap();
/// let record = extractor.extract("x 30".to_string()).unwrap();
/// assert_eq!(record.key().fields(), &[KeyField::Integer(Integer::from(30)), KeyField::Text("x".into())]);
/// assert_eq!(record.line(), "x 30");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExtractor {
    separator: String,
    key_field: usize,
    field_types: Vec<FieldType>,
}

impl KeyExtractor {
    /// Creates a key extractor.
    ///
    /// # Arguments
    /// * `separator` - Field separator, must not be empty
    /// * `key_field` - Index of the key field, starting at 1
    /// * `field_types` - Types of the leading fields counted from the key field, `n` for integer and
    ///   `s` for string. Fields without a type symbol are compared as strings.
    pub fn new(separator: &str, key_field: usize, field_types: &str) -> Result<KeyExtractor, SortError> {
        if separator.is_empty() {
            return Err(SortError::InvalidArgument("field separator must not be empty".to_string()));
        }
        if key_field < 1 {
            return Err(SortError::InvalidArgument(format!(
                "key field must start at 1, got {}",
                key_field
            )));
        }

        let field_types = field_types
            .chars()
            .map(|symbol| {
                FieldType::from_symbol(symbol).ok_or_else(|| {
                    SortError::InvalidArgument(format!("unrecognized field type {}, expected n or s", symbol))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(KeyExtractor {
            separator: separator.to_string(),
            key_field,
            field_types,
        })
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn key_field(&self) -> usize {
        self.key_field
    }

    pub fn field_types(&self) -> &[FieldType] {
        &self.field_types
    }

    /// Builds the comparison key of a line and pairs it with the untouched line.
    pub fn extract(&self, line: String) -> Result<Record, SortError> {
        let mut fragments: Vec<&str> = line.split(self.separator.as_str()).filter(|f| !f.is_empty()).collect();
        if self.key_field > fragments.len() {
            return Err(SortError::MalformedRecord {
                field: self.key_field,
                fields: fragments.len(),
                line: line.clone(),
            });
        }
        fragments.rotate_left(self.key_field - 1);

        let mut fields = Vec::with_capacity(fragments.len());
        for (position, fragment) in fragments.into_iter().enumerate() {
            let field = match self.field_types.get(position) {
                Some(FieldType::Integer) => match Integer::parse(fragment) {
                    Some(value) => KeyField::Integer(value),
                    None => {
                        return Err(SortError::InvalidFieldType {
                            position: position + 1,
                            value: fragment.to_string(),
                            line: line.clone(),
                        })
                    }
                },
                _ => KeyField::Text(fragment.to_string()),
            };
            fields.push(field);
        }

        Ok(Record {
            key: Key { fields },
            line,
        })
    }
}

impl fmt::Display for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: String = self
            .field_types
            .iter()
            .map(|t| match t {
                FieldType::String => 's',
                FieldType::Integer => 'n',
            })
            .collect();
        write!(f, "separator: {:?}, key field: {}, types: {:?}", self.separator, self.key_field, types)
    }
}
