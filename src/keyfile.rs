//! Reader for line-oriented keyed text files.
//!
//! Many recording systems store sensor positions and acquisition settings as
//! plain text where each value follows a key at the start of a line:
//!
//! ```text
//! NumberPositions=   3
//! UnitPosition       mm
//! Positions
//! -86.08  -19.99  -47.99
//!  85.79  -20.01  -48.03
//!   0.01   86.81  -39.98
//! ```
//!
//! [`read_element`] finds one key and decodes the value next to it, or the
//! block of lines that follows it.

use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;
use std::str::FromStr;

use crate::types::FileError;

/// How the text of an element is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    /// Whitespace or comma separated numbers
    Numeric,
    /// Raw text
    Text,
}

impl FromStr for ValueFormat {
    type Err = FileError;

    /// Parses a printf-style conversion token such as `%f` or `%s`.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "%f" | "%lf" | "%g" | "%e" | "%d" | "%i" | "%u" => Ok(ValueFormat::Numeric),
            "%s" => Ok(ValueFormat::Text),
            other => Err(FileError::Malformed(format!(
                "unknown format token '{}'",
                other
            ))),
        }
    }
}

/// A single decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

/// The decoded contents of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementValue {
    /// One value from the key line
    Single(Value),
    /// Numbers, one row per line
    Matrix(Array2<f64>),
    /// Text lines following the key
    Strings(Vec<String>),
}

/// Finds `element` and decodes its value.
///
/// The first line starting with `element` (ASCII case-insensitive, leading
/// whitespace ignored) is the key line. With a `separator`, the value text
/// is whatever follows the first separator after the key; otherwise it is
/// whatever follows the key.
///
/// With `count` of `None` or 1 the value text of the key line is decoded. A
/// larger `count` reads that many non-blank lines after the key line instead,
/// as matrix rows (`Numeric`) or as strings (`Text`).
///
/// Returns `Ok(None)` when the input ends before the key is found or before
/// `count` lines have been read.
pub fn read_element<R: BufRead>(
    reader: R,
    element: &str,
    format: ValueFormat,
    count: Option<usize>,
    separator: Option<&str>,
) -> Result<Option<ElementValue>, FileError> {
    let mut lines = reader.lines();

    let Some(text) = find_key_line(&mut lines, element, separator)? else {
        return Ok(None);
    };

    let value = match (format, count.unwrap_or(1)) {
        (ValueFormat::Text, 1) => ElementValue::Single(Value::Text(text)),
        (ValueFormat::Numeric, 1) => {
            let numbers = parse_numbers(&text)?;
            if numbers.is_empty() {
                return Err(FileError::Malformed(format!(
                    "no value for element '{}'",
                    element
                )));
            }
            if numbers.len() == 1 {
                ElementValue::Single(Value::Number(numbers[0]))
            } else {
                let row = Array2::from_shape_vec((1, numbers.len()), numbers)
                    .map_err(|e| FileError::Malformed(e.to_string()))?;
                ElementValue::Matrix(row)
            }
        }
        (ValueFormat::Text, n) => match read_block(&mut lines, n)? {
            Some(rows) => ElementValue::Strings(rows),
            None => return Ok(None),
        },
        (ValueFormat::Numeric, n) => match read_block(&mut lines, n)? {
            Some(rows) => ElementValue::Matrix(numeric_rows(&rows)?),
            None => return Ok(None),
        },
    };

    Ok(Some(value))
}

/// Opens `path` and calls [`read_element`] on it.
pub fn read_element_from_path<P: AsRef<Path>>(
    path: P,
    element: &str,
    format: ValueFormat,
    count: Option<usize>,
    separator: Option<&str>,
) -> Result<Option<ElementValue>, FileError> {
    let file = File::open(path)?;
    read_element(BufReader::new(file), element, format, count, separator)
}

fn find_key_line<R: BufRead>(
    lines: &mut Lines<R>,
    element: &str,
    separator: Option<&str>,
) -> Result<Option<String>, FileError> {
    for line in lines {
        let line = line?;
        let trimmed = line.trim_start();
        let is_key = trimmed
            .get(..element.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(element));
        if !is_key {
            continue;
        }

        let rest = &trimmed[element.len()..];
        let value = match separator.and_then(|sep| rest.find(sep).map(|i| i + sep.len())) {
            Some(start) => &rest[start..],
            None => rest,
        };
        return Ok(Some(value.trim().to_string()));
    }
    Ok(None)
}

fn read_block<R: BufRead>(
    lines: &mut Lines<R>,
    count: usize,
) -> Result<Option<Vec<String>>, FileError> {
    let mut rows = Vec::with_capacity(count);
    while rows.len() < count {
        match lines.next() {
            Some(line) => {
                let line = line?;
                let line = line.trim();
                if !line.is_empty() {
                    rows.push(line.to_string());
                }
            }
            None => return Ok(None),
        }
    }
    Ok(Some(rows))
}

fn numeric_rows(rows: &[String]) -> Result<Array2<f64>, FileError> {
    let mut values = Vec::new();
    let mut width = None;

    for (i, row) in rows.iter().enumerate() {
        let numbers = parse_numbers(row)?;
        match width {
            None => width = Some(numbers.len()),
            Some(w) if w != numbers.len() => {
                return Err(FileError::Malformed(format!(
                    "row {} has {} values, expected {}",
                    i,
                    numbers.len(),
                    w
                )))
            }
            Some(_) => {}
        }
        values.extend(numbers);
    }

    Array2::from_shape_vec((rows.len(), width.unwrap_or(0)), values)
        .map_err(|e| FileError::Malformed(e.to_string()))
}

fn parse_numbers(text: &str) -> Result<Vec<f64>, FileError> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| FileError::Malformed(format!("'{}' is not a number", token)))
        })
        .collect()
}
