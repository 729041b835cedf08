use std::collections::BTreeSet;

use thiserror::Error;

/// Errors from parsing a cpuset list expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreRangeError {
    #[error("empty element in core range {0:?}")]
    EmptyElement(String),

    #[error("invalid core id {0:?}")]
    InvalidId(String),

    #[error("range {start}-{end} is reversed")]
    Reversed { start: u32, end: u32 },
}

/// Parse a cpuset list expression such as `"0-2,4,6-7"`.
///
/// Elements are comma separated and either a single id or an inclusive
/// `start-end` range. Blank input yields an empty set.
pub fn parse_core_range(text: &str) -> Result<BTreeSet<u32>, CoreRangeError> {
    let text = text.trim();
    let mut cores = BTreeSet::new();

    if text.is_empty() {
        return Ok(cores);
    }

    for element in text.split(',') {
        let element = element.trim();
        if element.is_empty() {
            return Err(CoreRangeError::EmptyElement(text.to_string()));
        }

        match element.split_once('-') {
            Some((start, end)) => {
                let start = parse_id(start)?;
                let end = parse_id(end)?;
                if start > end {
                    return Err(CoreRangeError::Reversed { start, end });
                }
                cores.extend(start..=end);
            }
            None => {
                cores.insert(parse_id(element)?);
            }
        }
    }

    Ok(cores)
}

/// Render a set of ids in the compact form the kernel prints, e.g. `"0-2,4"`.
pub fn to_core_range(cores: &BTreeSet<u32>) -> String {
    let mut parts = Vec::new();
    let mut iter = cores.iter().copied();

    let Some(first) = iter.next() else {
        return String::new();
    };

    let (mut start, mut end) = (first, first);
    for id in iter {
        if id == end + 1 {
            end = id;
            continue;
        }
        parts.push(render(start, end));
        start = id;
        end = id;
    }
    parts.push(render(start, end));

    parts.join(",")
}

fn render(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

fn parse_id(s: &str) -> Result<u32, CoreRangeError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreRangeError::InvalidId(s.to_string()));
    }
    s.parse().map_err(|_| CoreRangeError::InvalidId(s.to_string()))
}
