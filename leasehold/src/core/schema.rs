//! Shape of the lease table and verification of an existing one.

use crate::core::store::{ColumnInfo, ColumnType};

pub const ROLE_ID_MAX_LENGTH: usize = 20;
pub const CANDIDATE_ID_MAX_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy)]
enum Expected {
    Text(u32),
    BigInt,
}

const EXPECTED_COLUMNS: [(&str, Expected); 4] = [
    ("role_id", Expected::Text(ROLE_ID_MAX_LENGTH as u32)),
    ("candidate_id", Expected::Text(CANDIDATE_ID_MAX_LENGTH as u32)),
    ("last_seen_timestamp", Expected::BigInt),
    ("lease_counter", Expected::BigInt),
];

/// Checks that the table has every column the election needs, wide enough to
/// hold the values written to it. Extra columns are fine.
///
/// Returns one human readable problem per offending column.
pub fn verify_columns(columns: &[ColumnInfo]) -> Result<(), Vec<String>> {
    let problems: Vec<String> = EXPECTED_COLUMNS
        .iter()
        .filter_map(|(name, expected)| {
            let Some(column) = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
            else {
                return Some(format!("column '{}' is missing", name));
            };
            check_column(name, *expected, &column.column_type)
        })
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn check_column(name: &str, expected: Expected, actual: &ColumnType) -> Option<String> {
    match (expected, actual) {
        (Expected::Text(needed), ColumnType::Text { max_length }) => match max_length {
            Some(length) if *length < needed => Some(format!(
                "column '{}' holds at most {} characters, needs {}",
                name, length, needed
            )),
            _ => None,
        },
        (Expected::BigInt, ColumnType::Integer { bits }) if *bits >= 64 => None,
        (Expected::Text(needed), other) => Some(format!(
            "column '{}' has type {:?}, expected character data of length {}",
            name, other, needed
        )),
        (Expected::BigInt, other) => Some(format!(
            "column '{}' has type {:?}, expected a 64-bit integer",
            name, other
        )),
    }
}
