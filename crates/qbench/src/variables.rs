// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Cartesian expansion of benchmark variables
//!
//! Keys are visited in sorted order (the input is a `BTreeMap`) and the
//! last key varies fastest, like an odometer:
//!
//! ```text
//! {a: [1, 2], b: [x, y]}  =>  {a=1,b=x} {a=1,b=y} {a=2,b=x} {a=2,b=y}
//! ```
//!
//! An empty map yields no combinations at all.

use std::collections::BTreeMap;

use crate::error::BenchError;

/// Lazy iterator over every attribute map that picks one value per key.
#[derive(Debug, Clone)]
pub struct VariableExpander<'a> {
    keys: Vec<&'a str>,
    values: Vec<&'a [String]>,
    cursor: Vec<usize>,
    exhausted: bool,
}

impl<'a> VariableExpander<'a> {
    /// Fails with `InvalidArgument` if any key maps to an empty list.
    pub fn new(variables: &'a BTreeMap<String, Vec<String>>) -> Result<Self, BenchError> {
        if let Some((key, _)) = variables.iter().find(|(_, v)| v.is_empty()) {
            return Err(BenchError::InvalidArgument(format!(
                "variable {key} has no values"
            )));
        }
        Ok(Self {
            keys: variables.keys().map(String::as_str).collect(),
            values: variables.values().map(Vec::as_slice).collect(),
            cursor: vec![0; variables.len()],
            exhausted: variables.is_empty(),
        })
    }

    /// Number of combinations the iterator produces in total.
    #[must_use]
    pub fn combination_count(&self) -> usize {
        if self.keys.is_empty() {
            0
        } else {
            self.values.iter().map(|v| v.len()).product()
        }
    }

    fn advance(&mut self) {
        for position in (0..self.cursor.len()).rev() {
            self.cursor[position] += 1;
            if self.cursor[position] < self.values[position].len() {
                return;
            }
            self.cursor[position] = 0;
        }
        self.exhausted = true;
    }
}

impl Iterator for VariableExpander<'_> {
    type Item = BTreeMap<String, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let combination = self
            .keys
            .iter()
            .zip(&self.values)
            .zip(&self.cursor)
            .map(|((key, values), &index)| ((*key).to_string(), values[index].clone()))
            .collect();
        self.advance();
        Some(combination)
    }
}

/// Eager convenience wrapper around [`VariableExpander`].
pub fn expand(
    variables: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<BTreeMap<String, String>>, BenchError> {
    Ok(VariableExpander::new(variables)?.collect())
}
