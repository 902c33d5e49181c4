// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Allow/omit filtering and length capping for projected journal fields.

use std::collections::HashSet;

use tracing::warn;

/// Field length applied when the configuration leaves it unset.
pub const DEFAULT_FIELD_LENGTH: usize = 255;

/// Decides which journal keys become record attributes, and how long their
/// values may be.
///
/// At most one of the allow-set and omit-set should be configured. If both
/// are, omission wins and a warning is logged at construction time.
/// [`FieldPolicy::allows`] is pure so it can run inside the decode hot path.
#[derive(Debug, Clone, Default)]
pub struct FieldPolicy {
    allowed: HashSet<String>,
    omitted: HashSet<String>,
    max_field_length: usize,
}

impl FieldPolicy {
    pub fn new(allowed: &[String], omitted: &[String], max_field_length: usize) -> Self {
        if !allowed.is_empty() && !omitted.is_empty() {
            warn!("only one of fields and omit_fields should be set; omitted fields win");
        }
        FieldPolicy {
            allowed: allowed.iter().cloned().collect(),
            omitted: omitted.iter().cloned().collect(),
            max_field_length,
        }
    }

    pub fn allows(&self, key: &str) -> bool {
        if self.omitted.contains(key) {
            return false;
        }
        if !self.allowed.is_empty() {
            return self.allowed.contains(key);
        }
        true
    }

    /// Left-anchored trim to the configured maximum, never splitting a
    /// multi-byte character.
    pub fn trim(&self, mut value: String) -> String {
        let max = if self.max_field_length == 0 {
            DEFAULT_FIELD_LENGTH
        } else {
            self.max_field_length
        };
        if value.len() <= max {
            return value;
        }
        let mut end = max;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
        value
    }
}
