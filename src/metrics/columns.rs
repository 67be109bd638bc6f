//! Column discovery over loosely named headers.
//!
//! Each lookup is an ordered list of rules. Rules are tried in priority order
//! and each rule scans the headers in declaration order, so a higher-priority
//! rule always wins regardless of where its column sits in the table.

use super::{ADJUSTED_COLUMN, SQRT_COLUMN};

#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    Exact(&'static str),
    Contains(&'static str),
    /// Contains `needle` and at least one of `qualifiers`.
    Qualified {
        needle: &'static str,
        qualifiers: &'static [&'static str],
    },
}

impl Pattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Exact(s) => name == *s,
            Pattern::Contains(s) => name.contains(s),
            Pattern::Qualified { needle, qualifiers } => {
                name.contains(needle) && qualifiers.iter().any(|q| name.contains(q))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnRule {
    pub name: &'static str,
    pub pattern: Pattern,
}

pub const AREA_RULES: &[ColumnRule] = &[
    ColumnRule {
        name: "exact-area",
        pattern: Pattern::Exact("area"),
    },
    ColumnRule {
        name: "qualified-area",
        pattern: Pattern::Qualified {
            needle: "area",
            qualifiers: &["pixel", "px"],
        },
    },
    ColumnRule {
        name: "any-area",
        pattern: Pattern::Contains("area"),
    },
];

pub const CIRCULARITY_RULES: &[ColumnRule] = &[
    ColumnRule {
        name: "exact-circularity",
        pattern: Pattern::Exact("circularity"),
    },
    ColumnRule {
        name: "any-circ",
        pattern: Pattern::Contains("circ"),
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumn {
    pub index: usize,
    pub header: String,
    pub rule: &'static str,
}

fn normalize(header: &str) -> String {
    header.trim().to_lowercase()
}

/// Columns written back by the calculator itself are never inputs.
fn is_derived(normalized: &str) -> bool {
    normalized == ADJUSTED_COLUMN.to_lowercase() || normalized == SQRT_COLUMN.to_lowercase()
}

pub fn resolve(headers: &[String], rules: &[ColumnRule]) -> Option<ResolvedColumn> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize(h)).collect();
    rules.iter().find_map(|rule| {
        normalized
            .iter()
            .enumerate()
            .filter(|(_, name)| !is_derived(name))
            .find(|(_, name)| rule.pattern.matches(name))
            .map(|(index, _)| ResolvedColumn {
                index,
                header: headers[index].clone(),
                rule: rule.name,
            })
    })
}
