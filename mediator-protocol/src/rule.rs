use crate::Category;

/// A parsed `category(pattern)` or bare `category` rule string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    pub category: Category,
    pub pattern: String,
}

impl ParsedRule {
    pub fn new(category: Category, pattern: impl Into<String>) -> Self {
        ParsedRule {
            category,
            pattern: pattern.into(),
        }
    }
}
