use std::ops::Range;

/// Resolved layout entry for one named entity in a flat coefficient buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutEntry {
    pub name: String,
    pub coeff_range: Range<usize>,
}

/// Disjoint, contiguous ranges of a flat coefficient buffer, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoefficientLayout {
    pub entries: Vec<LayoutEntry>,
    pub total_coeffs: usize,
}

impl CoefficientLayout {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn range(&self, name: &str) -> Option<Range<usize>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.coeff_range.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutBuildError {
    pub message: String,
}

impl LayoutBuildError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LayoutBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LayoutBuildError {}

/// Incremental builder for coefficient layouts.
#[derive(Debug, Clone)]
pub struct CoefficientLayoutBuilder {
    next_coeff: usize,
    entries: Vec<LayoutEntry>,
}

impl CoefficientLayoutBuilder {
    pub fn new() -> Self {
        Self {
            next_coeff: 0,
            entries: Vec::new(),
        }
    }

    pub fn push_entity(
        &mut self,
        name: impl Into<String>,
        width: usize,
    ) -> Result<usize, LayoutBuildError> {
        let name = name.into();
        if width == 0 {
            return Err(LayoutBuildError::new(format!(
                "entity '{name}' must own at least one coefficient"
            )));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(LayoutBuildError::new(format!(
                "entity name '{name}' is already in the layout"
            )));
        }

        let coeff_range = self.next_coeff..self.next_coeff + width;
        self.next_coeff += width;
        self.entries.push(LayoutEntry { name, coeff_range });
        Ok(self.entries.len() - 1)
    }

    pub fn build(self) -> CoefficientLayout {
        CoefficientLayout {
            entries: self.entries,
            total_coeffs: self.next_coeff,
        }
    }
}

impl Default for CoefficientLayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}
