//! Quota dimensions.

/// A quantity tracked against its own quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Number of admitted requests
    Request,
    /// Number of admitted request bytes
    Traffic,
}

impl Dimension {
    /// Both dimensions, in the order they are checked.
    #[cfg(test)]
    pub(crate) const ALL: [Dimension; 2] = [Dimension::Request, Dimension::Traffic];

    /// Get the name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Request => "request",
            Dimension::Traffic => "traffic",
        }
    }

    /// Key prefix of the provisioned total for this dimension.
    pub fn total_prefix(&self) -> &'static str {
        match self {
            Dimension::Request => "quota:request:total:",
            Dimension::Traffic => "quota:traffic:total:",
        }
    }

    /// Key prefix of the running counter for this dimension.
    pub fn current_prefix(&self) -> &'static str {
        match self {
            Dimension::Request => "quota:request:current:",
            Dimension::Traffic => "quota:traffic:current:",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
