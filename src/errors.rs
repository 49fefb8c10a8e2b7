//! Aggregation of independent failures
//!
//! Used wherever several cleanups must all be attempted and every failure
//! has to reach the caller, not just the first one.

use std::fmt;

/// Ordered set of causes reported through one error value
///
/// `Error::source` exposes only the first cause; use `errors()` for all of them.
#[derive(Debug)]
pub struct ErrorCollection<E> {
    context: &'static str,
    errors: Vec<E>,
}

impl<E> ErrorCollection<E> {
    pub fn new(context: &'static str) -> Self {
        Self {
            context,
            errors: Vec::new(),
        }
    }

    /// Record the failure of `result`, if any
    pub fn collect<T>(&mut self, result: Result<T, E>) {
        if let Err(e) = result {
            self.errors.push(e);
        }
    }

    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    pub fn context(&self) -> &'static str {
        self.context
    }

    /// All causes, in the order they were recorded
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    /// `Ok(())` when nothing was recorded, otherwise the whole collection
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E: fmt::Display> fmt::Display for ErrorCollection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.context)?;
        for (i, e) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, e)?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for ErrorCollection<E>
where
    E: std::error::Error + 'static,
{
    /// The first recorded cause. `errors()` gives all of them.
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
