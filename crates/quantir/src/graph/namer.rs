//! Explicit naming sessions for graph construction.

use std::sync::Arc;

use super::symbol::SymbolRef;
use super::transform::post_order;

/// Issues fresh `%N` node names, scoped to one construction session.
///
/// A session is created per graph build or per rewrite stage; it is never a
/// process-wide counter. [`NameCtx::above`] seeds a session past every
/// numbered name already present so stage-inserted nodes cannot collide.
#[derive(Debug, Default)]
pub struct NameCtx {
    next: u64,
}

impl NameCtx {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// A session whose fresh names are disjoint from the `%N` names reachable
    /// from `root`.
    pub fn above(root: &SymbolRef) -> Self {
        let mut next = 0;
        for sym in post_order(root) {
            if let Some(rest) = sym.name().strip_prefix('%') {
                if let Ok(n) = rest.parse::<u64>() {
                    next = next.max(n + 1);
                }
            }
        }
        Self { next }
    }

    pub fn fresh(&mut self) -> Arc<str> {
        let name = format!("%{}", self.next);
        self.next += 1;
        Arc::from(name)
    }

    /// Fresh name carrying a human-readable prefix, e.g. `input_0`.
    pub fn fresh_prefixed(&mut self, prefix: &str) -> Arc<str> {
        let name = format!("{}{}", prefix, self.next);
        self.next += 1;
        Arc::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_names_are_sequential() {
        let mut namer = NameCtx::new();
        assert_eq!(&*namer.fresh(), "%0");
        assert_eq!(&*namer.fresh(), "%1");
        assert_eq!(&*namer.fresh_prefixed("input_"), "input_2");
    }
}
