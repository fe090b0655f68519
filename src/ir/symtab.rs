//! The scoped symbol table used during IR generation.
//!
//! A flat, open-addressed table rather than a stack of hash maps: scope
//! entry/exit is O(1) because it doesn't touch the table at all — it only
//! records an undo log ([`ScopeChange`]) of the slots a nested scope is
//! about to overwrite, and restores them on exit. Grounded in the
//! original's `SymbolTable`/`ScopeChange`, generalized to carry whether a
//! variable is stack-resident (spec.md's variable classification) instead
//! of always being a vreg.

use crate::common::Id;

/// Capacity must be a power of two (the original asserts this on
/// `SYMBOL_TABLE_SIZE`) so probing can mask instead of modulo.
const TABLE_SIZE: usize = 4096;

/// Where a variable's current value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// A register-resident value: the vreg holding it directly.
    Register(usize),
    /// A stack-resident local: the frame slot backing it.
    Stack(usize),
}

#[derive(Clone, Copy, Debug, Default)]
struct Entry {
    name: Option<Id>,
    binding: Option<Binding>,
    occupied: bool,
}

/// One undone table write: "slot `index` used to hold `previous`".
struct ScopeChange {
    index: usize,
    previous: Entry,
}

pub struct SymbolTable {
    entries: Vec<Entry>,
    /// Undo log since the start of the current scope. `enter_scope`
    /// pushes a marker (the log's current length); `exit_scope` pops
    /// back to it, replaying each recorded change in reverse.
    changes: Vec<ScopeChange>,
    scope_marks: Vec<usize>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable {
            entries: vec![Entry::default(); TABLE_SIZE],
            changes: Vec::new(),
            scope_marks: Vec::new(),
        }
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_for(&self, name: Id) -> usize {
        let hash = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            name.hash(&mut hasher);
            hasher.finish() as usize
        };
        hash & (TABLE_SIZE - 1)
    }

    /// Open-addressed linear probe, matching the original's flat array
    /// with a fixed capacity — this is a teaching compiler, not a
    /// production hash table, so it never resizes or rehashes.
    pub fn lookup(&self, name: Id) -> Option<Binding> {
        let start = self.slot_for(name);
        for offset in 0..TABLE_SIZE {
            let idx = (start + offset) & (TABLE_SIZE - 1);
            let entry = &self.entries[idx];
            if !entry.occupied {
                return None;
            }
            if entry.name == Some(name) {
                return entry.binding;
            }
        }
        None
    }

    pub fn add(&mut self, name: Id, binding: Binding) {
        let start = self.slot_for(name);
        for offset in 0..TABLE_SIZE {
            let idx = (start + offset) & (TABLE_SIZE - 1);
            if !self.entries[idx].occupied {
                self.changes.push(ScopeChange {
                    index: idx,
                    previous: self.entries[idx],
                });
                self.entries[idx] = Entry {
                    name: Some(name),
                    binding: Some(binding),
                    occupied: true,
                };
                return;
            }
        }
        unreachable!("symbol table exhausted — the lexer caps identifier count far below this");
    }

    pub fn enter_scope(&mut self) {
        self.scope_marks.push(self.changes.len());
    }

    pub fn exit_scope(&mut self) {
        let mark = self.scope_marks.pop().expect("exit_scope without enter_scope");
        while self.changes.len() > mark {
            let change = self.changes.pop().expect("checked len > mark above");
            self.entries[change.index] = change.previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Id {
        Id::new(s.to_string())
    }

    #[test]
    fn lookup_finds_added_binding() {
        let mut st = SymbolTable::new();
        st.add(id("x"), Binding::Register(3));
        assert_eq!(st.lookup(id("x")), Some(Binding::Register(3)));
    }

    #[test]
    fn exit_scope_restores_shadowed_binding() {
        let mut st = SymbolTable::new();
        st.add(id("x"), Binding::Register(1));
        st.enter_scope();
        st.add(id("x"), Binding::Register(2));
        assert_eq!(st.lookup(id("x")), Some(Binding::Register(2)));
        st.exit_scope();
        assert_eq!(st.lookup(id("x")), Some(Binding::Register(1)));
    }

    #[test]
    fn exit_scope_removes_a_scope_local_binding() {
        let mut st = SymbolTable::new();
        st.enter_scope();
        st.add(id("y"), Binding::Stack(0));
        st.exit_scope();
        assert_eq!(st.lookup(id("y")), None);
    }

    #[test]
    fn unknown_identifier_misses() {
        let st = SymbolTable::new();
        assert_eq!(st.lookup(id("nope")), None);
    }
}
