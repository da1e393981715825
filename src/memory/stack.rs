//! Operand stack and local-variable tables
//!
//! - [`DataStack`]: the single fixed-capacity value stack shared by every
//!   execution frame. Temporaries, parameters and send arguments all live
//!   here; frames only remember indices into it.
//! - [`LocalsTable`]: a script's local variables, kept in their own segment
//!   and linked back to the owning script by number.
//!
//! Both are addressed in bytes: slot `i` sits at offset `2 * i`, matching the
//! word-sized variables the bytecode was compiled against.

use super::value::Address;

/// Fixed-capacity value stack
#[derive(Debug, Clone)]
pub struct DataStack {
    entries: Vec<Address>,
}

impl DataStack {
    pub fn new(capacity: usize) -> Self {
        DataStack {
            entries: vec![Address::NULL; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> Option<Address> {
        self.entries.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: Address) -> bool {
        match self.entries.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// All slots from `index` to the end
    pub fn slice_from(&self, index: usize) -> Option<&[Address]> {
        self.entries.get(index..)
    }

    /// The live region `[0, top)`
    pub fn live(&self, top: usize) -> &[Address] {
        &self.entries[..top.min(self.entries.len())]
    }
}

/// A script's local variables
#[derive(Debug, Clone)]
pub struct LocalsTable {
    /// Number of the script these locals belong to
    pub script_number: u16,
    pub values: Vec<Address>,
}

impl LocalsTable {
    pub fn new(script_number: u16, values: Vec<Address>) -> Self {
        LocalsTable {
            script_number,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Address> {
        self.values.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: Address) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_bounds() {
        let mut stack = DataStack::new(4);
        assert!(stack.set(3, Address::from_u16(9)));
        assert!(!stack.set(4, Address::from_u16(9)));
        assert_eq!(stack.get(3), Some(Address::from_u16(9)));
        assert_eq!(stack.live(2).len(), 2);
        assert_eq!(stack.live(10).len(), 4);
    }

    #[test]
    fn test_locals_bounds() {
        let mut locals = LocalsTable::new(5, vec![Address::NULL; 2]);
        assert!(locals.set(1, Address::new(7, 2)));
        assert!(!locals.set(2, Address::NULL));
        assert_eq!(locals.get(1), Some(Address::new(7, 2)));
        assert_eq!(locals.get(2), None);
    }
}
