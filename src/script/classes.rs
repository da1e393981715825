//! Species → class table
//!
//! Superclass links and the `class` opcode name classes by species number.
//! The table maps each species to the script that defines it and, once that
//! script is resident, to the class object's address.

use crate::memory::value::{Address, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassEntry {
    /// Script defining the class, when known
    pub script: Option<u16>,
    /// Class object address while its script is resident
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    entries: Vec<ClassEntry>,
}

impl ClassTable {
    pub fn new() -> Self {
        ClassTable {
            entries: Vec::new(),
        }
    }

    /// Seed the species → script mapping supplied by the resources
    pub fn with_scripts(scripts: &[(u16, u16)]) -> Self {
        let mut table = ClassTable::new();
        for &(species, script) in scripts {
            table.entry_mut(species).script = Some(script);
        }
        table
    }

    fn entry_mut(&mut self, species: u16) -> &mut ClassEntry {
        let index = species as usize;
        if index >= self.entries.len() {
            self.entries.resize(index + 1, ClassEntry::default());
        }
        &mut self.entries[index]
    }

    pub fn get(&self, species: u16) -> Option<&ClassEntry> {
        self.entries.get(species as usize)
    }

    pub fn address(&self, species: u16) -> Option<Address> {
        self.get(species).and_then(|e| e.address)
    }

    pub fn script(&self, species: u16) -> Option<u16> {
        self.get(species).and_then(|e| e.script)
    }

    /// Record a class object as it is instantiated
    pub fn register(&mut self, species: u16, script: u16, address: Address) {
        let entry = self.entry_mut(species);
        entry.script = Some(script);
        entry.address = Some(address);
    }

    /// Forget addresses into a segment that is going away
    pub fn forget_segment(&mut self, segment: SegmentId) {
        for entry in &mut self.entries {
            if entry.address.is_some_and(|a| a.segment == segment) {
                entry.address = None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_forget() {
        let mut table = ClassTable::with_scripts(&[(3, 12)]);
        assert_eq!(table.script(3), Some(12));
        assert_eq!(table.address(3), None);

        table.register(3, 12, Address::new(5, 0x20));
        assert_eq!(table.address(3), Some(Address::new(5, 0x20)));

        table.forget_segment(5);
        assert_eq!(table.address(3), None);
        assert_eq!(table.script(3), Some(12));
        assert_eq!(table.address(200), None);
    }
}
