//! Kernel function table
//!
//! `callk n` invokes entry `n` of the [`KernelTable`]. The table is built from
//! the game's kernel name list: names with a built-in implementation get it,
//! every other name gets a stub that logs a warning and returns 0. Embedders
//! supply the remaining services (graphics, sound, input) with
//! [`KernelTable::register`].

use super::builtins;
use super::engine::Interpreter;
use super::errors::RuntimeError;
use crate::memory::value::Address;
use log::warn;
use std::fmt;
use std::rc::Rc;

/// A kernel function: receives the interpreter and the call arguments
///
/// The interpreter may be re-entered through
/// [`Interpreter::send_selector`].
pub type KernelFn = Rc<dyn Fn(&mut Interpreter, &[Address]) -> Result<Address, RuntimeError>>;

#[derive(Clone)]
pub struct KernelEntry {
    pub name: String,
    pub func: KernelFn,
    /// False for the warning stubs
    pub implemented: bool,
}

#[derive(Clone, Default)]
pub struct KernelTable {
    entries: Vec<KernelEntry>,
}

fn stub(name: &str) -> KernelFn {
    let name = name.to_string();
    Rc::new(move |_, args| {
        warn!("unimplemented kernel function {} called with {} args", name, args.len());
        Ok(Address::NULL)
    })
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table in the order of `names`
    pub fn from_names(names: &[String]) -> Self {
        let entries = names
            .iter()
            .map(|name| match builtins::lookup(name) {
                Some(func) => KernelEntry {
                    name: name.clone(),
                    func,
                    implemented: true,
                },
                None => KernelEntry {
                    name: name.clone(),
                    func: stub(name),
                    implemented: false,
                },
            })
            .collect();
        KernelTable { entries }
    }

    /// Every built-in, in declaration order
    pub fn with_builtins() -> Self {
        let names: Vec<String> = builtins::BUILTIN_NAMES
            .iter()
            .map(|n| n.to_string())
            .collect();
        Self::from_names(&names)
    }

    /// Install `func` under `name`, replacing an entry of that name
    ///
    /// Returns the kernel number.
    pub fn register<F>(&mut self, name: &str, func: F) -> usize
    where
        F: Fn(&mut Interpreter, &[Address]) -> Result<Address, RuntimeError> + 'static,
    {
        let entry = KernelEntry {
            name: name.to_string(),
            func: Rc::new(func),
            implemented: true,
        };
        match self.index_of(name) {
            Some(index) => {
                self.entries[index] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&KernelEntry> {
        self.entries.get(index)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| (&e.name, e.implemented)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_names_become_stubs() {
        let table = KernelTable::from_names(&["Clone".to_string(), "DrawPic".to_string()]);
        assert_eq!(table.len(), 2);
        assert!(table.get(0).unwrap().implemented);
        assert!(!table.get(1).unwrap().implemented);
    }

    #[test]
    fn test_register_replaces_by_name() {
        let mut table = KernelTable::from_names(&["DrawPic".to_string()]);
        let index = table.register("DrawPic", |_, _| Ok(Address::from_u16(1)));
        assert_eq!(index, 0);
        assert!(table.get(0).unwrap().implemented);
        assert_eq!(table.register("Sound", |_, _| Ok(Address::NULL)), 1);
        assert_eq!(table.index_of("Sound"), Some(1));
    }
}
