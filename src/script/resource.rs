//! Resource collaborator
//!
//! The VM never parses resource archives itself. It asks a [`ResourceSource`]
//! for the bytes of a script (and, for 1.1+ games, its heap) and for the
//! vocabulary tables that name selectors, kernel functions and class scripts.
//!
//! Two implementations ship with the crate: [`MemoryResources`] for tests and
//! embedders that already hold the bytes, and [`DirectoryResources`] for a
//! directory of extracted patch files.

use rustc_hash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub trait ResourceSource {
    /// Script resource bytes
    fn script(&self, number: u16) -> Option<Vec<u8>>;

    /// Heap resource bytes (1.1+ only)
    fn heap(&self, number: u16) -> Option<Vec<u8>>;

    /// `(species, script)` pairs telling which script defines each class
    fn class_scripts(&self) -> Vec<(u16, u16)> {
        Vec::new()
    }

    /// Selector names indexed by selector id
    fn selector_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Kernel function names indexed by `callk` number
    fn kernel_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Resources held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    scripts: FxHashMap<u16, Vec<u8>>,
    heaps: FxHashMap<u16, Vec<u8>>,
    pub class_scripts: Vec<(u16, u16)>,
    pub selector_names: Vec<String>,
    pub kernel_names: Vec<String>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_script(&mut self, number: u16, bytes: Vec<u8>) -> &mut Self {
        self.scripts.insert(number, bytes);
        self
    }

    pub fn add_heap(&mut self, number: u16, bytes: Vec<u8>) -> &mut Self {
        self.heaps.insert(number, bytes);
        self
    }

    /// Add both parts of a script, as produced by the builder
    pub fn add(&mut self, number: u16, parts: (Vec<u8>, Option<Vec<u8>>)) -> &mut Self {
        self.scripts.insert(number, parts.0);
        if let Some(heap) = parts.1 {
            self.heaps.insert(number, heap);
        }
        self
    }

    pub fn add_class_script(&mut self, species: u16, script: u16) -> &mut Self {
        self.class_scripts.push((species, script));
        self
    }
}

impl ResourceSource for MemoryResources {
    fn script(&self, number: u16) -> Option<Vec<u8>> {
        self.scripts.get(&number).cloned()
    }

    fn heap(&self, number: u16) -> Option<Vec<u8>> {
        self.heaps.get(&number).cloned()
    }

    fn class_scripts(&self) -> Vec<(u16, u16)> {
        self.class_scripts.clone()
    }

    fn selector_names(&self) -> Vec<String> {
        self.selector_names.clone()
    }

    fn kernel_names(&self) -> Vec<String> {
        self.kernel_names.clone()
    }
}

/// Extracted resource files in one directory
///
/// Scripts are `script.NNN` (pre-1.1) or `NNN.scr` with `NNN.hep` (1.1+).
/// Optional text tables: `selectors.txt` and `kernel.txt` hold one name per
/// line (line number is the id), `classes.txt` holds `species script` pairs.
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl AsRef<Path>) -> Self {
        DirectoryResources {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.root.join(name)).ok()
    }

    fn read_lines(&self, name: &str) -> Vec<String> {
        match fs::read_to_string(self.root.join(name)) {
            Ok(text) => text.lines().map(|l| l.trim().to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl ResourceSource for DirectoryResources {
    fn script(&self, number: u16) -> Option<Vec<u8>> {
        self.read(&format!("script.{:03}", number))
            .or_else(|| self.read(&format!("{}.scr", number)))
    }

    fn heap(&self, number: u16) -> Option<Vec<u8>> {
        self.read(&format!("{}.hep", number))
    }

    fn class_scripts(&self) -> Vec<(u16, u16)> {
        self.read_lines("classes.txt")
            .iter()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let species = parts.next()?.parse().ok()?;
                let script = parts.next()?.parse().ok()?;
                Some((species, script))
            })
            .collect()
    }

    fn selector_names(&self) -> Vec<String> {
        self.read_lines("selectors.txt")
    }

    fn kernel_names(&self) -> Vec<String> {
        self.read_lines("kernel.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_resources_lookup() {
        let mut res = MemoryResources::new();
        res.add_script(3, vec![1, 2]).add_heap(3, vec![9]);
        res.add_class_script(7, 3);

        assert_eq!(res.script(3), Some(vec![1, 2]));
        assert_eq!(res.heap(3), Some(vec![9]));
        assert_eq!(res.script(4), None);
        assert_eq!(res.class_scripts(), vec![(7, 3)]);
    }

    #[test]
    fn test_directory_resources_missing_dir() {
        let res = DirectoryResources::new("/nonexistent/scivm-resources");
        assert_eq!(res.script(0), None);
        assert!(res.selector_names().is_empty());
        assert!(res.class_scripts().is_empty());
    }
}
