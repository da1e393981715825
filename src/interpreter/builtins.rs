//! Built-in kernel functions
//!
//! These are the kernel calls that only touch the heap: object cloning,
//! script residency, linked lists, raw memory and string access. Everything
//! else the games call (graphics, sound, input, file I/O) is supplied by the
//! embedder through [`KernelTable::register`](super::kernel::KernelTable::register).
//!
//! # Conventions
//!
//! - Arguments arrive as the stacked values, `args[0]` first
//! - A missing required argument is a [`RuntimeError::KernelArgument`]
//! - Functions with no meaningful result return the current accumulator
//! - List functions treat a null list or node as empty

use super::engine::Interpreter;
use super::errors::RuntimeError;
use super::kernel::KernelFn;
use crate::memory::pool::MAX_POOL_ENTRIES;
use crate::memory::segment::Node;
use crate::memory::value::Address;
use log::{debug, warn};
use std::rc::Rc;

type Builtin = fn(&mut Interpreter, &[Address]) -> Result<Address, RuntimeError>;

/// Names with a built-in implementation, in default kernel order
pub const BUILTIN_NAMES: &[&str] = &[
    "Clone",
    "DisposeClone",
    "IsObject",
    "RespondsTo",
    "ScriptID",
    "DisposeScript",
    "NewList",
    "DisposeList",
    "NewNode",
    "FirstNode",
    "LastNode",
    "EmptyList",
    "NextNode",
    "PrevNode",
    "NodeValue",
    "AddAfter",
    "AddToFront",
    "AddToEnd",
    "FindKey",
    "DeleteKey",
    "Memory",
    "StrLen",
    "StrCmp",
    "StrCpy",
    "StrAt",
];

/// Built-in implementation of kernel function `name`
pub fn lookup(name: &str) -> Option<KernelFn> {
    let func: Builtin = match name {
        "Clone" => Interpreter::kernel_clone,
        "DisposeClone" => Interpreter::kernel_dispose_clone,
        "IsObject" => Interpreter::kernel_is_object,
        "RespondsTo" => Interpreter::kernel_responds_to,
        "ScriptID" => Interpreter::kernel_script_id,
        "DisposeScript" => Interpreter::kernel_dispose_script,
        "NewList" => Interpreter::kernel_new_list,
        "DisposeList" => Interpreter::kernel_dispose_list,
        "NewNode" => Interpreter::kernel_new_node,
        "FirstNode" => Interpreter::kernel_first_node,
        "LastNode" => Interpreter::kernel_last_node,
        "EmptyList" => Interpreter::kernel_empty_list,
        "NextNode" => Interpreter::kernel_next_node,
        "PrevNode" => Interpreter::kernel_prev_node,
        "NodeValue" => Interpreter::kernel_node_value,
        "AddAfter" => Interpreter::kernel_add_after,
        "AddToFront" => Interpreter::kernel_add_to_front,
        "AddToEnd" => Interpreter::kernel_add_to_end,
        "FindKey" => Interpreter::kernel_find_key,
        "DeleteKey" => Interpreter::kernel_delete_key,
        "Memory" => Interpreter::kernel_memory,
        "StrLen" => Interpreter::kernel_str_len,
        "StrCmp" => Interpreter::kernel_str_cmp,
        "StrCpy" => Interpreter::kernel_str_cpy,
        "StrAt" => Interpreter::kernel_str_at,
        _ => return None,
    };
    Some(Rc::new(func))
}

fn arg(name: &str, args: &[Address], index: usize) -> Result<Address, RuntimeError> {
    args.get(index)
        .copied()
        .ok_or_else(|| RuntimeError::KernelArgument {
            name: name.to_string(),
            message: format!("missing argument {} of {}", index + 1, args.len()),
        })
}

fn number_arg(name: &str, args: &[Address], index: usize) -> Result<u16, RuntimeError> {
    let value = arg(name, args, index)?;
    value.as_u16().ok_or_else(|| RuntimeError::KernelArgument {
        name: name.to_string(),
        message: format!("argument {} is {}, expected a number", index + 1, value),
    })
}

impl Interpreter {
    // =====================================================================
    // Objects and scripts
    // =====================================================================

    pub(crate) fn kernel_clone(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let origin = arg("Clone", args, 0)?;
        let clone = self.segments.alloc_clone(origin)?;
        debug!("cloned {} as {}", self.segments.object_name(origin), clone);
        Ok(clone)
    }

    pub(crate) fn kernel_dispose_clone(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let address = arg("DisposeClone", args, 0)?;
        let is_clone = self.segments.object(address).is_some_and(|o| o.is_clone());
        if is_clone {
            self.segments.free_clone(address)?;
        } else {
            warn!("DisposeClone on {}, which is not a clone", address);
        }
        Ok(self.context.acc)
    }

    pub(crate) fn kernel_is_object(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let address = arg("IsObject", args, 0)?;
        Ok(Address::from_bool(self.segments.is_object(address)))
    }

    pub(crate) fn kernel_responds_to(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let object = arg("RespondsTo", args, 0)?;
        let selector = number_arg("RespondsTo", args, 1)?;
        Ok(Address::from_bool(
            self.segments.is_object(object) && self.responds_to(object, selector),
        ))
    }

    /// `ScriptID(script [, export])`: address of an export, loading the script
    pub(crate) fn kernel_script_id(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let number = number_arg("ScriptID", args, 0)?;
        let export = match args.get(1) {
            Some(_) => number_arg("ScriptID", args, 1)? as usize,
            None => 0,
        };
        let id = self.ensure_script(number)?;
        match self.segments.script(id)?.export_address(export) {
            Some(address) => Ok(address),
            None => {
                warn!("ScriptID: script {} has no export {}", number, export);
                Ok(Address::NULL)
            }
        }
    }

    pub(crate) fn kernel_dispose_script(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let number = number_arg("DisposeScript", args, 0)?;
        self.uninstantiate_script(number);
        Ok(self.context.acc)
    }

    // =====================================================================
    // Lists
    // =====================================================================

    pub(crate) fn kernel_new_list(&mut self, _args: &[Address]) -> Result<Address, RuntimeError> {
        self.segments.alloc_list()
    }

    pub(crate) fn kernel_dispose_list(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("DisposeList", args, 0)?;
        if list.is_null() {
            return Ok(self.context.acc);
        }
        for node in self.list_nodes(list)? {
            self.segments.free_node(node)?;
        }
        self.segments.free_list(list)?;
        Ok(self.context.acc)
    }

    /// `NewNode(value [, key])`; the key defaults to the value
    pub(crate) fn kernel_new_node(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let value = arg("NewNode", args, 0)?;
        let key = args.get(1).copied().unwrap_or(value);
        self.segments.alloc_node(value, key)
    }

    pub(crate) fn kernel_first_node(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("FirstNode", args, 0)?;
        if list.is_null() {
            return Ok(Address::NULL);
        }
        Ok(self.segments.list(list)?.first)
    }

    pub(crate) fn kernel_last_node(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("LastNode", args, 0)?;
        if list.is_null() {
            return Ok(Address::NULL);
        }
        Ok(self.segments.list(list)?.last)
    }

    pub(crate) fn kernel_empty_list(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("EmptyList", args, 0)?;
        if list.is_null() {
            return Ok(Address::from_bool(true));
        }
        Ok(Address::from_bool(self.segments.list(list)?.first.is_null()))
    }

    pub(crate) fn kernel_next_node(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let node = arg("NextNode", args, 0)?;
        if node.is_null() {
            return Ok(Address::NULL);
        }
        Ok(self.segments.node(node)?.succ)
    }

    pub(crate) fn kernel_prev_node(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let node = arg("PrevNode", args, 0)?;
        if node.is_null() {
            return Ok(Address::NULL);
        }
        Ok(self.segments.node(node)?.pred)
    }

    pub(crate) fn kernel_node_value(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let node = arg("NodeValue", args, 0)?;
        if node.is_null() {
            return Ok(Address::NULL);
        }
        Ok(self.segments.node(node)?.value)
    }

    /// `AddAfter(list, ref, node [, key])`; a null `ref` adds to the front
    pub(crate) fn kernel_add_after(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("AddAfter", args, 0)?;
        let reference = arg("AddAfter", args, 1)?;
        let node = arg("AddAfter", args, 2)?;
        self.set_node_key(node, args.get(3))?;
        if reference.is_null() {
            self.link_front(list, node)?;
        } else {
            self.link_after(list, reference, node)?;
        }
        Ok(node)
    }

    pub(crate) fn kernel_add_to_front(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("AddToFront", args, 0)?;
        let node = arg("AddToFront", args, 1)?;
        self.set_node_key(node, args.get(2))?;
        self.link_front(list, node)?;
        Ok(node)
    }

    pub(crate) fn kernel_add_to_end(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("AddToEnd", args, 0)?;
        let node = arg("AddToEnd", args, 1)?;
        self.set_node_key(node, args.get(2))?;
        let last = self.segments.list(list)?.last;
        if last.is_null() {
            self.link_front(list, node)?;
        } else {
            self.link_after(list, last, node)?;
        }
        Ok(node)
    }

    pub(crate) fn kernel_find_key(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("FindKey", args, 0)?;
        let key = arg("FindKey", args, 1)?;
        if list.is_null() {
            return Ok(Address::NULL);
        }
        self.find_node(list, key)
            .map(|found| found.unwrap_or(Address::NULL))
    }

    /// Unlink and free the node with `key`; returns whether one was found
    pub(crate) fn kernel_delete_key(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let list = arg("DeleteKey", args, 0)?;
        let key = arg("DeleteKey", args, 1)?;
        if list.is_null() {
            return Ok(Address::from_bool(false));
        }
        let Some(node) = self.find_node(list, key)? else {
            return Ok(Address::from_bool(false));
        };
        self.unlink(list, node)?;
        self.segments.free_node(node)?;
        Ok(Address::from_bool(true))
    }

    fn set_node_key(&mut self, node: Address, key: Option<&Address>) -> Result<(), RuntimeError> {
        if let Some(&key) = key {
            self.segments.node_mut(node)?.key = key;
        }
        Ok(())
    }

    /// Node addresses of `list` in order
    fn list_nodes(&self, list: Address) -> Result<Vec<Address>, RuntimeError> {
        let mut nodes = Vec::new();
        let mut current = self.segments.list(list)?.first;
        while !current.is_null() {
            if nodes.len() >= MAX_POOL_ENTRIES {
                warn!("list {} does not terminate", list);
                break;
            }
            nodes.push(current);
            current = self.segments.node(current)?.succ;
        }
        Ok(nodes)
    }

    fn find_node(&self, list: Address, key: Address) -> Result<Option<Address>, RuntimeError> {
        for node in self.list_nodes(list)? {
            if self.segments.node(node)?.key == key {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    fn link_front(&mut self, list: Address, node: Address) -> Result<(), RuntimeError> {
        let first = self.segments.list(list)?.first;
        {
            let n = self.segments.node_mut(node)?;
            n.pred = Address::NULL;
            n.succ = first;
        }
        if first.is_null() {
            self.segments.list_mut(list)?.last = node;
        } else {
            self.segments.node_mut(first)?.pred = node;
        }
        self.segments.list_mut(list)?.first = node;
        Ok(())
    }

    fn link_after(&mut self, list: Address, reference: Address, node: Address) -> Result<(), RuntimeError> {
        let succ = self.segments.node(reference)?.succ;
        {
            let n = self.segments.node_mut(node)?;
            n.pred = reference;
            n.succ = succ;
        }
        self.segments.node_mut(reference)?.succ = node;
        if succ.is_null() {
            self.segments.list_mut(list)?.last = node;
        } else {
            self.segments.node_mut(succ)?.pred = node;
        }
        Ok(())
    }

    fn unlink(&mut self, list: Address, node: Address) -> Result<(), RuntimeError> {
        let Node { pred, succ, .. } = *self.segments.node(node)?;
        if pred.is_null() {
            self.segments.list_mut(list)?.first = succ;
        } else {
            self.segments.node_mut(pred)?.succ = succ;
        }
        if succ.is_null() {
            self.segments.list_mut(list)?.last = pred;
        } else {
            self.segments.node_mut(succ)?.pred = pred;
        }
        Ok(())
    }

    // =====================================================================
    // Raw memory
    // =====================================================================

    /// `Memory(subfunction, ...)`
    ///
    /// 1, 2: allocate `size` bytes. 3: free. 4: copy `n` bytes from `src` to
    /// `dst`. 5: read a word. 6: write a word.
    pub(crate) fn kernel_memory(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        const NAME: &str = "Memory";
        match number_arg(NAME, args, 0)? {
            1 | 2 => {
                let size = number_arg(NAME, args, 1)? as usize;
                self.segments.alloc_dynmem(size, "Memory")
            }
            3 => {
                let block = arg(NAME, args, 1)?;
                self.segments.free_dynmem(block)?;
                Ok(self.context.acc)
            }
            4 => {
                let dst = arg(NAME, args, 1)?;
                let src = arg(NAME, args, 2)?;
                let len = number_arg(NAME, args, 3)? as usize;
                let bytes = self.segments.read_bytes(src, len)?;
                self.segments.write_bytes(dst, &bytes)?;
                Ok(dst)
            }
            5 => self.segments.read_value(arg(NAME, args, 1)?),
            6 => {
                let address = arg(NAME, args, 1)?;
                let value = arg(NAME, args, 2)?;
                self.segments.write_value(address, value)?;
                Ok(self.context.acc)
            }
            other => Err(RuntimeError::KernelArgument {
                name: NAME.to_string(),
                message: format!("unknown subfunction {}", other),
            }),
        }
    }

    // =====================================================================
    // Strings
    // =====================================================================

    pub(crate) fn kernel_str_len(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let text = self.segments.read_string(arg("StrLen", args, 0)?)?;
        Ok(Address::from_u16(text.len() as u16))
    }

    /// `StrCmp(a, b [, n])`: difference of the first differing bytes, or 0
    pub(crate) fn kernel_str_cmp(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let a = self.segments.read_string(arg("StrCmp", args, 0)?)?;
        let b = self.segments.read_string(arg("StrCmp", args, 1)?)?;
        let limit = match args.get(2) {
            Some(_) => number_arg("StrCmp", args, 2)? as usize,
            None => usize::MAX,
        };
        let at = |s: &[u8], i: usize| s.get(i).copied().unwrap_or(0) as i16;
        let len = a.len().max(b.len()).min(limit);
        let diff = (0..len)
            .map(|i| at(&a, i) - at(&b, i))
            .find(|&d| d != 0)
            .unwrap_or(0);
        Ok(Address::from_i16(diff))
    }

    /// `StrCpy(dst, src [, n])`
    ///
    /// A positive `n` bounds the copy, terminator included; a negative `n`
    /// copies exactly `-n` raw bytes with no terminator.
    pub(crate) fn kernel_str_cpy(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let dst = arg("StrCpy", args, 0)?;
        let src = arg("StrCpy", args, 1)?;
        let limit = match args.get(2) {
            Some(_) => Some(number_arg("StrCpy", args, 2)? as i16),
            None => None,
        };
        match limit {
            Some(n) if n < 0 => {
                let bytes = self.segments.read_bytes(src, n.unsigned_abs() as usize)?;
                self.segments.write_bytes(dst, &bytes)?;
            }
            Some(0) => {}
            Some(n) => {
                let text = self.segments.read_string(src)?;
                let len = text.len().min(n as usize - 1);
                self.segments.write_string(dst, &text[..len])?;
            }
            None => {
                let text = self.segments.read_string(src)?;
                self.segments.write_string(dst, &text)?;
            }
        }
        Ok(dst)
    }

    /// `StrAt(str, index [, byte])`: returns the old byte, storing the new one
    pub(crate) fn kernel_str_at(&mut self, args: &[Address]) -> Result<Address, RuntimeError> {
        let text = arg("StrAt", args, 0)?;
        let index = number_arg("StrAt", args, 1)? as usize;
        let mut bytes = self.segments.read_bytes(text, index + 1)?;
        let old = bytes[index];
        if args.get(2).is_some() {
            bytes[index] = number_arg("StrAt", args, 2)? as u8;
            self.segments.write_bytes(text, &bytes)?;
        }
        Ok(Address::from_u16(old as u16))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::config::VmConfig;
    use crate::script::MemoryResources;

    fn vm() -> Interpreter {
        Interpreter::new(VmConfig::default(), Box::new(MemoryResources::new())).unwrap()
    }

    fn call(vm: &mut Interpreter, name: &str, args: &[Address]) -> Address {
        let func = lookup(name).unwrap();
        func(vm, args).unwrap()
    }

    #[test]
    fn test_every_builtin_name_resolves() {
        for name in BUILTIN_NAMES {
            assert!(lookup(name).is_some(), "{}", name);
        }
        assert!(lookup("DrawPic").is_none());
    }

    #[test]
    fn test_list_order_and_delete() {
        let mut vm = vm();
        let list = call(&mut vm, "NewList", &[]);
        assert_eq!(call(&mut vm, "EmptyList", &[list]), Address::from_u16(1));

        let a = call(&mut vm, "NewNode", &[Address::from_u16(10)]);
        let b = call(&mut vm, "NewNode", &[Address::from_u16(20)]);
        let c = call(&mut vm, "NewNode", &[Address::from_u16(30)]);
        call(&mut vm, "AddToEnd", &[list, b]);
        call(&mut vm, "AddToFront", &[list, a]);
        call(&mut vm, "AddAfter", &[list, b, c]);

        assert_eq!(call(&mut vm, "FirstNode", &[list]), a);
        assert_eq!(call(&mut vm, "LastNode", &[list]), c);
        assert_eq!(call(&mut vm, "NextNode", &[a]), b);
        assert_eq!(call(&mut vm, "PrevNode", &[c]), b);

        let found = call(&mut vm, "FindKey", &[list, Address::from_u16(20)]);
        assert_eq!(found, b);
        assert_eq!(call(&mut vm, "DeleteKey", &[list, Address::from_u16(20)]), Address::from_u16(1));
        assert_eq!(call(&mut vm, "NextNode", &[a]), c);
        assert_eq!(call(&mut vm, "PrevNode", &[c]), a);
        assert!(!vm.segments().is_valid_address(b));
        assert_eq!(call(&mut vm, "DeleteKey", &[list, Address::from_u16(20)]), Address::NULL);

        call(&mut vm, "DisposeList", &[list]);
        assert!(!vm.segments().is_valid_address(list));
        assert!(!vm.segments().is_valid_address(a));
    }

    #[test]
    fn test_memory_and_strings() {
        let mut vm = vm();
        let block = call(&mut vm, "Memory", &[Address::from_u16(1), Address::from_u16(16)]);
        vm.segments_mut().write_string(block, b"door").unwrap();
        assert_eq!(call(&mut vm, "StrLen", &[block]), Address::from_u16(4));

        let copy = call(&mut vm, "Memory", &[Address::from_u16(1), Address::from_u16(16)]);
        call(&mut vm, "StrCpy", &[copy, block]);
        assert_eq!(call(&mut vm, "StrCmp", &[copy, block]), Address::NULL);

        let old = call(&mut vm, "StrAt", &[copy, Address::from_u16(0), Address::from_u16(b'm' as u16)]);
        assert_eq!(old, Address::from_u16(b'd' as u16));
        assert_eq!(vm.segments().read_string(copy).unwrap(), b"moor");
        assert!(call(&mut vm, "StrCmp", &[copy, block]).as_i16().unwrap() > 0);

        call(&mut vm, "StrCpy", &[copy, block, Address::from_u16(3)]);
        assert_eq!(vm.segments().read_string(copy).unwrap(), b"do");

        call(&mut vm, "Memory", &[Address::from_u16(6), block, Address::from_u16(0x4241)]);
        assert_eq!(
            call(&mut vm, "Memory", &[Address::from_u16(5), block]),
            Address::from_u16(0x4241)
        );
        call(&mut vm, "Memory", &[Address::from_u16(3), block]);
        assert!(!vm.segments().is_valid_address(block));
    }

    #[test]
    fn test_missing_argument() {
        let mut vm = vm();
        let func = lookup("Clone").unwrap();
        assert!(matches!(
            func(&mut vm, &[]),
            Err(RuntimeError::KernelArgument { .. })
        ));
    }
}
