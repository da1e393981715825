// Integration tests for the segmented heap, script loading and the collector

use scivm::gc;
use scivm::interpreter::constants::OBJECT_MAGIC;
use scivm::interpreter::context::ExecutionContext;
use scivm::interpreter::{lookup, Interpreter, RuntimeError, SelectorLookup, VmConfig};
use scivm::memory::{Address, SegmentKind, SegmentManager};
use scivm::script::{ClassTable, MemoryResources, ObjectDef, ScriptBuilder, ScriptLayout, ScriptVersion};

const NAME: u16 = 20;
const SIGNAL: u16 = 21;
const WALK: u16 = 22;
const COLOR: u16 = 23;

const VERSIONS: [ScriptVersion; 2] = [ScriptVersion::Sci0, ScriptVersion::Sci11];

fn first_property(version: ScriptVersion) -> usize {
    ScriptLayout::for_version(version).min_var_count
}

/// Script 5: one class with a property, one instance, two locals
fn feature_script(version: ScriptVersion) -> MemoryResources {
    let mut builder = ScriptBuilder::new(version, 5);
    let walk = builder.asm().here();
    builder.asm().ldi(1).ret();
    builder
        .object(
            ObjectDef::class("Feature", 1)
                .property(SIGNAL, 0)
                .method(WALK, walk),
        )
        .object(ObjectDef::instance("door", 1).property(SIGNAL, 3))
        .export_object("door")
        .export_object("Feature")
        .local(11)
        .local(12);

    let mut resources = MemoryResources::new();
    resources.add(5, builder.build().unwrap());
    resources.add_class_script(1, 5);
    resources
}

fn manager(version: ScriptVersion) -> SegmentManager {
    let mut segments = SegmentManager::new(ScriptLayout::for_version(version));
    segments.allocate_stack(64).unwrap();
    segments
}

#[test]
fn test_address_survives_stack_round_trip() {
    let mut segments = SegmentManager::new(ScriptLayout::SCI0);
    let stack = segments.allocate_stack(16).unwrap();
    let pointer = Address::new(7, 9);

    segments.write_value(Address::new(stack, 6), pointer).unwrap();
    assert_eq!(segments.read_value(Address::new(stack, 6)).unwrap(), pointer);
    assert_eq!(segments.stack(stack).unwrap().get(3), Some(pointer));

    // Odd offsets do not name a slot
    assert!(segments.read_value(Address::new(stack, 5)).is_err());
}

#[test]
fn test_address_survives_locals_round_trip() {
    for version in VERSIONS {
        let resources = feature_script(version);
        let mut segments = manager(version);
        let id = segments.instantiate_script(5, &resources).unwrap();
        let locals = segments.script(id).unwrap().locals_segment();
        assert_ne!(locals, 0);
        assert_eq!(segments.kind(locals), Some(SegmentKind::Locals));
        assert_eq!(
            segments.read_value(Address::new(locals, 2)).unwrap(),
            Address::from_u16(12)
        );

        let pointer = Address::new(id, 4);
        segments.write_value(Address::new(locals, 2), pointer).unwrap();
        assert_eq!(segments.read_value(Address::new(locals, 2)).unwrap(), pointer);
        assert_eq!(segments.locals(locals).unwrap().get(1), Some(pointer));
        assert_eq!(segments.locals(locals).unwrap().get(0), Some(Address::from_u16(11)));
    }
}

#[test]
fn test_clone_property_round_trip() {
    for version in VERSIONS {
        let resources = feature_script(version);
        let mut segments = manager(version);
        let id = segments.instantiate_script(5, &resources).unwrap();
        let door = segments.script(id).unwrap().export_address(0).unwrap();
        let index = first_property(version);

        let clone = segments.alloc_clone(door).unwrap();
        assert_eq!(segments.kind(clone.segment), Some(SegmentKind::Clones));
        assert!(segments.object(clone).unwrap().is_clone());
        assert_eq!(segments.read_property(clone, index).unwrap(), Address::from_u16(3));

        let pointer = Address::new(id, 2);
        segments.write_property(clone, index, pointer).unwrap();
        assert_eq!(segments.read_property(clone, index).unwrap(), pointer);
        assert_eq!(segments.read_property(door, index).unwrap(), Address::from_u16(3));

        let count = segments.object(clone).unwrap().var_count();
        assert!(matches!(
            segments.read_property(clone, count),
            Err(RuntimeError::PropertyOutOfRange { .. })
        ));
    }
}

#[test]
fn test_freed_segment_is_invalid_and_others_keep_their_ids() {
    let mut segments = SegmentManager::new(ScriptLayout::SCI0);
    let first = segments.alloc_dynmem(8, "first").unwrap();
    let second = segments.alloc_dynmem(8, "second").unwrap();
    segments.write_bytes(second, b"kept").unwrap();

    segments.free_dynmem(first).unwrap();
    assert!(matches!(
        segments.dereference(first),
        Err(RuntimeError::InvalidAddress { .. })
    ));
    assert!(matches!(
        segments.read_value(first),
        Err(RuntimeError::InvalidAddress { .. })
    ));
    assert_eq!(segments.read_bytes(second, 4).unwrap(), b"kept".to_vec());

    // The freed id is handed out again
    let list = segments.alloc_list().unwrap();
    assert_eq!(list.segment, first.segment);
    assert!(segments.is_valid_address(second));
}

#[test]
fn test_freed_pool_entry_is_invalid() {
    let mut segments = SegmentManager::new(ScriptLayout::SCI0);
    let a = segments.alloc_node(Address::from_u16(1), Address::from_u16(1)).unwrap();
    let b = segments.alloc_node(Address::from_u16(2), Address::from_u16(2)).unwrap();
    segments.free_node(a).unwrap();

    assert!(matches!(segments.node(a), Err(RuntimeError::InvalidAddress { .. })));
    assert!(segments.free_node(a).is_err());
    assert_eq!(segments.node(b).unwrap().value, Address::from_u16(2));
}

#[test]
fn test_instantiation_is_idempotent() {
    for version in VERSIONS {
        let resources = feature_script(version);
        let mut segments = manager(version);
        let first = segments.instantiate_script(5, &resources).unwrap();
        let objects = segments.script(first).unwrap().objects().len();
        let before = segments.stats();

        let second = segments.instantiate_script(5, &resources).unwrap();
        assert_eq!(first, second);
        assert_eq!(segments.stats(), before);

        let script = segments.script(first).unwrap();
        assert_eq!(script.lockers(), 2);
        assert_eq!(script.objects().len(), objects);

        let door = script.export_address(0).unwrap();
        let index = script.object_index(door.offset).unwrap();
        assert_eq!(segments.instantiate_object(first, door.offset).unwrap(), index);
        assert_eq!(segments.script(first).unwrap().objects().len(), objects);
    }
}

#[test]
fn test_unlocked_script_is_collected() {
    for version in VERSIONS {
        let resources = feature_script(version);
        let config = VmConfig {
            version,
            ..VmConfig::default()
        };
        let mut vm = Interpreter::new(config, Box::new(resources)).unwrap();
        let id = vm.instantiate_script(5).unwrap();
        assert_eq!(vm.instantiate_script(5).unwrap(), id);

        vm.uninstantiate_script(5);
        assert_eq!(vm.collect_garbage().freed_scripts, 0);

        vm.uninstantiate_script(5);
        assert!(vm.segments().script(id).unwrap().is_marked_deleted());
        assert_eq!(vm.collect_garbage().freed_scripts, 1);
        assert_eq!(vm.segments().script_segment(5), None);
        assert_eq!(vm.segments().classes().address(1), None);
    }
}

#[test]
fn test_three_level_selector_resolution() {
    for version in VERSIONS {
        let mut builder = ScriptBuilder::new(version, 7);
        let walk = builder.asm().here();
        builder.asm().ldi(4).ret();
        builder
            .object(ObjectDef::class("Base", 1).method(WALK, walk))
            .object(ObjectDef::class("Middle", 2).superclass(1).property(COLOR, 8))
            .object(
                ObjectDef::class("Leaf", 3)
                    .superclass(2)
                    .property(COLOR, 9)
                    .property(NAME, 0),
            )
            .object(
                ObjectDef::instance("leaf", 3)
                    .property(COLOR, 10)
                    .property(NAME, 0),
            )
            .export_object("leaf")
            .export_object("Base");
        let mut resources = MemoryResources::new();
        resources.add(7, builder.build().unwrap());
        for species in 1..=3 {
            resources.add_class_script(species, 7);
        }

        let mut segments = manager(version);
        let id = segments.instantiate_script(7, &resources).unwrap();
        let leaf = segments.script(id).unwrap().export_address(0).unwrap();
        let base = segments.script(id).unwrap().export_address(1).unwrap();
        let property = first_property(version);

        match lookup(&segments, leaf, WALK).unwrap() {
            SelectorLookup::Method { owner, address } => {
                assert_eq!(owner, base);
                assert_eq!(address.segment, id);
            }
            other => panic!("expected a method, got {:?}", other),
        }
        assert_eq!(
            lookup(&segments, leaf, COLOR).unwrap(),
            SelectorLookup::Variable {
                object: leaf,
                index: property
            }
        );
        assert_eq!(
            lookup(&segments, leaf, NAME).unwrap(),
            SelectorLookup::Variable {
                object: leaf,
                index: property + 1
            }
        );
        assert_eq!(lookup(&segments, leaf, SIGNAL).unwrap(), SelectorLookup::NotFound);
        assert!(matches!(
            lookup(&segments, Address::from_u16(3), WALK),
            Err(RuntimeError::NotAnObject { .. })
        ));
    }
}

#[test]
fn test_gc_keeps_list_reachable_from_global() {
    let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 0);
    builder.asm().ret();
    builder.object(ObjectDef::class("Thing", 1).property(SIGNAL, 0));
    builder.export_object("Thing").local(0);
    let mut resources = MemoryResources::new();
    resources.add(0, builder.build().unwrap());

    let mut vm = Interpreter::new(VmConfig::default(), Box::new(resources)).unwrap();
    let thing = vm.game_object().unwrap();
    let globals = vm.segments().globals_segment().unwrap();

    let segments = vm.segments_mut();
    let clone = segments.alloc_clone(thing).unwrap();
    let node = segments.alloc_node(clone, clone).unwrap();
    let list = segments.alloc_list().unwrap();
    {
        let l = segments.list_mut(list).unwrap();
        l.first = node;
        l.last = node;
    }
    let stray = segments.alloc_list().unwrap();
    segments.write_value(Address::new(globals, 0), list).unwrap();

    let stats = vm.collect_garbage();
    assert_eq!(stats.freed(), 1);
    assert_eq!(stats.freed_lists, 1);
    assert!(!vm.segments().is_valid_address(stray));
    for live in [list, node, clone] {
        assert!(vm.segments().is_valid_address(live));
    }

    vm.segments_mut()
        .write_value(Address::new(globals, 0), Address::NULL)
        .unwrap();
    let stats = vm.collect_garbage();
    assert_eq!(stats.freed_lists, 1);
    assert_eq!(stats.freed_nodes, 1);
    assert_eq!(stats.freed_clones, 1);
    assert_eq!(vm.segments().stats().clones, 0);
    for gone in [list, node, clone] {
        assert!(matches!(
            vm.segments().dereference(gone),
            Err(RuntimeError::InvalidAddress { .. })
        ));
    }

    // The script is locked, so it survives every collection
    assert!(vm.segments().script_segment(0).is_some());
}

#[test]
fn test_buffer_size_per_layout() {
    let mut sci0 = vec![0u8; 40];
    sci0[0] = 3;
    assert_eq!(ScriptLayout::SCI0.buffer_size(1, &sci0, None).unwrap(), 46);
    assert!(matches!(
        ScriptLayout::SCI0.buffer_size(1, &[0], None),
        Err(RuntimeError::ScriptCorrupt { .. })
    ));

    let script = vec![0u8; 31];
    let heap = vec![0u8; 20];
    assert_eq!(
        ScriptLayout::SCI11.buffer_size(1, &script, Some(&heap)).unwrap(),
        52
    );
    assert!(matches!(
        ScriptLayout::SCI11.buffer_size(1, &script, None),
        Err(RuntimeError::ScriptNotFound { script: 1 })
    ));
}

#[test]
fn test_loaded_buffer_matches_layout_size() {
    for version in VERSIONS {
        let (script, heap) = {
            let mut builder = ScriptBuilder::new(version, 5);
            builder.asm().ret();
            builder.object(ObjectDef::class("Feature", 1)).local(1).local(2);
            builder.build().unwrap()
        };
        let expected = ScriptLayout::for_version(version)
            .buffer_size(5, &script, heap.as_deref())
            .unwrap();

        let mut alone = MemoryResources::new();
        alone.add(5, (script, heap));
        let mut segments = manager(version);
        let id = segments.instantiate_script(5, &alone).unwrap();
        assert_eq!(segments.script(id).unwrap().len(), expected);
    }
}

fn corrupt_magic(bytes: &mut [u8]) {
    let magic = OBJECT_MAGIC.to_le_bytes();
    let at = bytes
        .windows(2)
        .position(|w| w == magic)
        .expect("object magic present");
    bytes[at] ^= 0xff;
}

#[test]
fn test_corrupt_script_leaves_nothing_resident() {
    for version in VERSIONS {
        let mut builder = ScriptBuilder::new(version, 9);
        builder.asm().ret();
        builder
            .object(ObjectDef::class("Broken", 4).property(SIGNAL, 1))
            .local(0);
        let (mut script, mut heap) = builder.build().unwrap();
        match heap.as_mut() {
            Some(heap) => corrupt_magic(heap),
            None => corrupt_magic(&mut script),
        }
        let mut resources = MemoryResources::new();
        resources.add(9, (script, heap));

        let mut segments = manager(version);
        let before = segments.stats();
        let result = segments.instantiate_script(9, &resources);
        assert!(
            matches!(result, Err(RuntimeError::ScriptCorrupt { script: 9, .. })),
            "{:?}",
            result
        );
        assert_eq!(segments.script_segment(9), None);
        assert_eq!(segments.stats(), before);
        assert_eq!(segments.classes().address(4), None);
    }
}

#[test]
fn test_truncated_block_is_rejected() {
    let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 9);
    builder.asm().ret();
    builder.object(ObjectDef::class("Broken", 4));
    let (mut script, _) = builder.build().unwrap();
    // First block starts right after the header; claim it runs off the end
    script[6..8].copy_from_slice(&0x7ff0u16.to_le_bytes());
    let mut resources = MemoryResources::new();
    resources.add_script(9, script);

    let mut segments = manager(ScriptVersion::Sci0);
    assert!(matches!(
        segments.instantiate_script(9, &resources),
        Err(RuntimeError::ScriptCorrupt { .. })
    ));
    assert_eq!(segments.script_segment(9), None);
}

#[test]
fn test_missing_script_is_reported() {
    let resources = MemoryResources::new();
    let mut segments = manager(ScriptVersion::Sci0);
    let err = segments.instantiate_script(42, &resources).unwrap_err();
    assert!(matches!(err, RuntimeError::ScriptNotFound { script: 42 }));
    assert!(err.is_load_error());
    assert!(!err.is_recoverable());
}

/// Script 1 defines class Base; scripts 2 and 3 each export one instance of it
fn family(version: ScriptVersion) -> MemoryResources {
    let mut resources = MemoryResources::new();

    let mut base = ScriptBuilder::new(version, 1);
    let walk = base.asm().here();
    base.asm().ldi(1).ret();
    base.object(ObjectDef::class("Base", 1).property(SIGNAL, 0).method(WALK, walk))
        .export_object("Base");
    resources.add(1, base.build().unwrap());

    for (number, name) in [(2, "door"), (3, "gate")] {
        let mut builder = ScriptBuilder::new(version, number);
        builder.asm().ret();
        builder
            .object(ObjectDef::instance(name, 1).property(SIGNAL, 0))
            .export_object(name);
        resources.add(number, builder.build().unwrap());
    }
    resources.add_class_script(1, 1);
    resources
}

fn family_manager(version: ScriptVersion, resources: &MemoryResources) -> (SegmentManager, ExecutionContext) {
    let mut segments = SegmentManager::new(ScriptLayout::for_version(version));
    let stack = segments.allocate_stack(64).unwrap();
    *segments.classes_mut() = ClassTable::with_scripts(&resources.class_scripts);
    (segments, ExecutionContext::new(stack))
}

fn walks(segments: &SegmentManager, script: u16) -> bool {
    let Some(id) = segments.script_segment(script) else {
        return false;
    };
    let object = segments.script(id).unwrap().export_address(0).unwrap();
    matches!(lookup(segments, object, WALK), Ok(SelectorLookup::Method { .. }))
}

#[test]
fn test_reinstantiated_script_relocks_its_superclass() {
    for version in VERSIONS {
        let resources = family(version);
        let (mut segments, context) = family_manager(version, &resources);

        segments.instantiate_script(2, &resources).unwrap();
        let base = segments.script_segment(1).unwrap();
        assert_eq!(segments.script(base).unwrap().lockers(), 1);
        assert!(walks(&segments, 2));

        segments.uninstantiate_script(2);
        assert!(segments.script(base).unwrap().is_marked_deleted());

        // Revived before any collection ran
        let door = segments.instantiate_script(2, &resources).unwrap();
        assert!(!segments.script(door).unwrap().is_marked_deleted());
        assert_eq!(segments.script(base).unwrap().lockers(), 1);
        assert!(!segments.script(base).unwrap().is_marked_deleted());

        let stats = gc::run_gc(&mut segments, &context);
        assert_eq!(stats.freed_scripts, 0);
        assert_eq!(segments.script_segment(1), Some(base));
        assert!(walks(&segments, 2));

        // Dropping the last lock releases both scripts
        segments.uninstantiate_script(2);
        let stats = gc::run_gc(&mut segments, &context);
        assert_eq!(stats.freed_scripts, 2);
        assert_eq!(segments.script_segment(1), None);
    }
}

#[test]
fn test_disposing_unlocked_script_keeps_shared_superclass() {
    for version in VERSIONS {
        let resources = family(version);
        let (mut segments, context) = family_manager(version, &resources);

        segments.instantiate_script(3, &resources).unwrap();
        let base = segments.script_segment(1).unwrap();

        // Loaded the way an exported-procedure call loads it, without a lock
        let door = segments.load_script(2, &resources).unwrap();
        assert_eq!(segments.script(door).unwrap().lockers(), 0);

        segments.uninstantiate_script(2);
        assert!(segments.script(door).unwrap().is_marked_deleted());
        assert_eq!(segments.script(base).unwrap().lockers(), 1);

        let stats = gc::run_gc(&mut segments, &context);
        assert_eq!(stats.freed_scripts, 1);
        assert_eq!(segments.script_segment(2), None);
        assert_eq!(segments.script_segment(1), Some(base));
        assert!(walks(&segments, 3));

        // A later instantiation takes its superclass lock as usual
        segments.instantiate_script(2, &resources).unwrap();
        assert_eq!(segments.script(base).unwrap().lockers(), 2);
        assert!(walks(&segments, 2));
    }
}

#[test]
fn test_unlocked_script_takes_superclass_locks_when_instantiated() {
    let resources = family(ScriptVersion::Sci0);
    let (mut segments, _) = family_manager(ScriptVersion::Sci0, &resources);

    let door = segments.load_script(2, &resources).unwrap();
    assert_eq!(segments.script_segment(1), None);
    assert!(!segments.script(door).unwrap().holds_superclasses());

    assert_eq!(segments.instantiate_script(2, &resources).unwrap(), door);
    assert!(segments.script(door).unwrap().holds_superclasses());
    let base = segments.script_segment(1).unwrap();
    assert_eq!(segments.script(base).unwrap().lockers(), 1);

    // Further locks do not lock the superclass again
    segments.instantiate_script(2, &resources).unwrap();
    assert_eq!(segments.script(base).unwrap().lockers(), 1);
}
