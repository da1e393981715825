// Integration tests for execution: sends, calls, kernel re-entry and stopping

use scivm::interpreter::builtins::BUILTIN_NAMES;
use scivm::interpreter::errors::VariableKind;
use scivm::interpreter::opcodes;
use scivm::interpreter::{ExecState, Interpreter, RuntimeError, StopRequest, VmConfig};
use scivm::memory::Address;
use scivm::script::{MemoryResources, ObjectDef, ScriptBuilder, ScriptLayout, ScriptVersion};
use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

const SIGNAL: u16 = 10;
const LOOK: u16 = 11;
const LOOP: u16 = 12;
const CALLBACK: u16 = 13;
const X: u16 = 14;
const PLAY: u16 = 15;
const Y: u16 = 16;
const MISSING: u16 = 99;

const VERSIONS: [ScriptVersion; 2] = [ScriptVersion::Sci0, ScriptVersion::Sci11];

fn first_property(version: ScriptVersion) -> u16 {
    ScriptLayout::for_version(version).min_var_count as u16
}

/// Resources holding `builder` as script 0, which defines every species in `classes`
fn resources(builder: &ScriptBuilder, classes: &[u16]) -> MemoryResources {
    let mut resources = MemoryResources::new();
    resources.add(0, builder.build().unwrap());
    for &species in classes {
        resources.add_class_script(species, 0);
    }
    resources
}

fn boot_with(config: VmConfig, resources: MemoryResources) -> (Interpreter, Address) {
    let mut vm = Interpreter::new(config, Box::new(resources)).unwrap();
    let game = vm.game_object().unwrap();
    (vm, game)
}

fn boot(version: ScriptVersion, resources: MemoryResources) -> (Interpreter, Address) {
    let config = VmConfig {
        version,
        ..VmConfig::default()
    };
    boot_with(config, resources)
}

/// Class `Game` with `code` as its PLAY method and properties X and Y
fn game_script(version: ScriptVersion, code: impl FnOnce(&mut ScriptBuilder)) -> ScriptBuilder {
    let mut builder = ScriptBuilder::new(version, 0);
    let play = builder.asm().here();
    code(&mut builder);
    builder
        .object(
            ObjectDef::class("Game", 1)
                .property(X, 0)
                .property(Y, 0)
                .method(PLAY, play),
        )
        .export_object("Game");
    builder
}

#[test]
fn test_method_sets_property_through_self_send() {
    for version in VERSIONS {
        let mut builder = ScriptBuilder::new(version, 0);
        let look = builder.asm().here();
        builder
            .asm()
            .pushi(SIGNAL as i16)
            .push1()
            .pushi(5)
            .send_self(3)
            .ret();
        builder
            .object(
                ObjectDef::class("Feature", 1)
                    .property(SIGNAL, 0)
                    .method(LOOK, look),
            )
            .object(ObjectDef::instance("door", 1).property(SIGNAL, 0))
            .export_object("door");

        let (mut vm, door) = boot(version, resources(&builder, &[1]));
        let outcome = vm.execute(door, LOOK, &[]);
        assert!(outcome.is_halted(), "{:?}", outcome);
        assert!(outcome.steps > 0);
        assert_eq!(vm.get_property(door, SIGNAL).unwrap(), Address::from_u16(5));
        assert_eq!(vm.context().depth(), 0);

        // The class keeps its own value
        let class = vm.resolve_class(1).unwrap();
        assert_eq!(vm.get_property(class, SIGNAL).unwrap(), Address::NULL);
    }
}

#[test]
fn test_property_read_through_send() {
    let builder = game_script(ScriptVersion::Sci0, |b| {
        b.asm()
            .pushi(X as i16)
            .push0()
            .send_self(2)
            .ret();
    });
    let (mut vm, game) = boot(ScriptVersion::Sci0, resources(&builder, &[1]));
    vm.set_property(game, X, Address::from_u16(21)).unwrap();

    let outcome = vm.execute(game, PLAY, &[]);
    assert!(outcome.is_halted());
    assert_eq!(outcome.acc, Address::from_u16(21));
}

#[test]
fn test_super_send_acts_on_self() {
    for version in VERSIONS {
        let mut builder = ScriptBuilder::new(version, 0);
        let base_look = builder.asm().here();
        builder
            .asm()
            .pushi(SIGNAL as i16)
            .push1()
            .pushi(5)
            .send_self(3)
            .ret();
        let derived_look = builder.asm().here();
        builder
            .asm()
            .pushi(LOOK as i16)
            .push0()
            .send_super(1, 2)
            .pushi(SIGNAL as i16)
            .push0()
            .send_self(2)
            .ret();
        builder
            .object(
                ObjectDef::class("Base", 1)
                    .property(SIGNAL, 0)
                    .method(LOOK, base_look),
            )
            .object(
                ObjectDef::class("Derived", 2)
                    .superclass(1)
                    .property(SIGNAL, 0)
                    .method(LOOK, derived_look),
            )
            .object(ObjectDef::instance("thing", 2).property(SIGNAL, 0))
            .export_object("thing");

        let (mut vm, thing) = boot(version, resources(&builder, &[1, 2]));
        let outcome = vm.execute(thing, LOOK, &[]);
        assert!(outcome.is_halted(), "{:?}", outcome);
        assert_eq!(outcome.acc, Address::from_u16(5));
        assert_eq!(vm.get_property(thing, SIGNAL).unwrap(), Address::from_u16(5));

        let base = vm.resolve_class(1).unwrap();
        assert_eq!(vm.get_property(base, SIGNAL).unwrap(), Address::NULL);
    }
}

#[test]
fn test_property_increment_updates_object() {
    let version = ScriptVersion::Sci0;
    let index = first_property(version);
    let builder = game_script(version, |b| {
        b.asm().ip_to_a(index).ip_to_s(index).ret();
    });
    let (mut vm, game) = boot(version, resources(&builder, &[1]));
    vm.set_property(game, X, Address::from_u16(40)).unwrap();

    let outcome = vm.execute(game, PLAY, &[]);
    assert!(outcome.is_halted());
    assert_eq!(outcome.acc, Address::from_u16(41));
    assert_eq!(vm.get_property(game, X).unwrap(), Address::from_u16(42));
}

#[test]
fn test_runaway_recursion_overflows() {
    let mut builder = ScriptBuilder::new(ScriptVersion::Sci0, 0);
    let spin = builder.asm().here();
    builder
        .asm()
        .pushi(LOOP as i16)
        .push0()
        .send_self(2)
        .ret();
    builder
        .object(ObjectDef::class("Spinner", 1).method(LOOP, spin))
        .export_object("Spinner");

    let config = VmConfig {
        max_call_depth: 50,
        ..VmConfig::default()
    };
    let (mut vm, spinner) = boot_with(config, resources(&builder, &[1]));
    let outcome = vm.execute(spinner, LOOP, &[]);
    assert_eq!(outcome.state, ExecState::Aborted);
    assert!(
        matches!(outcome.error, Some(RuntimeError::StackOverflow { limit: 50, .. })),
        "{:?}",
        outcome.error
    );
    assert_eq!(vm.context().depth(), 0);
    assert_eq!(vm.state(), ExecState::Aborted);
}

#[test]
fn test_kernel_call_reenters_interpreter() {
    let version = ScriptVersion::Sci0;
    let first = first_property(version);
    let mut builder = ScriptBuilder::new(version, 0);
    let play = builder.asm().here();
    builder
        .asm()
        .link(1)
        .ldi(7)
        .store(VariableKind::Temp, 0)
        .pushi(100)
        .push1()
        .push_self()
        .callk(0, 1)
        .push()
        .load(VariableKind::Temp, 0)
        .op(opcodes::ADD)
        .a_to_p(first)
        .ldi(0)
        .op(opcodes::ADD)
        .a_to_p(first + 1)
        .ret();
    let callback = builder.asm().here();
    builder
        .asm()
        .link(2)
        .ldi(30)
        .store(VariableKind::Temp, 0)
        .pushi(5)
        .load(VariableKind::Temp, 0)
        .op(opcodes::ADD)
        .ret();
    builder
        .object(
            ObjectDef::class("Game", 1)
                .property(X, 0)
                .property(Y, 0)
                .method(PLAY, play)
                .method(CALLBACK, callback),
        )
        .export_object("Game");

    let mut res = resources(&builder, &[1]);
    res.kernel_names = vec!["Callback".to_string()];
    let (mut vm, game) = boot(version, res);

    let seen = Rc::new(Cell::new(None));
    let record = Rc::clone(&seen);
    let index = vm.kernel_mut().register("Callback", move |vm, args| {
        record.set(Some(vm.state()));
        let result = vm.send_selector(args[0], CALLBACK, &[])?;
        Ok(Address::from_i16(result.as_i16().unwrap_or(0) + 1))
    });
    assert_eq!(index, 0);

    let outcome = vm.execute(game, PLAY, &[]);
    assert!(outcome.is_halted(), "{:?}", outcome);
    assert_eq!(seen.get(), Some(ExecState::AwaitingKernelCall));
    assert_eq!(vm.get_property(game, X).unwrap(), Address::from_u16(43));
    assert_eq!(vm.get_property(game, Y).unwrap(), Address::from_u16(100));
    assert_eq!(vm.state(), ExecState::Halted);
    assert_eq!(vm.context().depth(), 0);
}

#[test]
fn test_builtin_kernel_allocates_list() {
    let new_list = BUILTIN_NAMES
        .iter()
        .position(|&n| n == "NewList")
        .unwrap() as u16;
    let builder = game_script(ScriptVersion::Sci0, |b| {
        b.asm().push0().callk(new_list, 0).ret();
    });
    let (mut vm, game) = boot(ScriptVersion::Sci0, resources(&builder, &[1]));

    let outcome = vm.execute(game, PLAY, &[]);
    assert!(outcome.is_halted());
    let list = outcome.acc;
    assert!(vm.segments().list(list).is_ok());

    // Still held by the accumulator
    assert_eq!(vm.collect_garbage().freed_lists, 0);
    assert!(vm.segments().list(list).is_ok());
}

#[test]
fn test_unknown_kernel_call_aborts() {
    let builder = game_script(ScriptVersion::Sci0, |b| {
        b.asm().push0().callk(400, 0).ret();
    });
    let (mut vm, game) = boot(ScriptVersion::Sci0, resources(&builder, &[1]));
    let outcome = vm.execute(game, PLAY, &[]);
    assert_eq!(outcome.state, ExecState::Aborted);
    assert_eq!(outcome.error, Some(RuntimeError::UnknownKernelCall { index: 400 }));
}

#[test]
fn test_abort_from_another_thread() {
    let builder = game_script(ScriptVersion::Sci0, |b| {
        let top = b.asm().here();
        b.asm().jmp(top);
    });
    let (mut vm, game) = boot(ScriptVersion::Sci0, resources(&builder, &[1]));

    let handle = vm.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.abort();
    });
    let outcome = vm.execute(game, PLAY, &[]);
    stopper.join().unwrap();

    assert_eq!(outcome.state, ExecState::Aborted);
    assert_eq!(outcome.error, None);
    assert!(outcome.steps > 0);
    assert_eq!(vm.context().depth(), 0);
    assert_eq!(vm.stop_handle().pending(), None);
}

#[test]
fn test_kernel_requests_restart() {
    let builder = game_script(ScriptVersion::Sci0, |b| {
        b.asm().push0().callk(0, 0).ldi(1).ret();
    });
    let mut res = resources(&builder, &[1]);
    res.kernel_names = vec!["RestartGame".to_string()];
    let (mut vm, game) = boot(ScriptVersion::Sci0, res);
    vm.kernel_mut().register("RestartGame", |vm, _| {
        vm.request_stop(StopRequest::Restart);
        Ok(Address::NULL)
    });

    let outcome = vm.execute(game, PLAY, &[]);
    assert_eq!(outcome.state, ExecState::Restarting);
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.acc, Address::NULL);
    assert_eq!(vm.state(), ExecState::Restarting);
}

fn missing_selector_script() -> MemoryResources {
    let builder = game_script(ScriptVersion::Sci0, |b| {
        b.asm()
            .ldi(9)
            .pushi(MISSING as i16)
            .push0()
            .send_self(2)
            .ret();
    });
    resources(&builder, &[1])
}

#[test]
fn test_missing_selector_aborts_by_default() {
    let (mut vm, game) = boot(ScriptVersion::Sci0, missing_selector_script());
    let outcome = vm.execute(game, PLAY, &[]);
    assert_eq!(outcome.state, ExecState::Aborted);
    assert!(matches!(
        outcome.error,
        Some(RuntimeError::SelectorNotFound { selector: MISSING, .. })
    ));
}

#[test]
fn test_missing_selector_can_be_skipped() {
    let config = VmConfig {
        continue_on_invalid_selector: true,
        ..VmConfig::default()
    };
    let (mut vm, game) = boot_with(config, missing_selector_script());
    let outcome = vm.execute(game, PLAY, &[]);
    assert!(outcome.is_halted(), "{:?}", outcome);
    assert_eq!(outcome.acc, Address::NULL);
}

#[test]
fn test_exported_procedures_and_rest() {
    for version in VERSIONS {
        let mut builder = ScriptBuilder::new(version, 0);
        let sum = builder.asm().here();
        builder
            .asm()
            .load(VariableKind::Param, 1)
            .push()
            .load(VariableKind::Param, 2)
            .op(opcodes::ADD)
            .ret();
        let forward = builder.asm().here();
        builder.asm().push0().rest(1).call(sum, 0).ret();
        let remember = builder.asm().here();
        builder
            .asm()
            .link(1)
            .load(VariableKind::Param, 1)
            .store(VariableKind::Temp, 0)
            .load(VariableKind::Temp, 0)
            .store(VariableKind::Global, 1)
            .ret();
        builder
            .object(ObjectDef::class("Game", 1))
            .export_object("Game")
            .export_code(sum)
            .export_code(forward)
            .export_code(remember)
            .locals(2);

        let (mut vm, _) = boot(version, resources(&builder, &[1]));
        let args = [Address::from_u16(3), Address::from_u16(4)];
        assert_eq!(vm.call_export(0, 1, &args).unwrap(), Address::from_u16(7));
        assert_eq!(vm.call_export(0, 2, &args).unwrap(), Address::from_u16(7));

        assert_eq!(
            vm.call_export(0, 3, &[Address::from_u16(6)]).unwrap(),
            Address::from_u16(6)
        );
        let globals = vm.segments().globals_segment().unwrap();
        assert_eq!(
            vm.segments().locals(globals).unwrap().get(1),
            Some(Address::from_u16(6))
        );
        assert_eq!(vm.context().depth(), 0);

        assert!(matches!(
            vm.call_export(0, 9, &[]),
            Err(RuntimeError::KernelArgument { .. })
        ));
    }
}
