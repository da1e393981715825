// scivm: run or disassemble adventure-game script resources

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::process;

use scivm::interpreter::{ExecState, Interpreter, VmConfig};
use scivm::memory::SegmentManager;
use scivm::script::disasm::{self, Symbols};
use scivm::script::{ClassTable, DirectoryResources, ResourceSource, ScriptLayout, ScriptVersion};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Script format of the game
    #[arg(long, default_value = "sci0", global = true, help = "sci0 or sci11")]
    format: ScriptVersion,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a selector to the game object (export 0 of script 0)
    Run {
        /// Directory holding the script resources
        dir: PathBuf,

        /// Selector to send, by name or number
        #[arg(long, default_value = "play")]
        selector: String,

        /// Skip sends to missing selectors instead of aborting
        #[arg(long)]
        continue_on_invalid_selector: bool,

        /// Log every instruction (needs RUST_LOG=trace)
        #[arg(long)]
        trace: bool,

        /// Deepest call stack allowed
        #[arg(long)]
        max_depth: Option<usize>,

        /// Kernel calls between collections, 0 to disable
        #[arg(long)]
        gc_interval: Option<u32>,
    },

    /// List the code of one script
    Disasm {
        /// Directory holding the script resources
        dir: PathBuf,

        /// Script number
        script: u16,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run {
            dir,
            selector,
            continue_on_invalid_selector,
            trace,
            max_depth,
            gc_interval,
        } => {
            let mut config = VmConfig {
                version: cli.format,
                continue_on_invalid_selector,
                trace_instructions: trace,
                ..VmConfig::default()
            };
            if let Some(depth) = max_depth {
                config.max_call_depth = depth;
            }
            if let Some(interval) = gc_interval {
                config.gc_interval = interval;
            }
            run(config, dir, &selector)
        }
        Command::Disasm { dir, script } => disassemble(cli.format, dir, script),
    };
    process::exit(code);
}

fn run(config: VmConfig, dir: PathBuf, selector: &str) -> i32 {
    let resources = DirectoryResources::new(&dir);
    let mut vm = match Interpreter::new(config, Box::new(resources)) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error starting interpreter: {}", err);
            return 1;
        }
    };

    let selector_id = match selector.parse::<u16>().ok().or_else(|| vm.selector_id(selector)) {
        Some(id) => id,
        None => {
            eprintln!("Unknown selector '{}'", selector);
            return 1;
        }
    };

    let game = match vm.game_object() {
        Ok(game) => game,
        Err(err) => {
            eprintln!("Error loading game object from {}: {}", dir.display(), err);
            return 1;
        }
    };

    let outcome = vm.execute(game, selector_id, &[]);
    let stats = vm.segments().stats();
    eprintln!(
        "{:?} after {} instructions, acc = {}",
        outcome.state, outcome.steps, outcome.acc
    );
    eprintln!(
        "heap: {} segments, {} scripts, {} clones, {} lists, {} nodes",
        stats.segments, stats.scripts, stats.clones, stats.lists, stats.nodes
    );

    match (outcome.state, outcome.error) {
        (_, Some(err)) if err.is_load_error() => {
            eprintln!("Error loading a script from {}: {}", dir.display(), err);
            1
        }
        (_, Some(err)) => {
            eprintln!("Error: {}", err);
            1
        }
        (ExecState::Halted, None) => 0,
        _ => 2,
    }
}

fn disassemble(version: ScriptVersion, dir: PathBuf, number: u16) -> i32 {
    let resources = DirectoryResources::new(&dir);
    let mut segments = SegmentManager::new(ScriptLayout::for_version(version));
    *segments.classes_mut() = ClassTable::with_scripts(&resources.class_scripts());

    let id = match segments.load_script(number, &resources) {
        Ok(id) => id,
        Err(err) => {
            eprintln!("Error loading script {}: {}", number, err);
            return 1;
        }
    };
    let Ok(script) = segments.script(id) else {
        return 1;
    };

    let kernels = resources.kernel_names();
    let selectors = resources.selector_names();
    let symbols = Symbols {
        kernels: &kernels,
        selectors: &selectors,
    };

    println!("; script {} ({} bytes)", number, script.len());
    for (i, export) in script.exports().iter().enumerate() {
        println!("; export {}: {:04x}", i, export);
    }
    for object in script.objects() {
        println!(
            "; {} {} at {:04x}",
            if object.is_class() { "class" } else { "object" },
            segments.object_name(object.pos()),
            object.pos().offset
        );
    }
    for line in disasm::disassemble(script, symbols) {
        println!("{}", line);
    }
    0
}
