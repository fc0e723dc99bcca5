use clap::Parser;
use std::path::PathBuf;
use std::process;

use heap::{BakerHeap, GenerationalHeap, HeapSettings, MemoryManager};
use object::Process;

use vm::handles::HandleScope;
use vm::interpreter::{execute, ExecuteResult};
use vm::materialize::make_process;
use vm::{image, Vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Collector {
    Baker,
    Generational,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "A little Smalltalk virtual machine", long_about = None)]
struct Cli {
    /// Image file to boot
    image: PathBuf,

    /// Tick budget per execute call (one tick is roughly one bytecode)
    #[arg(long, default_value_t = 500_000)]
    ticks: u32,

    /// Total heap size in bytes (both semi-spaces together)
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    heap_size: usize,

    /// Garbage collector to run under
    #[arg(long, value_enum, default_value = "generational")]
    collector: Collector,

    /// Dump heap and method cache statistics on exit
    #[arg(long)]
    stats: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let settings = HeapSettings {
        heap_size: cli.heap_size,
        ..HeapSettings::default()
    };
    if let Err(err) = settings.validate() {
        eprintln!("Invalid heap settings: {err}");
        process::exit(1);
    }
    let memory: Box<dyn MemoryManager> = match cli.collector {
        Collector::Baker => Box::new(BakerHeap::new(settings)),
        Collector::Generational => Box::new(GenerationalHeap::new(settings)),
    };

    let mut vm = Vm::new(memory);
    if let Err(err) = image::load_image(&mut vm, &cli.image) {
        eprintln!("Error loading image '{}': {err}", cli.image.display());
        process::exit(1);
    }

    let initial_method = vm.special.initial_method;
    if !initial_method.is_ref() || initial_method.same_as(vm.nil()) {
        eprintln!("Image has no initial method");
        process::exit(1);
    }
    // Pinned: the process moves whenever an execute slice collects.
    let scope = HandleScope::new(&mut vm);
    let process_obj = scope.pin(make_process(&mut vm, initial_method));

    // Re-invoke on expiry so the tick budget only bounds one slice.
    let result = loop {
        match execute(&mut vm, process_obj.get(), cli.ticks) {
            ExecuteResult::TimeExpired => continue,
            other => break other,
        }
    };

    match result {
        ExecuteResult::Returned => {
            let value = unsafe { Process(process_obj.get()).result() };
            println!("{value:?}");
        }
        other => eprintln!("Interpreter stopped: {other:?}"),
    }

    if cli.stats {
        let stats = vm.memory.stats();
        eprintln!("collections:        {}", stats.collections);
        eprintln!("  minor:            {}", stats.minor_collections);
        eprintln!("  major:            {}", stats.major_collections);
        eprintln!("  total time:       {:?}", stats.total_collection_time);
        eprintln!("  major time:       {:?}", stats.major_collection_time);
        eprintln!("heap size:          {} bytes", stats.heap_size);
        eprintln!("young free:         {} bytes", stats.free_bytes);
        eprintln!("old free:           {} bytes", stats.old_free_bytes);
        eprintln!("cache hits/misses:  {}/{}", vm.cache.hits, vm.cache.misses);
    }

    process::exit(result.exit_code());
}
