use std::{path::PathBuf, process::ExitCode};

use clap::{ArgGroup, Parser};
use log::error;

use slabscope::{
    dump_heap,
    mem::MemoryReader,
    report::{self, Format},
    serialize::serde_addr::parse_addr,
    MemoryImage, TargetDescription,
};

/// Walk a slab heap's size classes and check every slab's allocation count
/// against its bitmap
#[derive(Parser, Debug)]
#[command(version, about)]
#[command(group(ArgGroup::new("source").required(true).args(["image", "raw", "pid"])))]
struct Args {
    /// Target description: symbol addresses and record layouts (JSON)
    #[arg(long)]
    target: PathBuf,

    /// Captured memory image (JSON regions)
    #[arg(long)]
    image: Option<PathBuf>,

    /// Raw memory dump, mapped at --base
    #[arg(long, requires = "base")]
    raw: Option<PathBuf>,

    /// Load address of --raw
    #[arg(long, value_parser = parse_base)]
    base: Option<u64>,

    /// Live process to read from
    #[arg(long)]
    pid: Option<i32>,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Number of size class table entries to walk
    #[arg(long)]
    size_classes: Option<usize>,

    /// Symbol naming the size class table
    #[arg(long)]
    symbol: Option<String>,

    /// Exit with status 2 if anything corrupt or unreadable was found
    #[arg(long)]
    fail_on_corruption: bool,
}

fn parse_base(s: &str) -> Result<u64, String> {
    parse_addr(s).ok_or_else(|| format!("invalid address {s:?}"))
}

fn open_memory(args: &Args) -> Result<Box<dyn MemoryReader>, String> {
    if let Some(path) = &args.image {
        return MemoryImage::from_json_file(path)
            .map(|image| Box::new(image) as Box<dyn MemoryReader>)
            .map_err(|e| e.to_string());
    }
    if let (Some(path), Some(base)) = (&args.raw, args.base) {
        return MemoryImage::from_raw_file(path, base)
            .map(|image| Box::new(image) as Box<dyn MemoryReader>)
            .map_err(|e| e.to_string());
    }
    if let Some(pid) = args.pid {
        return attach(pid);
    }
    Err("no memory source given".to_owned())
}

#[cfg(target_os = "linux")]
fn attach(pid: i32) -> Result<Box<dyn MemoryReader>, String> {
    slabscope::os::mem::ProcessMemory::attach(pid)
        .map(|mem| Box::new(mem) as Box<dyn MemoryReader>)
        .map_err(|e| format!("cannot attach to pid {pid}: {e}"))
}

#[cfg(not(target_os = "linux"))]
fn attach(_pid: i32) -> Result<Box<dyn MemoryReader>, String> {
    Err("--pid is only supported on Linux".to_owned())
}

fn run(args: &Args) -> Result<bool, String> {
    let target = TargetDescription::from_file(&args.target).map_err(|e| e.to_string())?;
    let mut config = target.walk_config();
    if let Some(count) = args.size_classes {
        config.size_class_count = count;
    }
    if let Some(symbol) = &args.symbol {
        config.table_symbol = symbol.clone();
    }

    let mem = open_memory(args)?;
    let heap = dump_heap(mem.as_ref(), &target, &config).map_err(|e| e.to_string())?;
    let out = report::render(&heap, args.format).map_err(|e| e.to_string())?;
    print!("{out}");
    if args.format == Format::Json {
        println!();
    }
    Ok(heap.is_clean())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    match run(&args) {
        Ok(clean) if clean || !args.fail_on_corruption => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            error!("{e}");
            eprintln!("slabscope: {e}");
            ExitCode::FAILURE
        }
    }
}
