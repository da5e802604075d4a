use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use xrefscan::annotate::annotate_listing;
use xrefscan::encoding::adrp_result;
use xrefscan::format::OutputFormat;
use xrefscan::memory::ImageMemory;
use xrefscan::operands::int_value_from_string;
use xrefscan::parser::Image;
use xrefscan::reference::{ReferenceCache, REFERENCE_WINDOW};
use xrefscan::render::ListingRenderer;

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "AArch64 reference scanner and disassembly annotator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Disassemble a range and annotate it with reconstructed addresses
    Edis {
        /// Binary image to disassemble
        binary: PathBuf,

        /// Start address (hex or decimal)
        #[arg(short, long, conflicts_with = "name")]
        address: Option<String>,

        /// Function symbol to disassemble instead of an address
        #[arg(short, long)]
        name: Option<String>,

        /// Number of instructions
        #[arg(short, long, default_value_t = 16)]
        count: usize,
    },

    /// Scan an image for references to an address
    Reference {
        /// Target address (hex or decimal)
        address: String,

        /// Binary image to scan
        binary: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Compute the result of an adrp instruction
    Adrp {
        /// Immediate operand (hex or decimal)
        immediate: String,

        /// Address of the adrp instruction (hex or decimal)
        pc_address: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Edis { binary, address, name, count } => edis(binary, address, name, count),
        Command::Reference { address, binary, output } => reference(address, binary, output),
        Command::Adrp { immediate, pc_address } => adrp(&immediate, &pc_address),
    }
}

fn parse_address(text: &str) -> Result<u64> {
    let value = int_value_from_string(text)
        .with_context(|| format!("Invalid address:{}", text))?;
    if value < 0 {
        bail!("Invalid address:{}", text);
    }
    Ok(value as u64)
}

fn edis(
    binary: PathBuf,
    address: Option<String>,
    name: Option<String>,
    count: usize,
) -> Result<()> {
    let image = Image::open(&binary)?;
    let probe = ImageMemory::new(&image);
    let renderer = ListingRenderer::new()?;

    let listing = match (address, name) {
        (Some(address), _) => {
            let start = parse_address(&address)?;
            renderer.render(&probe, start, count)?
        }
        (None, Some(name)) => renderer.render_symbol(&image, &probe, &name, count)?,
        (None, None) => bail!("Pass --address or --name. See \"xrefscan edis --help\"."),
    };

    print!("{}", annotate_listing(&listing, &probe, &image));
    Ok(())
}

fn reference(address: String, binary: PathBuf, output: OutputFormat) -> Result<()> {
    let target = parse_address(&address)?;
    let image = Image::open(&binary)?;
    let probe = ImageMemory::new(&image);

    let mut cache = ReferenceCache::new();
    let facts = cache.facts_for(&image, &probe, REFERENCE_WINDOW)?;
    let report = facts.find_references(target);

    let formatter = output.get_formatter();
    print!("{}", formatter.format(&report, Some(&image))?);
    Ok(())
}

fn adrp(immediate: &str, pc_address: &str) -> Result<()> {
    let immediate = int_value_from_string(immediate)
        .with_context(|| format!("Invalid immediate:{}", immediate))?;
    let pc = parse_address(pc_address)?;
    let result = adrp_result(immediate, pc);
    println!("result: 0x{:x}, {}", result, result);
    Ok(())
}
