//! The `bag` command family: inspect and combine aggregate-bag files.

use std::fs::File;
use std::path::{Path, PathBuf};

use clap::Subcommand;

use flowforge_core::bag::{AggregateBag, FieldRef};
use flowforge_core::layout::ValueKind;
use flowforge_core::stream::CompressionMethod;

#[derive(Subcommand)]
pub enum BagCommands {
    /// Print the schema and entries of a bag file
    Print {
        /// Bag file to read
        file: PathBuf,
    },

    /// Saturating-add bags together and write the result
    Merge {
        /// Output bag file
        #[arg(short, long)]
        output: PathBuf,

        /// Input bag files; all must share the first file's schema
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,

        /// Output compression
        #[arg(long, default_value = "none", value_parser = ["none", "zlib"])]
        compression: String,
    },

    /// Floor-zero subtract bags from the first and write the result
    Minus {
        /// Output bag file
        #[arg(short, long)]
        output: PathBuf,

        /// Input bag files; the first is the minuend
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,

        /// Output compression
        #[arg(long, default_value = "none", value_parser = ["none", "zlib"])]
        compression: String,
    },
}

pub fn run(command: BagCommands) -> Result<(), String> {
    match command {
        BagCommands::Print { file } => print(&file),
        BagCommands::Merge {
            output,
            inputs,
            compression,
        } => combine(&output, &inputs, &compression, AggregateBag::merge),
        BagCommands::Minus {
            output,
            inputs,
            compression,
        } => combine(&output, &inputs, &compression, AggregateBag::minus),
    }
}

fn read_bag(path: &Path) -> Result<AggregateBag, String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {e}", path.display()))?;
    AggregateBag::read_from(file).map_err(|e| format!("cannot read {}: {e}", path.display()))
}

fn print(path: &Path) -> Result<(), String> {
    let bag = read_bag(path)?;
    let key_layout = bag.key_layout().ok_or("bag has no key layout")?;
    let counter_layout = bag.counter_layout().ok_or("bag has no counter layout")?;

    let names = |layout: &flowforge_core::FieldLayout| {
        layout
            .fields()
            .iter()
            .map(|f| f.ftype.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("key:     {}", names(key_layout));
    println!("counter: {}", names(counter_layout));
    println!("entries: {}", bag.len());
    println!();

    for (key, counter) in bag.iter() {
        let row = [format_side(&key), format_side(&counter)].join(" | ");
        println!("{row}");
    }
    Ok(())
}

fn format_side(side: &FieldRef<'_>) -> String {
    side.layout()
        .fields()
        .iter()
        .map(|f| {
            let value = match f.ftype.kind() {
                ValueKind::Ipv4 => side
                    .get_ipv4(f.ftype)
                    .map(|a| a.to_string())
                    .unwrap_or_else(|e| e.to_string()),
                ValueKind::Time => side
                    .get_time(f.ftype)
                    .map(|t| format!("{t}ms"))
                    .unwrap_or_else(|e| e.to_string()),
                _ => side
                    .get_unsigned(f.ftype)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|e| e.to_string()),
            };
            format!("{}={value}", f.ftype)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn combine(
    output: &Path,
    inputs: &[PathBuf],
    compression: &str,
    op: fn(&mut AggregateBag, &AggregateBag) -> Result<(), flowforge_core::BagError>,
) -> Result<(), String> {
    let mut result = read_bag(&inputs[0])?;
    for path in &inputs[1..] {
        let other = read_bag(path)?;
        op(&mut result, &other)
            .map_err(|e| format!("cannot combine {}: {e}", path.display()))?;
    }
    let compression = match compression {
        "zlib" => CompressionMethod::Zlib,
        _ => CompressionMethod::None,
    };
    let file =
        File::create(output).map_err(|e| format!("cannot create {}: {e}", output.display()))?;
    result
        .write_to(file, compression)
        .map_err(|e| format!("cannot write {}: {e}", output.display()))?;
    println!("wrote {} entries to {}", result.len(), output.display());
    Ok(())
}
