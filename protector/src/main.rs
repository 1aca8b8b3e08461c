use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use clap::Parser;
use exe::Arch;
use logger::{error, info};

use protector::error::ProtectError;
use protector::pe::PeImage;
use protector::protector::{protect, ProtectOptions};

#[derive(Parser)]
#[command(
    name = "protector",
    about = "Replaces hot instructions of a PE with jumps into an embedded bytecode interpreter"
)]
struct Args {
    /// Host executable to protect (PE32 or PE32+)
    input: PathBuf,

    /// Interpreter sidecar matching the host bitness
    #[arg(long, default_value = "Interpreter.dll")]
    interpreter: PathBuf,

    /// Output path; defaults to `<stem>.protected.<ext>` next to the input
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Install the interpreter's TLS callback
    #[arg(long)]
    tls_callbacks: bool,

    /// Seed disassembly from function pointers found in `.rdata`
    #[arg(long)]
    scan_function_pointers: bool,

    /// Log every virtualized instruction
    #[arg(long)]
    verbose: bool,
}

fn default_output(input: &Path) -> PathBuf {
    if let Some(extension) = input.extension() {
        input.with_file_name(format!(
            "{}.protected.{}",
            input.file_stem().unwrap().to_str().unwrap(),
            extension.to_str().unwrap()
        ))
    } else {
        let mut output = input.to_path_buf();
        output.set_file_name(format!(
            "{}.protected",
            input.file_name().unwrap().to_str().unwrap()
        ));
        output
    }
}

fn run(args: &Args) -> Result<(), ProtectError> {
    let data = fs::read(&args.input)?;
    let pe = PeImage::parse(&data)?;

    let bitness = match pe.arch() {
        Arch::X86 => 32,
        Arch::X64 => 64,
    };
    info!(
        "Loaded {}-bit binary ({:.2} MB)",
        bitness,
        data.len() as f64 / 1_000_000.0
    );

    let interpreter_data = fs::read(&args.interpreter)?;

    let options = ProtectOptions {
        tls_callbacks: args.tls_callbacks,
        scan_function_pointers: args.scan_function_pointers,
    };

    let protected = protect(pe, &interpreter_data, &options)?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));
    fs::write(&output, protected.to_vec())?;

    info!("Wrote output to '{}'", output.display());

    Ok(())
}

fn main() {
    let args = Args::parse();

    logger::set_verbose(args.verbose);

    if let Err(err) = run(&args) {
        error!("{}", err);
        process::exit(1);
    }
}
