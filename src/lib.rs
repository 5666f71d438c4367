//! Command-line driver for the RISC-V static binary translator.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
use clap::Parser;

use sbt_translate::{Options, RegMode, Translator};

pub mod smoke;

/// Translate RISC-V 32-bit ELF objects into a host object via Cranelift IR.
#[derive(Parser)]
#[command(name = "sbt", version, about)]
pub struct Cli {
    /// Input object files.
    #[arg(value_name = "input.o")]
    pub inputs: Vec<PathBuf>,

    /// Output file (default: first input with a `.sbt.o` extension).
    #[arg(short = 'o', value_name = "path")]
    pub output: Option<PathBuf>,

    /// Emit only the syscall handler module; requires -o.
    #[arg(long = "gen-sc-handler")]
    pub gen_sc_handler: bool,

    /// Run the built-in smoke path.
    #[arg(long)]
    pub test: bool,

    /// Register file mode.
    #[arg(long, value_name = "globals|locals|abi", default_value = "globals")]
    pub regs: String,

    /// Guest stack size in bytes.
    #[arg(long = "stack-size", value_name = "N")]
    pub stack_size: Option<u32>,

    /// Generate a diagnostic printf in the icaller default case.
    #[arg(long = "use-libc")]
    pub use_libc: bool,

    /// Address-to-source sidecar file.
    #[arg(long = "a2s", value_name = "path")]
    pub a2s: Option<PathBuf>,

    /// Disable icaller generation (no soft-float wrappers).
    #[arg(long = "hard-float-abi")]
    pub hard_float_abi: bool,

    /// Route repeated fixed-offset stack accesses through dedicated slots.
    #[arg(long = "opt-stack")]
    pub opt_stack: bool,

    /// Check that data relocations stay inside their section.
    #[arg(long = "sym-bounds-check")]
    pub sym_bounds_check: bool,

    /// Model fflags/frm/fcsr on the rv_fcsr global.
    #[arg(long = "enable-fcsr")]
    pub enable_fcsr: bool,

    /// Guard float-to-int conversions against NaN.
    #[arg(long = "enable-fcvt-validation")]
    pub enable_fcvt_validation: bool,

    /// Synchronise local registers with the globals around external calls.
    #[arg(long = "sync-on-external-calls")]
    pub sync_on_external_calls: bool,

    /// Include the F registers in register synchronisation.
    #[arg(long = "sync-fregs")]
    pub sync_fregs: bool,

    /// Restrict icaller dispatch to integer-only signatures.
    #[arg(long = "icall-int-only")]
    pub icall_int_only: bool,

    /// Log the assembly rendition of every translated instruction.
    #[arg(long = "commented-asm")]
    pub commented_asm: bool,

    /// Redirect the log to a file.
    #[arg(long = "log-file", value_name = "path")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    fn options(&self) -> anyhow::Result<Options> {
        let regs: RegMode = self
            .regs
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let mut opts = Options {
            regs,
            use_libc: self.use_libc,
            a2s: self.a2s.clone(),
            hard_float_abi: self.hard_float_abi,
            opt_stack: self.opt_stack,
            sym_bounds_check: self.sym_bounds_check,
            enable_fcsr: self.enable_fcsr,
            enable_fcvt_validation: self.enable_fcvt_validation,
            sync_on_external_calls: self.sync_on_external_calls,
            sync_fregs: self.sync_fregs,
            icall_int_only: self.icall_int_only,
            commented_asm: self.commented_asm,
            ..Options::default()
        };
        if let Some(n) = self.stack_size {
            opts.stack_size = n;
        }
        Ok(opts)
    }
}

/// Default output path: the first input with its extension swapped.
pub fn default_output(first_input: &Path) -> PathBuf {
    first_input.with_extension("sbt.o")
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(path) = &cli.log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    init_logging(&cli)?;
    let opts = cli.options()?;

    if cli.test {
        return smoke::run(opts);
    }

    if cli.gen_sc_handler {
        let Some(output) = cli.output.as_deref() else {
            bail!("--gen-sc-handler requires -o");
        };
        let translator = Translator::new(opts)?;
        let bytes = translator.finish_syscall_module()?;
        return write_output(output, &bytes);
    }

    if cli.inputs.is_empty() {
        bail!("no input files");
    }
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output(&cli.inputs[0]));

    let mut translator = Translator::new(opts)?;
    for input in &cli.inputs {
        translator.translate_file(input)?;
    }

    if let Some(a2s) = &cli.a2s {
        let mut f = std::fs::File::create(a2s)
            .with_context(|| format!("cannot create {}", a2s.display()))?;
        for line in translator.a2s_lines() {
            writeln!(f, "{line}")?;
        }
    }

    // nothing is written until the whole translation succeeded
    let bytes = translator.finish()?;
    write_output(&output, &bytes)
}

fn write_output(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("cannot write {}", path.display()))?;
    log::info!("wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Entry point used by the binary: parse, run, report.
pub fn exec() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap renders help/version itself
            let _ = e.print();
            return if e.use_stderr() { 2 } else { 0 };
        }
    };
    match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("sbt: error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("Cause: {cause}");
            }
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_swaps_extension() {
        assert_eq!(
            default_output(Path::new("prog.o")),
            PathBuf::from("prog.sbt.o")
        );
        assert_eq!(
            default_output(Path::new("dir/prog.o")),
            PathBuf::from("dir/prog.sbt.o")
        );
    }

    #[test]
    fn regs_mode_parses() {
        let cli = Cli::parse_from(["sbt", "--regs", "locals", "x.o"]);
        assert!(matches!(cli.options().unwrap().regs, RegMode::Locals));
    }
}
