//! Command-line driver: literal-flag dispatch, per-mode argument parsing,
//! and the mapping from library errors onto process exit codes.

use std::env;
use std::fs;
use std::process::ExitCode;

use clap::Parser;

use kpatchelf::elf::Elf;
use kpatchelf::elf::sym::{STT_FUNC, STT_OBJECT};
use kpatchelf::error::Error;
use kpatchelf::{diff, extract, livepatch, queries, symindex};

const EXIT_USAGE: u8 = 1;
const EXIT_ERROR: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;

#[derive(Parser)]
#[command(name = "kpatchelf --diff", disable_help_flag = true)]
struct DiffArgs {
    #[arg(long)]
    diff: bool,
    #[arg(short)]
    a: String,
    #[arg(short)]
    b: String,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf --callchain", disable_help_flag = true)]
struct CallchainArgs {
    #[arg(long)]
    callchain: bool,
    #[arg(short)]
    f: String,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf --extract", disable_help_flag = true)]
struct ExtractArgs {
    #[arg(long)]
    extract: bool,
    #[arg(short)]
    f: String,
    #[arg(short)]
    o: String,
    #[arg(short)]
    s: Vec<String>,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf --changeCallSymbol", disable_help_flag = true)]
struct ChangeCallSymbolArgs {
    #[arg(long = "changeCallSymbol")]
    change_call_symbol: bool,
    #[arg(short)]
    s: String,
    #[arg(short)]
    d: String,
    module: String,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf --disassemble", disable_help_flag = true)]
struct DisassembleArgs {
    #[arg(long)]
    disassemble: bool,
    #[arg(short)]
    f: String,
    #[arg(short)]
    s: String,
    #[arg(short)]
    r: bool,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf --referenceFrom", disable_help_flag = true)]
struct ReferenceFromArgs {
    #[arg(long = "referenceFrom")]
    reference_from: bool,
    #[arg(short)]
    f: String,
    #[arg(short)]
    s: String,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf mklivepatch", disable_help_flag = true)]
struct MklivepatchArgs {
    #[arg(short)]
    s: Vec<String>,
    #[arg(short)]
    r: Vec<String>,
    module: String,
    #[arg(short = 'V')]
    verbose: bool,
}

#[derive(Parser)]
#[command(name = "kpatchelf symbolindex", disable_help_flag = true)]
struct SymbolIndexArgs {
    #[arg(short)]
    o: String,
    #[arg(short)]
    a: Option<String>,
    #[arg(short)]
    f: String,
    #[arg(short)]
    t: String,
    name: String,
    #[arg(short = 'V')]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let _ = stderrlog::new()
        .verbosity(if verbose {
            log::Level::Debug
        } else {
            log::Level::Warn
        })
        .init();
}

fn usage() -> ExitCode {
    eprintln!(
        "Usage: kpatchelf [--diff|--callchain|--extract|--changeCallSymbol|\
         --disassemble|--referenceFrom] ...\n       \
         kpatchelf mklivepatch -s <OBJ.PATCH_FUNCTION> -r <OBJ.FUN,IDX> <MODULE.ko>\n       \
         kpatchelf symbolindex -o <OBJECT> [-a <ARCHIVE>] -f <SRC_FILE> -t {{f|v}} <SYMBOL>"
    );
    ExitCode::from(EXIT_USAGE)
}

fn parse<T: Parser>(args: &[String]) -> Result<T, ExitCode> {
    T::try_parse_from(args).map_err(|err| {
        let _ = err.print();
        ExitCode::from(EXIT_USAGE)
    })
}

fn exit_code(err: &Error) -> u8 {
    match err {
        Error::NotFound(_) => EXIT_NOT_FOUND,
        _ => EXIT_ERROR,
    }
}

fn report(err: Error) -> ExitCode {
    eprintln!("ERROR: {err}");
    ExitCode::from(exit_code(&err))
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let has = |flag: &str| args.iter().any(|a| a == flag);

    if args.get(1).map(String::as_str) == Some("mklivepatch") {
        let parsed: MklivepatchArgs = match parse(&args[1..]) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        let Some(first) = parsed.s.first() else {
            return usage();
        };
        let Some(dot) = first.find('.') else {
            return usage();
        };
        let obj_name = &first[..dot];
        if obj_name.is_empty() {
            return usage();
        }
        if parsed.r.is_empty() {
            return usage();
        }
        return match livepatch::make_livepatch(&parsed.module, obj_name, &parsed.r) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => report(err),
        };
    }

    if args.get(1).map(String::as_str) == Some("symbolindex") {
        let parsed: SymbolIndexArgs = match parse(&args[1..]) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        let kind = match parsed.t.as_str() {
            "f" => STT_FUNC,
            "v" => STT_OBJECT,
            _ => {
                eprintln!("ERROR: Invalid -t parameter. Available options: [f|v]");
                return ExitCode::from(EXIT_USAGE);
            }
        };
        let run = || -> kpatchelf::Result<u32> {
            let obj_index = match &parsed.a {
                Some(archive) => {
                    let bytes = fs::read(archive)?;
                    symindex::find_obj_index(&bytes, &parsed.f)?
                }
                None => 0,
            };
            let elf = Elf::open(&parsed.o)?;
            symindex::symbol_rank(&elf, &parsed.f, &parsed.name, kind, obj_index)
        };
        return match run() {
            Ok(rank) => {
                println!("{rank}");
                ExitCode::SUCCESS
            }
            Err(err) => report(err),
        };
    }

    if has("--diff") {
        let parsed: DiffArgs = match parse(&args) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        return match diff::diff_files(&parsed.a, &parsed.b) {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                ExitCode::SUCCESS
            }
            Err(err) => report(err),
        };
    }

    if has("--callchain") {
        let parsed: CallchainArgs = match parse(&args) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        return match queries::call_chains(&parsed.f) {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                ExitCode::SUCCESS
            }
            Err(err) => report(err),
        };
    }

    if has("--extract") {
        let parsed: ExtractArgs = match parse(&args) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        let names: Vec<String> = parsed
            .s
            .iter()
            .flat_map(|s| s.split(','))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return usage();
        }
        return match extract::extract_symbols(&parsed.f, &parsed.o, &names) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => report(err),
        };
    }

    if has("--changeCallSymbol") {
        let parsed: ChangeCallSymbolArgs = match parse(&args) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        return match queries::change_call_symbol(&parsed.module, &parsed.s, &parsed.d) {
            Ok(0) => report(Error::EmptyResult("No relocation has been replaced".into())),
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => report(err),
        };
    }

    if has("--disassemble") {
        let parsed: DisassembleArgs = match parse(&args) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        return match queries::disassemble_symbol(&parsed.f, &parsed.s, parsed.r) {
            Ok(lines) => {
                println!("{}", lines.join("\n"));
                ExitCode::SUCCESS
            }
            Err(err) => report(err),
        };
    }

    if has("--referenceFrom") {
        let parsed: ReferenceFromArgs = match parse(&args) {
            Ok(parsed) => parsed,
            Err(code) => return code,
        };
        init_logging(parsed.verbose);
        return match queries::reference_from(&parsed.f, &parsed.s) {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                ExitCode::SUCCESS
            }
            Err(err) => report(err),
        };
    }

    usage()
}
