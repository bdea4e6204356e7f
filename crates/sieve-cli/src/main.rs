mod program_file;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use program_file::ProgramFile;
use serde::Serialize;
use sieve_core::bytecode::ProgType;
use sieve_core::{
    Caps, Engine, EngineConfig, Harden, HelperRegistry, Program, ProgramFlags, ProgramStats,
    RedirectTarget, SkBuffContext, XdpContext,
};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "sieve", version, about = "Sieve packet-filter engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a program and run it over packets
    Run {
        program: PathBuf,
        /// Hex-encoded frame; repeatable
        #[arg(long = "packet", short = 'p')]
        packets: Vec<String>,
        #[command(flatten)]
        load: LoadArgs,
        /// Print per-program statistics after the run
        #[arg(long)]
        stats: bool,
        #[arg(long)]
        json: bool,
    },
    /// Load a program and describe it
    Inspect {
        program: PathBuf,
        #[command(flatten)]
        load: LoadArgs,
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct LoadArgs {
    /// Never compile; always interpret
    #[arg(long)]
    interpreter: bool,
    /// Constant blinding: off, unprivileged or always
    #[arg(long, value_parser = parse_harden)]
    harden: Option<Harden>,
    /// Load without administrative capability
    #[arg(long)]
    unprivileged: bool,
}

fn parse_harden(value: &str) -> std::result::Result<Harden, String> {
    Harden::parse(value).ok_or_else(|| format!("unknown hardening level `{value}`"))
}

impl LoadArgs {
    fn engine(&self, stats: bool) -> Engine {
        let mut config = EngineConfig::from_env();
        config.stats_enabled |= stats;
        if let Some(harden) = self.harden {
            config.policy.harden = harden;
        }
        if self.interpreter {
            config.policy.jit_enable = false;
            return Engine::from_parts(config, None, HelperRegistry::with_builtins());
        }
        Engine::new(config)
    }

    fn caps(&self) -> Caps {
        if self.unprivileged { Caps::UNPRIVILEGED } else { Caps::ADMIN }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            program,
            packets,
            load,
            stats,
            json,
        } => run_program(program, packets, &load, stats, json)?,
        Commands::Inspect { program, load, json } => inspect_program(program, &load, json)?,
    }

    Ok(())
}

#[derive(Serialize)]
struct RunRecord {
    packet: usize,
    len: usize,
    result: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<String>,
}

#[derive(Serialize)]
struct RunReport {
    records: Vec<RunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<ProgramStats>,
}

fn run_program(path: PathBuf, packets: Vec<String>, load: &LoadArgs, stats: bool, json: bool) -> Result<()> {
    let file = ProgramFile::load(&path)?;
    let engine = load.engine(stats);
    let prog = file.install(&engine, load.caps())?;

    let frames = if packets.is_empty() { &file.packets } else { &packets };
    if frames.is_empty() {
        return Err(anyhow!("no packets: pass --packet or list them in {}", path.display()));
    }

    let mut worker = engine.worker();
    let mut records = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let bytes = hex::decode(frame.trim()).with_context(|| format!("packet {index} is not valid hex"))?;
        let len = bytes.len();
        let record = if file.prog_type() == ProgType::Xdp {
            let mut ctx = XdpContext::new(bytes, 1, 0);
            let action = worker.run_xdp(&prog, &mut ctx);
            let redirect = worker.redirect().take_pending().map(|target| match target {
                RedirectTarget::Device(ifindex) => format!("dev {ifindex}"),
                RedirectTarget::Map { map, key } => format!("{}[{key}]", map.name()),
            });
            RunRecord {
                packet: index,
                len,
                result: action as u32,
                action: Some(format!("{action:?}")),
                redirect,
            }
        } else {
            let mut ctx = SkBuffContext::new(bytes);
            RunRecord {
                packet: index,
                len,
                result: worker.run(&prog, &mut ctx),
                action: None,
                redirect: None,
            }
        };
        records.push(record);
    }

    let report = RunReport {
        records,
        stats: stats.then(|| prog.stats()),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for record in &report.records {
            let mut line = format!("packet {} ({} bytes): {}", record.packet, record.len, record.result);
            if let Some(action) = &record.action {
                line.push_str(&format!(" {action}"));
            }
            if let Some(redirect) = &record.redirect {
                line.push_str(&format!(" -> {redirect}"));
            }
            println!("{line}");
        }
        if let Some(stats) = &report.stats {
            println!("runs: {} time: {}ns", stats.cnt, stats.nsecs);
        }
    }

    engine.destroy(prog);
    Ok(())
}

#[derive(Serialize)]
struct ProgramReport {
    id: u64,
    name: String,
    tag: String,
    prog_type: ProgType,
    insns: usize,
    alloc_size: usize,
    flags: ProgramFlags,
    codegen: Option<&'static str>,
    image_size: Option<usize>,
    symbols: Vec<String>,
}

fn describe(engine: &Engine, prog: &Program) -> ProgramReport {
    let compiled = prog.compiled();
    let symbols = if engine.dump_raw_ok() {
        engine
            .symbols()
            .into_iter()
            .filter(|sym| sym.owner == prog.id())
            .map(|sym| format!("{:#x}-{:#x} {}", sym.range.start, sym.range.end, sym.name))
            .collect()
    } else {
        Vec::new()
    };
    ProgramReport {
        id: prog.id(),
        name: prog.name().to_owned(),
        tag: prog.tag_hex(),
        prog_type: prog.prog_type(),
        insns: prog.insn_count(),
        alloc_size: prog.alloc_size(),
        flags: prog.flags(),
        codegen: compiled.map(|code| code.codegen_name()),
        image_size: compiled.map(|code| code.size()),
        symbols,
    }
}

fn inspect_program(path: PathBuf, load: &LoadArgs, json: bool) -> Result<()> {
    let file = ProgramFile::load(&path)?;
    let engine = load.engine(false);
    let prog = file.install(&engine, load.caps())?;
    let report = describe(&engine, &prog);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("id:       {}", report.id);
        println!("name:     {}", report.name);
        println!("tag:      {}", report.tag);
        println!("type:     {}", report.prog_type.name());
        println!("insns:    {}", report.insns);
        println!("jited:    {}", report.flags.jited);
        println!("blinded:  {}", report.flags.blinded);
        if let (Some(codegen), Some(size)) = (report.codegen, report.image_size) {
            println!("image:    {size} bytes ({codegen})");
        }
        for symbol in &report.symbols {
            println!("symbol:   {symbol}");
        }
    }

    engine.destroy(prog);
    Ok(())
}
