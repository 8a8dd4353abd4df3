use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corepin::{CURRENT, CpuSet, get_affinity, pin, reset_affinity, set_affinity};
use corepin_cli::{logging, report::print_mask};
use libc::pid_t;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Increase log verbosity (repeat for more).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the affinity mask of a process or thread.
    Get(Target),
    /// Pin a process or thread to a single CPU.
    Set(Set),
    /// Apply an affinity mask given in list notation.
    Reset(Reset),
    /// Pin to a CPU, show the result and restore the previous mask.
    Pin(Set),
}

#[derive(Parser, Debug)]
struct Target {
    /// Process or thread id (0 is the calling thread).
    #[arg(long, default_value_t = CURRENT)]
    pid: pid_t,
}

#[derive(Parser, Debug)]
struct Set {
    #[command(flatten)]
    target: Target,
    /// CPU index.
    #[arg(long)]
    cpu: usize,
}

#[derive(Parser, Debug)]
struct Reset {
    #[command(flatten)]
    target: Target,
    /// CPUs in list notation, such as 0-3,8.
    #[arg(long)]
    cpus: CpuSet,
}

fn get(args: &Target) -> Result<()> {
    let set = get_affinity(args.pid).context("could not read affinity")?;
    print_mask("affinity", args.pid, &set);
    Ok(())
}

fn set(args: &Set) -> Result<()> {
    let pid = args.target.pid;
    set_affinity(pid, args.cpu).with_context(|| format!("could not pin to CPU {}", args.cpu))?;
    info!(pid, cpu = args.cpu, "pinned");
    Ok(())
}

fn reset(args: &Reset) -> Result<()> {
    let pid = args.target.pid;
    anyhow::ensure!(!args.cpus.is_empty(), "CPU list cannot be empty");
    reset_affinity(pid, &args.cpus)
        .with_context(|| format!("could not apply affinity {}", args.cpus))?;
    info!(pid, mask = %args.cpus, "affinity applied");
    Ok(())
}

fn pin_and_restore(args: &Set) -> Result<()> {
    let pid = args.target.pid;
    let guard = pin(pid, args.cpu).with_context(|| format!("could not pin to CPU {}", args.cpu))?;
    print_mask("before", pid, guard.saved());
    let pinned = get_affinity(pid).context("could not read affinity")?;
    print_mask("pinned", pid, &pinned);
    guard.restore().map_err(|(err, saved)| {
        anyhow::Error::new(err).context(format!("could not restore affinity {saved}"))
    })?;
    let restored = get_affinity(pid).context("could not read affinity")?;
    print_mask("restored", pid, &restored);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);
    match &args.command {
        Command::Get(sub) => get(sub)?,
        Command::Set(sub) => set(sub)?,
        Command::Reset(sub) => reset(sub)?,
        Command::Pin(sub) => pin_and_restore(sub)?,
    }
    Ok(())
}
