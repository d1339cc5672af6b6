use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use agent_audit_domain::{RecordId, ThreadId};
use agent_audit_manager::AuditManager;
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "agent-audit")]
#[command(about = "Tamper-evident audit trails for agent execution threads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Threads(ThreadsArgs),
    Tree(TreeArgs),
    Verify(VerifyArgs),
    Export(ExportArgs),
    Proof(ProofArgs),
}

#[derive(Debug, Args)]
struct ThreadsArgs {
    #[arg(long)]
    audit_root: PathBuf,
    /// List every thread directory, not just roots.
    #[arg(long, default_value_t = false)]
    all: bool,
}

#[derive(Debug, Args)]
struct TreeArgs {
    #[arg(long)]
    audit_root: PathBuf,
    #[arg(long)]
    thread_id: String,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    audit_root: PathBuf,
    #[arg(long)]
    thread_id: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    audit_root: PathBuf,
    #[arg(long)]
    thread_id: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ProofArgs {
    #[arg(long)]
    audit_root: PathBuf,
    #[arg(long)]
    thread_id: String,
    #[arg(long)]
    record_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Threads(args) => threads_command(&args),
        Commands::Tree(args) => tree_command(&args),
        Commands::Verify(args) => verify_command(&args),
        Commands::Export(args) => export_command(&args),
        Commands::Proof(args) => proof_command(&args),
    }
}

fn threads_command(args: &ThreadsArgs) -> Result<()> {
    let manager = AuditManager::new(&args.audit_root);
    let ids = if args.all {
        manager.list_threads()?
    } else {
        manager.get_root_threads()?
    };
    for thread_id in ids {
        let info = manager
            .get_thread(&thread_id)?
            .ok_or_else(|| anyhow!("thread {thread_id} listed but manifest missing"))?;
        println!("{}", serde_json::to_string(&info)?);
    }
    Ok(())
}

fn tree_command(args: &TreeArgs) -> Result<()> {
    let manager = AuditManager::new(&args.audit_root);
    let thread_id = ThreadId::new(args.thread_id.clone());
    let tree = manager
        .get_thread_tree(&thread_id)?
        .ok_or_else(|| anyhow!("thread {thread_id} not found"))?;
    print_tree(&tree, 0);
    Ok(())
}

fn print_tree(node: &agent_audit_manager::LineageNode, depth: usize) {
    println!(
        "{}{} [{}] {} - {}",
        "  ".repeat(depth),
        node.thread_id,
        node.thread_kind.as_str(),
        node.status.as_str(),
        node.name
    );
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn verify_command(args: &VerifyArgs) -> Result<()> {
    let manager = AuditManager::new(&args.audit_root);
    let thread_id = ThreadId::new(args.thread_id.clone());
    let report = manager.verify_thread(&thread_id)?;

    println!(
        "thread_id={} valid={} chain_valid={} blocks_total={} blocks_verified={} transactions_contiguous={} frames_contiguous={} conversations_contiguous={}",
        report.thread_id,
        report.is_valid(),
        report.chain.valid,
        report.chain.total_blocks,
        report.chain.verified_blocks,
        report.transactions.contiguous,
        report.frames.contiguous,
        report.conversations.contiguous
    );
    if let Some(block_id) = &report.chain.first_invalid_block {
        println!("first_invalid_block={block_id}");
    }
    if let Some(error) = &report.chain.error {
        println!("chain_error={error}");
    }
    for finding in report
        .transactions
        .findings
        .iter()
        .chain(&report.frames.findings)
        .chain(&report.conversations.findings)
    {
        println!("sequence_finding={finding}");
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let manager = AuditManager::new(&args.audit_root);
    let thread_id = ThreadId::new(args.thread_id.clone());
    let entries = manager.export_thread(&thread_id)?;
    let entry_count = entries.len();

    let output = File::create(&args.out)?;
    let mut writer = BufWriter::new(output);
    for entry in &entries {
        writeln!(writer, "{}", serde_json::to_string(entry)?)?;
    }
    writer.flush()?;

    println!("exported {} records to {}", entry_count, args.out.display());
    Ok(())
}

fn proof_command(args: &ProofArgs) -> Result<()> {
    let manager = AuditManager::new(&args.audit_root);
    let thread_id = ThreadId::new(args.thread_id.clone());
    let record_id = RecordId(args.record_id.clone());
    let proof = manager
        .prove_record(&thread_id, &record_id)?
        .ok_or_else(|| anyhow!("record {record_id} not on the chain of {thread_id}"))?;
    println!("{}", serde_json::to_string_pretty(&proof)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn verify_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "agent-audit",
            "verify",
            "--audit-root",
            "/tmp/audit",
            "--thread-id",
            "run-1",
        ]);
        assert!(cli.is_ok());
        match cli {
            Ok(cli) => match cli.command {
                Commands::Verify(args) => assert_eq!(args.thread_id, "run-1"),
                _ => unreachable!(),
            },
            Err(_) => unreachable!(),
        }
    }

    #[test]
    fn threads_defaults_to_roots_only() {
        let cli = Cli::try_parse_from(["agent-audit", "threads", "--audit-root", "/tmp/audit"]);
        assert!(cli.is_ok());
        match cli {
            Ok(cli) => match cli.command {
                Commands::Threads(args) => assert!(!args.all),
                _ => unreachable!(),
            },
            Err(_) => unreachable!(),
        }
    }
}
