mod cli;

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tower::ServiceExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use logbook_scraper::config::{self, LogbookConfig};
use logbook_scraper::{convert, metadata, prefetch};
use logbook_scraper::{Credentials, LogbookError, LogbookService, RunReport, RunRequest};

use cli::{Cli, Command, ConvertArgs, ExtractArgs, PrefetchArgs, SearchArgs};

/// 一覧表示するエントリ数
const PREVIEW_ENTRIES: usize = 10;
const PASSWORD_ENV: &str = "LOGBOOK_PASSWORD";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let result = match cli.command {
        Command::Search(args) => run_search(args).await,
        Command::Extract(args) => run_extract(args),
        Command::Prefetch(args) => run_prefetch(args).await,
        Command::Convert(args) => run_convert(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("エラー: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// 失敗した段階名を付けて anyhow::Error に変換
fn stage_error(e: LogbookError) -> anyhow::Error {
    let stage = e.stage();
    anyhow::Error::new(e).context(format!("{} の段階で中断しました", stage))
}

async fn run_search(args: SearchArgs) -> Result<()> {
    let file = LogbookConfig::load_optional(args.config.as_deref()).map_err(stage_error)?;
    let run_config = config::resolve(file.as_ref(), &args.overrides()).map_err(stage_error)?;
    let credentials = read_credentials(args.username.clone()).context("認証情報を読み込めません")?;

    info!("Output directory: {:?}", run_config.output_dir);
    let report = LogbookService::new()
        .oneshot(RunRequest::new(run_config, credentials))
        .await
        .map_err(stage_error)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, args.quiet);
    }
    Ok(())
}

fn print_report(report: &RunReport, quiet: bool) {
    if !quiet {
        for entry in report.entries.iter().take(PREVIEW_ENTRIES) {
            println!("Log Entry: {} - {}", entry.title, entry.url);
        }
        if report.entries_kept() > PREVIEW_ENTRIES {
            println!("... ({} more)", report.entries_kept() - PREVIEW_ENTRIES);
        }
    }
    if let Some(index) = &report.results_index {
        println!("Full results saved to {}", index.display());
    }

    println!(
        "Entries: {} found, {} kept / Files: {} downloaded, {} failed / {:.2}s",
        report.entries_found,
        report.entries_kept(),
        report.downloaded.len(),
        report.failures.len(),
        report.elapsed.as_secs_f64()
    );
    if !report.skipped.is_empty() {
        println!("Skipped {} entries without a run number", report.skipped.len());
    }
    for failure in &report.failures {
        println!(
            "  failed: entry {} {}: {}",
            failure.entry_id,
            failure.attachment.as_deref().unwrap_or("(attachment list)"),
            failure.message
        );
    }
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let output_dir = args.resolved_output_dir();
    let listings = metadata::extract(&args.metadata_dir, &output_dir, &args.options())
        .with_context(|| format!("{} の抽出に失敗しました", args.metadata_dir.display()))?;

    for listing in &listings {
        println!("Saved: {} ({} runs)", listing.path.display(), listing.runs);
    }
    println!("{} listings written to {}", listings.len(), output_dir.display());
    Ok(())
}

async fn run_prefetch(args: PrefetchArgs) -> Result<()> {
    let runs = args.run_numbers();
    let report = prefetch::prefetch_runs(&args.config(), &runs).await;

    println!(
        "Requested {} runs, {} failed",
        report.requested.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        println!("  failed: {}", failure.message);
    }
    Ok(())
}

async fn run_convert(args: ConvertArgs) -> Result<()> {
    let config = args.config();
    let report = if args.check_only {
        convert::check_all(&args.parent_dir, &config).await
    } else {
        let names = match &args.filename_list {
            Some(list) => convert::read_filenames(list).map_err(stage_error)?,
            None => Vec::new(),
        };
        convert::convert_all(&args.parent_dir, &names, &config).await
    }
    .map_err(stage_error)?;

    println!(
        "PDFs: {} processed, {} skipped, {} failed",
        report.converted.len(),
        report.skipped.len(),
        report.failures.len()
    );
    if let Some(log) = &report.error_log {
        println!("Errors logged to {}", log.display());
    }
    Ok(())
}

/// ユーザー名は引数/環境変数、パスワードは環境変数。無ければ端末で入力を求める
fn read_credentials(username: Option<String>) -> Result<Credentials> {
    let username = match username {
        Some(username) => username,
        None => prompt("Logbook username: ")?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => prompt("Logbook password: ")?,
    };
    Ok(Credentials::new(username, password))
}

fn prompt(label: &str) -> Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{}", label)?;
    stderr.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    anyhow::ensure!(!value.is_empty(), "{}が入力されていません", label.trim_end_matches(": "));
    Ok(value)
}
