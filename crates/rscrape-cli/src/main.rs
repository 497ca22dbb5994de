use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use rscrape_core::{validate_day, validate_month, validate_year, CalendarDate, DateRange};
use rscrape_source::{is_valid_channel_name, ChannelPrompt, FixtureSource, SubmissionSource};
use rscrape_sync::{reddit_pipeline, DownloadMode, ScrapeConfig, ScrapePipeline, ScrapeRequest};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rscrape")]
#[command(about = "Downloads media linked from a subreddit's submissions within a date range")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    args: RunArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest submissions and download their media (default).
    Scrape(RunArgs),
    /// Print harvested submissions as JSON lines without downloading.
    Harvest(RunArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Log progress at info level.
    #[arg(short, long)]
    verbose: bool,

    /// Download every file concurrently instead of one at a time.
    #[arg(long = "async", visible_alias = "concurrent")]
    concurrent: bool,

    #[arg(long, value_name = "MM.DD.YYYY", value_parser = parse_date)]
    begin_date: Option<CalendarDate>,

    #[arg(long, value_name = "MM.DD.YYYY", value_parser = parse_date)]
    end_date: Option<CalendarDate>,

    #[arg(long, visible_alias = "channel")]
    subreddit: Option<String>,

    /// YAML configuration file; RSCRAPE_* variables still apply on top.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Serve submissions from a JSON fixture instead of Reddit.
    #[arg(long, value_name = "FILE")]
    fixtures: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Scrape,
    Harvest,
}

fn parse_date(input: &str) -> Result<CalendarDate, String> {
    parse_date_until(input, Utc::now().year())
}

/// Flag dates obey the same year bounds as the interactive prompt.
fn parse_date_until(input: &str, current_year: i32) -> Result<CalendarDate, String> {
    let date = CalendarDate::parse_dotted(input).map_err(|err| err.to_string())?;
    validate_year(date.year(), current_year).map_err(|err| err.to_string())?;
    Ok(date)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (action, args) = match cli.command {
        Some(Commands::Scrape(args)) => (Action::Scrape, args),
        Some(Commands::Harvest(args)) => (Action::Harvest, args),
        None => (Action::Scrape, cli.args),
    };

    init_tracing(args.verbose)?;

    let mut config = match &args.config {
        Some(path) => ScrapeConfig::load(path)?,
        None => ScrapeConfig::from_env(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }

    let request = {
        let stdin = io::stdin();
        let stderr = io::stderr();
        build_request(&args, &mut stdin.lock(), &mut stderr.lock(), Utc::now().year())?
    };
    let mut prompt = TerminalChannelPrompt;

    match &args.fixtures {
        Some(path) => {
            let pipeline = ScrapePipeline::new(config, FixtureSource::load(path)?)?;
            execute(&pipeline, action, &request, &mut prompt).await
        }
        None => {
            let pipeline = reddit_pipeline(config)?;
            execute(&pipeline, action, &request, &mut prompt).await
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(if verbose { "info" } else { "warn" }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

async fn execute<S: SubmissionSource>(
    pipeline: &ScrapePipeline<S>,
    action: Action,
    request: &ScrapeRequest,
    prompt: &mut dyn ChannelPrompt,
) -> Result<()> {
    match action {
        Action::Scrape => {
            let summary = pipeline.run_once(request, prompt).await?;
            println!("Scraping complete.");
            println!(
                "run_id={} channel={} days={} harvested={} files={} bytes={} mode={} dir={}",
                summary.run_id,
                summary.channel,
                summary.buckets,
                summary.harvested,
                summary.downloaded_files,
                summary.downloaded_bytes,
                summary.mode,
                summary.output_dir
            );
        }
        Action::Harvest => {
            let harvest = pipeline.harvest_only(request, prompt).await?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for record in &harvest.records {
                serde_json::to_writer(&mut out, record)?;
                writeln!(out)?;
            }
        }
    }
    Ok(())
}

/// Fills in whatever the command line left out by asking on `input`.
fn build_request<R: BufRead, W: Write>(
    args: &RunArgs,
    input: &mut R,
    output: &mut W,
    current_year: i32,
) -> Result<ScrapeRequest> {
    let begin = match args.begin_date {
        Some(date) => date,
        None => {
            let date = prompt_date(input, output, "start", current_year)?;
            writeln!(output, "\nStart date is: {date}.")?;
            date
        }
    };
    let end = match args.end_date {
        Some(date) => date,
        None => {
            let date = prompt_date(input, output, "end", current_year)?;
            writeln!(output, "\nEnd date is: {date}.")?;
            date
        }
    };
    let range = DateRange::new(begin, end)?;

    let channel = match args.subreddit.as_deref().and_then(normalize_channel) {
        Some(channel) => channel,
        None => {
            writeln!(output, "\nEnter subreddit you wish to scrape: ")?;
            prompt_channel(input, output)?
        }
    };

    let mode = if args.concurrent {
        DownloadMode::Concurrent
    } else {
        DownloadMode::Sequential
    };

    Ok(ScrapeRequest {
        channel,
        range,
        mode,
    })
}

fn read_answer<R: BufRead>(input: &mut R) -> Result<String> {
    let mut line = String::new();
    if input.read_line(&mut line).context("reading answer")? == 0 {
        bail!("input closed before an answer was given");
    }
    Ok(line.trim().to_string())
}

/// Asks `question` until `accept` takes the answer.
fn ask_until_valid<R, W, T>(
    input: &mut R,
    output: &mut W,
    question: &str,
    accept: impl Fn(&str) -> Option<T>,
) -> Result<T>
where
    R: BufRead,
    W: Write,
{
    loop {
        write!(output, "{question}")?;
        output.flush()?;
        let answer = read_answer(input)?;
        match accept(&answer) {
            Some(value) => return Ok(value),
            None => writeln!(output, "\n\t{answer} is an invalid number.")?,
        }
    }
}

fn prompt_year<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    start_or_end: &str,
    current_year: i32,
) -> Result<i32> {
    let question = format!("\nEnter the year you would like to {start_or_end} your range: ");
    ask_until_valid(input, output, &question, |answer| {
        answer
            .parse::<i32>()
            .ok()
            .and_then(|year| validate_year(year, current_year).ok())
    })
}

fn prompt_month<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<u32> {
    ask_until_valid(input, output, "\nEnter month: ", |answer| {
        answer
            .parse::<u32>()
            .ok()
            .and_then(|month| validate_month(month).ok())
    })
}

fn prompt_day<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    year: i32,
    month: u32,
) -> Result<u32> {
    ask_until_valid(input, output, "\nEnter day: ", |answer| {
        answer
            .parse::<u32>()
            .ok()
            .and_then(|day| validate_day(year, month, day).ok())
    })
}

fn prompt_date<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    start_or_end: &str,
    current_year: i32,
) -> Result<CalendarDate> {
    let year = prompt_year(input, output, start_or_end, current_year)?;
    let month = prompt_month(input, output)?;
    let day = prompt_day(input, output, year, month)?;
    Ok(CalendarDate::new(year, month, day)?)
}

/// Accepts `pics`, `r/pics` and `/r/pics`.
fn normalize_channel(raw: &str) -> Option<String> {
    let name = raw.trim().trim_start_matches('/');
    let name = name.strip_prefix("r/").unwrap_or(name).trim_end_matches('/');
    is_valid_channel_name(name).then(|| name.to_string())
}

fn prompt_channel<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<String> {
    loop {
        write!(output, "www.reddit.com/r/")?;
        output.flush()?;
        if let Some(channel) = normalize_channel(&read_answer(input)?) {
            return Ok(channel);
        }
    }
}

/// Re-asks on the terminal when a subreddit turns out not to exist.
struct TerminalChannelPrompt;

#[async_trait]
impl ChannelPrompt for TerminalChannelPrompt {
    async fn replacement_channel(&mut self, rejected: &str) -> Result<Option<String>> {
        let rejected = rejected.to_string();
        tokio::task::spawn_blocking(move || {
            let stdin = io::stdin();
            let stderr = io::stderr();
            ask_replacement(&mut stdin.lock(), &mut stderr.lock(), &rejected)
        })
        .await
        .context("joining terminal prompt")?
    }
}

fn ask_replacement<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    rejected: &str,
) -> Result<Option<String>> {
    writeln!(output, "\n/r/{rejected} does not exist. Enter a different subreddit: ")?;
    match prompt_channel(input, output) {
        Ok(channel) => Ok(Some(channel)),
        Err(_) => Ok(None),
    }
}
