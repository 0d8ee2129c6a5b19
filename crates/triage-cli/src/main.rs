use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinSet;
use tracing::{info, warn};
use triage_adapters::{load_table, summarize, DataSummary, DateRange, RecordNormalizer};
use triage_core::{Sentiment, TriagedRecord};
use triage_pipeline::{CancelFlag, TriageConfig, TriagePipeline, TriageRunSummary};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "triage-cli")]
#[command(about = "Customer feedback triage command-line interface")]
struct Cli {
    /// Emit JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the canonical records inferred from an export.
    Normalize {
        file: PathBuf,
        #[arg(long)]
        min_text_avg_len: Option<f64>,
    },
    /// Volume, source mix and date range of an export.
    Summary { file: PathBuf },
    /// Classify one text; without --sentiment the configured scorer is called.
    Classify {
        text: String,
        #[arg(long, value_enum)]
        sentiment: Option<SentimentArg>,
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Score, classify and alert over one or more exports.
    Triage {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        scorer_url: Option<String>,
        #[arg(long)]
        webhook_url: Option<String>,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        no_alerts: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SentimentArg {
    Positive,
    Negative,
}

impl From<SentimentArg> for Sentiment {
    fn from(arg: SentimentArg) -> Self {
        match arg {
            SentimentArg::Positive => Sentiment::Positive,
            SentimentArg::Negative => Sentiment::Negative,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();
    let mut config = TriageConfig::from_env();

    match cli.command {
        Commands::Normalize {
            file,
            min_text_avg_len,
        } => {
            if let Some(len) = min_text_avg_len {
                config.min_text_avg_len = len;
            }
            let table = load_table(&file)?;
            let records = RecordNormalizer::new(config.inference_config())
                .normalize(&table)
                .with_context(|| format!("normalizing {}", file.display()))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for record in &records {
                    println!(
                        "[{}] {} | {} | {}",
                        record.id, record.source, record.timestamp, record.text
                    );
                }
            }
        }
        Commands::Summary { file } => {
            let table = load_table(&file)?;
            let records = RecordNormalizer::new(config.inference_config())
                .normalize(&table)
                .with_context(|| format!("normalizing {}", file.display()))?;
            let summary = summarize(&records);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", render_data_summary(&summary));
            }
        }
        Commands::Classify {
            text,
            sentiment,
            rules,
        } => {
            if rules.is_some() {
                config.rules_path = rules;
            }
            let analysis = match sentiment {
                Some(sentiment) => {
                    let sentiment = Sentiment::from(sentiment);
                    let urgency = config.urgency_rules()?.classify(&text, sentiment);
                    serde_json::json!({ "sentiment": sentiment, "urgency": urgency })
                }
                None => {
                    let pipeline = TriagePipeline::from_config(&config)?;
                    serde_json::to_value(pipeline.analyze(&text).await?)?
                }
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                println!(
                    "sentiment={} urgency={}{}",
                    analysis["sentiment"].as_str().unwrap_or("?"),
                    analysis["urgency"].as_str().unwrap_or("?"),
                    analysis["confidence"]
                        .as_f64()
                        .map(|c| format!(" confidence={c:.3}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Triage {
            files,
            scorer_url,
            webhook_url,
            rules,
            no_alerts,
        } => {
            if let Some(url) = scorer_url {
                config.scorer_url = url;
            }
            if webhook_url.is_some() {
                config.alert_webhook_url = webhook_url;
            }
            if rules.is_some() {
                config.rules_path = rules;
            }
            if no_alerts {
                config.alerts_enabled = false;
            }
            run_triage(&config, files, cli.json).await?;
        }
    }

    Ok(())
}

async fn run_triage(config: &TriageConfig, files: Vec<PathBuf>, json: bool) -> Result<()> {
    let pipeline = Arc::new(TriagePipeline::from_config(config)?);
    if config.active_webhook().is_none() {
        info!("alerting disabled; HIGH urgency records are only reported");
    }

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the record in flight");
            on_interrupt.cancel();
        }
    });

    let mut tasks = JoinSet::new();
    for (index, file) in files.iter().cloned().enumerate() {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = async {
                let table = load_table(&file)?;
                let summary = pipeline
                    .run(&table, &cancel)
                    .await
                    .with_context(|| format!("triaging {}", file.display()))?;
                Ok::<_, anyhow::Error>(summary)
            }
            .await;
            (index, result)
        });
    }

    let mut results: Vec<Option<Result<TriageRunSummary>>> = files.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.context("triage task panicked")?;
        results[index] = Some(result);
    }

    let mut failed = 0usize;
    for (file, result) in files.iter().zip(results) {
        match result {
            Some(Ok(summary)) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    print!("{}", render_run_summary(&file.display().to_string(), &summary));
                }
            }
            Some(Err(err)) => {
                failed += 1;
                eprintln!("{}: {err:#}", file.display());
            }
            None => {
                failed += 1;
                eprintln!("{}: no result", file.display());
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} files failed", files.len());
    }
    Ok(())
}

fn render_record(triaged: &TriagedRecord) -> String {
    let TriagedRecord { record, analysis } = triaged;
    format!(
        "[{}] {} ({:.3}) {} | {} | {} | {}\n",
        record.id,
        analysis.sentiment,
        analysis.confidence,
        analysis.urgency,
        record.source,
        record.timestamp,
        record.text
    )
}

fn render_run_summary(label: &str, summary: &TriageRunSummary) -> String {
    let mut out = format!("== {label} (run {})\n", summary.run_id);
    for triaged in &summary.records {
        out.push_str(&render_record(triaged));
    }
    let c = &summary.counters;
    out.push_str(&format!(
        "total={} positive={} negative={} high_urgency={} alerts_sent={} alerts_failed={}{}\n",
        c.total,
        c.positive,
        c.negative,
        c.high_urgency,
        c.alerts_sent,
        c.alerts_failed,
        if summary.cancelled { " (cancelled)" } else { "" }
    ));
    out
}

fn render_data_summary(summary: &DataSummary) -> String {
    let mut out = format!(
        "total_feedback={}\nunique_sources={}\n",
        summary.total_feedback, summary.unique_sources
    );
    for entry in &summary.source_counts {
        out.push_str(&format!("  {}: {}\n", entry.source, entry.count));
    }
    if summary.sources_truncated {
        out.push_str("  ...\n");
    }
    match &summary.date_range {
        Some(DateRange::Range { start, end }) => {
            out.push_str(&format!("date_range={start} .. {end}\n"));
        }
        Some(DateRange::Unparseable) => out.push_str("date_range=unparseable\n"),
        None => {}
    }
    out
}
