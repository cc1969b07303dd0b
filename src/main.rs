use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use scansage::config::AppConfig;
use scansage::depgraph::DependencyGraphClient;
use scansage::inference::OllamaClient;
use scansage::router::QueryRouter;
use scansage::store::{EvidenceStore, Finding, Scan};
use scansage::workflow::WorkflowHistoryClient;

#[derive(Parser)]
#[command(name = "scansage")]
#[command(about = "Query assistant for security scan results, workflows, and weaknesses")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a natural-language query against the evidence layer
    Query {
        /// The query text
        query: String,

        /// Team context for team-scoped answers
        #[arg(short, long)]
        team: Option<String>,
    },

    /// Manage curated knowledge-base entries
    Kb {
        #[command(subcommand)]
        command: KbCommand,
    },

    /// Seed the local database with demo scans and findings
    Seed,
}

#[derive(Subcommand)]
enum KbCommand {
    /// Add a question/answer pair
    Add {
        #[arg(short, long)]
        question: String,
        #[arg(short, long)]
        answer: String,
        /// Restrict the entry to one team
        #[arg(short, long)]
        team: Option<String>,
    },

    /// List active entries
    List {
        #[arg(short, long)]
        team: Option<String>,
    },

    /// Rewrite an entry's question and answer
    Update {
        /// Entry id
        id: Uuid,
        #[arg(short, long)]
        question: String,
        #[arg(short, long)]
        answer: String,
    },

    /// Remove an entry
    Remove {
        /// Entry id
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::from_env();
    let store = Arc::new(EvidenceStore::open(&config.database_path)?);

    match args.command {
        Command::Query { query, team } => {
            let inference = Arc::new(OllamaClient::new(&config.inference));
            let history = Arc::new(WorkflowHistoryClient::new(&config.workflow));
            let depgraph = Arc::new(DependencyGraphClient::new(&config.depgraph));
            let router = QueryRouter::new(store, inference, history, depgraph);

            let response = router.process(&query, team.as_deref()).await?;
            println!("{}", response.answer);
            println!(
                "\n[source: {:?}, confidence: {:.2}]",
                response.source, response.confidence
            );
            if let Some(data) = response.data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
        }

        Command::Kb { command } => match command {
            KbCommand::Add {
                question,
                answer,
                team,
            } => {
                let entry =
                    store.create_knowledge_entry(&question, &answer, team.as_deref(), Some("cli"))?;
                println!("Created knowledge entry {}", entry.kb_id);
            }
            KbCommand::List { team } => {
                for entry in store.active_knowledge_entries(team.as_deref())? {
                    println!(
                        "{}  [{}] used {} times\n  Q: {}\n  A: {}",
                        entry.kb_id,
                        entry.team.as_deref().unwrap_or("all teams"),
                        entry.usage_count,
                        entry.question,
                        entry.answer
                    );
                }
            }
            KbCommand::Update {
                id,
                question,
                answer,
            } => {
                store.update_knowledge_entry(id, &question, &answer)?;
                println!("Updated knowledge entry {}", id);
            }
            KbCommand::Remove { id } => {
                store.delete_knowledge_entry(id)?;
                println!("Removed knowledge entry {}", id);
            }
        },

        Command::Seed => {
            seed_demo_data(&store)?;
            println!("Seeded demo data into {}", config.database_path);
        }
    }

    Ok(())
}

fn seed_demo_data(store: &EvidenceStore) -> Result<()> {
    info!("Seeding demo scans and findings");

    store.insert_cwe("CWE-89", "SQL Injection")?;
    store.insert_cwe("CWE-79", "Cross-site Scripting")?;
    store.insert_cwe("CWE-798", "Hard-coded Credentials")?;

    let green_scan = Scan {
        scan_id: Uuid::new_v4(),
        workflow_id: "scan-billing-api-20260820".to_string(),
        run_id: None,
        team: "payments".to_string(),
        project: Some("billing-api".to_string()),
        scan_type: Some("SAST".to_string()),
        status: "COMPLETED".to_string(),
        started_at: Utc::now() - Duration::days(10),
        completed_at: Some(Utc::now() - Duration::days(10) + Duration::minutes(12)),
    };
    store.insert_scan(&green_scan)?;

    let latest_scan = Scan {
        scan_id: Uuid::new_v4(),
        workflow_id: "scan-billing-api-20260828".to_string(),
        run_id: None,
        team: "payments".to_string(),
        project: Some("billing-api".to_string()),
        scan_type: Some("SAST".to_string()),
        status: "FAILED".to_string(),
        started_at: Utc::now() - Duration::days(2),
        completed_at: Some(Utc::now() - Duration::days(2) + Duration::minutes(41)),
    };
    store.insert_scan(&latest_scan)?;

    let demo_findings = [
        (green_scan.scan_id, "CWE-89", "HIGH", "SQL injection in invoice search"),
        (green_scan.scan_id, "CWE-79", "MEDIUM", "Reflected XSS in error page"),
        (latest_scan.scan_id, "CWE-89", "HIGH", "SQL injection in invoice search"),
        (latest_scan.scan_id, "CWE-798", "CRITICAL", "Hard-coded database password"),
    ];
    for (scan_id, cwe_id, severity, title) in demo_findings {
        store.insert_finding(&Finding {
            finding_id: Uuid::new_v4(),
            scan_id,
            cwe_id: cwe_id.to_string(),
            severity: severity.to_string(),
            title: title.to_string(),
            description: Some(format!("{} detected by static analysis.", title)),
        })?;
    }

    Ok(())
}
