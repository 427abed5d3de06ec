use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use learnflow_core::{
    api::PortalClient,
    auth::{AuthSessionManager, FileTokenStore, HttpTokenRefresher, MemoryTokenStore, TokenStore},
    config::Config,
    flow::{FlowNavigator, LearningFlowPhase},
    http_client::HttpClient,
    model::{ChatMessage, Citation, ParagraphStep, SelfAssessmentRating, SessionSummary, StepUpdateRequest},
    stream::{StreamHandler, StreamOutcome},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "learning portal client", long_about = None)]
struct Cli {
    /// JSON or TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Rating {
    Understood,
    Questions,
    Difficult,
}

impl From<Rating> for SelfAssessmentRating {
    fn from(r: Rating) -> Self {
        match r {
            Rating::Understood => SelfAssessmentRating::Understood,
            Rating::Questions => SelfAssessmentRating::Questions,
            Rating::Difficult => SelfAssessmentRating::Difficult,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Step {
    Content,
    Practice,
    Summary,
    Completed,
}

impl From<Step> for ParagraphStep {
    fn from(s: Step) -> Self {
        match s {
            Step::Content => ParagraphStep::Content,
            Step::Practice => ParagraphStep::Practice,
            Step::Summary => ParagraphStep::Summary,
            Step::Completed => ParagraphStep::Completed,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question in a tutor chat session (prints deltas live)
    ChatStream {
        #[arg(long)]
        session: String,
        #[arg(short, long, help = "Message from the student")]
        message: String,
    },
    /// Open a new tutor chat session for a paragraph
    NewSession {
        #[arg(long)]
        paragraph: i64,
    },
    /// Record a paragraph progress step
    Step {
        #[arg(long)]
        paragraph: i64,
        #[arg(long, value_enum)]
        step: Step,
        #[arg(long)]
        time_spent: Option<u64>,
    },
    /// Submit a self-assessment for a paragraph
    Assess {
        #[arg(long)]
        paragraph: i64,
        #[arg(long, value_enum)]
        rating: Rating,
    },
    /// Walk a paragraph through reading, questions and assessment
    Walkthrough {
        #[arg(long)]
        paragraph: i64,
        /// Answers for the embedded questions, in order
        #[arg(long = "answer")]
        answers: Vec<String>,
        /// Ratings to submit, one per assessment round
        #[arg(long = "rating", value_enum, required = true)]
        ratings: Vec<Rating>,
    },
}

/// Prints assistant deltas to stdout as they arrive.
struct PrintHandler {
    saw_delta: bool,
}

impl StreamHandler for PrintHandler {
    fn on_delta(&mut self, fragment: &str) {
        self.saw_delta = true;
        print!("{fragment}");
        io::stdout().flush().ok();
    }

    fn on_complete(&mut self, message: ChatMessage, session: SessionSummary, citations: Vec<Citation>) {
        if self.saw_delta {
            println!();
        } else {
            println!("{}", message.content);
        }
        eprintln!(
            "[done: session {} has {} messages, {} citations]",
            session.id,
            session.message_count,
            citations.len()
        );
    }

    fn on_error(&mut self, error: String) {
        if self.saw_delta {
            println!();
        }
        eprintln!("[error: {error}]");
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut cfg = match path {
        Some(p) => Config::from_path(p)?,
        None => Config::default(),
    };
    if let Ok(url) = std::env::var("LEARNFLOW_BASE_URL") {
        cfg.api.base_url = url;
        cfg.validate()?;
    }
    Ok(cfg)
}

fn build_auth(cfg: &Config) -> anyhow::Result<Arc<AuthSessionManager>> {
    let store: Arc<dyn TokenStore> = match &cfg.auth.token_file {
        Some(path) => Arc::new(FileTokenStore::new(path)),
        None => Arc::new(MemoryTokenStore::default()),
    };
    let http = HttpClient::from_config(&cfg.http, &cfg.stream)?;
    let refresher = Arc::new(HttpTokenRefresher::new(http, cfg.base_url()));
    let auth = Arc::new(AuthSessionManager::new(refresher, store)?);

    if let Ok(token) = std::env::var("LEARNFLOW_TOKEN") {
        let refresh = std::env::var("LEARNFLOW_REFRESH_TOKEN").ok();
        auth.sign_in(&token, refresh.as_deref())?;
    }
    if auth.credential().is_none() {
        tracing::warn!("no access token available; requests will be sent unauthenticated");
    }
    Ok(auth)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;
    let auth = build_auth(&cfg)?;
    let client = Arc::new(PortalClient::from_config(&cfg, auth)?);

    match cli.command {
        Commands::ChatStream { session, message } => {
            let mut handler = PrintHandler { saw_delta: false };
            let outcome = client
                .stream_chat_message(&session, &message, &mut handler)
                .await?;
            if outcome != StreamOutcome::Completed {
                anyhow::bail!("chat stream did not complete ({outcome:?})");
            }
        }
        Commands::NewSession { paragraph } => {
            let session = client.create_chat_session(paragraph).await?;
            println!("{}", session.id);
        }
        Commands::Step {
            paragraph,
            step,
            time_spent,
        } => {
            let req = StepUpdateRequest {
                step: step.into(),
                time_spent,
            };
            let progress = client.update_step(paragraph, &req).await?;
            println!("{progress:?}");
        }
        Commands::Assess { paragraph, rating } => {
            let req = learnflow_core::model::SelfAssessmentRequest {
                rating: rating.into(),
                practice_score: None,
                time_spent: None,
            };
            let result = client.submit_self_assessment(paragraph, &req).await?;
            println!("{result:?}");
        }
        Commands::Walkthrough {
            paragraph,
            answers,
            ratings,
        } => {
            let questions = client.list_questions(paragraph).await?;
            let nav = FlowNavigator::new(client.clone(), cfg.progress.max_time_spent_secs);
            nav.open(paragraph, questions);
            let mut snap = nav.finish_reading().await?;

            let mut answers = answers.into_iter();
            while snap.phase == LearningFlowPhase::Questions {
                let Some(q) = nav.current_question() else {
                    snap = nav.complete_questions().await?;
                    continue;
                };
                let Some(answer) = answers.next() else {
                    anyhow::bail!("no answer given for question {} ({})", q.id, q.prompt);
                };
                let (result, next) = nav.answer_question(&answer).await?;
                println!(
                    "question {}: {}",
                    q.id,
                    if result.is_correct { "correct" } else { "incorrect" }
                );
                snap = next;
            }

            for rating in ratings {
                if snap.phase == LearningFlowPhase::Chat {
                    snap = nav.close_chat()?;
                }
                snap = nav.submit_rating(rating.into()).await?;
                println!("round {}: {}", snap.round, snap.phase);
                if snap.phase == LearningFlowPhase::Completed {
                    break;
                }
            }

            match nav.completion_summary() {
                Ok(summary) => println!("{summary:#?}"),
                Err(_) => eprintln!("paragraph not completed; stopped in {}", snap.phase),
            }
        }
    }

    Ok(())
}
