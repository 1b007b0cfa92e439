use autopost::cli::{
    Args, BestTimeConfig, ClassifyConfig, ConfigDiscovery, ExecutionMode, RunConfig, ScoreConfig, TaskLoader,
};
use autopost::store::{InMemoryTaskStore, TaskStatus};
use autopost::{AppCollaborators, AppContext, ErrorClassifier, PriorityCalculator, TimingPredictor, env};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(env::LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(env::DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Run(config) => run_mode(config).await,
        ExecutionMode::Classify(config) => classify_mode(config),
        ExecutionMode::BestTime(config) => best_time_mode(config),
        ExecutionMode::Score(config) => score_mode(config),
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
    }
}

async fn run_mode(config: RunConfig) -> anyhow::Result<()> {
    let app_config = ConfigDiscovery::load(config.config_override.as_deref())?;

    let now = Utc::now();
    let tasks = match &config.task_input {
        Some(input) => {
            info!("Loading seed tasks from {:?}", input.path());
            TaskLoader::load_tasks(input, now)?
        }
        None => Vec::new(),
    };

    if config.verbose || config.dry_run {
        let calculator = PriorityCalculator::new(app_config.priority.clone());
        let mut scored: Vec<_> = tasks
            .iter()
            .map(|task| (calculator.score_at(task, now), task))
            .collect();
        scored.sort_by_key(|(score, task)| (score.queue_priority(), task.scheduled_time));
        println!("📝 Loaded {} tasks", tasks.len());
        for (score, task) in &scored {
            println!(
                "  {:>5.1} {:<9} {} {} [{}] due {}",
                score.value,
                score.level.to_string(),
                task.id,
                task.project_id,
                task.content_type,
                task.scheduled_time.to_rfc3339()
            );
        }
    }

    if config.dry_run {
        println!("🔍 Dry run mode - nothing was scheduled");
        return Ok(());
    }

    let store = Arc::new(InMemoryTaskStore::new());
    store.insert_all(tasks).await;

    let app = AppContext::new(app_config, AppCollaborators::in_memory(store.clone())).await?;
    let stats = app.run_for(config.duration).await?;

    let all = store.all_tasks().await;
    let count = |status: TaskStatus| all.iter().filter(|task| task.status == status).count();
    println!("📊 Run summary");
    println!("  Published: {}", stats.successful);
    println!("  Failed:    {}", stats.failed);
    println!("  Retried:   {}", stats.retried);
    println!("  Timed out: {}", stats.timed_out);
    println!(
        "  Store:     {} completed, {} pending, {} retry, {} failed",
        count(TaskStatus::Completed),
        count(TaskStatus::Pending),
        count(TaskStatus::Retry),
        count(TaskStatus::Failed)
    );
    if config.verbose {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

fn classify_mode(config: ClassifyConfig) -> anyhow::Result<()> {
    let classification = ErrorClassifier::default().classify_text(&config.message, config.attempt);

    if config.json {
        println!("{}", serde_json::to_string_pretty(&classification)?);
        return Ok(());
    }

    println!("Category:       {}", classification.category);
    println!("Should retry:   {}", classification.should_retry);
    match classification.retry_delay_seconds {
        Some(delay) => println!("Retry delay:    {}s", delay),
        None => println!("Retry delay:    -"),
    }
    println!("Human needed:   {}", classification.needs_human_intervention);
    if let Some(matched) = classification.matched_by {
        println!("Matched by:     {}", matched);
    }
    Ok(())
}

fn best_time_mode(config: BestTimeConfig) -> anyhow::Result<()> {
    let app_config = ConfigDiscovery::load(config.config_override.as_deref())?;
    let predictor = TimingPredictor::new(app_config.timing)?;

    let earliest = Utc::now();
    let latest = config
        .window_end(earliest)
        .ok_or_else(|| anyhow::anyhow!("--within {} hours is out of range", config.within_hours))?;
    let prediction = predictor.predict(&config.content_type, config.level, earliest, latest)?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
        return Ok(());
    }

    println!("Best time:   {}", prediction.best_time.to_rfc3339());
    println!("Score:       {:.1}", prediction.score);
    println!("Confidence:  {:.2}", prediction.confidence);
    println!("Rationale:   {}", prediction.rationale);
    for alternative in &prediction.alternatives {
        println!("  alt {} ({:.1})", alternative.time.to_rfc3339(), alternative.score);
    }
    Ok(())
}

fn score_mode(config: ScoreConfig) -> anyhow::Result<()> {
    let app_config = ConfigDiscovery::load(config.config_override.as_deref())?;
    let calculator = PriorityCalculator::new(app_config.priority);

    let now = Utc::now();
    let tasks = TaskLoader::load_tasks(&config.task_input, now)?;
    let scores: Vec<_> = tasks.iter().map(|task| (task, calculator.score_at(task, now))).collect();

    if config.json {
        let rows: Vec<serde_json::Value> = scores
            .iter()
            .map(|(task, score)| {
                serde_json::json!({
                    "project_id": task.project_id,
                    "payload_ref": task.payload_ref,
                    "scheduled_time": task.scheduled_time,
                    "score": score,
                    "queue_priority": score.queue_priority(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    for (task, score) in &scores {
        println!(
            "{:>5.1} {:<9} queue={:<3} {} {}",
            score.value,
            score.level.to_string(),
            score.queue_priority(),
            task.project_id,
            task.payload_ref
        );
    }
    Ok(())
}
