use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::time::Duration;

use query_sync::api::{keys, ApiKey, NewProject, Rule, RuleFilter, SyncedClient};
use query_sync::{config, logging, Query};

#[derive(Parser, Debug)]
#[command(name = "query-sync")]
#[command(about = "Cached command-line client for the compliance backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/query-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Project to use when a command needs one
  #[arg(short, long)]
  project: Option<String>,

  /// Log at debug level unless QUERY_SYNC_LOG says otherwise
  #[arg(long)]
  debug: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List projects
  Projects,
  /// Show one project
  Project { id: String },
  /// List a project's guidelines
  Guidelines { project: Option<String> },
  /// List rules
  Rules {
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    category: Option<String>,
  },
  DeleteRule { rule: String },
  /// Rewrite a rule following instructions
  RefineRule { rule: String, instructions: String },
  DeleteGuideline { guideline: String },
  CreateProject {
    name: String,
    #[arg(long)]
    description: Option<String>,
  },
  DeleteProject { id: String },
  /// Keep a rule list on screen and refresh it as it changes
  WatchRules {
    #[arg(long)]
    category: Option<String>,
    /// Invalidate the rule lists every N seconds
    #[arg(long, default_value_t = 30)]
    every: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.debug)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override project if specified on command line
  let config = if let Some(project) = args.project {
    config::Config {
      default_project: Some(project),
      ..config
    }
  } else {
    config
  };

  let client = SyncedClient::new(&config)?;
  client.cache().start_gc();

  let project = || {
    config
      .default_project
      .clone()
      .ok_or_else(|| eyre!("No project given; pass --project or set default_project"))
  };

  match args.command {
    Command::Projects => {
      for p in client.list_projects().await? {
        println!("{}  {}", p.id, p.name);
      }
    }
    Command::Project { id } => {
      let p = client.get_project(&id).await?;
      println!("{}  {}", p.id, p.name);
      if let Some(description) = p.description {
        println!("{}", description);
      }
    }
    Command::Guidelines { project: explicit } => {
      let project_id = match explicit {
        Some(p) => p,
        None => project()?,
      };
      for g in client.list_guidelines(&project_id).await? {
        println!("{}  {}  {}", g.id, g.created_at.format("%Y-%m-%d"), g.title);
      }
    }
    Command::Rules { page, category } => {
      let filter = RuleFilter {
        project_id: config.default_project.clone(),
        page,
        category,
      };
      print_rules(&client.list_rules(&filter).await?);
    }
    Command::DeleteRule { rule } => {
      client.delete_rule(&project()?, &rule).await?;
      println!("Deleted rule {}", rule);
    }
    Command::RefineRule { rule, instructions } => {
      let refined = client.refine_rule(&project()?, &rule, &instructions).await?;
      println!("{}", serde_json::to_string_pretty(&refined)?);
    }
    Command::DeleteGuideline { guideline } => {
      client.delete_guideline(&project()?, &guideline).await?;
      println!("Deleted guideline {}", guideline);
    }
    Command::CreateProject { name, description } => {
      let p = client.create_project(NewProject { name, description }).await?;
      println!("Created project {}", p.id);
    }
    Command::DeleteProject { id } => {
      client.delete_project(&id).await?;
      println!("Deleted project {}", id);
    }
    Command::WatchRules { category, every } => {
      let filter = RuleFilter {
        project_id: config.default_project.clone(),
        page: None,
        category,
      };
      watch_rules(&client, filter, Duration::from_secs(every.max(1))).await?;
    }
  }

  client.cache().shutdown();
  Ok(())
}

async fn watch_rules(client: &SyncedClient, filter: RuleFilter, every: Duration) -> Result<()> {
  let mut query: Query<Vec<Rule>> = client.query(&ApiKey::Rules { filter });
  query.fetch();

  let mut tick = tokio::time::interval(Duration::from_millis(250));
  let mut refresh = tokio::time::interval(every);
  // The first tick of an interval completes immediately
  refresh.tick().await;

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      _ = refresh.tick() => {
        client.cache().invalidate(&keys::rule_lists());
      }
      _ = tick.tick() => {
        if !query.poll() {
          continue;
        }
        let state = query.state();
        if state.is_loading() {
          println!("Loading rules...");
        }
        if let Some(e) = state.error() {
          eprintln!("Error: {}", e);
        }
        if let Some(rules) = state.data() {
          if !state.is_fetching() {
            print_rules(rules);
          }
        }
      }
    }
  }

  query.unmount();
  Ok(())
}

fn print_rules(rules: &[Rule]) {
  for r in rules {
    let status = if r.is_active { "" } else { " (inactive)" };
    println!("{}  [{}/{}]{} {}", r.id, r.category, r.severity, status, r.rule_text);
  }
  println!("{} rules", rules.len());
}
