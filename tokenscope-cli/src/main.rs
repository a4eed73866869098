mod cli;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::error;

use tokenscope::error::BulkError;
use tokenscope::gitlab::{ClientOptions, GitLabClient, ProjectQuery};
use tokenscope::project_ref::HostContext;
use tokenscope::report::{ReportWriter, build_yaml_report};
use tokenscope::{AdjustOptions, Adjuster};

use cli::Cli;

fn init_tracing(args: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(args.verbosity.tracing_level_filter().to_string())
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn project_query(args: &Cli) -> ProjectQuery {
    ProjectQuery {
        search: args.search.clone(),
        membership: args.membership.then_some(true),
        owned: args.owned.then_some(true),
        archived: args.archived,
        simple: None,
        min_access_level: args.min_access_level,
        order_by: args.order_by.clone(),
        sort: args.sort.clone(),
        visibility: args.visibility.clone(),
        per_page: args.per_page,
        page_limit: args.page_limit,
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(&args);

    let client = GitLabClient::new(&args.url, &args.token, ClientOptions::default());
    let host = HostContext::new(&args.url);
    let options = AdjustOptions {
        dry_run: args.dry_run,
        monorepo: args.monorepo,
        concurrency: args.concurrency,
        page_limit: args.page_limit,
        project_timeout: args.project_timeout.map(Duration::from_secs),
    };
    let adjuster = Adjuster::new(Arc::new(client), host, options);

    if args.all {
        let writer = match (&args.output, args.dry_run) {
            (Some(path), true) => Some(
                ReportWriter::create(path)
                    .await
                    .with_context(|| format!("failed to create {}", path.display()))?,
            ),
            _ => None,
        };

        let result = adjuster
            .adjust_all_projects(&project_query(&args), writer.as_ref())
            .await;
        if let Some(writer) = writer {
            writer.finish().await.context("failed to flush report")?;
        }

        match result {
            Ok(entries) => {
                if args.dry_run {
                    print!("{}", build_yaml_report(&entries));
                }
                Ok(())
            }
            Err(BulkError::Projects { failures }) => {
                for failure in &failures {
                    error!("{failure}");
                    for detail in &failure.details {
                        error!("  {detail}");
                    }
                }
                bail!("{} project(s) failed during adjustment", failures.len());
            }
            Err(e) => Err(e.into()),
        }
    } else {
        // The argument group guarantees a project id is present here.
        let project_id = args.project.context("--project or --all is required")?;
        match adjuster.adjust_project(project_id).await {
            Ok(Some(entry)) => {
                let report = build_yaml_report(&[entry]);
                if let Some(path) = &args.output {
                    std::fs::write(path, &report)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
                print!("{report}");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                for detail in e.details() {
                    error!("  {detail}");
                }
                Err(e.into())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}
