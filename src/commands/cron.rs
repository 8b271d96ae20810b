/// CronWorkflow commands

use super::{human_age, read_manifest, timestamp, Context};
use anyhow::Result;
use argosy::workflow::types::CronWorkflow;
use chrono::Utc;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum CronCommand {
    /// List cron workflows
    List,

    /// Show one cron workflow
    Get { name: String },

    /// Create a cron workflow from a manifest
    Create { file: PathBuf },

    /// Delete a cron workflow
    Delete { name: String },

    /// Stop scheduling new runs
    Suspend { name: String },

    /// Resume scheduling
    Resume { name: String },
}

pub async fn run(ctx: &Context, command: CronCommand) -> Result<()> {
    match command {
        CronCommand::List => {
            let crons = ctx.client.list_crons(&ctx.namespace).await?;
            println!("{}", list_header());
            let now = Utc::now();
            for cron in &crons {
                println!("{}", list_row(cron, now));
            }
        }
        CronCommand::Get { name } => {
            let cron = ctx.client.get_cron(&ctx.namespace, &name).await?;
            print_cron(&cron);
        }
        CronCommand::Create { file } => {
            let mut cron: CronWorkflow = read_manifest(&file)?;
            if cron.metadata.namespace.is_empty() {
                cron.metadata.namespace = ctx.namespace.clone();
            }
            let created = ctx.client.create_cron(&cron.metadata.namespace, &cron).await?;
            print_cron(&created);
        }
        CronCommand::Delete { name } => {
            ctx.client.delete_cron(&ctx.namespace, &name).await?;
            println!("CronWorkflow '{}' deleted", name);
        }
        CronCommand::Suspend { name } => {
            ctx.client.set_cron_suspend(&ctx.namespace, &name, "suspend").await?;
            println!("CronWorkflow '{}' suspended", name);
        }
        CronCommand::Resume { name } => {
            ctx.client.set_cron_suspend(&ctx.namespace, &name, "resume").await?;
            println!("CronWorkflow '{}' resumed", name);
        }
    }
    Ok(())
}

pub fn list_header() -> &'static str {
    "NAME   AGE   LAST RUN   SCHEDULE   SUSPENDED"
}

pub fn list_row(cron: &CronWorkflow, now: chrono::DateTime<Utc>) -> String {
    let age = cron
        .metadata
        .creation_timestamp
        .map(|at| human_age(at, now))
        .unwrap_or_else(|| "-".to_string());
    let last_run = cron
        .status
        .last_scheduled_time
        .map(|at| human_age(at, now))
        .unwrap_or_else(|| "N/A".to_string());
    format!(
        "{}   {}   {}   {}   {}",
        cron.metadata.name, age, last_run, cron.spec.schedule, cron.spec.suspend
    )
}

fn print_cron(cron: &CronWorkflow) {
    println!("Name:                  {}", cron.metadata.name);
    println!("Namespace:             {}", cron.metadata.namespace);
    println!("Created:               {}", timestamp(cron.metadata.creation_timestamp));
    println!("Schedule:              {}", cron.spec.schedule);
    println!("Suspended:             {}", cron.spec.suspend);
    println!("ConcurrencyPolicy:     {:?}", cron.spec.concurrency_policy);
    println!("LastScheduledTime:     {}", timestamp(cron.status.last_scheduled_time));
    if let Some(reason) = &cron.status.last_skip_reason {
        println!("LastSkipReason:        {}", reason);
    }
    if !cron.status.active.is_empty() {
        let active: Vec<&str> = cron.status.active.iter().map(|r| r.name.as_str()).collect();
        println!("Active Workflows:      {}", active.join(", "));
    }
}
