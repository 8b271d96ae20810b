/// Archived workflow commands

use super::{timestamp, Context};
use crate::client::ArchiveQuery;
use anyhow::Result;
use clap::{Args, Subcommand};

/// Archive records are addressed by namespace and UID
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ArchivedRef {
    /// Namespace the workflow ran in
    #[arg(value_name = "NAMESPACE")]
    pub archive_namespace: String,
    pub uid: String,
}

#[derive(Subcommand, Debug)]
pub enum ArchiveCommand {
    /// List archived workflows
    List {
        /// Only these phases, comma separated
        #[arg(long)]
        phases: Option<String>,
        /// Label selector, e.g. `team=data`
        #[arg(short = 'l', long)]
        selector: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// List across every namespace
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },

    /// Show an archived workflow
    Get(ArchivedRef),

    /// Start a new run from an archived workflow
    Resubmit(ArchivedRef),

    /// Delete an archived workflow
    Delete(ArchivedRef),
}

pub async fn run(ctx: &Context, command: ArchiveCommand) -> Result<()> {
    match command {
        ArchiveCommand::List {
            phases,
            selector,
            prefix,
            limit,
            all_namespaces,
        } => {
            let query = ArchiveQuery {
                namespace: (!all_namespaces).then(|| ctx.namespace.clone()),
                phases,
                label_selector: selector,
                name_prefix: prefix,
                limit,
            };
            let items = ctx.client.list_archived(&query).await?;
            println!("NAMESPACE NAME UID");
            for item in &items {
                println!("{} {} {}", item.namespace, item.name, item.uid);
            }
        }
        ArchiveCommand::Get(ArchivedRef { archive_namespace, uid }) => {
            let item = ctx.client.get_archived(&archive_namespace, &uid).await?;
            println!("Name:        {}", item.name);
            println!("Namespace:   {}", item.namespace);
            println!("UID:         {}", item.uid);
            println!("Status:      {}", item.phase);
            if let Some(message) = &item.workflow.status.message {
                println!("Message:     {}", message);
            }
            println!("Started:     {}", timestamp(item.started_at));
            println!("Finished:    {}", timestamp(item.finished_at));
            println!("Archived:    {}", item.archived_at.to_rfc3339());
        }
        ArchiveCommand::Resubmit(ArchivedRef { archive_namespace, uid }) => {
            let created = ctx.client.resubmit_archived(&archive_namespace, &uid).await?;
            println!("Archived workflow '{}' resubmitted as '{}'", uid, created.metadata.name);
        }
        ArchiveCommand::Delete(ArchivedRef { archive_namespace, uid }) => {
            ctx.client.delete_archived(&archive_namespace, &uid).await?;
            println!("Archived workflow '{}' deleted", uid);
        }
    }
    Ok(())
}
