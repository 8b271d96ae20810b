/// Workflow commands: submit, get, delete, stop, terminate

use super::{read_manifest, timestamp, Context};
use anyhow::Result;
use argosy::{
    runtime::backoff::{wait_until, Backoff},
    workflow::types::{Workflow, WorkflowPhase},
};
use std::{path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;

/// Submit a manifest, optionally waiting for it to finish
pub async fn submit(ctx: &Context, file: PathBuf, wait: bool) -> Result<()> {
    let mut workflow: Workflow = read_manifest(&file)?;
    if workflow.metadata.namespace.is_empty() {
        workflow.metadata.namespace = ctx.namespace.clone();
    }
    let created = ctx.client.submit(&workflow.metadata.namespace, &workflow).await?;
    print_summary(&created);

    if wait {
        let finished = wait_for(ctx, &created.metadata.namespace, &created.metadata.name).await?;
        println!("{} {}", finished.metadata.name, finished.status.phase);
        if finished.status.phase != WorkflowPhase::Succeeded {
            anyhow::bail!(
                "workflow {} {}: {}",
                finished.metadata.name,
                finished.status.phase,
                finished.status.message.unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn wait_for(ctx: &Context, namespace: &str, name: &str) -> Result<Workflow> {
    let poll = Backoff::polling(Duration::from_secs(1), Duration::from_secs(24 * 3600));
    let client = &ctx.client;
    wait_until(&poll, &CancellationToken::new(), || async move {
        client
            .get_workflow(namespace, name)
            .await
            .map(|wf| wf.is_completed())
            .unwrap_or(false)
    })
    .await?;
    ctx.client.get_workflow(namespace, name).await
}

pub async fn get(ctx: &Context, name: &str) -> Result<()> {
    let workflow = ctx.client.get_workflow(&ctx.namespace, name).await?;
    print_summary(&workflow);

    let mut nodes: Vec<_> = workflow.status.nodes.values().collect();
    nodes.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.name.cmp(&b.name)));
    if !nodes.is_empty() {
        println!();
        println!("STEP   PHASE   MESSAGE");
        for node in nodes {
            println!(
                "{}   {}   {}",
                node.name,
                node.phase,
                node.message.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

pub async fn delete(ctx: &Context, name: &str) -> Result<()> {
    ctx.client.delete_workflow(&ctx.namespace, name).await?;
    println!("Workflow '{}' deleted", name);
    Ok(())
}

/// `action` is `stop` or `terminate`
pub async fn shutdown(ctx: &Context, name: &str, action: &str) -> Result<()> {
    ctx.client.shutdown_workflow(&ctx.namespace, name, action).await?;
    let verb = if action == "stop" { "stopped" } else { "terminated" };
    println!("Workflow '{}' {}", name, verb);
    Ok(())
}

fn print_summary(workflow: &Workflow) {
    println!("Name:        {}", workflow.metadata.name);
    println!("Namespace:   {}", workflow.metadata.namespace);
    println!("UID:         {}", workflow.metadata.uid);
    println!("Status:      {}", workflow.status.phase);
    if let Some(message) = &workflow.status.message {
        println!("Message:     {}", message);
    }
    println!("Created:     {}", timestamp(workflow.metadata.creation_timestamp));
    if workflow.status.started_at.is_some() {
        println!("Started:     {}", timestamp(workflow.status.started_at));
    }
    if workflow.status.finished_at.is_some() {
        println!("Finished:    {}", timestamp(workflow.status.finished_at));
    }
}
